use nom::error::{Error, ErrorKind};
use nom::IResult;
use std::ops::Range;

use super::crc::crc16;
use super::{FRAME_END, TAG_LEN_16, TAG_LEN_24, TAG_LEN_8};

/// Result of looking for a frame at the very start of some input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Decoded {
    /// A whole valid frame, with the payload location and the number
    /// of bytes the frame occupies.
    Frame {
        payload: Range<usize>,
        consumed: usize,
    },
    /// This could still be a frame, given at least this many more bytes.
    NeedMore(usize),
    /// This is not a frame. Drop one byte and try again.
    Invalid,
}

/// Parse the tag and length. Returns the header width and payload length.
fn frame_header(input: &[u8]) -> IResult<&[u8], (usize, usize)> {
    use nom::number::complete::{be_u16, be_u24, be_u8};

    let (rest, tag) = be_u8(input)?;
    match tag {
        TAG_LEN_8 => be_u8(rest).map(|(r, l)| (r, (2, l as usize))),
        TAG_LEN_16 => be_u16(rest).map(|(r, l)| (r, (3, l as usize))),
        TAG_LEN_24 => be_u24(rest).map(|(r, l)| (r, (4, l as usize))),
        _ => Err(nom::Err::Error(Error::new(input, ErrorKind::Tag))),
    }
}

/// Try to decode one frame at the start of `input`.
///
/// Lengths that would fit in a narrower header are rejected, as are
/// lengths over `max_payload_len`.
pub fn try_decode(input: &[u8], max_payload_len: usize) -> Decoded {
    let Some(&tag) = input.first() else {
        return Decoded::NeedMore(1);
    };

    let header_len = match tag {
        TAG_LEN_8 | TAG_LEN_16 | TAG_LEN_24 => tag as usize,
        _ => return Decoded::Invalid,
    };

    if input.len() < header_len {
        return Decoded::NeedMore(header_len - input.len());
    }

    let (header_len, len) = match frame_header(input) {
        Ok((_, header)) => header,
        Err(_) => return Decoded::Invalid,
    };

    let min_len = match header_len {
        2 => 1,
        3 => 255,
        _ => 65535,
    };
    if len < min_len || len > max_payload_len {
        return Decoded::Invalid;
    }

    // header + payload + crc + end
    let total = header_len + len + 3;
    if input.len() < total {
        return Decoded::NeedMore(total - input.len());
    }

    if input[total - 1] != FRAME_END {
        return Decoded::Invalid;
    }

    let payload = header_len..header_len + len;
    let provided = u16::from_be_bytes([input[payload.end], input[payload.end + 1]]);
    if crc16(&input[payload.clone()]) != provided {
        return Decoded::Invalid;
    }

    Decoded::Frame {
        payload,
        consumed: total,
    }
}

/// Why a payload did not parse as a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseError {
    /// Payload had no command id.
    Empty,
    /// Payload body was not understood for this command.
    Malformed { command: u8, kind: ErrorKind },
}

impl std::error::Error for ParseError {}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty payload"),
            Self::Malformed { command, kind } => {
                write!(f, "malformed command {}: {:?}", command, kind)
            }
        }
    }
}

/// Parse a command id, and provide it to a function that returns a
/// parser for that command's body.
pub fn message<'a, F, P, O>(mut parser: F) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], O>
where
    F: FnMut(u8) -> P,
    P: nom::Parser<&'a [u8], O, Error<&'a [u8]>>,
{
    move |input| {
        let (rest, command) = nom::number::complete::be_u8(input)?;
        parser(command).parse(rest)
    }
}

/// A trait for parseable messages.
pub trait MessageParse<'a>: Sized {
    /// Parse the body of a message, given the command id.
    fn parse_body(command: u8) -> impl nom::Parser<&'a [u8], Self, Error<&'a [u8]>>;

    /// Parse a whole payload, command id included.
    ///
    /// Trailing bytes after a recognized body are ignored, since newer
    /// firmware tends to append fields.
    fn parse_payload(payload: &'a [u8]) -> Result<Self, ParseError> {
        let Some(&command) = payload.first() else {
            return Err(ParseError::Empty);
        };

        match message(Self::parse_body)(payload) {
            Ok((_, msg)) => Ok(msg),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                Err(ParseError::Malformed {
                    command,
                    kind: e.code,
                })
            }
            Err(nom::Err::Incomplete(_)) => Err(ParseError::Malformed {
                command,
                kind: ErrorKind::Complete,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MAX: usize = 512;

    #[test]
    fn decode_empty() {
        assert_eq!(try_decode(b"", MAX), Decoded::NeedMore(1));
    }

    #[test]
    fn decode_garbage() {
        assert_eq!(try_decode(b"abc", MAX), Decoded::Invalid);
    }

    #[test]
    fn decode_incomplete_header() {
        assert_eq!(try_decode(b"\x03\x01", MAX), Decoded::NeedMore(1));
    }

    #[test]
    fn decode_incomplete_body() {
        assert_eq!(try_decode(b"\x02\x09123", MAX), Decoded::NeedMore(9));
    }

    #[test]
    fn decode_complete() {
        assert_eq!(
            try_decode(b"\x02\x09123456789\x31\xc3\x03after", MAX),
            Decoded::Frame {
                payload: 2..11,
                consumed: 14
            }
        );
    }

    #[test]
    fn decode_zero_length() {
        assert_eq!(try_decode(b"\x02\x00\x00\x00\x03", MAX), Decoded::Invalid);
    }

    #[test]
    fn decode_non_minimal_length() {
        // a 16-bit length that would have fit in 8 bits
        assert_eq!(try_decode(b"\x03\x00\x10", MAX), Decoded::Invalid);
    }

    #[test]
    fn decode_too_long() {
        assert_eq!(try_decode(b"\x03\x02\x01", MAX), Decoded::Invalid);
        assert_eq!(try_decode(b"\x03\x02\x01", 1024), Decoded::NeedMore(516));
    }

    #[test]
    fn decode_bad_crc() {
        assert_eq!(
            try_decode(b"\x02\x09123456789\x31\xc4\x03", MAX),
            Decoded::Invalid
        );
    }

    #[test]
    fn decode_bad_end() {
        assert_eq!(
            try_decode(b"\x02\x09123456789\x31\xc3\x04", MAX),
            Decoded::Invalid
        );
    }

    fn first_byte(command: u8) -> impl nom::Parser<&'static [u8], (u8, u8), Error<&'static [u8]>> {
        move |input: &'static [u8]| {
            nom::number::complete::be_u8(input).map(|(rest, b)| (rest, (command, b)))
        }
    }

    #[test]
    fn message_command() {
        let mut parser = message(first_byte);
        assert_eq!(parser(&b"\x07\x01\x02"[..]), Ok((&b"\x02"[..], (7, 1))));
    }
}
