//! General parsing utilities.

use nom::error::{Error, ErrorKind};
use nom::IResult;

/// Fail unless `command` is one of `ids`.
pub fn expect_command<'a>(command: u8, ids: &[u8], input: &'a [u8]) -> IResult<&'a [u8], ()> {
    if ids.contains(&command) {
        Ok((input, ()))
    } else {
        Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)))
    }
}

/// A NUL-terminated string. A missing terminator at the end of input
/// is tolerated.
pub fn cstr(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, s) = nom::bytes::complete::take_till(|b| b == 0)(input)?;
    let (input, _) = nom::combinator::opt(nom::bytes::complete::tag(b"\0".as_ref()))(input)?;
    Ok((input, s))
}

/// A one-byte flag, where anything but zero is true.
pub fn flag(input: &[u8]) -> IResult<&[u8], bool> {
    nom::combinator::map(nom::number::complete::u8, |b| b != 0)(input)
}

/// Parse a statically-sized array of bytes.
pub fn byte_array<const LEN: usize>(input: &[u8]) -> IResult<&[u8], [u8; LEN]> {
    let mut data = [0; LEN];
    let (input, _) = nom::multi::fill(nom::number::complete::u8, &mut data[..])(input)?;
    Ok((input, data))
}
