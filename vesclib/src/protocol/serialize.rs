use core::convert::Infallible;

use super::crc::{CrcDigest, CrcStyle};
use super::{FRAME_END, TAG_LEN_16, TAG_LEN_24, TAG_LEN_8};

/// A trait for serializing messages. All multi-byte integers on the
/// wire are big-endian.
pub trait Serializer {
    type Error;

    fn write_u8(&mut self, val: u8) -> Result<(), Self::Error>;

    // everything else can be written in terms of write_u8
    // (although they probably should be specialized in some impls)

    // Note: they *definitely should* be specialized in
    // SerializerLength and &mut S so if you add a method here, add
    // one there.

    fn write_bytes(&mut self, val: &[u8]) -> Result<(), Self::Error> {
        for b in val.iter() {
            self.write_u8(*b)?;
        }
        Ok(())
    }

    fn write_i8(&mut self, val: i8) -> Result<(), Self::Error> {
        self.write_u8(val as u8)
    }

    fn write_be_u16(&mut self, val: u16) -> Result<(), Self::Error> {
        self.write_bytes(&val.to_be_bytes())
    }

    fn write_be_i16(&mut self, val: i16) -> Result<(), Self::Error> {
        self.write_be_u16(val as u16)
    }

    fn write_be_u32(&mut self, val: u32) -> Result<(), Self::Error> {
        self.write_bytes(&val.to_be_bytes())
    }

    fn write_be_i32(&mut self, val: i32) -> Result<(), Self::Error> {
        self.write_be_u32(val as u32)
    }

    /// Write bytes followed by a NUL terminator.
    fn write_cstr(&mut self, val: &[u8]) -> Result<(), Self::Error> {
        self.write_bytes(val)?;
        self.write_u8(0)
    }
}

impl<S> Serializer for &mut S
where
    S: Serializer,
{
    type Error = S::Error;

    fn write_u8(&mut self, val: u8) -> Result<(), Self::Error> {
        (*self).write_u8(val)
    }

    fn write_bytes(&mut self, val: &[u8]) -> Result<(), Self::Error> {
        (*self).write_bytes(val)
    }

    fn write_be_u16(&mut self, val: u16) -> Result<(), Self::Error> {
        (*self).write_be_u16(val)
    }

    fn write_be_i16(&mut self, val: i16) -> Result<(), Self::Error> {
        (*self).write_be_i16(val)
    }

    fn write_be_u32(&mut self, val: u32) -> Result<(), Self::Error> {
        (*self).write_be_u32(val)
    }

    fn write_be_i32(&mut self, val: i32) -> Result<(), Self::Error> {
        (*self).write_be_i32(val)
    }
}

impl Serializer for Vec<u8> {
    type Error = Infallible;

    fn write_u8(&mut self, val: u8) -> Result<(), Self::Error> {
        self.push(val);
        Ok(())
    }

    fn write_bytes(&mut self, val: &[u8]) -> Result<(), Self::Error> {
        self.extend_from_slice(val);
        Ok(())
    }
}

/// Unwrap a result that cannot fail.
pub fn infallible<T>(res: Result<T, Infallible>) -> T {
    match res {
        Ok(v) => v,
        Err(never) => match never {},
    }
}

/// A serializer that only counts bytes written.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SerializerLength {
    len: usize,
}

impl SerializerLength {
    pub fn new() -> Self {
        SerializerLength { len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Serializer for SerializerLength {
    type Error = Infallible;

    fn write_u8(&mut self, _val: u8) -> Result<(), Self::Error> {
        self.len += 1;
        Ok(())
    }

    fn write_bytes(&mut self, val: &[u8]) -> Result<(), Self::Error> {
        self.len += val.len();
        Ok(())
    }

    fn write_be_u16(&mut self, _val: u16) -> Result<(), Self::Error> {
        self.len += 2;
        Ok(())
    }

    fn write_be_i16(&mut self, _val: i16) -> Result<(), Self::Error> {
        self.len += 2;
        Ok(())
    }

    fn write_be_u32(&mut self, _val: u32) -> Result<(), Self::Error> {
        self.len += 4;
        Ok(())
    }

    fn write_be_i32(&mut self, _val: i32) -> Result<(), Self::Error> {
        self.len += 4;
        Ok(())
    }
}

/// A serializer that also computes a CRC on the side.
pub struct SerializerCrc<'a, C, T>
where
    C: CrcStyle + 'a,
{
    digest: C::Digest<'a>,
    inner: T,
}

impl<'a, C, T> SerializerCrc<'a, C, T>
where
    C: CrcStyle + 'a,
{
    pub fn new(crc: &'a C, inner: T) -> Self {
        Self {
            digest: crc.digest(),
            inner,
        }
    }

    pub fn finalize(self) -> (u16, T) {
        (self.digest.finalize(), self.inner)
    }
}

impl<'a, C, T> std::ops::Deref for SerializerCrc<'a, C, T>
where
    C: CrcStyle + 'a,
{
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, C, T> std::ops::DerefMut for SerializerCrc<'a, C, T>
where
    C: CrcStyle + 'a,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<'a, C, T> Serializer for SerializerCrc<'a, C, T>
where
    C: CrcStyle + 'a,
    T: Serializer,
{
    type Error = T::Error;

    fn write_u8(&mut self, val: u8) -> Result<(), Self::Error> {
        self.digest.update(&[val]);
        self.inner.write_u8(val)
    }

    fn write_bytes(&mut self, val: &[u8]) -> Result<(), Self::Error> {
        self.digest.update(val);
        self.inner.write_bytes(val)
    }
}

/// Errors from building a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameError {
    /// Zero-length payloads cannot be framed.
    Empty,
    /// Payload is longer than the configured maximum.
    TooLong { len: usize, max: usize },
}

impl std::error::Error for FrameError {}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Empty => write!(f, "cannot frame an empty payload"),
            Self::TooLong { len, max } => {
                write!(f, "payload of {} bytes exceeds maximum of {}", len, max)
            }
        }
    }
}

/// Check that a payload of `len` bytes may be framed.
pub fn check_payload_len(len: usize, max_payload_len: usize) -> Result<(), FrameError> {
    if len == 0 {
        Err(FrameError::Empty)
    } else if len > max_payload_len {
        Err(FrameError::TooLong {
            len,
            max: max_payload_len,
        })
    } else {
        Ok(())
    }
}

/// Write the tag and big-endian length that start a frame.
pub fn write_frame_header<S>(ser: &mut S, len: usize) -> Result<(), S::Error>
where
    S: Serializer,
{
    if len <= 0xff {
        ser.write_u8(TAG_LEN_8)?;
        ser.write_u8(len as u8)
    } else if len <= 0xffff {
        ser.write_u8(TAG_LEN_16)?;
        ser.write_be_u16(len as u16)
    } else {
        ser.write_u8(TAG_LEN_24)?;
        ser.write_bytes(&(len as u32).to_be_bytes()[1..])
    }
}

/// Write a whole frame: header, payload, CRC and terminator.
///
/// This does not check the payload length, see [check_payload_len].
pub fn write_frame<S>(ser: &mut S, payload: &[u8]) -> Result<(), S::Error>
where
    S: Serializer,
{
    write_frame_header(ser, payload.len())?;

    let mut crc_ser = SerializerCrc::new(&super::crc::CrcXModem, ser);
    crc_ser.write_bytes(payload)?;
    let (crc, ser) = crc_ser.finalize();

    ser.write_be_u16(crc)?;
    ser.write_u8(FRAME_END)
}

/// A trait for serializing messages.
pub trait MessageSerialize {
    /// The command id byte that starts this message.
    fn command(&self) -> u8;

    /// Serialize just the message body.
    ///
    /// For this to work correctly, it *must* perform the same actions
    /// every time it is called with the same message. That means no
    /// IO, no funny business.
    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer;

    // these can all use default implementations

    /// Serialize the message into a payload, command id first.
    fn payload<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_u8(self.command())?;
        self.message_body(ser)
    }

    /// Length of the serialized payload.
    fn payload_len(&self) -> usize {
        let mut len_ser = SerializerLength::new();
        infallible(self.payload(&mut len_ser));
        len_ser.len()
    }

    /// Serialize the message into a freshly allocated payload.
    fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len());
        infallible(self.payload(&mut out));
        out
    }
}
