//! Messages for a debug probe attached to the target, which writes
//! straight into another chip's flash.

use nom::{error::Error, Parser};

use crate::protocol::parse::MessageParse;
use crate::protocol::serialize::{MessageSerialize, Serializer};

use super::{command, util};

/// BM_ERASE_FLASH_ALL
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EraseFlashAll;

impl MessageSerialize for EraseFlashAll {
    fn command(&self) -> u8 {
        command::BM_ERASE_FLASH_ALL
    }

    fn message_body<S>(&self, _ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        Ok(())
    }
}

impl<'a> MessageParse<'a> for EraseFlashAll {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::BM_ERASE_FLASH_ALL], input)?;
            Ok((input, EraseFlashAll))
        }
    }
}

/// BM_WRITE_FLASH
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteFlash<I> {
    /// Absolute flash address.
    pub address: u32,
    pub data: I,
}

impl<I> MessageSerialize for WriteFlash<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        command::BM_WRITE_FLASH
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.address)?;
        ser.write_bytes(self.data.as_ref())
    }
}

impl<'a> MessageParse<'a> for WriteFlash<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::BM_WRITE_FLASH], input)?;
            let (input, address) = nom::number::complete::be_u32(input)?;
            let (input, data) = nom::combinator::rest(input)?;
            Ok((input, WriteFlash { address, data }))
        }
    }
}

/// BM_WRITE_FLASH_LZO
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteFlashCompressed<I> {
    pub address: u32,
    pub raw_len: u16,
    pub data: I,
}

impl<I> MessageSerialize for WriteFlashCompressed<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        command::BM_WRITE_FLASH_LZO
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.address)?;
        ser.write_be_u16(self.raw_len)?;
        ser.write_bytes(self.data.as_ref())
    }
}

impl<'a> MessageParse<'a> for WriteFlashCompressed<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::BM_WRITE_FLASH_LZO], input)?;
            let (input, address) = nom::number::complete::be_u32(input)?;
            let (input, raw_len) = nom::number::complete::be_u16(input)?;
            let (input, data) = nom::combinator::rest(input)?;
            Ok((
                input,
                WriteFlashCompressed {
                    address,
                    raw_len,
                    data,
                },
            ))
        }
    }
}

/// BM_MEM_READ
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemRead {
    pub address: u32,
    pub len: u16,
}

impl MessageSerialize for MemRead {
    fn command(&self) -> u8 {
        command::BM_MEM_READ
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.address)?;
        ser.write_be_u16(self.len)
    }
}

impl<'a> MessageParse<'a> for MemRead {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::BM_MEM_READ], input)?;
            let (input, address) = nom::number::complete::be_u32(input)?;
            let (input, len) = nom::number::complete::be_u16(input)?;
            Ok((input, MemRead { address, len }))
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test::*;
    use super::*;

    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn roundtrip_mem_read(address: u32, len: u16) -> bool {
        roundtrip(MemRead { address, len }) && roundtrip(EraseFlashAll)
    }

    #[quickcheck]
    fn roundtrip_write_flash(address: u32, data: Vec<u8>) -> bool {
        let msg = WriteFlash {
            address,
            data: &data[..],
        };
        let payload = msg.to_payload();
        WriteFlash::parse_payload(&payload) == Ok(msg)
    }

    #[quickcheck]
    fn roundtrip_write_flash_compressed(address: u32, raw_len: u16, data: Vec<u8>) -> bool {
        let msg = WriteFlashCompressed {
            address,
            raw_len,
            data: &data[..],
        };
        let payload = msg.to_payload();
        WriteFlashCompressed::parse_payload(&payload) == Ok(msg)
    }
}
