//! Messages for reading the firmware version and replacing firmware.

use nom::{error::Error, Parser};

use crate::protocol::parse::MessageParse;
use crate::protocol::serialize::{MessageSerialize, Serializer};

use super::{command, util, HwType};

/// FW_VERSION request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FwVersion;

impl MessageSerialize for FwVersion {
    fn command(&self) -> u8 {
        command::FW_VERSION
    }

    fn message_body<S>(&self, _ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        Ok(())
    }
}

impl<'a> MessageParse<'a> for FwVersion {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::FW_VERSION], input)?;
            Ok((input, FwVersion))
        }
    }
}

/// FW_VERSION reply.
///
/// Everything past the version numbers was added over time, so older
/// targets leave the later fields out.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FwVersionReply<I> {
    pub major: u8,
    pub minor: u8,
    /// Hardware name.
    pub hw_name: I,
    pub uuid: Option<[u8; 12]>,
    pub paired: Option<bool>,
    /// Non-zero on test builds.
    pub test_version: Option<u8>,
    pub hw_type: Option<HwType>,
    /// Number of custom configurations the target carries.
    pub custom_configs: Option<u8>,
}

impl<I> FwVersionReply<I>
where
    I: AsRef<[u8]>,
{
    pub fn hw_name_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.hw_name.as_ref())
    }
}

impl<I> MessageSerialize for FwVersionReply<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        command::FW_VERSION
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_u8(self.major)?;
        ser.write_u8(self.minor)?;
        ser.write_bytes(self.hw_name.as_ref())?;
        ser.write_u8(0)?;

        // each field is only present if everything before it is
        let Some(uuid) = self.uuid else {
            return Ok(());
        };
        ser.write_bytes(&uuid)?;
        let Some(paired) = self.paired else {
            return Ok(());
        };
        ser.write_u8(paired as u8)?;
        let Some(test_version) = self.test_version else {
            return Ok(());
        };
        ser.write_u8(test_version)?;
        let Some(hw_type) = self.hw_type else {
            return Ok(());
        };
        ser.write_u8(hw_type.into())?;
        if let Some(custom_configs) = self.custom_configs {
            ser.write_u8(custom_configs)?;
        }
        Ok(())
    }
}

impl<'a> MessageParse<'a> for FwVersionReply<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        use nom::combinator::opt;
        use nom::number::complete::u8;

        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::FW_VERSION], input)?;
            let (input, major) = u8(input)?;
            let (input, minor) = u8(input)?;
            let (input, hw_name) = util::cstr(input)?;
            let (input, uuid) = opt(util::byte_array::<12>)(input)?;
            let (input, paired) = opt(util::flag)(input)?;
            let (input, test_version) = opt(u8)(input)?;
            let (input, hw_type) = opt(nom::combinator::map(u8, HwType::from))(input)?;
            let (input, custom_configs) = opt(u8)(input)?;

            Ok((
                input,
                FwVersionReply {
                    major,
                    minor,
                    hw_name,
                    uuid,
                    paired,
                    test_version,
                    hw_type,
                    custom_configs,
                },
            ))
        }
    }
}

/// JUMP_TO_BOOTLOADER, or JUMP_TO_BOOTLOADER_ALL_CAN when broadcast.
///
/// Reboots into the bootloader, which installs the uploaded image.
/// There is no reply.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct JumpToBootloader {
    pub broadcast: bool,
}

impl MessageSerialize for JumpToBootloader {
    fn command(&self) -> u8 {
        if self.broadcast {
            command::JUMP_TO_BOOTLOADER_ALL_CAN
        } else {
            command::JUMP_TO_BOOTLOADER
        }
    }

    fn message_body<S>(&self, _ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        Ok(())
    }
}

impl<'a> MessageParse<'a> for JumpToBootloader {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let ids = [
                command::JUMP_TO_BOOTLOADER,
                command::JUMP_TO_BOOTLOADER_ALL_CAN,
            ];
            let (input, _) = util::expect_command(cmd, &ids, input)?;
            Ok((
                input,
                JumpToBootloader {
                    broadcast: cmd == command::JUMP_TO_BOOTLOADER_ALL_CAN,
                },
            ))
        }
    }
}

/// ERASE_NEW_APP, or ERASE_NEW_APP_ALL_CAN when broadcast.
///
/// Erases enough of the staging area to hold `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EraseNewApp {
    pub size: u32,
    pub broadcast: bool,
}

impl MessageSerialize for EraseNewApp {
    fn command(&self) -> u8 {
        if self.broadcast {
            command::ERASE_NEW_APP_ALL_CAN
        } else {
            command::ERASE_NEW_APP
        }
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.size)
    }
}

impl<'a> MessageParse<'a> for EraseNewApp {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let ids = [command::ERASE_NEW_APP, command::ERASE_NEW_APP_ALL_CAN];
            let (input, _) = util::expect_command(cmd, &ids, input)?;
            let (input, size) = nom::number::complete::be_u32(input)?;
            Ok((
                input,
                EraseNewApp {
                    size,
                    broadcast: cmd == command::ERASE_NEW_APP_ALL_CAN,
                },
            ))
        }
    }
}

/// ERASE_BOOTLOADER, or ERASE_BOOTLOADER_ALL_CAN when broadcast.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EraseBootloader {
    pub broadcast: bool,
}

impl MessageSerialize for EraseBootloader {
    fn command(&self) -> u8 {
        if self.broadcast {
            command::ERASE_BOOTLOADER_ALL_CAN
        } else {
            command::ERASE_BOOTLOADER
        }
    }

    fn message_body<S>(&self, _ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        Ok(())
    }
}

impl<'a> MessageParse<'a> for EraseBootloader {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let ids = [command::ERASE_BOOTLOADER, command::ERASE_BOOTLOADER_ALL_CAN];
            let (input, _) = util::expect_command(cmd, &ids, input)?;
            Ok((
                input,
                EraseBootloader {
                    broadcast: cmd == command::ERASE_BOOTLOADER_ALL_CAN,
                },
            ))
        }
    }
}

/// WRITE_NEW_APP_DATA, or WRITE_NEW_APP_DATA_ALL_CAN when broadcast.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteNewAppData<I> {
    /// Offset into the staging area.
    pub offset: u32,
    pub data: I,
    pub broadcast: bool,
}

impl<I> MessageSerialize for WriteNewAppData<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        if self.broadcast {
            command::WRITE_NEW_APP_DATA_ALL_CAN
        } else {
            command::WRITE_NEW_APP_DATA
        }
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.offset)?;
        ser.write_bytes(self.data.as_ref())
    }
}

impl<'a> MessageParse<'a> for WriteNewAppData<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let ids = [
                command::WRITE_NEW_APP_DATA,
                command::WRITE_NEW_APP_DATA_ALL_CAN,
            ];
            let (input, _) = util::expect_command(cmd, &ids, input)?;
            let (input, offset) = nom::number::complete::be_u32(input)?;
            let (input, data) = nom::combinator::rest(input)?;
            Ok((
                input,
                WriteNewAppData {
                    offset,
                    data,
                    broadcast: cmd == command::WRITE_NEW_APP_DATA_ALL_CAN,
                },
            ))
        }
    }
}

/// WRITE_NEW_APP_DATA_LZO (or its broadcast twin): a chunk compressed
/// with [crate::heatshrink], plus its uncompressed length.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteNewAppDataCompressed<I> {
    pub offset: u32,
    pub raw_len: u16,
    pub data: I,
    pub broadcast: bool,
}

impl<I> MessageSerialize for WriteNewAppDataCompressed<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        if self.broadcast {
            command::WRITE_NEW_APP_DATA_ALL_CAN_LZO
        } else {
            command::WRITE_NEW_APP_DATA_LZO
        }
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.offset)?;
        ser.write_be_u16(self.raw_len)?;
        ser.write_bytes(self.data.as_ref())
    }
}

impl<'a> MessageParse<'a> for WriteNewAppDataCompressed<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let ids = [
                command::WRITE_NEW_APP_DATA_LZO,
                command::WRITE_NEW_APP_DATA_ALL_CAN_LZO,
            ];
            let (input, _) = util::expect_command(cmd, &ids, input)?;
            let (input, offset) = nom::number::complete::be_u32(input)?;
            let (input, raw_len) = nom::number::complete::be_u16(input)?;
            let (input, data) = nom::combinator::rest(input)?;
            Ok((
                input,
                WriteNewAppDataCompressed {
                    offset,
                    raw_len,
                    data,
                    broadcast: cmd == command::WRITE_NEW_APP_DATA_ALL_CAN_LZO,
                },
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test::*;
    use super::*;

    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    impl Arbitrary for EraseNewApp {
        fn arbitrary(g: &mut Gen) -> Self {
            Self {
                size: u32::arbitrary(g),
                broadcast: bool::arbitrary(g),
            }
        }
    }

    #[quickcheck]
    fn roundtrip_erase_new_app(msg: EraseNewApp) -> bool {
        roundtrip(msg)
    }

    #[quickcheck]
    fn roundtrip_jump(broadcast: bool) -> bool {
        roundtrip(JumpToBootloader { broadcast }) && roundtrip(EraseBootloader { broadcast })
    }

    #[quickcheck]
    fn roundtrip_write_new_app_data(offset: u32, data: Vec<u8>, broadcast: bool) -> bool {
        let msg = WriteNewAppData {
            offset,
            data: &data[..],
            broadcast,
        };
        let payload = msg.to_payload();
        WriteNewAppData::parse_payload(&payload) == Ok(msg)
    }

    #[quickcheck]
    fn roundtrip_write_compressed(offset: u32, raw_len: u16, data: Vec<u8>) -> bool {
        let msg = WriteNewAppDataCompressed {
            offset,
            raw_len,
            data: &data[..],
            broadcast: false,
        };
        let payload = msg.to_payload();
        payload[0] == command::WRITE_NEW_APP_DATA_LZO
            && WriteNewAppDataCompressed::parse_payload(&payload) == Ok(msg)
    }

    #[test]
    fn erase_new_app_bytes() {
        let msg = EraseNewApp {
            size: 0x12345,
            broadcast: false,
        };
        assert_eq!(msg.to_payload(), b"\x02\x00\x01\x23\x45");
    }

    #[test]
    fn fw_version_minimal() {
        let reply = FwVersionReply::parse_payload(b"\x00\x06\x05HW60\0").unwrap();
        assert_eq!(reply.major, 6);
        assert_eq!(reply.minor, 5);
        assert_eq!(reply.hw_name, b"HW60");
        assert_eq!(reply.uuid, None);
        assert_eq!(reply.hw_type, None);
    }

    #[test]
    fn fw_version_full() {
        let reply = FwVersionReply {
            major: 6,
            minor: 2,
            hw_name: b"60".as_ref(),
            uuid: Some([7; 12]),
            paired: Some(false),
            test_version: Some(0),
            hw_type: Some(HwType::VescBms),
            custom_configs: Some(1),
        };
        let payload = reply.to_payload();
        assert_eq!(FwVersionReply::parse_payload(&payload), Ok(reply));
    }

    #[test]
    fn fw_version_wrong_command() {
        assert!(FwVersionReply::parse_payload(b"\x02\x01").is_err());
    }
}
