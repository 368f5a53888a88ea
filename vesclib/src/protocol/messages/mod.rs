//! Message types used in the protocol.
//!
//! Every payload starts with a one-byte command id. Requests go from
//! the host to the target, replies come back carrying the same id.

use nom::{error::Error, Parser};

use crate::protocol::parse::MessageParse;
use crate::protocol::serialize::{MessageSerialize, Serializer};

pub mod firmware;
pub mod probe;
pub mod script;
pub mod util;

/// Command ids.
pub mod command {
    pub const FW_VERSION: u8 = 0;
    pub const JUMP_TO_BOOTLOADER: u8 = 1;
    pub const ERASE_NEW_APP: u8 = 2;
    pub const WRITE_NEW_APP_DATA: u8 = 3;
    pub const FORWARD_CAN: u8 = 34;
    pub const JUMP_TO_BOOTLOADER_ALL_CAN: u8 = 59;
    pub const ERASE_NEW_APP_ALL_CAN: u8 = 60;
    pub const WRITE_NEW_APP_DATA_ALL_CAN: u8 = 61;
    pub const BM_ERASE_FLASH_ALL: u8 = 67;
    pub const BM_WRITE_FLASH: u8 = 68;
    pub const ERASE_BOOTLOADER: u8 = 73;
    pub const ERASE_BOOTLOADER_ALL_CAN: u8 = 74;
    pub const BM_MEM_READ: u8 = 80;
    pub const WRITE_NEW_APP_DATA_LZO: u8 = 81;
    pub const WRITE_NEW_APP_DATA_ALL_CAN_LZO: u8 = 82;
    pub const BM_WRITE_FLASH_LZO: u8 = 83;
    pub const QMLUI_ERASE: u8 = 120;
    pub const QMLUI_WRITE: u8 = 121;
    pub const LISP_READ_CODE: u8 = 130;
    pub const LISP_WRITE_CODE: u8 = 131;
    pub const LISP_ERASE_CODE: u8 = 132;
    pub const LISP_SET_RUNNING: u8 = 133;
    pub const LISP_STREAM_CODE: u8 = 139;

    /// Commands answered with `[cmd][ok]`.
    pub const ERASE_STYLE: [u8; 7] = [
        ERASE_NEW_APP,
        ERASE_NEW_APP_ALL_CAN,
        ERASE_BOOTLOADER,
        ERASE_BOOTLOADER_ALL_CAN,
        QMLUI_ERASE,
        LISP_ERASE_CODE,
        LISP_SET_RUNNING,
    ];

    /// Commands answered with `[cmd][ok][offset]`.
    pub const WRITE_STYLE: [u8; 6] = [
        WRITE_NEW_APP_DATA,
        WRITE_NEW_APP_DATA_ALL_CAN,
        WRITE_NEW_APP_DATA_LZO,
        WRITE_NEW_APP_DATA_ALL_CAN_LZO,
        QMLUI_WRITE,
        LISP_WRITE_CODE,
    ];

    /// Probe commands answered with `[cmd][result]`.
    pub const PROBE_STYLE: [u8; 3] = [BM_ERASE_FLASH_ALL, BM_WRITE_FLASH, BM_WRITE_FLASH_LZO];
}

/// Kind of hardware that answered a version request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum HwType {
    /// A motor controller.
    #[default]
    Vesc,
    /// A battery management system.
    VescBms,
    CustomModule,
    Other(u8),
}

impl From<u8> for HwType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Vesc,
            1 => Self::VescBms,
            2 => Self::CustomModule,
            n => Self::Other(n),
        }
    }
}

impl From<HwType> for u8 {
    fn from(value: HwType) -> Self {
        match value {
            HwType::Vesc => 0,
            HwType::VescBms => 1,
            HwType::CustomModule => 2,
            HwType::Other(n) => n,
        }
    }
}

/// FORWARD_CAN: deliver a whole payload to another device on the bus
/// behind the one we're connected to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForwardCan<I> {
    pub target: u8,
    /// The inner payload, command id included.
    pub payload: I,
}

impl<I> MessageSerialize for ForwardCan<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        command::FORWARD_CAN
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_u8(self.target)?;
        ser.write_bytes(self.payload.as_ref())
    }
}

impl<'a> MessageParse<'a> for ForwardCan<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::FORWARD_CAN], input)?;
            let (input, target) = nom::number::complete::u8(input)?;
            let (input, payload) = nom::combinator::rest(input)?;
            Ok((input, ForwardCan { target, payload }))
        }
    }
}

/// Reply to an erase, or to set-running: `[cmd][ok]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ack {
    pub command: u8,
    pub ok: bool,
}

impl MessageSerialize for Ack {
    fn command(&self) -> u8 {
        self.command
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_u8(self.ok as u8)
    }
}

impl<'a> MessageParse<'a> for Ack {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &command::ERASE_STYLE, input)?;
            let (input, ok) = util::flag(input)?;
            Ok((input, Ack { command: cmd, ok }))
        }
    }
}

/// Reply to a chunk write: `[cmd][ok][offset]`.
///
/// Older targets leave out the offset. When present, it names the
/// chunk being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteAck {
    pub command: u8,
    pub ok: bool,
    pub offset: Option<u32>,
}

impl WriteAck {
    /// Does this acknowledge the chunk at `offset`?
    pub fn matches(&self, offset: u32) -> bool {
        self.offset.map_or(true, |o| o == offset)
    }
}

impl MessageSerialize for WriteAck {
    fn command(&self) -> u8 {
        self.command
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_u8(self.ok as u8)?;
        if let Some(offset) = self.offset {
            ser.write_be_u32(offset)?;
        }
        Ok(())
    }
}

impl<'a> MessageParse<'a> for WriteAck {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &command::WRITE_STYLE, input)?;
            let (input, ok) = util::flag(input)?;
            let (input, offset) = nom::combinator::opt(nom::number::complete::be_u32)(input)?;
            Ok((
                input,
                WriteAck {
                    command: cmd,
                    ok,
                    offset,
                },
            ))
        }
    }
}

/// Reply to a probe erase or write: `[cmd][result]`, 1 on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProbeAck {
    pub command: u8,
    pub result: i16,
}

impl ProbeAck {
    pub const SUCCESS: i16 = 1;

    pub fn ok(&self) -> bool {
        self.result == Self::SUCCESS
    }
}

impl MessageSerialize for ProbeAck {
    fn command(&self) -> u8 {
        self.command
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_i16(self.result)
    }
}

impl<'a> MessageParse<'a> for ProbeAck {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &command::PROBE_STYLE, input)?;
            let (input, result) = nom::number::complete::be_i16(input)?;
            Ok((
                input,
                ProbeAck {
                    command: cmd,
                    result,
                },
            ))
        }
    }
}

/// Reply to BM_MEM_READ: `[cmd][result][data]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemReadReply<I> {
    pub result: i16,
    pub data: I,
}

impl<I> MessageSerialize for MemReadReply<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        command::BM_MEM_READ
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_i16(self.result)?;
        ser.write_bytes(self.data.as_ref())
    }
}

impl<'a> MessageParse<'a> for MemReadReply<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::BM_MEM_READ], input)?;
            let (input, result) = nom::number::complete::be_i16(input)?;
            let (input, data) = nom::combinator::rest(input)?;
            Ok((input, MemReadReply { result, data }))
        }
    }
}

/// Reply to LISP_STREAM_CODE: `[cmd][offset][result]`, 0 on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamAck {
    pub offset: i32,
    pub result: i16,
}

impl MessageSerialize for StreamAck {
    fn command(&self) -> u8 {
        command::LISP_STREAM_CODE
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_i32(self.offset)?;
        ser.write_be_i16(self.result)
    }
}

impl<'a> MessageParse<'a> for StreamAck {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::LISP_STREAM_CODE], input)?;
            let (input, offset) = nom::number::complete::be_i32(input)?;
            let (input, result) = nom::number::complete::be_i16(input)?;
            Ok((input, StreamAck { offset, result }))
        }
    }
}

/// Any request the host sends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Request<I> {
    FwVersion(firmware::FwVersion),
    JumpToBootloader(firmware::JumpToBootloader),
    EraseNewApp(firmware::EraseNewApp),
    WriteNewAppData(firmware::WriteNewAppData<I>),
    WriteNewAppDataCompressed(firmware::WriteNewAppDataCompressed<I>),
    EraseBootloader(firmware::EraseBootloader),
    EraseCode(script::EraseCode),
    WriteCode(script::WriteCode<I>),
    SetRunning(script::SetRunning),
    StreamCode(script::StreamCode<I>),
    EraseFlashAll(probe::EraseFlashAll),
    WriteFlash(probe::WriteFlash<I>),
    WriteFlashCompressed(probe::WriteFlashCompressed<I>),
    MemRead(probe::MemRead),
    ForwardCan(ForwardCan<I>),
}

impl<I> MessageSerialize for Request<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        match self {
            Self::FwVersion(m) => m.command(),
            Self::JumpToBootloader(m) => m.command(),
            Self::EraseNewApp(m) => m.command(),
            Self::WriteNewAppData(m) => m.command(),
            Self::WriteNewAppDataCompressed(m) => m.command(),
            Self::EraseBootloader(m) => m.command(),
            Self::EraseCode(m) => m.command(),
            Self::WriteCode(m) => m.command(),
            Self::SetRunning(m) => m.command(),
            Self::StreamCode(m) => m.command(),
            Self::EraseFlashAll(m) => m.command(),
            Self::WriteFlash(m) => m.command(),
            Self::WriteFlashCompressed(m) => m.command(),
            Self::MemRead(m) => m.command(),
            Self::ForwardCan(m) => m.command(),
        }
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::FwVersion(m) => m.message_body(ser),
            Self::JumpToBootloader(m) => m.message_body(ser),
            Self::EraseNewApp(m) => m.message_body(ser),
            Self::WriteNewAppData(m) => m.message_body(ser),
            Self::WriteNewAppDataCompressed(m) => m.message_body(ser),
            Self::EraseBootloader(m) => m.message_body(ser),
            Self::EraseCode(m) => m.message_body(ser),
            Self::WriteCode(m) => m.message_body(ser),
            Self::SetRunning(m) => m.message_body(ser),
            Self::StreamCode(m) => m.message_body(ser),
            Self::EraseFlashAll(m) => m.message_body(ser),
            Self::WriteFlash(m) => m.message_body(ser),
            Self::WriteFlashCompressed(m) => m.message_body(ser),
            Self::MemRead(m) => m.message_body(ser),
            Self::ForwardCan(m) => m.message_body(ser),
        }
    }
}

impl<'a> MessageParse<'a> for Request<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        use command::*;

        move |input: &'a [u8]| match cmd {
            FW_VERSION => firmware::FwVersion::parse_body(cmd)
                .map(Self::FwVersion)
                .parse(input),
            JUMP_TO_BOOTLOADER | JUMP_TO_BOOTLOADER_ALL_CAN => {
                firmware::JumpToBootloader::parse_body(cmd)
                    .map(Self::JumpToBootloader)
                    .parse(input)
            }
            ERASE_NEW_APP | ERASE_NEW_APP_ALL_CAN => firmware::EraseNewApp::parse_body(cmd)
                .map(Self::EraseNewApp)
                .parse(input),
            WRITE_NEW_APP_DATA | WRITE_NEW_APP_DATA_ALL_CAN => {
                firmware::WriteNewAppData::parse_body(cmd)
                    .map(Self::WriteNewAppData)
                    .parse(input)
            }
            WRITE_NEW_APP_DATA_LZO | WRITE_NEW_APP_DATA_ALL_CAN_LZO => {
                firmware::WriteNewAppDataCompressed::parse_body(cmd)
                    .map(Self::WriteNewAppDataCompressed)
                    .parse(input)
            }
            ERASE_BOOTLOADER | ERASE_BOOTLOADER_ALL_CAN => {
                firmware::EraseBootloader::parse_body(cmd)
                    .map(Self::EraseBootloader)
                    .parse(input)
            }
            LISP_ERASE_CODE | QMLUI_ERASE => script::EraseCode::parse_body(cmd)
                .map(Self::EraseCode)
                .parse(input),
            LISP_WRITE_CODE | QMLUI_WRITE => script::WriteCode::parse_body(cmd)
                .map(Self::WriteCode)
                .parse(input),
            LISP_SET_RUNNING => script::SetRunning::parse_body(cmd)
                .map(Self::SetRunning)
                .parse(input),
            LISP_STREAM_CODE => script::StreamCode::parse_body(cmd)
                .map(Self::StreamCode)
                .parse(input),
            BM_ERASE_FLASH_ALL => probe::EraseFlashAll::parse_body(cmd)
                .map(Self::EraseFlashAll)
                .parse(input),
            BM_WRITE_FLASH => probe::WriteFlash::parse_body(cmd)
                .map(Self::WriteFlash)
                .parse(input),
            BM_WRITE_FLASH_LZO => probe::WriteFlashCompressed::parse_body(cmd)
                .map(Self::WriteFlashCompressed)
                .parse(input),
            BM_MEM_READ => probe::MemRead::parse_body(cmd)
                .map(Self::MemRead)
                .parse(input),
            FORWARD_CAN => ForwardCan::parse_body(cmd)
                .map(Self::ForwardCan)
                .parse(input),

            // we don't recognize the command
            _ => nom::combinator::fail(input),
        }
    }
}

/// Any reply the target sends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reply<I> {
    FwVersion(firmware::FwVersionReply<I>),
    Ack(Ack),
    WriteAck(WriteAck),
    ProbeAck(ProbeAck),
    MemRead(MemReadReply<I>),
    Stream(StreamAck),
}

impl<I> MessageSerialize for Reply<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        match self {
            Self::FwVersion(m) => m.command(),
            Self::Ack(m) => m.command(),
            Self::WriteAck(m) => m.command(),
            Self::ProbeAck(m) => m.command(),
            Self::MemRead(m) => m.command(),
            Self::Stream(m) => m.command(),
        }
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::FwVersion(m) => m.message_body(ser),
            Self::Ack(m) => m.message_body(ser),
            Self::WriteAck(m) => m.message_body(ser),
            Self::ProbeAck(m) => m.message_body(ser),
            Self::MemRead(m) => m.message_body(ser),
            Self::Stream(m) => m.message_body(ser),
        }
    }
}

impl<'a> MessageParse<'a> for Reply<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        nom::branch::alt((
            firmware::FwVersionReply::parse_body(cmd).map(Reply::FwVersion),
            Ack::parse_body(cmd).map(Reply::Ack),
            WriteAck::parse_body(cmd).map(Reply::WriteAck),
            ProbeAck::parse_body(cmd).map(Reply::ProbeAck),
            MemReadReply::parse_body(cmd).map(Reply::MemRead),
            StreamAck::parse_body(cmd).map(Reply::Stream),
        ))
    }
}
