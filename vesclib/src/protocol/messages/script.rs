//! Messages for the script (lisp) and UI (qml) storage areas.

use nom::{error::Error, Parser};

use crate::protocol::parse::MessageParse;
use crate::protocol::serialize::{MessageSerialize, Serializer};

use super::{command, util};

/// Which storage area a script or UI message is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CodeArea {
    Script,
    Ui,
}

impl CodeArea {
    pub fn erase_command(&self) -> u8 {
        match self {
            Self::Script => command::LISP_ERASE_CODE,
            Self::Ui => command::QMLUI_ERASE,
        }
    }

    pub fn write_command(&self) -> u8 {
        match self {
            Self::Script => command::LISP_WRITE_CODE,
            Self::Ui => command::QMLUI_WRITE,
        }
    }
}

/// LISP_ERASE_CODE or QMLUI_ERASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EraseCode {
    pub area: CodeArea,
    /// Bytes that will be written afterwards.
    pub size: u32,
}

impl MessageSerialize for EraseCode {
    fn command(&self) -> u8 {
        self.area.erase_command()
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.size)
    }
}

impl<'a> MessageParse<'a> for EraseCode {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let ids = [command::LISP_ERASE_CODE, command::QMLUI_ERASE];
            let (input, _) = util::expect_command(cmd, &ids, input)?;
            let (input, size) = nom::number::complete::be_u32(input)?;
            let area = if cmd == command::QMLUI_ERASE {
                CodeArea::Ui
            } else {
                CodeArea::Script
            };
            Ok((input, EraseCode { area, size }))
        }
    }
}

/// LISP_WRITE_CODE or QMLUI_WRITE.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteCode<I> {
    pub area: CodeArea,
    pub offset: u32,
    pub data: I,
}

impl<I> MessageSerialize for WriteCode<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        self.area.write_command()
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_u32(self.offset)?;
        ser.write_bytes(self.data.as_ref())
    }
}

impl<'a> MessageParse<'a> for WriteCode<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let ids = [command::LISP_WRITE_CODE, command::QMLUI_WRITE];
            let (input, _) = util::expect_command(cmd, &ids, input)?;
            let (input, offset) = nom::number::complete::be_u32(input)?;
            let (input, data) = nom::combinator::rest(input)?;
            let area = if cmd == command::QMLUI_WRITE {
                CodeArea::Ui
            } else {
                CodeArea::Script
            };
            Ok((input, WriteCode { area, offset, data }))
        }
    }
}

/// LISP_SET_RUNNING: start or stop the stored script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetRunning {
    pub running: bool,
}

impl MessageSerialize for SetRunning {
    fn command(&self) -> u8 {
        command::LISP_SET_RUNNING
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_u8(self.running as u8)
    }
}

impl<'a> MessageParse<'a> for SetRunning {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::LISP_SET_RUNNING], input)?;
            let (input, running) = util::flag(input)?;
            Ok((input, SetRunning { running }))
        }
    }
}

/// How a streamed script is handled once it has all arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum StreamMode {
    /// Run it in a fresh environment.
    #[default]
    Run,
    /// Evaluate it in the running environment.
    Append,
    Other(i8),
}

impl From<i8> for StreamMode {
    fn from(value: i8) -> Self {
        match value {
            0 => Self::Run,
            1 => Self::Append,
            n => Self::Other(n),
        }
    }
}

impl From<StreamMode> for i8 {
    fn from(value: StreamMode) -> Self {
        match value {
            StreamMode::Run => 0,
            StreamMode::Append => 1,
            StreamMode::Other(n) => n,
        }
    }
}

/// LISP_STREAM_CODE: one piece of a script that is run from RAM
/// instead of being stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamCode<I> {
    pub offset: i32,
    /// Length of the whole script.
    pub total: i32,
    pub mode: StreamMode,
    pub data: I,
}

impl<I> MessageSerialize for StreamCode<I>
where
    I: AsRef<[u8]>,
{
    fn command(&self) -> u8 {
        command::LISP_STREAM_CODE
    }

    fn message_body<S>(&self, ser: &mut S) -> Result<(), S::Error>
    where
        S: Serializer,
    {
        ser.write_be_i32(self.offset)?;
        ser.write_be_i32(self.total)?;
        ser.write_i8(self.mode.into())?;
        ser.write_bytes(self.data.as_ref())
    }
}

impl<'a> MessageParse<'a> for StreamCode<&'a [u8]> {
    fn parse_body(cmd: u8) -> impl Parser<&'a [u8], Self, Error<&'a [u8]>> {
        use nom::number::complete::{be_i32, i8};

        move |input: &'a [u8]| {
            let (input, _) = util::expect_command(cmd, &[command::LISP_STREAM_CODE], input)?;
            let (input, offset) = be_i32(input)?;
            let (input, total) = be_i32(input)?;
            let (input, mode) = i8(input)?;
            let (input, data) = nom::combinator::rest(input)?;
            Ok((
                input,
                StreamCode {
                    offset,
                    total,
                    mode: mode.into(),
                    data,
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

    impl Arbitrary for CodeArea {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) {
                Self::Script
            } else {
                Self::Ui
            }
        }
    }

    #[quickcheck]
    fn roundtrip_erase(area: CodeArea, size: u32) -> bool {
        roundtrip(EraseCode { area, size })
    }

    #[quickcheck]
    fn roundtrip_set_running(running: bool) -> bool {
        roundtrip(SetRunning { running })
    }

    #[quickcheck]
    fn roundtrip_write(area: CodeArea, offset: u32, data: Vec<u8>) -> bool {
        let msg = WriteCode {
            area,
            offset,
            data: &data[..],
        };
        let payload = msg.to_payload();
        WriteCode::parse_payload(&payload) == Ok(msg)
    }

    #[quickcheck]
    fn roundtrip_stream(offset: i32, total: i32, mode: i8, data: Vec<u8>) -> bool {
        let msg = StreamCode {
            offset,
            total,
            mode: mode.into(),
            data: &data[..],
        };
        let payload = msg.to_payload();
        StreamCode::parse_payload(&payload) == Ok(msg)
    }

    #[test]
    fn erase_ui_bytes() {
        let msg = EraseCode {
            area: CodeArea::Ui,
            size: 300,
        };
        assert_eq!(msg.to_payload(), b"\x78\x00\x00\x01\x2c");
    }
}
