/// Frame tag for an 8-bit length. Also the header width.
pub const TAG_LEN_8: u8 = 2;
/// Frame tag for a 16-bit length.
pub const TAG_LEN_16: u8 = 3;
/// Frame tag for a 24-bit length.
pub const TAG_LEN_24: u8 = 4;

pub const FRAME_END: u8 = 3;

/// Largest payload a stock target accepts in one frame.
pub const MAX_PAYLOAD_LEN: usize = 512;

/// Length of one idle/poll tick, in milliseconds.
pub const TICK_MS: u32 = 10;

pub const BAUD_RATE: u32 = 115200;

pub mod crc;

pub mod decoder;
pub use decoder::{encode_frame, CodecConfig, FrameDecoder};

pub mod parse;
pub use parse::{try_decode, Decoded, MessageParse, ParseError};

mod messages;
pub use messages::*;

pub mod serialize;
pub use serialize::{FrameError, MessageSerialize};

/// Serialize a message into a whole frame, ready for the wire.
pub fn serialize<M>(config: &CodecConfig, message: &M) -> Result<Vec<u8>, FrameError>
where
    M: MessageSerialize,
{
    config.encode(&message.to_payload())
}
