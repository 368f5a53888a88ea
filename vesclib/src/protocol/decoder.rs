use super::parse::{try_decode, Decoded};
use super::serialize::{check_payload_len, infallible, write_frame, FrameError};
use super::{MAX_PAYLOAD_LEN, TICK_MS};

/// Framing limits shared by the encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodecConfig {
    /// Largest payload accepted in either direction.
    pub max_payload_len: usize,
    /// Ticks of silence before a partial frame is thrown away.
    pub idle_timeout_ticks: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload_len: MAX_PAYLOAD_LEN,
            // 500ms
            idle_timeout_ticks: 500 / TICK_MS,
        }
    }
}

impl CodecConfig {
    /// Size of the receive buffer. Fits the largest frame with room
    /// for one byte of slack.
    pub fn buffer_len(&self) -> usize {
        self.max_payload_len + 8
    }

    /// Frame a payload with these limits.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        encode_frame(payload, self.max_payload_len)
    }
}

/// Frame a payload: tag, length, payload, CRC, end byte.
pub fn encode_frame(payload: &[u8], max_payload_len: usize) -> Result<Vec<u8>, FrameError> {
    check_payload_len(payload.len(), max_payload_len)?;
    let mut out = Vec::with_capacity(payload.len() + 7);
    infallible(write_frame(&mut out, payload));
    Ok(out)
}

/// A byte-at-a-time frame decoder.
///
/// Bytes are fed in as they arrive, in any split. Garbage between
/// frames is skipped one byte at a time, and a partial frame is
/// dropped once [FrameDecoder::tick] has been called often enough
/// without new input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameDecoder {
    config: CodecConfig,
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    bytes_left: usize,
    idle: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl FrameDecoder {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            buf: vec![0; config.buffer_len()].into_boxed_slice(),
            read: 0,
            write: 0,
            bytes_left: 0,
            idle: config.idle_timeout_ticks,
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Number of bytes held that have not become a frame yet.
    pub fn pending(&self) -> usize {
        self.write - self.read
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.bytes_left = 0;
    }

    /// Advance the idle timer by one tick.
    pub fn tick(&mut self) {
        if self.idle > 0 {
            self.idle -= 1;
        } else {
            if self.pending() > 0 {
                log::debug!("dropping {} bytes of partial frame", self.pending());
            }
            self.reset();
        }
    }

    /// Feed in one byte, calling `on_frame` with each payload that
    /// completes.
    pub fn push_byte<F>(&mut self, byte: u8, mut on_frame: F)
    where
        F: FnMut(&[u8]),
    {
        self.idle = self.config.idle_timeout_ticks;

        let cap = self.buf.len();
        if self.pending() >= cap {
            // full of something that never became a frame
            self.reset();
        }
        if self.write >= cap {
            self.buf.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }

        self.buf[self.write] = byte;
        self.write += 1;

        if self.bytes_left > 1 {
            self.bytes_left -= 1;
            return;
        }

        loop {
            match try_decode(&self.buf[self.read..self.write], self.config.max_payload_len) {
                Decoded::NeedMore(n) => {
                    self.bytes_left = n;
                    break;
                }
                Decoded::Frame { payload, consumed } => {
                    on_frame(&self.buf[self.read + payload.start..self.read + payload.end]);
                    self.read += consumed;
                }
                Decoded::Invalid => {
                    self.read += 1;
                }
            }

            if self.read == self.write {
                self.read = 0;
                self.write = 0;
            }
        }
    }

    /// Feed in a run of bytes, returning every payload that completes.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for b in data {
            self.push_byte(*b, |payload| frames.push(payload.to_owned()));
        }
        frames
    }
}
