use std::collections::VecDeque;

use embedded_io::{Error as _, ErrorKind};

use crate::protocol::{CodecConfig, ForwardCan, FrameDecoder, FrameError, MessageSerialize};
use crate::transfer::Link;

/// Re-export to allow using [Client] with [std::io] streams.
pub use embedded_io_adapters::std::FromStd;

/// Size of each read from the port.
const READ_CHUNK: usize = 256;

/// An error type for [Client].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientError<E> {
    /// EOF in underlying stream.
    UnexpectedEof,
    /// Other IO error in underlying stream.
    Io(E),
    /// Outgoing payload could not be framed.
    Frame(FrameError),
}

impl<E> std::error::Error for ClientError<E> where E: core::fmt::Debug {}

impl<E> core::fmt::Display for ClientError<E>
where
    E: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected eof"),
            Self::Io(e) => write!(f, "io error: {:?}", e),
            Self::Frame(e) => write!(f, "frame error: {}", e),
        }
    }
}

impl<E> From<E> for ClientError<E> {
    fn from(other: E) -> Self {
        Self::Io(other)
    }
}

/// A client for the framed serial protocol, over any byte stream.
///
/// Reads that time out are not errors, they just mean nothing has
/// arrived yet.
#[derive(Debug)]
pub struct Client<F> {
    port: F,
    decoder: FrameDecoder,
    pending: VecDeque<Vec<u8>>,
    forward: Option<u8>,
}

impl<F> Client<F> {
    /// Create a new client with the default limits.
    pub fn new(port: F) -> Self {
        Self::new_with(CodecConfig::default(), port)
    }

    /// Create a new client with the provided limits.
    pub fn new_with(config: CodecConfig, port: F) -> Self {
        Self {
            port,
            decoder: FrameDecoder::new(config),
            pending: VecDeque::new(),
            forward: None,
        }
    }

    /// Send everything to another device on the bus, through the one
    /// this port is connected to. `None` talks to the connected
    /// device itself.
    pub fn set_forward(&mut self, target: Option<u8>) {
        self.forward = target;
    }

    pub fn forward(&self) -> Option<u8> {
        self.forward
    }

    /// Release the port used to create this client.
    pub fn free(self) -> F {
        self.port
    }

    /// Get the underlying port.
    pub fn port(&self) -> &F {
        &self.port
    }

    /// Get the underlying port, mutably
    ///
    /// Using this won't confuse the client, but it might cause you to miss
    /// messages if you are not careful.
    pub fn port_mut(&mut self) -> &mut F {
        &mut self.port
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }
}

impl<F> Client<FromStd<F>> {
    /// Create a new client using an [std::io] port.
    pub fn new_std(port: F) -> Self {
        Self::new(FromStd::new(port))
    }
}

impl<F> Client<F>
where
    F: embedded_io::Read,
{
    /// Read once from the port and return the next complete payload,
    /// if there is one.
    pub fn read_payload(&mut self) -> Result<Option<Vec<u8>>, ClientError<F::Error>> {
        if let Some(payload) = self.pending.pop_front() {
            return Ok(Some(payload));
        }

        let mut buf = [0; READ_CHUNK];
        let amt = match self.port.read(&mut buf) {
            // end of file is an error
            Ok(0) => return Err(ClientError::UnexpectedEof),
            Ok(amt) => amt,
            Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(ClientError::Io(e)),
        };

        log::trace!("read {:02x?}", &buf[..amt]);
        for b in &buf[..amt] {
            self.decoder
                .push_byte(*b, |payload| self.pending.push_back(payload.to_owned()));
        }

        Ok(self.pending.pop_front())
    }
}

impl<F> Client<F>
where
    F: embedded_io::Write,
{
    /// Frame and write a raw payload.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), ClientError<F::Error>> {
        let config = self.decoder.config();
        let frame = match self.forward {
            Some(target) => config.encode(&ForwardCan { target, payload }.to_payload()),
            None => config.encode(payload),
        }
        .map_err(ClientError::Frame)?;

        log::trace!("write {:02x?}", frame);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }

    /// Write a message to the port.
    pub fn write<M>(&mut self, msg: &M) -> Result<(), ClientError<F::Error>>
    where
        M: MessageSerialize,
    {
        self.write_payload(&msg.to_payload())
    }
}

impl<F> Link for Client<F>
where
    F: embedded_io::Read + embedded_io::Write,
{
    type Error = ClientError<F::Error>;

    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        self.write_payload(payload)
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>, Self::Error> {
        self.read_payload()
    }

    fn tick(&mut self) {
        self.decoder.tick();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{encode_frame, firmware::FwVersion};
    use std::io::{Read, Write};

    /// A port that replays canned input, then times out.
    struct Canned {
        input: std::io::Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Canned {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let amt = self.input.read(buf)?;
            if amt == 0 {
                Err(std::io::ErrorKind::TimedOut.into())
            } else {
                Ok(amt)
            }
        }
    }

    impl Write for Canned {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn canned(input: Vec<u8>) -> Client<FromStd<Canned>> {
        Client::new_std(Canned {
            input: std::io::Cursor::new(input),
            output: Vec::new(),
        })
    }

    #[test]
    fn write_frames_payload() {
        let mut client = canned(vec![]);
        client.write(&FwVersion).unwrap();
        assert_eq!(
            client.port().inner().output,
            encode_frame(b"\x00", 512).unwrap()
        );
    }

    #[test]
    fn write_forwarded() {
        let mut client = canned(vec![]);
        client.set_forward(Some(5));
        client.write(&FwVersion).unwrap();
        assert_eq!(
            client.port().inner().output,
            encode_frame(b"\x22\x05\x00", 512).unwrap()
        );
    }

    #[test]
    fn read_two_frames() {
        let mut input = b"junk".to_vec();
        input.extend(encode_frame(b"one", 512).unwrap());
        input.extend(encode_frame(b"two", 512).unwrap());
        let mut client = canned(input);
        assert_eq!(client.read_payload().unwrap(), Some(b"one".to_vec()));
        assert_eq!(client.read_payload().unwrap(), Some(b"two".to_vec()));
        assert_eq!(client.read_payload().unwrap(), None);
    }

    #[test]
    fn write_empty_payload() {
        let mut client = canned(vec![]);
        assert!(matches!(
            client.write_payload(b""),
            Err(ClientError::Frame(FrameError::Empty))
        ));
    }
}
