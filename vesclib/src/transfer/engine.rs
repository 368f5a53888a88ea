use std::time::Duration;

use crate::heatshrink;
use crate::package::{ui_payload, VescPackage};
use crate::protocol::crc::crc16;
use crate::protocol::firmware::{
    EraseBootloader, EraseNewApp, FwVersion, FwVersionReply, JumpToBootloader, WriteNewAppData,
    WriteNewAppDataCompressed,
};
use crate::protocol::probe::{EraseFlashAll, MemRead, WriteFlash, WriteFlashCompressed};
use crate::protocol::script::{CodeArea, EraseCode, SetRunning, StreamCode, StreamMode, WriteCode};
use crate::protocol::serialize::{infallible, Serializer};
use crate::protocol::{MessageParse, MessageSerialize, ProbeAck, Reply};

use super::{
    CancelToken, Capabilities, Clock, Compression, Deadline, Link, Phase, SystemClock, Target,
    TransferError, TransferEvent, TransferOptions, TransferState, Wait, ERASE_SLACK,
    COMPRESS_MARGIN, IMAGE_COMPRESSED,
};

type Observer<'a> = &'a mut dyn FnMut(&TransferEvent);

/// Drives uploads over a [Link], one request at a time.
#[derive(Debug)]
pub struct Transfer<L, C = SystemClock> {
    link: L,
    clock: C,
    options: TransferOptions,
    capabilities: Capabilities,
    cancel: CancelToken,
    state: TransferState,
}

impl<L> Transfer<L, SystemClock>
where
    L: Link,
    L::Error: core::fmt::Debug,
{
    pub fn new(link: L, options: TransferOptions) -> Self {
        Self::new_with_clock(link, SystemClock::default(), options)
    }
}

impl<L, C> Transfer<L, C>
where
    L: Link,
    L::Error: core::fmt::Debug,
    C: Clock,
{
    pub fn new_with_clock(link: L, clock: C, options: TransferOptions) -> Self {
        Self {
            link,
            clock,
            options,
            capabilities: Capabilities::default(),
            cancel: CancelToken::new(),
            state: TransferState::Idle,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Release the link used to create this engine.
    pub fn free(self) -> L {
        self.link
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut TransferOptions {
        &mut self.options
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// A handle that can stop a running transfer at the next chunk.
    /// Each new transfer clears it.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// Ask the target for its version, and remember what it can do.
    pub fn query_version(&mut self) -> Result<FwVersionReply<Vec<u8>>, TransferError<L::Error>> {
        self.send(&FwVersion)?;
        let timeout = self.options.write_timeout;
        let reply = self
            .wait_reply(timeout, |reply| match reply {
                Reply::FwVersion(v) => Some(FwVersionReply {
                    major: v.major,
                    minor: v.minor,
                    hw_name: v.hw_name.to_vec(),
                    uuid: v.uuid,
                    paired: v.paired,
                    test_version: v.test_version,
                    hw_type: v.hw_type,
                    custom_configs: v.custom_configs,
                }),
                _ => None,
            })
            .map_err(TransferError::Link)?
            .ok_or(TransferError::Timeout {
                phase: Phase::Query,
                address: 0,
            })?;

        log::info!(
            "target {} runs firmware {}.{:02}",
            reply.hw_name_lossy(),
            reply.major,
            reply.minor
        );
        self.capabilities = Capabilities::from_version(&reply);
        Ok(reply)
    }

    /// Erase `target`, then write `data` into it.
    ///
    /// Events are reported to `on_event` as the transfer goes, ending
    /// with exactly one of the finished states.
    pub fn upload<F>(
        &mut self,
        target: Target,
        data: &[u8],
        mut on_event: F,
    ) -> Result<(), TransferError<L::Error>>
    where
        F: FnMut(&TransferEvent),
    {
        self.cancel.reset();
        let result = self.run_upload(target, data, &mut on_event);
        self.finish(target, &result, &mut on_event);
        result
    }

    /// Install a package: UI first, then the script, which is started.
    pub fn install_package<F>(
        &mut self,
        package: &VescPackage,
        mut on_event: F,
    ) -> Result<(), TransferError<L::Error>>
    where
        F: FnMut(&TransferEvent),
    {
        if !package.ui_bundle.is_empty() {
            let ui = ui_payload(&package.ui_bundle, package.ui_fullscreen);
            self.upload(Target::Ui, &ui, &mut on_event)?;
        }

        if !package.script_data.is_empty() {
            self.upload(Target::Script, &package.script_data, &mut on_event)?;
            self.set_running(true)?;
        }

        Ok(())
    }

    /// Start or stop the stored script.
    pub fn set_running(&mut self, running: bool) -> Result<(), TransferError<L::Error>> {
        let msg = SetRunning { running };
        let cmd = msg.command();
        self.send(&msg)?;
        let timeout = self.options.write_timeout;
        let ok = self
            .wait_reply(timeout, |reply| match reply {
                Reply::Ack(a) if a.command == cmd => Some(a.ok),
                _ => None,
            })
            .map_err(TransferError::Link)?;

        // older targets never answer this
        match ok {
            Some(false) => log::warn!("target refused to change script state"),
            None => log::debug!("no reply to set-running"),
            Some(true) => {}
        }
        Ok(())
    }

    /// Run a script bundle from RAM without storing it. Each chunk must
    /// be accepted, and nothing is retried.
    pub fn stream_script<F>(
        &mut self,
        bundle: &[u8],
        mode: StreamMode,
        mut on_event: F,
    ) -> Result<(), TransferError<L::Error>>
    where
        F: FnMut(&TransferEvent),
    {
        self.cancel.reset();
        let result = self.run_stream(bundle, mode, &mut on_event);
        self.finish(Target::Script, &result, &mut on_event);
        result
    }

    fn run_stream(
        &mut self,
        bundle: &[u8],
        mode: StreamMode,
        on_event: Observer,
    ) -> Result<(), TransferError<L::Error>> {
        self.enter(TransferState::Writing, "Streaming Code", on_event);

        let total = bundle.len();
        let chunk_size = self.options.chunk_size.max(1);
        for (i, data) in bundle.chunks(chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let offset = i * chunk_size;
            self.send(&StreamCode {
                offset: offset as i32,
                total: total as i32,
                mode,
                data,
            })?;

            let timeout = self.options.stream_timeout;
            let result = self
                .wait_reply(timeout, |reply| match reply {
                    Reply::Stream(s) => Some(s.result),
                    _ => None,
                })
                .map_err(TransferError::Link)?;

            match result {
                Some(0) => {}
                Some(r) => {
                    log::warn!("stream rejected at {} with result {}", offset, r);
                    return Err(TransferError::TargetRejected {
                        phase: Phase::Stream,
                        address: offset as u32,
                    });
                }
                None => {
                    return Err(TransferError::Timeout {
                        phase: Phase::Stream,
                        address: offset as u32,
                    })
                }
            }

            on_event(&TransferEvent::Progress {
                done: offset + data.len(),
                total,
            });
        }

        Ok(())
    }

    fn run_upload(
        &mut self,
        target: Target,
        data: &[u8],
        on_event: Observer,
    ) -> Result<(), TransferError<L::Error>> {
        let payload = self.prepare(target, data)?;

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let erase_size = match target {
            Target::Script | Target::Ui => payload.len() as u32 + ERASE_SLACK,
            _ => payload.len() as u32,
        };
        self.erase(target, erase_size, on_event)?;
        self.write_all(target, &payload, on_event)?;

        if let Target::Probe { address } = target {
            if self.options.verify {
                self.verify(address, &payload, on_event)?;
            }
        }

        if target == Target::Firmware && self.options.reboot {
            log::info!("jumping to bootloader");
            self.send(&JumpToBootloader {
                broadcast: self.options.broadcast,
            })?;
        }

        Ok(())
    }

    /// Build the bytes that are actually written, checking they fit.
    fn prepare(&self, target: Target, data: &[u8]) -> Result<Vec<u8>, TransferError<L::Error>> {
        let mut out: Vec<u8> = Vec::new();
        match target {
            Target::Firmware => {
                let mut image = std::borrow::Cow::Borrowed(data);
                let mut len = data.len() as u32;
                if self.options.compression == Compression::Image
                    && self.capabilities.compression(target, self.options.broadcast)
                {
                    let packed = heatshrink::compress(data);
                    if packed.len() < data.len() && packed.len() < (1 << 24) {
                        log::info!("image compressed to {} bytes", packed.len());
                        len = packed.len() as u32 | (IMAGE_COMPRESSED as u32) << 24;
                        image = std::borrow::Cow::Owned(packed);
                    }
                }
                infallible(out.write_be_u32(len));
                infallible(out.write_be_u16(crc16(&image)));
                infallible(out.write_bytes(&image));
            }
            Target::Script | Target::Ui => {
                // the flags word is not counted in the length
                infallible(out.write_be_u32(data.len().saturating_sub(2) as u32));
                infallible(out.write_be_u16(crc16(data)));
                infallible(out.write_bytes(data));
            }
            Target::Bootloader | Target::Probe { .. } => out.extend_from_slice(data),
        }

        if let Some(max) = target.max_len(self.capabilities.hw_type) {
            if out.len() > max {
                return Err(TransferError::Capacity {
                    size: out.len(),
                    max,
                });
            }
        }

        Ok(out)
    }

    fn erase(
        &mut self,
        target: Target,
        size: u32,
        on_event: Observer,
    ) -> Result<(), TransferError<L::Error>> {
        self.enter(TransferState::Erasing, target.erase_status(), on_event);

        let broadcast = self.options.broadcast;
        let payload = match target {
            Target::Firmware => EraseNewApp { size, broadcast }.to_payload(),
            Target::Bootloader => EraseBootloader { broadcast }.to_payload(),
            Target::Script => EraseCode {
                area: CodeArea::Script,
                size,
            }
            .to_payload(),
            Target::Ui => EraseCode {
                area: CodeArea::Ui,
                size,
            }
            .to_payload(),
            Target::Probe { .. } => EraseFlashAll.to_payload(),
        };
        let cmd = payload[0];
        self.link.send(&payload).map_err(TransferError::Link)?;

        let timeout = self.options.erase_timeout(target);
        let ok = self
            .wait_reply(timeout, |reply| match reply {
                Reply::Ack(a) if a.command == cmd => Some(a.ok),
                Reply::ProbeAck(a) if a.command == cmd => Some(a.ok()),
                _ => None,
            })
            .map_err(TransferError::Link)?;

        let address = target.base_address();
        match ok {
            Some(true) => Ok(()),
            Some(false) => Err(TransferError::TargetRejected {
                phase: Phase::Erase,
                address,
            }),
            None => Err(TransferError::Timeout {
                phase: Phase::Erase,
                address,
            }),
        }
    }

    fn write_all(
        &mut self,
        target: Target,
        payload: &[u8],
        on_event: Observer,
    ) -> Result<(), TransferError<L::Error>> {
        self.enter(TransferState::Writing, target.write_status(), on_event);

        let total = payload.len();
        let chunk_size = self.options.chunk_size.max(1);
        let chunked = match self.options.compression {
            Compression::Off => false,
            Compression::Chunks => true,
            // the image is already compressed as a whole
            Compression::Image => target != Target::Firmware,
        };
        let compress = chunked
            && total > chunk_size
            && self.capabilities.compression(target, self.options.broadcast);
        if compress {
            log::debug!("compressing chunks where it helps");
        }

        for (i, chunk) in payload.chunks(chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let offset = i * chunk_size;
            let address = target.base_address() + offset as u32;
            self.write_chunk(target, address, chunk, compress, on_event)?;

            on_event(&TransferEvent::Progress {
                done: offset + chunk.len(),
                total,
            });
        }

        Ok(())
    }

    /// Write one chunk, retrying on timeouts and rejections alike.
    fn write_chunk(
        &mut self,
        target: Target,
        address: u32,
        chunk: &[u8],
        compress: bool,
        on_event: Observer,
    ) -> Result<(), TransferError<L::Error>> {
        let mut failure = TransferError::Timeout {
            phase: Phase::Write,
            address,
        };

        for attempt in 0..self.options.write_retries.max(1) {
            if attempt > 0 {
                log::warn!("retrying chunk at 0x{:x}, attempt {}", address, attempt + 1);
                on_event(&TransferEvent::Retry { address, attempt });
            }

            // compressed on even attempts, plain on odd ones
            let packed = if compress && attempt % 2 == 0 {
                compress_chunk(chunk)
            } else {
                None
            };
            let payload = self.write_request(target, address, chunk, packed.as_deref());
            let cmd = payload[0];
            self.link.send(&payload).map_err(TransferError::Link)?;

            let timeout = self.options.write_timeout;
            let ok = self
                .wait_reply(timeout, |reply| match reply {
                    Reply::WriteAck(a) if a.command == cmd => {
                        if a.matches(address) {
                            Some(a.ok)
                        } else {
                            log::debug!("ignoring stale ack for {:?}", a.offset);
                            None
                        }
                    }
                    Reply::ProbeAck(a) if a.command == cmd => Some(a.ok()),
                    _ => None,
                })
                .map_err(TransferError::Link)?;

            match ok {
                Some(true) => return Ok(()),
                Some(false) => {
                    failure = TransferError::TargetRejected {
                        phase: Phase::Write,
                        address,
                    }
                }
                None => {
                    failure = TransferError::Timeout {
                        phase: Phase::Write,
                        address,
                    }
                }
            }
        }

        Err(failure)
    }

    fn write_request(
        &self,
        target: Target,
        address: u32,
        chunk: &[u8],
        packed: Option<&[u8]>,
    ) -> Vec<u8> {
        let broadcast = self.options.broadcast;
        match (target, packed) {
            (Target::Firmware | Target::Bootloader, Some(data)) => WriteNewAppDataCompressed {
                offset: address,
                raw_len: chunk.len() as u16,
                data,
                broadcast,
            }
            .to_payload(),
            (Target::Firmware | Target::Bootloader, None) => WriteNewAppData {
                offset: address,
                data: chunk,
                broadcast,
            }
            .to_payload(),
            (Target::Script, _) => WriteCode {
                area: CodeArea::Script,
                offset: address,
                data: chunk,
            }
            .to_payload(),
            (Target::Ui, _) => WriteCode {
                area: CodeArea::Ui,
                offset: address,
                data: chunk,
            }
            .to_payload(),
            (Target::Probe { .. }, Some(data)) => WriteFlashCompressed {
                address,
                raw_len: chunk.len() as u16,
                data,
            }
            .to_payload(),
            (Target::Probe { .. }, None) => WriteFlash {
                address,
                data: chunk,
            }
            .to_payload(),
        }
    }

    /// Read back a probe write and compare it.
    fn verify(
        &mut self,
        base: u32,
        payload: &[u8],
        on_event: Observer,
    ) -> Result<(), TransferError<L::Error>> {
        self.enter(TransferState::Verifying, "Verifying", on_event);

        let total = payload.len();
        let chunk_size = self.options.chunk_size.max(1);
        for (i, expected) in payload.chunks(chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let offset = i * chunk_size;
            let address = base + offset as u32;
            let (result, data) = self.read_back(address, expected.len() as u16)?;
            if result != ProbeAck::SUCCESS {
                return Err(TransferError::TargetRejected {
                    phase: Phase::Verify,
                    address,
                });
            }
            if data != expected {
                log::warn!(
                    "read back {} bytes at 0x{:x}, expected {}",
                    data.len(),
                    address,
                    expected.len()
                );
                return Err(TransferError::VerifyMismatch { address });
            }

            on_event(&TransferEvent::Progress {
                done: offset + expected.len(),
                total,
            });
        }

        Ok(())
    }

    /// Only timeouts are retried here.
    ///
    /// Read replies carry no address, so a reply to a timed-out request
    /// that turns up late would be taken for the next one. Those are
    /// drained before returning.
    fn read_back(&mut self, address: u32, len: u16) -> Result<(i16, Vec<u8>), TransferError<L::Error>> {
        let mut unanswered = 0;
        for _ in 0..self.options.write_retries.max(1) {
            self.send(&MemRead { address, len })?;
            let timeout = self.options.write_timeout;
            let reply = self
                .wait_reply(timeout, |reply| match reply {
                    Reply::MemRead(m) => Some((m.result, m.data.to_vec())),
                    _ => None,
                })
                .map_err(TransferError::Link)?;
            if let Some(reply) = reply {
                self.drain_reads(unanswered)?;
                return Ok(reply);
            }
            unanswered += 1;
            log::warn!("read at 0x{:x} timed out", address);
        }

        Err(TransferError::Timeout {
            phase: Phase::Verify,
            address,
        })
    }

    /// Swallow up to `count` late read replies.
    fn drain_reads(&mut self, mut count: usize) -> Result<(), TransferError<L::Error>> {
        let timeout = self.options.write_timeout;
        while count > 0 {
            let late = self
                .wait_reply(timeout, |reply| match reply {
                    Reply::MemRead(_) => Some(()),
                    _ => None,
                })
                .map_err(TransferError::Link)?;
            if late.is_none() {
                break;
            }
            log::debug!("dropped a late read reply");
            count -= 1;
        }
        Ok(())
    }

    fn send<M>(&mut self, msg: &M) -> Result<(), TransferError<L::Error>>
    where
        M: MessageSerialize,
    {
        self.link
            .send(&msg.to_payload())
            .map_err(TransferError::Link)
    }

    /// Poll the link once. Replies the matcher rejects are dropped.
    pub fn poll_reply<T, M>(&mut self, deadline: &Deadline, mut matcher: M) -> Result<Wait<T>, L::Error>
    where
        M: FnMut(Reply<&[u8]>) -> Option<T>,
    {
        if let Some(payload) = self.link.poll()? {
            match Reply::parse_payload(&payload) {
                Ok(reply) => {
                    let cmd = reply.command();
                    if let Some(v) = matcher(reply) {
                        return Ok(Wait::Ready(v));
                    }
                    log::debug!("ignoring reply to command {}", cmd);
                }
                Err(e) => log::debug!("unparsed reply: {}", e),
            }
        }

        if deadline.expired(&self.clock) {
            Ok(Wait::TimedOut)
        } else {
            Ok(Wait::Pending)
        }
    }

    /// Wait for a reply the matcher accepts, or for `timeout` to pass.
    fn wait_reply<T, M>(&mut self, timeout: Duration, mut matcher: M) -> Result<Option<T>, L::Error>
    where
        M: FnMut(Reply<&[u8]>) -> Option<T>,
    {
        let deadline = Deadline::after(&self.clock, timeout);
        loop {
            match self.poll_reply(&deadline, &mut matcher)? {
                Wait::Ready(v) => return Ok(Some(v)),
                Wait::TimedOut => return Ok(None),
                Wait::Pending => {
                    self.link.tick();
                    self.clock.sleep(self.options.tick);
                }
            }
        }
    }

    fn enter(&mut self, state: TransferState, status: &str, on_event: Observer) {
        log::info!("{}", status);
        self.state = state.clone();
        on_event(&TransferEvent::Phase {
            state,
            status: status.to_owned(),
        });
    }

    fn finish(
        &mut self,
        target: Target,
        result: &Result<(), TransferError<L::Error>>,
        on_event: Observer,
    ) {
        match result {
            Ok(()) => self.enter(TransferState::Done, target.done_status(), on_event),
            Err(TransferError::Cancelled) => {
                self.enter(TransferState::Cancelled, "Cancelled", on_event)
            }
            Err(e) => {
                log::warn!("transfer failed: {}", e);
                let status = e.status(target);
                self.enter(TransferState::Failed(status.clone()), &status, on_event)
            }
        }
    }
}

/// Compress a chunk, if that saves enough to be worth it.
fn compress_chunk(chunk: &[u8]) -> Option<Vec<u8>> {
    let limit = chunk.len().checked_sub(COMPRESS_MARGIN + 1)?;
    let mut out = vec![0; limit];
    let len = heatshrink::compress_into(chunk, &mut out)?;
    out.truncate(len);
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::command;
    use crate::transfer::ManualClock;

    /// Replies to nothing.
    #[derive(Default)]
    struct Silent {
        sent: Vec<Vec<u8>>,
        ticks: usize,
    }

    impl Link for Silent {
        type Error = ();

        fn send(&mut self, payload: &[u8]) -> Result<(), ()> {
            self.sent.push(payload.to_vec());
            Ok(())
        }

        fn poll(&mut self) -> Result<Option<Vec<u8>>, ()> {
            Ok(None)
        }

        fn tick(&mut self) {
            self.ticks += 1;
        }
    }

    fn engine() -> Transfer<Silent, ManualClock> {
        Transfer::new_with_clock(
            Silent::default(),
            ManualClock::new(),
            TransferOptions::default(),
        )
    }

    #[test]
    fn erase_timeout() {
        let mut t = engine();
        let mut states = Vec::new();
        let res = t.upload(Target::Script, b"\0\0(+ 1 2)\0", |e| {
            if let TransferEvent::Phase { state, .. } = e {
                states.push(state.clone());
            }
        });
        assert_eq!(
            res,
            Err(TransferError::Timeout {
                phase: Phase::Erase,
                address: 0
            })
        );
        assert_eq!(
            states,
            vec![
                TransferState::Erasing,
                TransferState::Failed("Erase timed out".to_owned())
            ]
        );
        // waited the whole erase timeout, one tick at a time
        assert_eq!(t.clock().now(), Duration::from_secs(8));
        assert_eq!(t.link().ticks, 800);
        assert_eq!(t.link().sent.len(), 1);
        assert_eq!(t.link().sent[0][0], command::LISP_ERASE_CODE);
    }

    #[test]
    fn capacity_preflight() {
        let mut t = engine();
        t.set_capabilities(Capabilities::new(crate::protocol::HwType::Vesc));
        let big = vec![0x55; 130 * 1024];
        let res = t.upload(Target::Script, &big, |_| {});
        assert_eq!(
            res,
            Err(TransferError::Capacity {
                size: big.len() + 6,
                max: 120 * 1024
            })
        );
        assert!(t.link().sent.is_empty());
        assert_eq!(
            t.state(),
            &TransferState::Failed("Not enough space".to_owned())
        );
    }

    #[test]
    fn script_header() {
        let t = engine();
        let bundle = b"\0\0(+ 1 2)\0";
        let out = t.prepare(Target::Script, bundle).unwrap();
        assert_eq!(&out[..4], &(bundle.len() as u32 - 2).to_be_bytes());
        assert_eq!(&out[4..6], &crc16(bundle).to_be_bytes());
        assert_eq!(&out[6..], bundle);
    }

    #[test]
    fn firmware_image_compression() {
        let mut t = engine();
        t.options_mut().compression = Compression::Image;
        let image = vec![0xaa; 4000];

        // not advertised, so sent plain
        let out = t.prepare(Target::Firmware, &image).unwrap();
        assert_eq!(&out[..4], &4000u32.to_be_bytes());
        assert_eq!(out.len(), 4006);

        t.set_capabilities(Capabilities::default().with(command::WRITE_NEW_APP_DATA_LZO));
        let out = t.prepare(Target::Firmware, &image).unwrap();
        assert_eq!(out[0], IMAGE_COMPRESSED);
        let len = u32::from_be_bytes([0, out[1], out[2], out[3]]) as usize;
        assert_eq!(len, out.len() - 6);
        assert_eq!(&out[4..6], &crc16(&out[6..]).to_be_bytes());
        assert_eq!(heatshrink::decompress(&out[6..]).unwrap(), image);
    }

    #[test]
    fn chunk_compression_needs_margin() {
        assert_eq!(compress_chunk(&[0; 8]), None);
        let packed = compress_chunk(&[7; 384]).unwrap();
        assert!(packed.len() + COMPRESS_MARGIN < 384);
        // random-ish data does not shrink
        let mut x = 0x1234_5678u32;
        let noise: Vec<u8> = (0..384)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                (x >> 24) as u8
            })
            .collect();
        assert_eq!(compress_chunk(&noise), None);
    }

    #[test]
    fn cancel_before_start() {
        let mut t = engine();
        // a fresh transfer clears an old cancellation
        t.cancel();
        let token = t.cancel_token();
        let res = t.upload(Target::Ui, b"\x00\x01abc", |e| {
            if let TransferEvent::Phase {
                state: TransferState::Erasing,
                ..
            } = e
            {
                token.cancel();
            }
        });
        // cancellation is only seen between chunks, so the erase still
        // times out first
        assert!(matches!(res, Err(TransferError::Timeout { .. })));
    }
}
