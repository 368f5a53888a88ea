//! Reliable chunked transfers into target memory.
//!
//! A transfer erases the destination, then writes the payload in fixed
//! size chunks, each one acknowledged before the next is sent. Only one
//! request is ever in flight.

use std::time::Duration;

use crate::protocol::firmware::FwVersionReply;
use crate::protocol::{command, HwType};

mod engine;
pub use engine::*;

mod wait;
pub use wait::*;

/// Largest chunk a target accepts in one write.
pub const CHUNK_SIZE: usize = 384;

/// Attempts made on each chunk before giving up.
pub const WRITE_RETRIES: u32 = 5;

/// Where a bootloader image goes in the staging area.
pub const BOOTLOADER_OFFSET: u32 = 3 * 128 * 1024;
pub const BOOTLOADER_MAX: usize = 128 * 1024;

pub const SCRIPT_MAX: usize = 500 * 1024;
/// Scripts on a motor controller share a single flash page.
pub const SCRIPT_MAX_VESC: usize = 120 * 1024;
pub const UI_MAX: usize = 120 * 1024;

/// Top byte of the firmware length field when the whole image is
/// compressed.
pub const IMAGE_COMPRESSED: u8 = 0xcc;

/// A compressed chunk must be at least this much smaller to be sent
/// compressed.
pub const COMPRESS_MARGIN: usize = 10;

/// Extra room requested when erasing a script or UI area.
pub const ERASE_SLACK: u32 = 100;

/// A duplex, message-oriented connection to a target.
///
/// Implemented by [crate::Client] for byte streams and by
/// [crate::can::BusClient] for the field bus.
pub trait Link {
    type Error;

    /// Send one whole payload.
    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error>;

    /// Return the next received payload, if one has arrived. Must not
    /// block for long.
    fn poll(&mut self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Called once per idle tick while waiting.
    fn tick(&mut self);
}

impl<L> Link for &mut L
where
    L: Link + ?Sized,
{
    type Error = L::Error;

    fn send(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        (**self).send(payload)
    }

    fn poll(&mut self) -> Result<Option<Vec<u8>>, Self::Error> {
        (**self).poll()
    }

    fn tick(&mut self) {
        (**self).tick()
    }
}

/// What is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    /// A new application image, installed by the bootloader.
    Firmware,
    /// A new bootloader.
    Bootloader,
    /// A script bundle, as built by [crate::imports::ImportBundle].
    Script,
    /// A UI bundle, as built by [crate::package::ui_payload].
    Ui,
    /// Another chip's flash, through a debug probe on the target.
    Probe { address: u32 },
}

impl Target {
    /// Largest prepared payload this target can hold.
    pub fn max_len(&self, hw_type: HwType) -> Option<usize> {
        match self {
            Self::Firmware | Self::Probe { .. } => None,
            Self::Bootloader => Some(BOOTLOADER_MAX),
            Self::Script if hw_type == HwType::Vesc => Some(SCRIPT_MAX_VESC),
            Self::Script => Some(SCRIPT_MAX),
            Self::Ui => Some(UI_MAX),
        }
    }

    /// Where offset 0 of the prepared payload is written.
    pub fn base_address(&self) -> u32 {
        match self {
            Self::Bootloader => BOOTLOADER_OFFSET,
            Self::Probe { address } => *address,
            _ => 0,
        }
    }

    pub(crate) fn done_status(&self) -> &'static str {
        match self {
            Self::Firmware | Self::Bootloader => "FW Upload Done",
            Self::Script => "Code Upload Done",
            Self::Ui => "Qml Upload Done",
            Self::Probe { .. } => "Flash Write Done",
        }
    }

    pub(crate) fn erase_status(&self) -> &'static str {
        match self {
            Self::Firmware | Self::Bootloader => "Buffer Erase",
            Self::Script => "Erasing Lisp Code",
            Self::Ui => "Erasing Qml",
            Self::Probe { .. } => "Erasing Flash",
        }
    }

    pub(crate) fn write_status(&self) -> &'static str {
        match self {
            Self::Firmware | Self::Bootloader => "FW Data Write",
            Self::Script => "Writing Lisp Code",
            Self::Ui => "Writing Qml",
            Self::Probe { .. } => "Writing Flash",
        }
    }
}

/// How payloads are compressed on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Compression {
    /// Always send plain data.
    Off,
    /// Compress individual chunks when the target supports it, falling
    /// back to plain data per chunk.
    #[default]
    Chunks,
    /// Compress a whole firmware image once and mark it in the header.
    /// Other targets treat this like [Compression::Chunks].
    Image,
}

/// Knobs for a [Transfer].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferOptions {
    pub chunk_size: usize,
    /// Attempts per chunk, including the first.
    pub write_retries: u32,
    pub write_timeout: Duration,
    pub firmware_erase_timeout: Duration,
    pub bootloader_erase_timeout: Duration,
    pub script_erase_timeout: Duration,
    pub ui_erase_timeout: Duration,
    pub probe_erase_timeout: Duration,
    pub stream_timeout: Duration,
    pub compression: Compression,
    /// Read probe writes back and compare.
    pub verify: bool,
    /// Jump to the bootloader after a firmware upload.
    pub reboot: bool,
    /// Use the bus-wide firmware commands.
    pub broadcast: bool,
    /// Idle time between polls while waiting.
    pub tick: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            write_retries: WRITE_RETRIES,
            write_timeout: Duration::from_secs(1),
            firmware_erase_timeout: Duration::from_secs(20),
            bootloader_erase_timeout: Duration::from_secs(30),
            script_erase_timeout: Duration::from_secs(8),
            ui_erase_timeout: Duration::from_secs(6),
            probe_erase_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(4),
            compression: Compression::default(),
            verify: false,
            reboot: true,
            broadcast: false,
            tick: Duration::from_millis(crate::protocol::TICK_MS as u64),
        }
    }
}

impl TransferOptions {
    pub fn erase_timeout(&self, target: Target) -> Duration {
        match target {
            Target::Firmware => self.firmware_erase_timeout,
            Target::Bootloader => self.bootloader_erase_timeout,
            Target::Script => self.script_erase_timeout,
            Target::Ui => self.ui_erase_timeout,
            Target::Probe { .. } => self.probe_erase_timeout,
        }
    }
}

/// What the connected target is known to understand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Capabilities {
    pub hw_type: HwType,
    /// Optional commands beyond the basic erase and write set.
    pub commands: Vec<u8>,
}

impl Capabilities {
    pub fn new(hw_type: HwType) -> Self {
        Self {
            hw_type,
            commands: Vec::new(),
        }
    }

    /// Guess capabilities from a version reply. Compressed writes and
    /// script streaming arrived with firmware 6.
    ///
    /// The reply has no list of supported commands, so this goes by the
    /// major version alone. Targets known to differ can be described with
    /// [Capabilities::with] and handed to [Transfer::set_capabilities]
    /// after the version query.
    pub fn from_version<I>(reply: &FwVersionReply<I>) -> Self {
        let mut caps = Self::new(reply.hw_type.unwrap_or_default());
        if reply.major >= 6 {
            caps.commands.extend_from_slice(&[
                command::WRITE_NEW_APP_DATA_LZO,
                command::WRITE_NEW_APP_DATA_ALL_CAN_LZO,
                command::BM_WRITE_FLASH_LZO,
                command::LISP_STREAM_CODE,
            ]);
        }
        caps
    }

    pub fn with(mut self, command: u8) -> Self {
        if !self.supports(command) {
            self.commands.push(command);
        }
        self
    }

    pub fn supports(&self, command: u8) -> bool {
        self.commands.contains(&command)
    }

    /// Can chunks for `target` be sent compressed?
    pub fn compression(&self, target: Target, broadcast: bool) -> bool {
        match target {
            Target::Firmware | Target::Bootloader if broadcast => {
                self.supports(command::WRITE_NEW_APP_DATA_ALL_CAN_LZO)
            }
            Target::Firmware | Target::Bootloader => {
                self.supports(command::WRITE_NEW_APP_DATA_LZO)
            }
            Target::Probe { .. } => self.supports(command::BM_WRITE_FLASH_LZO),
            Target::Script | Target::Ui => false,
        }
    }
}

/// Where a transfer is in its life.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Erasing,
    Writing,
    Verifying,
    Done,
    /// Failed, with a human-readable reason.
    Failed(String),
    Cancelled,
}

impl TransferState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_) | Self::Cancelled)
    }
}

/// Reported to the observer while a transfer runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferEvent {
    /// Entered a new state, with a status line for humans.
    Phase { state: TransferState, status: String },
    /// Bytes acknowledged so far.
    Progress { done: usize, total: usize },
    /// A chunk is being sent again.
    Retry { address: u32, attempt: u32 },
}

/// Which step of a transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Query,
    Erase,
    Write,
    Verify,
    Stream,
}

/// Why a transfer did not finish.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferError<E> {
    /// No reply in time, after any retries.
    Timeout { phase: Phase, address: u32 },
    /// Payload too large for the target. Nothing was sent.
    Capacity { size: usize, max: usize },
    /// The target answered, negatively.
    TargetRejected { phase: Phase, address: u32 },
    /// Read-back data did not match what was written.
    VerifyMismatch { address: u32 },
    Cancelled,
    /// The link itself failed.
    Link(E),
}

impl<E> TransferError<E> {
    /// Status line for a transfer to `target` that ended with this error.
    pub fn status(&self, target: Target) -> String {
        let fw = matches!(target, Target::Firmware | Target::Bootloader);
        match self {
            Self::Timeout {
                phase: Phase::Erase,
                ..
            } if fw => "Buffer Erase Timeout".to_owned(),
            Self::Timeout {
                phase: Phase::Erase,
                ..
            } => "Erase timed out".to_owned(),
            Self::TargetRejected {
                phase: Phase::Erase,
                ..
            } => match target {
                Target::Script => "Erasing Lisp Code failed".to_owned(),
                Target::Ui => "Erasing Qml failed".to_owned(),
                _ => "Buffer Erase failed".to_owned(),
            },
            Self::Timeout {
                phase: Phase::Write,
                ..
            } if fw => "FW Data Write Timeout".to_owned(),
            Self::TargetRejected {
                phase: Phase::Write,
                ..
            } if fw => "FW Data Write failed".to_owned(),
            Self::Timeout {
                phase: Phase::Write,
                ..
            }
            | Self::TargetRejected {
                phase: Phase::Write,
                ..
            } => match target {
                Target::Ui => "Qml write failed".to_owned(),
                _ => "Write failed".to_owned(),
            },
            Self::Timeout {
                phase: Phase::Verify,
                ..
            } => "Verify timed out".to_owned(),
            Self::TargetRejected {
                phase: Phase::Verify,
                ..
            }
            | Self::VerifyMismatch { .. } => "Verify failed".to_owned(),
            Self::Timeout {
                phase: Phase::Query,
                ..
            } => "No response".to_owned(),
            Self::TargetRejected {
                phase: Phase::Query,
                ..
            } => "Query rejected".to_owned(),
            Self::Timeout {
                phase: Phase::Stream,
                ..
            }
            | Self::TargetRejected {
                phase: Phase::Stream,
                ..
            } => "Stream failed".to_owned(),
            Self::Capacity { .. } => "Not enough space".to_owned(),
            Self::Cancelled => "Cancelled".to_owned(),
            Self::Link(_) => "Connection error".to_owned(),
        }
    }
}

impl<E> std::error::Error for TransferError<E> where E: core::fmt::Debug {}

impl<E> core::fmt::Display for TransferError<E>
where
    E: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Timeout { phase, address } => {
                write!(f, "{:?} timed out at 0x{:x}", phase, address)
            }
            Self::Capacity { size, max } => {
                write!(f, "payload of {} bytes exceeds maximum of {}", size, max)
            }
            Self::TargetRejected { phase, address } => {
                write!(f, "{:?} rejected by target at 0x{:x}", phase, address)
            }
            Self::VerifyMismatch { address } => {
                write!(f, "read-back mismatch at 0x{:x}", address)
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::Link(e) => write!(f, "link error: {:?}", e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ceilings() {
        assert_eq!(Target::Script.max_len(HwType::Vesc), Some(SCRIPT_MAX_VESC));
        assert_eq!(Target::Script.max_len(HwType::VescBms), Some(SCRIPT_MAX));
        assert_eq!(Target::Ui.max_len(HwType::CustomModule), Some(UI_MAX));
        assert_eq!(Target::Firmware.max_len(HwType::Vesc), None);
    }

    #[test]
    fn capabilities_from_version() {
        let reply = FwVersionReply {
            major: 6,
            minor: 5,
            hw_name: b"60".as_ref(),
            uuid: None,
            paired: None,
            test_version: None,
            hw_type: Some(HwType::VescBms),
            custom_configs: None,
        };
        let caps = Capabilities::from_version(&reply);
        assert_eq!(caps.hw_type, HwType::VescBms);
        assert!(caps.compression(Target::Firmware, false));
        assert!(caps.compression(Target::Probe { address: 0 }, false));
        assert!(!caps.compression(Target::Script, false));

        assert!(caps.supports(command::LISP_STREAM_CODE));

        let old = Capabilities::from_version(&FwVersionReply { major: 5, ..reply });
        assert!(!old.compression(Target::Firmware, false));
        assert!(!old.supports(command::LISP_STREAM_CODE));
        assert_eq!(old.hw_type, HwType::VescBms);

        // a backport the version number doesn't reveal
        let old = old.with(command::WRITE_NEW_APP_DATA_LZO);
        assert!(old.compression(Target::Firmware, false));
        assert!(!old.compression(Target::Firmware, true));
    }

    #[test]
    fn statuses() {
        let e: TransferError<()> = TransferError::Timeout {
            phase: Phase::Erase,
            address: 0,
        };
        assert_eq!(e.status(Target::Firmware), "Buffer Erase Timeout");
        assert_eq!(e.status(Target::Script), "Erase timed out");

        let e: TransferError<()> = TransferError::TargetRejected {
            phase: Phase::Erase,
            address: 0,
        };
        assert_eq!(e.status(Target::Script), "Erasing Lisp Code failed");

        let e: TransferError<()> = TransferError::Capacity { size: 9, max: 8 };
        assert_eq!(e.status(Target::Ui), "Not enough space");
        assert_eq!(TransferError::<()>::Cancelled.status(Target::Ui), "Cancelled");
    }
}
