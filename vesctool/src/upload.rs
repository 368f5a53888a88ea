use std::path::{Path, PathBuf};

use vesclib::package::ui_payload;
use vesclib::protocol::script::StreamMode;
use vesclib::transfer::{
    Compression, Phase, Target, Transfer, TransferError, TransferEvent, TransferOptions,
};

use crate::common::{PortClient, SerialPortArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
enum TargetKind {
    /// A new main firmware image.
    Firmware,
    /// A new bootloader image.
    Bootloader,
    /// A script, or a ready-made bundle.
    Script,
    /// A UI, or a ready-made UI payload.
    Ui,
    /// Another chip's flash, through the target's debug probe.
    Probe,
}

#[derive(clap::Args, Debug, Clone)]
pub struct TransferArgs {
    #[arg(long, default_value_t = vesclib::transfer::CHUNK_SIZE)]
    chunk_size: usize,
    /// Attempts per chunk.
    #[arg(long, default_value_t = vesclib::transfer::WRITE_RETRIES)]
    retries: u32,
    /// Never compress, even if the target could decompress.
    #[arg(long)]
    no_compress: bool,
    /// Compress a firmware image as a whole, not chunk by chunk.
    #[arg(long, conflicts_with = "no_compress")]
    compress_image: bool,
    /// Read back and compare after a probe write.
    #[arg(long)]
    verify: bool,
    /// Address every device on the bus at once.
    #[arg(long)]
    broadcast: bool,
    /// Don't jump to the bootloader after a firmware upload.
    #[arg(long)]
    no_reboot: bool,
}

impl TransferArgs {
    fn options(&self) -> TransferOptions {
        let compression = if self.no_compress {
            Compression::Off
        } else if self.compress_image {
            Compression::Image
        } else {
            Compression::Chunks
        };

        TransferOptions {
            chunk_size: self.chunk_size,
            write_retries: self.retries,
            compression,
            verify: self.verify,
            reboot: !self.no_reboot,
            broadcast: self.broadcast,
            ..Default::default()
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct UploadOpts {
    #[arg(value_enum)]
    target: TargetKind,
    file: PathBuf,
    /// Flash address for probe writes.
    #[arg(long, value_parser = crate::common::parse_u32, default_value = "0x08000000")]
    address: u32,
    /// Show the UI fullscreen.
    #[arg(long)]
    fullscreen: bool,
    /// Run a script from RAM instead of storing it.
    #[arg(long)]
    stream: bool,
    /// Look for script imports here first.
    #[arg(long)]
    editor_path: Option<PathBuf>,

    #[command(flatten)]
    transfer: TransferArgs,
    #[command(flatten)]
    port: SerialPortArgs,

    #[arg(short, long)]
    yes: bool,
}

impl crate::ToolRun for UploadOpts {
    fn run(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.stream || self.target == TargetKind::Script,
            "only scripts can be streamed"
        );

        let (target, data) = self.load()?;
        let mut uploader = Uploader::new(self.port.connect()?, &self.transfer);
        uploader.check()?;

        eprintln!();
        crate::common::confirm(
            &format!("Write {} bytes to {:?}?", data.len(), self.target),
            self.yes,
        )?;

        if self.stream {
            uploader.stream(&data)
        } else {
            uploader.upload(target, &data)
        }
    }
}

impl UploadOpts {
    fn load(&self) -> anyhow::Result<(Target, Vec<u8>)> {
        let source = extension(&self.file);
        Ok(match self.target {
            TargetKind::Firmware => (Target::Firmware, std::fs::read(&self.file)?),
            TargetKind::Bootloader => (Target::Bootloader, std::fs::read(&self.file)?),
            TargetKind::Probe => (
                Target::Probe {
                    address: self.address,
                },
                std::fs::read(&self.file)?,
            ),
            TargetKind::Script if source == "lisp" => {
                let bundle = crate::pack::pack_script(&self.file, self.editor_path.as_deref())?;
                crate::pack::report(&bundle);
                (Target::Script, bundle.encode()?)
            }
            TargetKind::Script => (Target::Script, std::fs::read(&self.file)?),
            TargetKind::Ui if source == "qml" => {
                let text = crate::common::read_text(&self.file)?;
                (Target::Ui, ui_payload(&text, self.fullscreen))
            }
            TargetKind::Ui => (Target::Ui, std::fs::read(&self.file)?),
        })
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[derive(clap::Args, Debug)]
pub struct InstallOpts {
    package: PathBuf,

    #[command(flatten)]
    transfer: TransferArgs,
    #[command(flatten)]
    port: SerialPortArgs,

    #[arg(short, long)]
    yes: bool,
}

impl crate::ToolRun for InstallOpts {
    fn run(&self) -> anyhow::Result<()> {
        let pkg = crate::package::read_package(&self.package)?;
        crate::package::report(&pkg);

        let mut uploader = Uploader::new(self.port.connect()?, &self.transfer);
        uploader.check()?;

        eprintln!();
        crate::common::confirm(&format!("Install {}?", pkg.name), self.yes)?;

        let bar = crate::common::upload_bar(0)?;
        let result = uploader
            .transfer
            .install_package(&pkg, |e| observe(&bar, e));
        bar.finish();
        result.map_err(|e| anyhow::anyhow!("install failed: {}", e))?;

        eprintln!("Installed {}.", pkg.name);
        Ok(())
    }
}

struct Uploader {
    transfer: Transfer<PortClient>,
}

impl Uploader {
    fn new(client: PortClient, args: &TransferArgs) -> Self {
        Self {
            transfer: Transfer::new(client, args.options()),
        }
    }

    fn check(&mut self) -> anyhow::Result<()> {
        let v = match self.transfer.query_version() {
            Ok(v) => v,
            Err(TransferError::Timeout {
                phase: Phase::Query,
                ..
            }) => {
                // bootloaders and very old firmware keep quiet
                eprintln!("No version reply, uploading without compression.");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        eprintln!(
            "Connected to {}, firmware {}.{:02}",
            v.hw_name_lossy(),
            v.major,
            v.minor
        );
        if let Some(hw) = v.hw_type {
            eprintln!("Hardware type: {:?}", hw);
        }
        if let Some(uuid) = v.uuid {
            let uuid: String = uuid.iter().map(|b| format!("{:02x}", b)).collect();
            eprintln!("UUID: {}", uuid);
        }
        if let Some(test) = v.test_version.filter(|t| *t > 0) {
            eprintln!("Test build {}", test);
        }
        if v.paired == Some(true) {
            eprintln!("Target is paired to another host.");
        }
        Ok(())
    }

    fn upload(&mut self, target: Target, data: &[u8]) -> anyhow::Result<()> {
        let bar = crate::common::upload_bar(data.len() as u64)?;
        let result = self.transfer.upload(target, data, |e| observe(&bar, e));
        bar.finish();
        result.map_err(|e| anyhow::anyhow!("{}: {}", e.status(target), e))
    }

    fn stream(&mut self, bundle: &[u8]) -> anyhow::Result<()> {
        let bar = crate::common::upload_bar(bundle.len() as u64)?;
        let result = self
            .transfer
            .stream_script(bundle, StreamMode::Run, |e| observe(&bar, e));
        bar.finish();
        result.map_err(|e| anyhow::anyhow!("{}: {}", e.status(Target::Script), e))
    }
}

fn observe(bar: &indicatif::ProgressBar, event: &TransferEvent) {
    match event {
        TransferEvent::Phase { state, status } => {
            if !state.is_finished() {
                bar.set_position(0);
            }
            bar.set_message(status.clone());
        }
        TransferEvent::Progress { done, total } => {
            bar.set_length(*total as u64);
            bar.set_position(*done as u64);
        }
        TransferEvent::Retry { address, attempt } => {
            bar.println(format!("retrying 0x{:08x}, attempt {}", address, attempt + 1));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_from_args() {
        let args = TransferArgs {
            chunk_size: 128,
            retries: 2,
            no_compress: true,
            compress_image: false,
            verify: true,
            broadcast: false,
            no_reboot: true,
        };
        let opts = args.options();
        assert_eq!(opts.chunk_size, 128);
        assert_eq!(opts.write_retries, 2);
        assert_eq!(opts.compression, Compression::Off);
        assert!(opts.verify);
        assert!(!opts.reboot);
        assert_eq!(opts.write_timeout, TransferOptions::default().write_timeout);
    }

    #[test]
    fn extensions() {
        assert_eq!(extension(Path::new("a/b.LISP")), "lisp");
        assert_eq!(extension(Path::new("noext")), "");
    }
}
