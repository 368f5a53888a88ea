use std::collections::BTreeMap;
use std::path::PathBuf;

use vesclib::heatshrink;
use vesclib::imports::ImportBundle;
use vesclib::protocol::crc::crc16;
use vesclib::protocol::firmware::FwVersionReply;
use vesclib::protocol::script::CodeArea;
use vesclib::protocol::{
    command, Ack, HwType, MemReadReply, MessageParse, MessageSerialize, ProbeAck, Request,
    StreamAck, WriteAck,
};
use vesclib::transfer::{Link, BOOTLOADER_OFFSET, IMAGE_COMPRESSED, SCRIPT_MAX, UI_MAX};
use vesclib::ClientError;

use crate::common::PortClient;

const UUID: [u8; 12] = *b"vesctool-sim";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
enum HwKind {
    Vesc,
    Bms,
    Custom,
}

impl From<HwKind> for HwType {
    fn from(value: HwKind) -> Self {
        match value {
            HwKind::Vesc => HwType::Vesc,
            HwKind::Bms => HwType::VescBms,
            HwKind::Custom => HwType::CustomModule,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct SimulateOpts {
    #[arg(default_value = "localhost:8855")]
    bind: String,
    #[arg(long, default_value = "vescsim")]
    name: String,
    /// Firmware version to report, as major.minor.
    #[arg(long, default_value = "6.05")]
    version: String,
    #[arg(long, value_enum, default_value = "vesc")]
    hw_type: HwKind,
    /// Write the flash areas into this directory after each session.
    #[arg(long)]
    save: Option<PathBuf>,

    #[command(flatten)]
    dump: crate::debug::DumpArgs,
}

impl crate::ToolRun for SimulateOpts {
    fn run(&self) -> anyhow::Result<()> {
        let (major, minor) = parse_version(&self.version)?;
        let mut flash = Flash::default();

        let listener = std::net::TcpListener::bind(&self.bind)?;
        eprintln!("Listening on {}.", self.bind);

        loop {
            let (stream, addr) = listener.accept()?;
            eprintln!("Connected to {}.", addr);

            let port = crate::common::SerialPort::tcp(stream)?;
            let port = self.dump.wrap(crate::debug::Direction::Target, port)?;
            let mut sim = Simulator {
                client: vesclib::Client::new_std(port),
                opts: self,
                major,
                minor,
                flash: &mut flash,
                stream: Vec::new(),
            };

            let e = match sim.simulate() {
                Ok(never) => match never {},
                Err(e) => e,
            };
            if !disconnected(&e) {
                anyhow::bail!(e);
            }
            eprintln!("Disconnected from {}.", addr);

            if let Some(ref dir) = self.save {
                flash.save(dir)?;
            }
        }
    }
}

fn parse_version(s: &str) -> anyhow::Result<(u8, u8)> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!("version must look like 6.05"))?;
    Ok((major.parse()?, minor.parse()?))
}

/// Expected errors, at disconnect.
fn disconnected(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<ClientError<std::io::Error>>() {
        Some(ClientError::UnexpectedEof) => true,
        Some(ClientError::Io(e)) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

/// Everything the simulated target stores. Outlives connections.
#[derive(Debug, Default)]
struct Flash {
    /// Staging area for new images. Bootloaders land at
    /// [BOOTLOADER_OFFSET].
    app: Vec<u8>,
    script: Vec<u8>,
    ui: Vec<u8>,
    probe: BTreeMap<u32, u8>,
    running: bool,
}

fn put(area: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if area.len() < offset + data.len() {
        area.resize(offset + data.len(), 0xff);
    }
    area[offset..offset + data.len()].copy_from_slice(data);
}

impl Flash {
    fn area(&mut self, area: CodeArea) -> &mut Vec<u8> {
        match area {
            CodeArea::Script => &mut self.script,
            CodeArea::Ui => &mut self.ui,
        }
    }

    /// Check the staged firmware image, and unpack it.
    fn image(&self) -> Result<Vec<u8>, String> {
        let header = self.app.get(..6).ok_or("no image header")?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u16::from_be_bytes([header[4], header[5]]);

        let compressed = (len >> 24) as u8 == IMAGE_COMPRESSED;
        let size = (len & 0xff_ffff) as usize;
        let stored = self
            .app
            .get(6..6 + size)
            .ok_or_else(|| format!("image claims {} bytes, only {} staged", size, self.app.len() - 6))?;
        if crc16(stored) != crc {
            return Err("image crc mismatch".to_owned());
        }

        if compressed {
            heatshrink::decompress(stored).ok_or_else(|| "image does not decompress".to_owned())
        } else {
            Ok(stored.to_vec())
        }
    }

    /// Check a stored script or UI area, returning the bundle in it.
    fn stored(area: &[u8]) -> Result<&[u8], String> {
        let header = area.get(..6).ok_or("area is empty")?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u16::from_be_bytes([header[4], header[5]]);

        // the length leaves out the flags word
        let data = area
            .get(6..6 + len + 2)
            .ok_or_else(|| format!("area claims {} bytes", len + 2))?;
        if crc16(data) != crc {
            return Err("crc mismatch".to_owned());
        }
        Ok(data)
    }

    fn save(&self, dir: &std::path::Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        for (name, data) in [
            ("app.bin", &self.app),
            ("script.bin", &self.script),
            ("ui.bin", &self.ui),
        ] {
            if !data.is_empty() {
                std::fs::write(dir.join(name), data)?;
            }
        }
        eprintln!("Saved flash to {}.", dir.display());
        Ok(())
    }
}

struct Simulator<'a> {
    client: PortClient,
    opts: &'a SimulateOpts,
    major: u8,
    minor: u8,
    flash: &'a mut Flash,
    stream: Vec<u8>,
}

impl<'a> Simulator<'a> {
    fn simulate(&mut self) -> anyhow::Result<std::convert::Infallible> {
        loop {
            match self.client.read_payload()? {
                Some(payload) => match Request::parse_payload(&payload) {
                    Ok(request) => self.handle(request)?,
                    Err(e) => {
                        log::warn!("unknown request: {}", e);
                        crate::hexdump::ehexdump_prefix("? ", 0, &payload);
                    }
                },
                None => self.client.tick(),
            }
        }
    }

    fn reply<M: MessageSerialize>(&mut self, msg: &M) -> anyhow::Result<()> {
        self.client.write(msg)?;
        Ok(())
    }

    fn handle(&mut self, request: Request<&[u8]>) -> anyhow::Result<()> {
        log::debug!("request {}", request.command());
        match request {
            Request::ForwardCan(m) => match Request::parse_payload(m.payload) {
                // there is no bus here, so answer for everyone
                Ok(inner) => {
                    log::info!("handling request forwarded to {}", m.target);
                    self.handle(inner)?;
                }
                Err(e) => log::warn!("bad forwarded request: {}", e),
            },

            Request::FwVersion(_) => {
                let name = self.opts.name.clone();
                self.reply(&FwVersionReply {
                    major: self.major,
                    minor: self.minor,
                    hw_name: name.as_bytes(),
                    uuid: Some(UUID),
                    paired: Some(false),
                    test_version: Some(0),
                    hw_type: Some(self.opts.hw_type.into()),
                    custom_configs: Some(0),
                })?;
            }

            Request::JumpToBootloader(_) => match self.flash.image() {
                Ok(image) => eprintln!("Rebooting into a new image of {} bytes.", image.len()),
                Err(e) => eprintln!("Refusing to reboot: {}.", e),
            },

            Request::EraseNewApp(m) => {
                let ok = m.size <= BOOTLOADER_OFFSET;
                if ok {
                    self.flash.app.clear();
                }
                self.reply(&Ack {
                    command: m.command(),
                    ok,
                })?;
            }

            Request::EraseBootloader(m) => {
                self.flash.app.truncate(BOOTLOADER_OFFSET as usize);
                self.reply(&Ack {
                    command: m.command(),
                    ok: true,
                })?;
            }

            Request::WriteNewAppData(m) => {
                put(&mut self.flash.app, m.offset as usize, m.data);
                self.reply(&WriteAck {
                    command: m.command(),
                    ok: true,
                    offset: Some(m.offset),
                })?;
            }

            Request::WriteNewAppDataCompressed(m) => {
                let data = heatshrink::decompress(m.data).filter(|d| d.len() == m.raw_len as usize);
                if let Some(ref data) = data {
                    put(&mut self.flash.app, m.offset as usize, data);
                }
                self.reply(&WriteAck {
                    command: m.command(),
                    ok: data.is_some(),
                    offset: Some(m.offset),
                })?;
            }

            Request::EraseCode(m) => {
                let max = match m.area {
                    CodeArea::Script => SCRIPT_MAX,
                    CodeArea::Ui => UI_MAX,
                };
                let ok = m.size as usize <= max + 100;
                if ok {
                    self.flash.area(m.area).clear();
                }
                if m.area == CodeArea::Script && self.flash.running {
                    log::info!("stopping the running script");
                    self.flash.running = false;
                }
                self.reply(&Ack {
                    command: m.area.erase_command(),
                    ok,
                })?;
            }

            Request::WriteCode(m) => {
                put(self.flash.area(m.area), m.offset as usize, m.data);
                self.reply(&WriteAck {
                    command: m.area.write_command(),
                    ok: true,
                    offset: Some(m.offset),
                })?;
            }

            Request::SetRunning(m) => {
                if m.running {
                    match Flash::stored(&self.flash.script) {
                        Ok(bundle) => {
                            let bundle = ImportBundle::decode(bundle);
                            eprintln!(
                                "Running script: {} bytes, {} imports.",
                                bundle.script.len(),
                                bundle.imports.len()
                            );
                        }
                        Err(e) => eprintln!("Stored script is bad: {}.", e),
                    }
                }
                self.flash.running = m.running;
                self.reply(&Ack {
                    command: m.command(),
                    ok: true,
                })?;
            }

            Request::StreamCode(m) => {
                if m.offset == 0 {
                    self.stream.clear();
                }
                let result = if m.offset as usize == self.stream.len() {
                    self.stream.extend_from_slice(m.data);
                    0
                } else {
                    -1
                };
                if result == 0 && self.stream.len() as i32 == m.total {
                    eprintln!(
                        "Streamed script of {} bytes, mode {:?}.",
                        self.stream.len(),
                        m.mode
                    );
                }
                self.reply(&StreamAck {
                    offset: m.offset,
                    result,
                })?;
            }

            Request::EraseFlashAll(_) => {
                self.flash.probe.clear();
                self.reply(&ProbeAck {
                    command: command::BM_ERASE_FLASH_ALL,
                    result: ProbeAck::SUCCESS,
                })?;
            }

            Request::WriteFlash(m) => {
                self.probe_write(m.address, m.data);
                self.reply(&ProbeAck {
                    command: command::BM_WRITE_FLASH,
                    result: ProbeAck::SUCCESS,
                })?;
            }

            Request::WriteFlashCompressed(m) => {
                let result = match heatshrink::decompress(m.data) {
                    Some(data) if data.len() == m.raw_len as usize => {
                        self.probe_write(m.address, &data);
                        ProbeAck::SUCCESS
                    }
                    _ => -1,
                };
                self.reply(&ProbeAck {
                    command: command::BM_WRITE_FLASH_LZO,
                    result,
                })?;
            }

            Request::MemRead(m) => {
                let data: Vec<u8> = (0..m.len as u32)
                    .map(|i| {
                        let address = m.address.wrapping_add(i);
                        self.flash.probe.get(&address).copied().unwrap_or(0xff)
                    })
                    .collect();
                self.reply(&MemReadReply {
                    result: ProbeAck::SUCCESS,
                    data,
                })?;
            }
        }
        Ok(())
    }

    fn probe_write(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.flash.probe.insert(address.wrapping_add(i as u32), *b);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn staged(len: u32, stored: &[u8]) -> Flash {
        let mut app = len.to_be_bytes().to_vec();
        app.extend(crc16(stored).to_be_bytes());
        app.extend(stored);
        Flash {
            app,
            ..Default::default()
        }
    }

    #[test]
    fn versions() {
        assert_eq!(parse_version("6.05").unwrap(), (6, 5));
        assert!(parse_version("6").is_err());
        assert!(parse_version("x.1").is_err());
    }

    #[test]
    fn plain_image() {
        let flash = staged(4, b"abcd");
        assert_eq!(flash.image().unwrap(), b"abcd");

        let mut flash = staged(4, b"abcd");
        flash.app[6] ^= 1;
        assert!(flash.image().is_err());
        assert!(staged(5, b"abcd").image().is_err());
        assert!(Flash::default().image().is_err());
    }

    #[test]
    fn compressed_image() {
        let image = [7u8; 500];
        let packed = heatshrink::compress(&image);
        let flash = staged(packed.len() as u32 | 0xcc00_0000, &packed);
        assert_eq!(flash.image().unwrap(), image);
    }

    #[test]
    fn stored_area() {
        let bundle = b"\0\0(+ 1 2)";
        let mut area = (bundle.len() as u32 - 2).to_be_bytes().to_vec();
        area.extend(crc16(bundle).to_be_bytes());
        area.extend(bundle);
        area.extend([0xff; 10]);
        assert_eq!(Flash::stored(&area).unwrap(), bundle);
        assert!(Flash::stored(&area[..8]).is_err());
    }

    #[test]
    fn writes_grow_area() {
        let mut area = Vec::new();
        put(&mut area, 4, b"ab");
        assert_eq!(area, b"\xff\xff\xff\xffab");
        put(&mut area, 0, b"x");
        assert_eq!(area[0], b'x');
    }
}
