use std::time::Duration;

use vesclib::protocol::TICK_MS;

/// A client talking over whatever [SerialPortArgs] opened.
pub type PortClient = vesclib::Client<vesclib::FromStd<crate::debug::Capture<SerialPort>>>;

#[derive(clap::Args, Debug, Clone)]
pub struct SerialPortArgs {
    #[arg(default_value_t = default_serial_port())]
    port: String,
    #[arg(short, long, default_value_t = vesclib::protocol::BAUD_RATE)]
    baud: u32,
    #[arg(long)]
    plain_file: bool,
    /// Treat the port as a host:port address.
    #[arg(long)]
    tcp: bool,
    /// Talk to this device on the bus, through the connected one.
    #[arg(long, value_name = "ID")]
    can_forward: Option<u8>,

    #[command(flatten)]
    dump: crate::debug::DumpArgs,
}

#[derive(Debug)]
pub enum SerialPort {
    Serial(std::io::BufWriter<Box<dyn serialport::SerialPort>>),
    File(std::io::BufWriter<std::fs::File>),
    Tcp(std::io::BufWriter<std::net::TcpStream>),
}

pub fn default_serial_port() -> String {
    if let Ok(infos) = serialport::available_ports() {
        for info in infos {
            #[cfg(target_os = "macos")]
            if info.port_name.ends_with(".Bluetooth-Incoming-Port") {
                // these ports are almost always *not* what we want
                continue;
            }

            #[cfg(target_os = "macos")]
            if info.port_name.starts_with("/dev/tty.") {
                // macos ports with tty. have flow control we don't use
                // use cu. ports instead!
                continue;
            }

            return info.port_name.clone();
        }
    }

    "/dev/ttyACM0".to_owned()
}

impl std::io::Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let r = match self {
            Self::Serial(port) => port.get_mut().read(buf),
            Self::File(port) => port.get_mut().read(buf),
            Self::Tcp(port) => port.get_mut().read(buf),
        };

        // sockets report an expired read timeout as WouldBlock
        match r {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(std::io::ErrorKind::TimedOut.into())
            }
            r => r,
        }
    }
}

impl std::io::Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Serial(port) => port.write(buf),
            Self::File(port) => port.write(buf),
            Self::Tcp(port) => port.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Serial(port) => port.flush(),
            Self::File(port) => port.flush(),
            Self::Tcp(port) => port.flush(),
        }
    }
}

impl SerialPort {
    /// Wrap an accepted connection, with the short read timeout
    /// clients expect.
    pub fn tcp(stream: std::net::TcpStream) -> anyhow::Result<Self> {
        stream.set_read_timeout(Some(poll_interval()))?;
        stream.set_nodelay(true)?;
        Ok(SerialPort::Tcp(std::io::BufWriter::new(stream)))
    }
}

impl SerialPortArgs {
    pub fn open(&self) -> anyhow::Result<SerialPort> {
        if self.tcp {
            SerialPort::tcp(std::net::TcpStream::connect(&self.port)?)
        } else if self.plain_file {
            let port = std::fs::File::options()
                .read(true)
                .write(true)
                .open(&self.port)?;

            Ok(SerialPort::File(std::io::BufWriter::new(port)))
        } else {
            let mut port = serialport::new(&self.port, self.baud).open()?;
            port.set_timeout(poll_interval())?;
            Ok(SerialPort::Serial(std::io::BufWriter::new(port)))
        }
    }

    /// Open the port and wrap it in a client.
    pub fn connect(&self) -> anyhow::Result<PortClient> {
        let port = self
            .dump
            .wrap(crate::debug::Direction::Host, self.open()?)?;
        let mut client = vesclib::Client::new_std(port);
        if let Some(id) = self.can_forward {
            log::info!("forwarding everything to bus id {}", id);
            client.set_forward(Some(id));
        }
        Ok(client)
    }
}

fn poll_interval() -> Duration {
    Duration::from_millis(TICK_MS as u64)
}

pub fn upload_bar(size: u64) -> anyhow::Result<indicatif::ProgressBar> {
    let bar = indicatif::ProgressBar::new(size);
    bar.set_style(
        indicatif::ProgressStyle::with_template(
            "({spinner}) [{wide_bar}] ({percent:>3}%, {bytes_per_sec:>12}) {msg}",
        )?
        .progress_chars("=> ")
        .tick_strings(&[">>>  ", ">  >>", ">>  >", "  >>>", " >>> ", "-----"]),
    );
    Ok(bar)
}

pub fn confirm(prompt: &str, yes: bool) -> anyhow::Result<()> {
    if yes {
        return Ok(());
    }

    let go = dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    if !go {
        anyhow::bail!("Cancelled.");
    }
    Ok(())
}

/// Parse a number, in hex if it starts with 0x.
pub fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Read a text file, naming it in the error.
pub fn read_text(path: &std::path::Path) -> anyhow::Result<String> {
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("could not read {}: {}", path.display(), e))?;
    String::from_utf8(data).map_err(|_| anyhow::anyhow!("{} is not UTF-8 text", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_u32("0x08000000"), Ok(0x0800_0000));
        assert_eq!(parse_u32("1024"), Ok(1024));
        assert!(parse_u32("0xzz").is_err());
    }
}
