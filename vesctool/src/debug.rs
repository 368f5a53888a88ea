use std::io::{Read, Write};

/// Which side of the conversation sent some bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Direction {
    Target = 0,
    Host = 1,
}

impl Direction {
    pub fn flip(&self) -> Self {
        match self {
            Direction::Host => Direction::Target,
            Direction::Target => Direction::Host,
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Direction::Host => "host -> target",
            Direction::Target => "target -> host",
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct DumpArgs {
    /// Append everything sent and received to this file, for parse-dump.
    #[arg(long, value_name = "FILE")]
    dump: Option<String>,
}

impl DumpArgs {
    // direction is the side that *writes* to the port
    pub fn wrap<F>(&self, direction: Direction, port: F) -> anyhow::Result<Capture<F>> {
        let mut dump = None;
        if let Some(ref path) = self.dump {
            dump = Some(std::io::BufWriter::new(
                std::fs::File::options()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ));
        }

        Ok(Capture {
            inner: port,
            dump,
            direction,
        })
    }
}

/// A port that copies all traffic into a dump file.
///
/// Each record is `[direction][len: u16 le][bytes]`.
#[derive(Debug)]
pub struct Capture<F> {
    inner: F,
    dump: Option<std::io::BufWriter<std::fs::File>>,
    direction: Direction,
}

impl<F> Capture<F> {
    fn record(&mut self, direction: Direction, data: &[u8]) -> std::io::Result<()> {
        if let Some(ref mut dump) = self.dump {
            write_record(dump, direction, data)?;
        }
        Ok(())
    }
}

fn write_record<W: Write>(out: &mut W, direction: Direction, data: &[u8]) -> std::io::Result<()> {
    for part in data.chunks(u16::MAX as usize) {
        out.write_all(&[direction as u8])?;
        out.write_all(&(part.len() as u16).to_le_bytes())?;
        out.write_all(part)?;
    }
    out.flush()
}

impl<F: Read> Read for Capture<F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let amt = self.inner.read(buf)?;
        if amt > 0 {
            self.record(self.direction.flip(), &buf[..amt])?;
        }
        Ok(amt)
    }
}

impl<F: Write> Write for Capture<F> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let amt = self.inner.write(buf)?;
        self.record(self.direction, &buf[..amt])?;
        Ok(amt)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Split a dump file into its records.
pub fn read_records(mut raw: &[u8]) -> anyhow::Result<Vec<(Direction, &[u8])>> {
    let mut records = Vec::new();
    while !raw.is_empty() {
        anyhow::ensure!(raw.len() >= 3, "dump ends inside a record header");
        let direction = match raw[0] {
            0 => Direction::Target,
            1 => Direction::Host,
            d => anyhow::bail!("bad direction byte {:#04x}", d),
        };
        let len = u16::from_le_bytes([raw[1], raw[2]]) as usize;
        anyhow::ensure!(raw.len() >= 3 + len, "dump ends inside a record");
        records.push((direction, &raw[3..3 + len]));
        raw = &raw[3 + len..];
    }
    Ok(records)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records() {
        let mut out = Vec::new();
        write_record(&mut out, Direction::Host, b"abc").unwrap();
        write_record(&mut out, Direction::Target, b"").unwrap();
        write_record(&mut out, Direction::Target, b"z").unwrap();
        assert_eq!(&out[..6], b"\x01\x03\x00abc");

        let records = read_records(&out).unwrap();
        assert_eq!(
            records,
            vec![
                (Direction::Host, b"abc".as_ref()),
                (Direction::Target, b"".as_ref()),
                (Direction::Target, b"z".as_ref()),
            ]
        );
    }

    #[test]
    fn truncated_dump() {
        assert!(read_records(b"\x01\x05\x00ab").is_err());
        assert!(read_records(b"\x01\x05").is_err());
        assert!(read_records(b"\x07\x00\x00").is_err());
    }
}
