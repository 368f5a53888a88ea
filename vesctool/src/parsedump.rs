use std::path::PathBuf;

use vesclib::protocol::{FrameDecoder, MessageParse, Reply, Request};

use crate::debug::Direction;

#[derive(clap::Args, Debug)]
pub struct ParseDumpOpts {
    dump: PathBuf,
    /// The file is a bare byte stream, not a --dump capture.
    #[arg(long)]
    raw: bool,
    /// Hexdump every payload, not just the ones that don't parse.
    #[arg(long)]
    hexdump: bool,
}

impl crate::ToolRun for ParseDumpOpts {
    fn run(&self) -> anyhow::Result<()> {
        let rawdata = std::fs::read(&self.dump)?;
        let records: Vec<(Option<Direction>, &[u8])> = if self.raw {
            vec![(None, &rawdata[..])]
        } else {
            crate::debug::read_records(&rawdata)?
                .into_iter()
                .map(|(d, data)| (Some(d), data))
                .collect()
        };

        let payloads = decode_capture(&records);
        anyhow::ensure!(!payloads.is_empty(), "no frames found");

        let mut unparsed = 0;
        for (direction, payload) in payloads.iter() {
            match direction {
                Some(d) => println!("{}, {} bytes", d.arrow(), payload.len()),
                None => println!("{} bytes", payload.len()),
            }

            let described = describe(*direction, payload);
            match described {
                Some(ref s) => println!("{}", s),
                None => {
                    unparsed += 1;
                    println!("Unparsed payload:");
                }
            }
            if described.is_none() || self.hexdump {
                crate::hexdump::hexdump_prefix("  ", payload);
            }
            println!();
        }

        eprintln!("{} payloads, {} unparsed.", payloads.len(), unparsed);
        Ok(())
    }
}

/// Run each side's bytes through its own decoder, keeping the order
/// payloads completed in.
fn decode_capture(records: &[(Option<Direction>, &[u8])]) -> Vec<(Option<Direction>, Vec<u8>)> {
    let mut host = FrameDecoder::default();
    let mut target = FrameDecoder::default();

    let mut out = Vec::new();
    for (direction, data) in records.iter() {
        let decoder = match direction {
            Some(Direction::Target) => &mut target,
            _ => &mut host,
        };
        for payload in decoder.decode(data) {
            out.push((*direction, payload));
        }
    }
    out
}

fn describe(direction: Option<Direction>, payload: &[u8]) -> Option<String> {
    let request = || Request::parse_payload(payload).ok().map(|m| format!("{:?}", m));
    let reply = || Reply::parse_payload(payload).ok().map(|m| format!("{:?}", m));
    match direction {
        Some(Direction::Host) => request(),
        Some(Direction::Target) => reply(),
        None => request().or_else(reply),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vesclib::protocol::encode_frame;

    #[test]
    fn split_frames() {
        let request = encode_frame(b"\x00", 512).unwrap();
        let reply = encode_frame(b"\x84\x01", 512).unwrap();
        let records = [
            (Some(Direction::Host), &request[..2]),
            (Some(Direction::Target), &reply[..]),
            (Some(Direction::Host), &request[2..]),
        ];

        let payloads = decode_capture(&records);
        assert_eq!(
            payloads,
            vec![
                (Some(Direction::Target), b"\x84\x01".to_vec()),
                (Some(Direction::Host), b"\x00".to_vec()),
            ]
        );
    }

    #[test]
    fn descriptions() {
        assert_eq!(describe(Some(Direction::Host), b"\x00").unwrap(), "FwVersion(FwVersion)");
        assert!(describe(Some(Direction::Target), b"\x84\x01")
            .unwrap()
            .starts_with("Ack("));
        assert!(describe(None, b"\x84\x01").is_some());
        assert!(describe(None, b"\xee").is_none());
    }
}
