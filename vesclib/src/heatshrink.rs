//! LZSS compression in the heatshrink bitstream format, with an 8-bit
//! window and a 4-bit lookahead.
//!
//! Bits are packed MSB first. A literal is a 1 bit followed by the
//! byte. A back-reference is a 0 bit, then `distance - 1` in 8 bits,
//! then `length - 1` in 4 bits. The last byte is padded with zeros.

pub const WINDOW_BITS: u8 = 8;
pub const LOOKAHEAD_BITS: u8 = 4;

const WINDOW: usize = 1 << WINDOW_BITS;
const MAX_MATCH: usize = 1 << LOOKAHEAD_BITS;
// a back-reference costs 13 bits, two literals cost 18
const MIN_MATCH: usize = 2;

struct BitWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
    used: u8,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self {
            out,
            pos: 0,
            used: 0,
        }
    }

    fn push(&mut self, value: u16, count: u8) -> Option<()> {
        for i in (0..count).rev() {
            if self.used == 0 {
                *self.out.get_mut(self.pos)? = 0;
            }
            if (value >> i) & 1 != 0 {
                self.out[self.pos] |= 0x80 >> self.used;
            }
            self.used += 1;
            if self.used == 8 {
                self.used = 0;
                self.pos += 1;
            }
        }
        Some(())
    }

    /// Bytes written, counting a partial last byte.
    fn finish(self) -> usize {
        self.pos + (self.used > 0) as usize
    }
}

struct BitReader<'a> {
    input: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, bit: 0 }
    }

    fn remaining(&self) -> usize {
        self.input.len() * 8 - self.bit
    }

    fn read(&mut self, count: u8) -> Option<u16> {
        if self.remaining() < count as usize {
            return None;
        }
        let mut value = 0;
        for _ in 0..count {
            let b = self.input[self.bit / 8] >> (7 - self.bit % 8);
            value = (value << 1) | (b & 1) as u16;
            self.bit += 1;
        }
        Some(value)
    }
}

/// Longest match for `input[pos..]` inside the window, as
/// (distance, length).
fn find_match(input: &[u8], pos: usize) -> Option<(usize, usize)> {
    let max_len = MAX_MATCH.min(input.len() - pos);
    if max_len < MIN_MATCH {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for distance in 1..=WINDOW.min(pos) {
        let start = pos - distance;
        let len = (0..max_len)
            .take_while(|&k| input[start + k] == input[pos + k])
            .count();
        if len >= MIN_MATCH && best.map_or(true, |(_, l)| len > l) {
            best = Some((distance, len));
            if len == max_len {
                break;
            }
        }
    }
    best
}

/// Compress `input` into `out`, returning the compressed length, or
/// None if `out` is too small.
pub fn compress_into(input: &[u8], out: &mut [u8]) -> Option<usize> {
    let mut writer = BitWriter::new(out);
    let mut pos = 0;

    while pos < input.len() {
        match find_match(input, pos) {
            Some((distance, len)) => {
                writer.push(0, 1)?;
                writer.push((distance - 1) as u16, WINDOW_BITS)?;
                writer.push((len - 1) as u16, LOOKAHEAD_BITS)?;
                pos += len;
            }
            None => {
                writer.push(1, 1)?;
                writer.push(input[pos] as u16, 8)?;
                pos += 1;
            }
        }
    }

    Some(writer.finish())
}

/// Largest possible compressed size for `len` input bytes.
pub fn max_compressed_len(len: usize) -> usize {
    (len * 9).div_ceil(8)
}

/// Compress `input` into a new buffer.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = vec![0; max_compressed_len(input.len())];
    let len = compress_into(input, &mut out).unwrap_or(out.len());
    out.truncate(len);
    out
}

/// Decompress a whole stream. Returns None if a back-reference points
/// before the start of the output.
pub fn decompress(input: &[u8]) -> Option<Vec<u8>> {
    let mut reader = BitReader::new(input);
    let mut out = Vec::with_capacity(input.len() * 2);

    // a short read is the zero padding at the end
    while let Some(tag) = reader.read(1) {
        if tag == 1 {
            let Some(b) = reader.read(8) else {
                break;
            };
            out.push(b as u8);
        } else {
            let (Some(index), Some(count)) =
                (reader.read(WINDOW_BITS), reader.read(LOOKAHEAD_BITS))
            else {
                break;
            };
            let distance = index as usize + 1;
            if distance > out.len() {
                return None;
            }
            for _ in 0..=count {
                out.push(out[out.len() - distance]);
            }
        }
    }

    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn known_stream() {
        // literal 'a', then distance 1 length 3
        assert_eq!(compress(b"aaaa"), b"\xb0\x80\x08");
        assert_eq!(decompress(b"\xb0\x80\x08").unwrap(), b"aaaa");
    }

    #[test]
    fn empty() {
        assert_eq!(compress(b""), b"");
        assert_eq!(decompress(b"").unwrap(), b"");
    }

    #[test]
    fn repetitive_shrinks() {
        let data: Vec<u8> = b"0123456789abcdef".iter().cycle().take(4096).copied().collect();
        let packed = compress(&data);
        assert!(packed.len() < data.len() / 4);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn out_too_small() {
        let mut out = [0; 2];
        assert_eq!(compress_into(b"abcdef", &mut out), None);
    }

    #[test]
    fn bad_distance() {
        // a back-reference with nothing before it
        assert_eq!(decompress(b"\x00\x00"), None);
    }

    #[quickcheck]
    fn roundtrip(data: Vec<u8>) -> bool {
        decompress(&compress(&data)).as_deref() == Some(&data[..])
    }

    #[quickcheck]
    fn roundtrip_low_entropy(data: Vec<bool>) -> bool {
        let data: Vec<u8> = data.into_iter().map(|b| b as u8).collect();
        decompress(&compress(&data)).as_deref() == Some(&data[..])
    }

    #[quickcheck]
    fn never_larger_than_bound(data: Vec<u8>) -> bool {
        compress(&data).len() <= max_compressed_len(data.len())
    }
}
