/// The CRC-16/XMODEM (CCITT, poly 0x1021, init 0) used by frames, bus
/// reassembly and upload headers. The lookup table is built at compile time.
pub static XMODEM: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Checksum a whole buffer in one go.
pub fn crc16(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

/// Generic CRC style, for computing checksums alongside serialization.
pub trait CrcStyle {
    type Digest<'a>: CrcDigest
    where
        Self: 'a;

    fn digest<'a>(&'a self) -> Self::Digest<'a>;
}

/// Interface for a CRC digest.
pub trait CrcDigest {
    fn update(&mut self, bytes: &[u8]);
    fn finalize(self) -> u16;
}

impl<C> CrcStyle for &C
where
    C: CrcStyle,
{
    type Digest<'a> = C::Digest<'a> where Self: 'a;

    fn digest<'a>(&'a self) -> Self::Digest<'a> {
        (*self).digest()
    }
}

/// The protocol CRC as a [CrcStyle].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CrcXModem;

/// A 16-bit XModem CRC digest struct.
#[derive(Clone)]
pub struct CrcXModemDigest(crc::Digest<'static, u16, crc::Table<1>>);

impl CrcStyle for CrcXModem {
    type Digest<'a> = CrcXModemDigest;

    fn digest<'a>(&'a self) -> Self::Digest<'a> {
        CrcXModemDigest(XMODEM.digest())
    }
}

impl CrcDigest for CrcXModemDigest {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes)
    }

    fn finalize(self) -> u16 {
        self.0.finalize()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_value() {
        // standard check input for CRC-16/XMODEM
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn digest_matches_checksum() {
        let mut digest = CrcXModem.digest();
        digest.update(b"12345");
        digest.update(b"6789");
        assert_eq!(digest.finalize(), crc16(b"123456789"));
    }
}
