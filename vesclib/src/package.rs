//! Installable packages: a script, a UI, and a description, stored as
//! one compressed record.

use nom::IResult;

use crate::protocol::serialize::{infallible, Serializer};
use crate::protocol::util::cstr;

/// First string in every package record. The typo is load-bearing.
pub const MAGIC: &[u8] = b"VESC Packet";

/// zlib level used for packages and UI bundles.
const COMPRESSION_LEVEL: u8 = 9;

/// Prepended to a UI before upload, so it can use the built-in types.
const UI_PREAMBLE: &str = "import Vedder.vesc.vescinterface 1.0;import \"qrc:/mobile\";";

const FIELD_NAME: &[u8] = b"name";
const FIELD_DESCRIPTION: &[u8] = b"description";
const FIELD_SCRIPT: &[u8] = b"lispData";
const FIELD_UI: &[u8] = b"qmlFile";
const FIELD_FULLSCREEN: &[u8] = b"qmlIsFullscreen";

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PackageError {
    /// Compressed data was damaged or too short.
    Decompress,
    /// Record does not start with [MAGIC].
    BadMagic,
    /// A field claims more bytes than remain.
    Truncated { field: String },
}

impl std::error::Error for PackageError {}

impl std::fmt::Display for PackageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PackageError::Decompress => write!(f, "could not decompress package"),
            PackageError::BadMagic => write!(f, "not a package"),
            PackageError::Truncated { field } => write!(f, "package field {:?} is truncated", field),
        }
    }
}

/// A package, decoded.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VescPackage {
    pub name: String,
    pub description: String,
    /// A script bundle, as built by [crate::imports::ImportBundle].
    pub script_data: Vec<u8>,
    /// UI source text.
    pub ui_bundle: String,
    pub ui_fullscreen: bool,
}

impl VescPackage {
    /// Encode into the compressed form stored on disk.
    pub fn encode(&self) -> Vec<u8> {
        qcompress(&self.encode_record())
    }

    /// Encode into the uncompressed record.
    pub fn encode_record(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        infallible(out.write_cstr(MAGIC));

        // empty fields are left out, except the flag
        let fields: [(&[u8], &[u8]); 4] = [
            (FIELD_NAME, self.name.as_bytes()),
            (FIELD_DESCRIPTION, self.description.as_bytes()),
            (FIELD_SCRIPT, &self.script_data),
            (FIELD_UI, self.ui_bundle.as_bytes()),
        ];
        for (name, data) in fields {
            if !data.is_empty() {
                write_field(&mut out, name, data);
            }
        }
        write_field(&mut out, FIELD_FULLSCREEN, &[self.ui_fullscreen as u8]);

        out
    }

    /// Decode from the compressed form.
    pub fn decode(data: &[u8]) -> Result<Self, PackageError> {
        Self::decode_record(&quncompress(data)?)
    }

    /// Decode an uncompressed record. Unknown fields are skipped.
    pub fn decode_record(record: &[u8]) -> Result<Self, PackageError> {
        let (mut input, magic) = cstr(record).map_err(|_| PackageError::BadMagic)?;
        if magic != MAGIC {
            return Err(PackageError::BadMagic);
        }

        let mut pkg = VescPackage::default();
        while !input.is_empty() {
            let (rest, name) = cstr(input).map_err(|_| PackageError::BadMagic)?;
            if name.is_empty() {
                log::warn!("empty field name, ignoring the rest of the package");
                break;
            }

            let (rest, data) = field_data(rest).map_err(|_| PackageError::Truncated {
                field: String::from_utf8_lossy(name).into_owned(),
            })?;

            match name {
                FIELD_NAME => pkg.name = String::from_utf8_lossy(data).into_owned(),
                FIELD_DESCRIPTION => pkg.description = String::from_utf8_lossy(data).into_owned(),
                FIELD_SCRIPT => pkg.script_data = data.to_vec(),
                FIELD_UI => pkg.ui_bundle = String::from_utf8_lossy(data).into_owned(),
                FIELD_FULLSCREEN => pkg.ui_fullscreen = data.first().map_or(false, |b| *b != 0),
                _ => log::debug!(
                    "skipping unknown field {:?}",
                    String::from_utf8_lossy(name)
                ),
            }

            input = rest;
        }

        Ok(pkg)
    }
}

fn write_field(out: &mut Vec<u8>, name: &[u8], data: &[u8]) {
    infallible(out.write_cstr(name));
    infallible(out.write_be_i32(data.len() as i32));
    infallible(out.write_bytes(data));
}

fn field_data(input: &[u8]) -> IResult<&[u8], &[u8]> {
    nom::multi::length_data(nom::number::complete::be_u32)(input)
}

/// Compress with zlib, behind a big-endian length of the original.
pub fn qcompress(data: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    infallible(out.write_be_u32(data.len() as u32));
    out.extend(miniz_oxide::deflate::compress_to_vec_zlib(
        data,
        COMPRESSION_LEVEL,
    ));
    out
}

/// Undo [qcompress].
pub fn quncompress(data: &[u8]) -> Result<Vec<u8>, PackageError> {
    let (len, body) = match data {
        [a, b, c, d, body @ ..] => (u32::from_be_bytes([*a, *b, *c, *d]), body),
        _ => return Err(PackageError::Decompress),
    };

    let out = miniz_oxide::inflate::decompress_to_vec_zlib(body).map_err(|e| {
        log::warn!("inflate failed: {:?}", e.status);
        PackageError::Decompress
    })?;
    if out.len() != len as usize {
        log::warn!("expected {} bytes, inflated {}", len, out.len());
    }
    Ok(out)
}

/// Build the upload payload for a UI: a flags word, then the
/// compressed source with the standard imports in front.
pub fn ui_payload(source: &str, fullscreen: bool) -> Vec<u8> {
    let mut text = String::with_capacity(UI_PREAMBLE.len() + source.len());
    text.push_str(UI_PREAMBLE);
    text.push_str(source);

    let mut out: Vec<u8> = Vec::new();
    infallible(out.write_be_u16(if fullscreen { 2 } else { 1 }));
    infallible(out.write_bytes(&qcompress(text.as_bytes())));
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn roundtrip_script() {
        let pkg = VescPackage {
            name: "x".to_owned(),
            script_data: b"(+ 1 2)".to_vec(),
            ..Default::default()
        };
        let decoded = VescPackage::decode(&pkg.encode()).unwrap();
        assert_eq!(decoded.name, "x");
        assert_eq!(decoded.script_data, b"(+ 1 2)");
        assert_eq!(decoded, pkg);
    }

    #[quickcheck]
    fn roundtrip(name: String, description: String, script: Vec<u8>, ui: String, fs: bool) -> bool {
        let pkg = VescPackage {
            name,
            description,
            script_data: script,
            ui_bundle: ui,
            ui_fullscreen: fs,
        };
        VescPackage::decode(&pkg.encode()) == Ok(pkg)
    }

    #[test]
    fn record_layout() {
        let pkg = VescPackage {
            name: "ab".to_owned(),
            ui_fullscreen: true,
            ..Default::default()
        };
        let mut expected = b"VESC Packet\0name\0\0\0\0\x02ab".to_vec();
        expected.extend(b"qmlIsFullscreen\0\0\0\0\x01\x01");
        assert_eq!(pkg.encode_record(), expected);
    }

    #[test]
    fn unknown_fields_skipped() {
        let mut record = b"VESC Packet\0".to_vec();
        record.extend(b"future\0\0\0\0\x03xyz");
        record.extend(b"name\0\0\0\0\x01n");
        let pkg = VescPackage::decode_record(&record).unwrap();
        assert_eq!(pkg.name, "n");
    }

    #[test]
    fn empty_name_ends_record() {
        let mut record = b"VESC Packet\0".to_vec();
        record.extend(b"name\0\0\0\0\x01n");
        record.extend(b"\0garbage");
        let pkg = VescPackage::decode_record(&record).unwrap();
        assert_eq!(pkg.name, "n");
    }

    #[test]
    fn bad_magic() {
        assert_eq!(
            VescPackage::decode_record(b"VESC Package\0"),
            Err(PackageError::BadMagic)
        );
        assert_eq!(
            VescPackage::decode(&qcompress(b"nope")),
            Err(PackageError::BadMagic)
        );
    }

    #[test]
    fn truncated() {
        let record = b"VESC Packet\0lispData\0\0\0\x01\x00abc";
        assert_eq!(
            VescPackage::decode_record(record),
            Err(PackageError::Truncated {
                field: "lispData".to_owned()
            })
        );
    }

    #[test]
    fn decompress_errors() {
        assert_eq!(quncompress(b"\0\0"), Err(PackageError::Decompress));
        assert_eq!(quncompress(b"\0\0\0\x04garbage"), Err(PackageError::Decompress));
    }

    #[test]
    fn qcompress_header() {
        let packed = qcompress(&[0x42; 1000]);
        assert_eq!(&packed[..4], b"\0\0\x03\xe8");
        assert_eq!(quncompress(&packed).unwrap(), vec![0x42; 1000]);
    }

    #[test]
    fn ui_payload_layout() {
        let payload = ui_payload("Item {}", true);
        assert_eq!(&payload[..2], b"\0\x02");
        let text = quncompress(&payload[2..]).unwrap();
        assert_eq!(
            text,
            b"import Vedder.vesc.vescinterface 1.0;import \"qrc:/mobile\";Item {}"
        );
        assert_eq!(&ui_payload("", false)[..2], b"\0\x01");
    }
}
