//! Script bundles: a script's text plus the binary files it imports.
//!
//! ```text
//! [flags: u16 = 0][script text][NUL]
//! [count: i16] count * [tag, NUL][offset: i32][len: i32]
//! [blob, NUL] ...
//! ```
//!
//! Offsets count from the start of the script text, just after the
//! flags, and are 4-byte aligned. Each declared length includes the
//! blob's trailing NUL.

use std::path::{Path, PathBuf};

use nom::IResult;

use crate::package::{PackageError, VescPackage};
use crate::protocol::serialize::{infallible, Serializer};
use crate::protocol::util::cstr;

/// Tables claiming this many imports or more are not trusted.
pub const MAX_IMPORTS: i16 = 500;

/// Prefix for an import taken from an already-built package.
const PKG_PREFIX: &str = "pkg@";
/// Prefix for a named import inside an already-built package.
const PKG_TAG_PREFIX: &str = "pkg::";

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ImportError {
    /// An import line without a path or tag.
    InvalidImport { line: usize },
    NotFound { line: usize, path: PathBuf },
    Unreadable {
        line: usize,
        path: PathBuf,
        kind: std::io::ErrorKind,
    },
    /// A nested package could not be decoded.
    PackageInvalid {
        line: usize,
        path: PathBuf,
        error: PackageError,
    },
    /// A nested package has no import with this tag.
    TagMissing {
        line: usize,
        path: PathBuf,
        tag: String,
    },
    /// More imports than a bundle table can hold.
    TooManyImports { count: usize },
}

impl std::error::Error for ImportError {}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ImportError::InvalidImport { line } => write!(f, "line {}: invalid import tag", line),
            ImportError::NotFound { line, path } => {
                write!(f, "line {}: imported file not found: {}", line, path.display())
            }
            ImportError::Unreadable { line, path, kind } => write!(
                f,
                "line {}: imported file cannot be opened: {} ({})",
                line,
                path.display(),
                kind
            ),
            ImportError::PackageInvalid { line, path, error } => {
                write!(f, "line {}: {}: {}", line, path.display(), error)
            }
            ImportError::TagMissing { line, path, tag } => write!(
                f,
                "line {}: tag {} not found in package {}",
                line,
                tag,
                path.display()
            ),
            ImportError::TooManyImports { count } => {
                write!(f, "{} imports, at most {} allowed", count, MAX_IMPORTS - 1)
            }
        }
    }
}

/// One imported blob.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Import {
    pub tag: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ImportBundle {
    pub script: String,
    pub imports: Vec<Import>,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

impl ImportBundle {
    pub fn encode(&self) -> Result<Vec<u8>, ImportError> {
        let count = i16::try_from(self.imports.len())
            .ok()
            .filter(|c| *c < MAX_IMPORTS)
            .ok_or(ImportError::TooManyImports {
                count: self.imports.len(),
            })?;

        let mut vb: Vec<u8> = Vec::new();
        infallible(vb.write_be_u16(0));
        infallible(vb.write_bytes(self.script.as_bytes()));
        if vb.last() != Some(&0) || self.script.is_empty() {
            vb.push(0);
        }

        let table_len: usize = self.imports.iter().map(|i| i.tag.len() + 9).sum();
        infallible(vb.write_be_i16(count));

        let mut offset = vb.len() + table_len - 2;
        for import in &self.imports {
            offset = align4(offset);
            infallible(vb.write_cstr(import.tag.as_bytes()));
            infallible(vb.write_be_i32(offset as i32));
            infallible(vb.write_be_i32(import.data.len() as i32 + 1));
            offset += import.data.len() + 1;
        }

        for import in &self.imports {
            while (vb.len() - 2) % 4 != 0 {
                vb.push(0);
            }
            infallible(vb.write_bytes(&import.data));
            vb.push(0);
        }

        Ok(vb)
    }

    /// Decode a bundle. Never fails: damaged tables just yield fewer
    /// imports.
    pub fn decode(data: &[u8]) -> Self {
        let data = match data {
            [0, 0, _, ..] => &data[2..],
            _ => data,
        };

        let Some(end) = data.iter().position(|b| *b == 0) else {
            return Self {
                script: String::from_utf8_lossy(data).into_owned(),
                imports: Vec::new(),
            };
        };

        let mut imports = Vec::new();
        let table = &data[end + 1..];
        if end > 0 && table.len() > 3 {
            if let Ok((mut input, count)) = nom::number::complete::be_i16::<_, ()>(table) {
                if count > 0 && count < MAX_IMPORTS {
                    for _ in 0..count {
                        let Ok((rest, (tag, offset, len))) = table_entry(input) else {
                            log::warn!("import table is truncated");
                            break;
                        };
                        input = rest;
                        imports.push(Import {
                            tag: String::from_utf8_lossy(tag).into_owned(),
                            data: blob(data, offset, len).to_vec(),
                        });
                    }
                }
            }
        }

        Self {
            script: String::from_utf8_lossy(&data[..end]).into_owned(),
            imports,
        }
    }

    pub fn get(&self, tag: &str) -> Option<&Import> {
        self.imports.iter().find(|i| i.tag == tag)
    }
}

fn table_entry(input: &[u8]) -> IResult<&[u8], (&[u8], i32, i32)> {
    use nom::number::complete::be_i32;
    nom::sequence::tuple((cstr, be_i32, be_i32))(input)
}

/// Slice out a blob, minus its padding byte, clamped to the data.
fn blob(data: &[u8], offset: i32, len: i32) -> &[u8] {
    let start = (offset.max(0) as usize).min(data.len());
    let len = len.saturating_sub(1).max(0) as usize;
    let end = start.saturating_add(len).min(data.len());
    &data[start..end]
}

/// A parsed `(import "path" 'tag)` line.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ImportLine {
    Import { path: String, tag: String },
    /// Looks like an import, but has no usable path or tag.
    Invalid,
}

/// Recognize an import line. Returns None for any other line.
pub fn parse_import_line(line: &str) -> Option<ImportLine> {
    let mut line = line.trim_start_matches(' ').to_owned();
    while line.starts_with("( ") {
        line.remove(1);
    }

    let is_import = line
        .get(..8)
        .map_or(false, |p| p.eq_ignore_ascii_case("(import "));
    if !is_import {
        return None;
    }

    let (Some(start), Some(end)) = (line.find('"'), line.rfind('"')) else {
        return Some(ImportLine::Invalid);
    };
    if start == 0 || end <= start {
        return Some(ImportLine::Invalid);
    }

    let path = line[start + 1..end].to_owned();
    let mut tag: String = line[end + 1..]
        .chars()
        .filter(|c| !matches!(c, '\r' | ' ' | ')' | '\''))
        .collect();
    if let Some(semi) = tag.find(';') {
        tag.truncate(semi);
    }

    if path.is_empty() || tag.is_empty() {
        Some(ImportLine::Invalid)
    } else {
        Some(ImportLine::Import { path, tag })
    }
}

/// Where an import's bytes come from.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ImportSource<'a> {
    File(&'a str),
    /// A package file. With a tag, one of its imports, otherwise its
    /// script text.
    Package { path: &'a str, tag: Option<&'a str> },
}

impl<'a> ImportSource<'a> {
    /// Split a path from an import line. None if a package tag is
    /// malformed.
    pub fn parse(path: &'a str) -> Option<Self> {
        if let Some(rest) = path.strip_prefix(PKG_TAG_PREFIX) {
            match rest.find('@') {
                Some(at) if at > 0 => Some(Self::Package {
                    path: &rest[at + 1..],
                    tag: Some(&rest[..at]),
                }),
                _ => None,
            }
        } else if let Some(rest) = path.strip_prefix(PKG_PREFIX) {
            Some(Self::Package {
                path: rest,
                tag: None,
            })
        } else {
            Some(Self::File(path))
        }
    }
}

/// Gathers imported files while building a bundle.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ImportResolver {
    /// Directory of the script being packed. Paths are tried relative
    /// to it first.
    pub editor_path: Option<PathBuf>,
}

impl ImportResolver {
    pub fn new(editor_path: Option<PathBuf>) -> Self {
        Self { editor_path }
    }

    /// Build a bundle from a script, resolving every import in it.
    /// Any failure aborts the whole bundle.
    pub fn pack(&self, script: &str) -> Result<ImportBundle, ImportError> {
        let mut imports = Vec::new();

        for (i, text) in script.split('\n').enumerate() {
            let line = i + 1;
            match parse_import_line(text) {
                None => {}
                Some(ImportLine::Invalid) => return Err(ImportError::InvalidImport { line }),
                Some(ImportLine::Import { path, tag }) => {
                    let data = self.resolve(line, &path)?;
                    log::debug!("line {}: imported {} bytes as {}", line, data.len(), tag);
                    imports.push(Import { tag, data });
                }
            }
        }

        if imports.len() >= MAX_IMPORTS as usize {
            return Err(ImportError::TooManyImports {
                count: imports.len(),
            });
        }

        Ok(ImportBundle {
            script: script.to_owned(),
            imports,
        })
    }

    /// Find the file an import path refers to.
    pub fn locate(&self, path: &str) -> PathBuf {
        if let Some(ref dir) = self.editor_path {
            let candidate = dir.join(path);
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(path)
    }

    /// Fetch the bytes for one import.
    pub fn resolve(&self, line: usize, path: &str) -> Result<Vec<u8>, ImportError> {
        let source = ImportSource::parse(path).ok_or(ImportError::InvalidImport { line })?;
        match source {
            ImportSource::File(path) => read(line, &self.locate(path)),
            ImportSource::Package { path, tag } => {
                let file = self.locate(path);
                let pkg = VescPackage::decode(&read(line, &file)?).map_err(|error| {
                    ImportError::PackageInvalid {
                        line,
                        path: file.clone(),
                        error,
                    }
                })?;
                let bundle = ImportBundle::decode(&pkg.script_data);

                match tag {
                    None => Ok(bundle.script.into_bytes()),
                    Some(tag) => bundle
                        .get(tag)
                        .map(|i| i.data.clone())
                        .ok_or_else(|| ImportError::TagMissing {
                            line,
                            path: file,
                            tag: tag.to_owned(),
                        }),
                }
            }
        }
    }
}

fn read(line: usize, path: &Path) -> Result<Vec<u8>, ImportError> {
    if !path.exists() {
        return Err(ImportError::NotFound {
            line,
            path: path.to_owned(),
        });
    }
    std::fs::read(path).map_err(|e| ImportError::Unreadable {
        line,
        path: path.to_owned(),
        kind: e.kind(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    impl Arbitrary for Import {
        fn arbitrary(g: &mut Gen) -> Self {
            // tags are NUL-terminated, so keep them printable
            let tag: String = String::arbitrary(g)
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            Self {
                tag,
                data: Vec::arbitrary(g),
            }
        }
    }

    #[quickcheck]
    fn roundtrip(imports: Vec<Import>) -> bool {
        let bundle = ImportBundle {
            script: "(+ 1 2)".to_owned(),
            imports,
        };
        ImportBundle::decode(&bundle.encode().unwrap()) == bundle
    }

    #[test]
    fn layout() {
        let bundle = ImportBundle {
            script: "ab".to_owned(),
            imports: vec![Import {
                tag: "t".to_owned(),
                data: b"xyz".to_vec(),
            }],
        };
        let vb = bundle.encode().unwrap();
        // flags, script, NUL, count
        assert_eq!(&vb[..7], b"\0\0ab\0\0\x01");
        // entry: tag, offset 16, len 4
        assert_eq!(&vb[7..17], b"t\0\0\0\0\x10\0\0\0\x04");
        // blob at 2 + 16, padded before and after
        assert_eq!(&vb[17..], b"\0xyz\0");
    }

    #[test]
    fn decode_without_flags() {
        let mut vb = ImportBundle {
            script: "(x)".to_owned(),
            imports: vec![],
        }
        .encode()
        .unwrap();
        vb.drain(..2);
        assert_eq!(ImportBundle::decode(&vb).script, "(x)");
    }

    #[test]
    fn decode_plain_text() {
        let bundle = ImportBundle::decode(b"(+ 1 2)");
        assert_eq!(bundle.script, "(+ 1 2)");
        assert!(bundle.imports.is_empty());
    }

    #[test]
    fn decode_ignores_absurd_count() {
        let mut vb = b"\0\0(x)\0".to_vec();
        vb.extend((MAX_IMPORTS).to_be_bytes());
        vb.extend(b"t\0\0\0\0\0\0\0\0\x01");
        let bundle = ImportBundle::decode(&vb);
        assert_eq!(bundle.script, "(x)");
        assert!(bundle.imports.is_empty());
    }

    #[test]
    fn blob_clamped() {
        assert_eq!(blob(b"abcdef", 4, 10), b"ef");
        assert_eq!(blob(b"abcdef", 10, 3), b"");
        assert_eq!(blob(b"abcdef", 1, 0), b"");
        assert_eq!(blob(b"abcdef", -4, 3), b"ab");
        assert_eq!(blob(b"abcdef", 2, i32::MIN), b"");
    }

    #[test]
    fn decode_hostile_table() {
        let mut vb = b"\0\0(x)\0\0\x01t\0".to_vec();
        vb.extend(0i32.to_be_bytes());
        vb.extend(i32::MIN.to_be_bytes());
        let bundle = ImportBundle::decode(&vb);
        assert_eq!(bundle.script, "(x)");
        assert_eq!(bundle.get("t").unwrap().data, b"");

        let mut vb = b"\0\0(x)\0\0\x01t\0".to_vec();
        vb.extend((-256i32).to_be_bytes());
        vb.extend(3i32.to_be_bytes());
        let bundle = ImportBundle::decode(&vb);
        assert_eq!(bundle.get("t").unwrap().data, b"(x");
    }

    #[test]
    fn encode_too_many() {
        let import = Import {
            tag: "t".to_owned(),
            data: vec![1],
        };
        let bundle = ImportBundle {
            script: "(x)".to_owned(),
            imports: vec![import.clone(); MAX_IMPORTS as usize],
        };
        assert_eq!(
            bundle.encode(),
            Err(ImportError::TooManyImports {
                count: MAX_IMPORTS as usize
            })
        );

        let bundle = ImportBundle {
            imports: vec![import; i16::MAX as usize + 1],
            ..bundle
        };
        assert!(bundle.encode().is_err());
    }

    #[test]
    fn pack_too_many() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"a").unwrap();
        let script = "(import \"a.bin\" 'a)\n".repeat(MAX_IMPORTS as usize);
        let resolver = ImportResolver::new(Some(dir.path().to_owned()));
        assert!(matches!(
            resolver.pack(&script),
            Err(ImportError::TooManyImports { .. })
        ));
    }

    #[test]
    fn import_lines() {
        assert_eq!(
            parse_import_line("  (  import \"lib/a.bin\" 'a) ; comment"),
            Some(ImportLine::Import {
                path: "lib/a.bin".to_owned(),
                tag: "a".to_owned()
            })
        );
        assert_eq!(
            parse_import_line("(IMPORT \"pkg::foo@x.vescpkg\" 'foo-tag)\r"),
            Some(ImportLine::Import {
                path: "pkg::foo@x.vescpkg".to_owned(),
                tag: "foo-tag".to_owned()
            })
        );
        assert_eq!(
            parse_import_line("(import \"a.bin\")"),
            Some(ImportLine::Invalid)
        );
        assert_eq!(parse_import_line("(import a.bin 'a)"), Some(ImportLine::Invalid));
        assert_eq!(parse_import_line("(define x 1)"), None);
        assert_eq!(parse_import_line(""), None);
    }

    #[test]
    fn import_sources() {
        assert_eq!(ImportSource::parse("a.bin"), Some(ImportSource::File("a.bin")));
        assert_eq!(
            ImportSource::parse("pkg@x.vescpkg"),
            Some(ImportSource::Package {
                path: "x.vescpkg",
                tag: None
            })
        );
        assert_eq!(
            ImportSource::parse("pkg::t@x.vescpkg"),
            Some(ImportSource::Package {
                path: "x.vescpkg",
                tag: Some("t")
            })
        );
        assert_eq!(ImportSource::parse("pkg::@x.vescpkg"), None);
        assert_eq!(ImportSource::parse("pkg::x.vescpkg"), None);
    }

    #[test]
    fn pack_two_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"first file").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), [0u8, 1, 2, 3, 4, 5, 6]).unwrap();

        let script = "(import \"a.bin\" 'a)\n(import \"sub/b.bin\" 'b)\n(+ 1 2)\n";
        let resolver = ImportResolver::new(Some(dir.path().to_owned()));
        let bundle = resolver.pack(script).unwrap();
        let vb = bundle.encode().unwrap();

        // walk the table by hand to check alignment
        let region = &vb[2..];
        let end = region.iter().position(|b| *b == 0).unwrap();
        let mut table = &region[end + 1..];
        assert_eq!(&table[..2], b"\0\x02");
        table = &table[2..];
        for (tag, expected) in [("a", &b"first file"[..]), ("b", &[0, 1, 2, 3, 4, 5, 6][..])] {
            let (rest, (t, offset, len)) = table_entry(table).unwrap();
            assert_eq!(t, tag.as_bytes());
            assert_eq!(offset % 4, 0);
            assert_eq!(len as usize, expected.len() + 1);
            assert_eq!(blob(region, offset, len), expected);
            table = rest;
        }

        let decoded = ImportBundle::decode(&vb);
        assert_eq!(decoded.script, script);
        assert_eq!(decoded.get("a").unwrap().data, b"first file");
        assert_eq!(decoded.get("b").unwrap().data, [0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn pack_from_package() {
        let dir = tempfile::tempdir().unwrap();
        let inner = ImportBundle {
            script: "(inner)".to_owned(),
            imports: vec![Import {
                tag: "font".to_owned(),
                data: b"glyphs".to_vec(),
            }],
        };
        let pkg = VescPackage {
            name: "lib".to_owned(),
            script_data: inner.encode().unwrap(),
            ..Default::default()
        };
        std::fs::write(dir.path().join("lib.vescpkg"), pkg.encode()).unwrap();

        let resolver = ImportResolver::new(Some(dir.path().to_owned()));
        let bundle = resolver
            .pack("(import \"pkg@lib.vescpkg\" 'lib)\n(import \"pkg::font@lib.vescpkg\" 'f)")
            .unwrap();
        assert_eq!(bundle.get("lib").unwrap().data, b"(inner)");
        assert_eq!(bundle.get("f").unwrap().data, b"glyphs");

        let err = resolver
            .pack("\n(import \"pkg::nope@lib.vescpkg\" 'n)")
            .unwrap_err();
        assert!(matches!(err, ImportError::TagMissing { line: 2, .. }));
    }

    #[test]
    fn pack_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.vescpkg"), b"not a package").unwrap();
        let resolver = ImportResolver::new(Some(dir.path().to_owned()));

        assert_eq!(
            resolver.pack("(import \"a.bin\")"),
            Err(ImportError::InvalidImport { line: 1 })
        );
        assert!(matches!(
            resolver.pack("(import \"missing.bin\" 'm)"),
            Err(ImportError::NotFound { line: 1, .. })
        ));
        assert!(matches!(
            resolver.pack("(import \"pkg@junk.vescpkg\" 'j)"),
            Err(ImportError::PackageInvalid { line: 1, .. })
        ));
    }
}
