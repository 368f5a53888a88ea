use std::path::{Path, PathBuf};

use vesclib::imports::ImportBundle;

#[derive(clap::Args, Debug)]
pub struct UnpackOpts {
    bundle: PathBuf,
    dir: PathBuf,
}

impl crate::ToolRun for UnpackOpts {
    fn run(&self) -> anyhow::Result<()> {
        let bundle = ImportBundle::decode(&std::fs::read(&self.bundle)?);
        crate::pack::report(&bundle);
        extract_bundle(&self.dir, &bundle)
    }
}

/// Write a bundle's script and imports out as separate files.
pub fn extract_bundle(dir: &Path, bundle: &ImportBundle) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("code.lisp"), &bundle.script)?;

    for import in bundle.imports.iter() {
        let name = format!("{}.bin", file_name(&import.tag));
        std::fs::write(dir.join(&name), &import.data)?;
        log::info!("{} -> {}", import.tag, name);
    }
    Ok(())
}

/// Tags are free text, file names are not.
fn file_name(tag: &str) -> String {
    let name: String = tag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "_".to_owned()
    } else {
        name
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vesclib::imports::Import;

    #[test]
    fn tag_names() {
        assert_eq!(file_name("pic-1"), "pic-1");
        assert_eq!(file_name("../x y"), "___x_y");
        assert_eq!(file_name(""), "_");
    }

    #[test]
    fn extract() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = ImportBundle {
            script: "(import \"f.bin\" 'f)".to_owned(),
            imports: vec![Import {
                tag: "f".to_owned(),
                data: b"data".to_vec(),
            }],
        };
        extract_bundle(dir.path(), &bundle).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("code.lisp")).unwrap(),
            bundle.script
        );
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), b"data");
    }
}
