use std::path::{Path, PathBuf};

use vesclib::imports::ImportBundle;
use vesclib::package::VescPackage;

#[derive(clap::Args, Debug)]
pub struct PackageOpts {
    output: PathBuf,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    /// Script to bundle, with its imports.
    #[arg(long)]
    script: Option<PathBuf>,
    /// UI source.
    #[arg(long)]
    ui: Option<PathBuf>,
    #[arg(long)]
    fullscreen: bool,
    /// Look for imports here first, instead of next to the script.
    #[arg(long)]
    editor_path: Option<PathBuf>,
}

impl crate::ToolRun for PackageOpts {
    fn run(&self) -> anyhow::Result<()> {
        let pkg = self.build()?;
        report(&pkg);

        let data = pkg.encode();
        std::fs::write(&self.output, &data)?;
        eprintln!("Wrote {} bytes.", data.len());
        Ok(())
    }
}

impl PackageOpts {
    fn build(&self) -> anyhow::Result<VescPackage> {
        anyhow::ensure!(
            self.script.is_some() || self.ui.is_some(),
            "a package needs a script, a UI, or both"
        );

        let mut pkg = VescPackage {
            name: self.name.clone(),
            description: self.description.clone(),
            ui_fullscreen: self.fullscreen,
            ..Default::default()
        };

        if let Some(ref script) = self.script {
            let bundle = crate::pack::pack_script(script, self.editor_path.as_deref())?;
            pkg.script_data = bundle.encode()?;
        }
        if let Some(ref ui) = self.ui {
            pkg.ui_bundle = crate::common::read_text(ui)?;
        }
        Ok(pkg)
    }
}

#[derive(clap::Args, Debug)]
pub struct PackageInfoOpts {
    package: PathBuf,
}

impl crate::ToolRun for PackageInfoOpts {
    fn run(&self) -> anyhow::Result<()> {
        let pkg = read_package(&self.package)?;
        report(&pkg);
        if !pkg.description.is_empty() {
            eprintln!();
            eprintln!("{}", pkg.description);
        }
        Ok(())
    }
}

#[derive(clap::Args, Debug)]
pub struct PackageExtractOpts {
    package: PathBuf,
    dir: PathBuf,
}

impl crate::ToolRun for PackageExtractOpts {
    fn run(&self) -> anyhow::Result<()> {
        let pkg = read_package(&self.package)?;
        report(&pkg);
        extract(&self.dir, &pkg)
    }
}

pub fn read_package(path: &Path) -> anyhow::Result<VescPackage> {
    let data = std::fs::read(path)?;
    VescPackage::decode(&data).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
}

pub fn report(pkg: &VescPackage) {
    eprintln!("name: {}", pkg.name);
    if !pkg.script_data.is_empty() {
        eprintln!("script bundle: {} bytes", pkg.script_data.len());
        crate::pack::report(&ImportBundle::decode(&pkg.script_data));
    }
    if !pkg.ui_bundle.is_empty() {
        eprintln!(
            "ui: {} bytes{}",
            pkg.ui_bundle.len(),
            if pkg.ui_fullscreen { ", fullscreen" } else { "" }
        );
    }
}

fn extract(dir: &Path, pkg: &VescPackage) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("README.md"), &pkg.description)?;
    if !pkg.script_data.is_empty() {
        crate::unpack::extract_bundle(dir, &ImportBundle::decode(&pkg.script_data))?;
    }
    if !pkg.ui_bundle.is_empty() {
        std::fs::write(dir.join("ui.qml"), &pkg.ui_bundle)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_and_extract() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("main.lisp"), "(import \"a.bin\" 'a)\n(print a)\n").unwrap();
        std::fs::write(src.join("a.bin"), b"\x01\x02\x03").unwrap();
        std::fs::write(src.join("ui.qml"), "Item {}").unwrap();

        let opts = PackageOpts {
            output: dir.path().join("out.vescpkg"),
            name: "test".to_owned(),
            description: "hello".to_owned(),
            script: Some(src.join("main.lisp")),
            ui: Some(src.join("ui.qml")),
            fullscreen: true,
            editor_path: None,
        };
        let pkg = opts.build().unwrap();
        let bundle = ImportBundle::decode(&pkg.script_data);
        assert_eq!(bundle.get("a").unwrap().data, b"\x01\x02\x03");
        assert!(pkg.ui_fullscreen);

        let out = dir.path().join("out");
        extract(&out, &VescPackage::decode(&pkg.encode()).unwrap()).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("README.md")).unwrap(), "hello");
        assert_eq!(std::fs::read(out.join("a.bin")).unwrap(), b"\x01\x02\x03");
        assert_eq!(std::fs::read_to_string(out.join("ui.qml")).unwrap(), "Item {}");
    }

    #[test]
    fn needs_content() {
        let opts = PackageOpts {
            output: PathBuf::from("x"),
            name: "empty".to_owned(),
            description: String::new(),
            script: None,
            ui: None,
            fullscreen: false,
            editor_path: None,
        };
        assert!(opts.build().is_err());
    }
}
