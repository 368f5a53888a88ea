use std::path::{Path, PathBuf};

use vesclib::imports::{ImportBundle, ImportResolver};

#[derive(clap::Args, Debug)]
pub struct PackOpts {
    script: PathBuf,
    output: PathBuf,
    /// Look for imports here first, instead of next to the script.
    #[arg(long)]
    editor_path: Option<PathBuf>,
}

impl crate::ToolRun for PackOpts {
    fn run(&self) -> anyhow::Result<()> {
        let bundle = pack_script(&self.script, self.editor_path.as_deref())?;
        report(&bundle);

        let data = bundle.encode()?;
        std::fs::write(&self.output, &data)?;
        eprintln!("Wrote {} bytes.", data.len());
        Ok(())
    }
}

/// Read a script and bundle it with everything it imports.
pub fn pack_script(path: &Path, editor_path: Option<&Path>) -> anyhow::Result<ImportBundle> {
    let text = crate::common::read_text(path)?;
    let dir = editor_path
        .or_else(|| path.parent())
        .map(|p| p.to_path_buf());
    let bundle = ImportResolver::new(dir)
        .pack(&text)
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    Ok(bundle)
}

pub fn report(bundle: &ImportBundle) {
    eprintln!("script: {} bytes", bundle.script.len());
    for import in bundle.imports.iter() {
        eprintln!("import: {:>8} bytes  {}", import.data.len(), import.tag);
    }
}
