use clap::Parser;

mod common;
mod debug;
mod hexdump;
mod pack;
mod package;
mod parsedump;
mod simulate;
mod unpack;
mod upload;

trait ToolRun {
    fn run(&self) -> anyhow::Result<()>;
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct ToolOptions {
    /// Log more. Repeat for even more.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: ToolCommand,
}

#[derive(clap::Subcommand, Debug)]
enum ToolCommand {
    /// Bundle a script with the files it imports.
    PackImports(pack::PackOpts),
    /// Split a bundle back into a script and its imports.
    UnpackImports(unpack::UnpackOpts),
    /// Build an installable package.
    Package(package::PackageOpts),
    /// Describe a package.
    PackageInfo(package::PackageInfoOpts),
    /// Split a package into its parts.
    PackageExtract(package::PackageExtractOpts),
    /// Write an image, script, or UI to a target.
    Upload(upload::UploadOpts),
    /// Install a package on a target.
    Install(upload::InstallOpts),
    /// Pretend to be a target, over TCP.
    Simulate(simulate::SimulateOpts),
    /// Decode a captured conversation.
    ParseDump(parsedump::ParseDumpOpts),
}

impl ToolRun for ToolCommand {
    fn run(&self) -> anyhow::Result<()> {
        use ToolCommand::*;
        match self {
            PackImports(o) => o.run(),
            UnpackImports(o) => o.run(),
            Package(o) => o.run(),
            PackageInfo(o) => o.run(),
            PackageExtract(o) => o.run(),
            Upload(o) => o.run(),
            Install(o) => o.run(),
            Simulate(o) => o.run(),
            ParseDump(o) => o.run(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let opts = ToolOptions::parse();

    let level = match opts.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    opts.command.run()
}
