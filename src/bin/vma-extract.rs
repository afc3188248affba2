//! CLI wrapper around the extraction library.

use std::path::PathBuf;

use clap::Parser;
use proxmox_human_byte::HumanByte;

use vma_extract::{extract, ExtractOptions};

#[derive(Debug, Parser)]
#[command(
    name = "vma-extract",
    about = "Extract a decompressed Proxmox VMA backup archive into config files and raw disk images.",
    version
)]
struct Args {
    /// Decompressed VMA archive to read
    archive: PathBuf,

    /// Directory to extract into
    destination: PathBuf,

    /// Overwrite an existing destination
    #[arg(short, long)]
    force: bool,

    /// Skip MD5 verification
    #[arg(long)]
    skip_hash: bool,

    /// Writer thread count (default: number of hardware threads)
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            // help and version are not usage errors
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.quiet { "warn" } else { "info" }),
    )
    .init();

    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    if !args.archive.is_file() {
        log::error!("source {:?} does not exist", args.archive);
        return 1;
    }
    if args.destination.exists() && !args.force {
        log::error!(
            "destination {:?} exists (use --force to overwrite)",
            args.destination
        );
        return 1;
    }
    if let Err(err) = std::fs::create_dir_all(&args.destination) {
        log::error!("cannot create destination {:?}: {}", args.destination, err);
        return 4;
    }

    let options = ExtractOptions {
        skip_hash: args.skip_hash,
        workers: args.jobs,
        progress: None,
    };

    match extract(&args.archive, &args.destination, options) {
        Ok(summary) => {
            log::info!(
                "extracted {} device(s) and {} config file(s) in {:.2}s ({} read, {} written)",
                summary.devices,
                summary.configs,
                summary.elapsed.as_secs_f64(),
                HumanByte::from(summary.read_bytes),
                HumanByte::from(summary.written_bytes),
            );
            0
        }
        Err(err) => {
            log::error!("{}", err);
            err.exit_code()
        }
    }
}
