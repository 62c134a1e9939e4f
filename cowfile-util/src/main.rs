mod cli;

use clap::Parser;
use cli::{Cli, Command};
use cowfile::header::StateError;
use cowfile::{
    MergePlan, PackOptions, Progress, RepairError, RepairOptions, SilentProgress,
};
use cowfile_util::{ConsoleProgress, confirm_merge, describe};
use snafu::{ResultExt, Snafu};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Top-level application errors for cowfile-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to read cowfile header"))]
    Info { source: cowfile::ReadHeaderError },

    #[snafu(display("failed to create cowfile"))]
    Create { source: cowfile::CreateError },

    #[snafu(display("failed to repair cowfile"))]
    Repair { source: cowfile::RepairError },

    #[snafu(display("failed to merge cowfile"))]
    Merge { source: cowfile::MergeError },

    #[snafu(display("failed to ask for confirmation"))]
    Prompt { source: std::io::Error },

    #[snafu(display("failed to pack cowfile"))]
    Pack { source: cowfile::PackError },

    #[snafu(display("failed to unpack cowfile"))]
    Unpack { source: cowfile::PackError },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed arguments");

    let console = ConsoleProgress::new();
    let progress: &dyn Progress = if cli.quiet { &SilentProgress } else { &console };

    match cli.command {
        Command::Info { path, compressed } => cmd_info(&path, compressed),
        Command::Create {
            base,
            overlay,
            mapunit,
        } => cmd_create(&base, &overlay, mapunit),
        Command::Repair {
            path,
            force,
            dry_run,
        } => cmd_repair(&path, RepairOptions { force, dry_run }, cli.verbose, progress),
        Command::Merge { overlay, base, yes } => cmd_merge(&overlay, &base, yes, progress),
        Command::Pack {
            source,
            dest,
            compressed,
        } => cmd_pack(&source, &dest, PackOptions { compressed }, progress),
        Command::Unpack {
            source,
            dest,
            compressed,
        } => cmd_unpack(&source, &dest, PackOptions { compressed }, progress),
    }
}

/// Logs warnings by default, more with each `-v`. `RUST_LOG` wins when set.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_info(path: &Path, compressed: bool) -> Result<()> {
    let header = cowfile::read_header(path, compressed).context(InfoSnafu)?;

    println!("Cowfile: {}", path.display());
    println!();
    print!("{}", describe(&header));

    Ok(())
}

fn cmd_create(base: &Path, overlay: &Path, mapunit: u64) -> Result<()> {
    let header = cowfile::create(base, overlay, mapunit).context(CreateSnafu)?;

    println!(
        "Created {} for {} ({} blocks of {} bytes).",
        overlay.display(),
        base.display(),
        header.rdoblocks(),
        header.mapunit()
    );

    Ok(())
}

fn cmd_repair(
    path: &Path,
    options: RepairOptions,
    verbose: u8,
    progress: &dyn Progress,
) -> Result<()> {
    let report = match cowfile::repair(path, options, progress) {
        Ok(report) => report,
        Err(RepairError::InvalidState {
            source: StateError::NotDirty,
            ..
        }) => {
            println!("{} is not dirty (use --force to repair anyway).", path.display());
            return Ok(());
        }
        Err(e) => return Err(e).context(RepairSnafu),
    };

    if verbose > 0 {
        for correction in &report.corrections {
            println!(
                "Block #{} at data offset 0x{:X} was not marked.",
                correction.block, correction.data_offset
            );
        }
    }

    let verb = if report.dry_run { "would be" } else { "were" };

    println!(
        "{} blocks scanned, {} corrections {verb} made, {} blocks in use (previously {}).",
        report.scanned,
        report.corrections.len(),
        report.cowused,
        report.previous_cowused
    );

    Ok(())
}

fn cmd_merge(overlay: &Path, base: &Path, yes: bool, progress: &dyn Progress) -> Result<()> {
    let plan = MergePlan::prepare(overlay, base).context(MergeSnafu)?;

    if !yes {
        let confirmed = confirm_merge(
            &mut std::io::stdin().lock(),
            &mut std::io::stdout(),
            base,
            overlay,
        )
        .context(PromptSnafu)?;

        if !confirmed {
            println!("Merge cancelled.");
            return Ok(());
        }
    }

    let start = std::time::Instant::now();
    let report = plan.apply(progress).context(MergeSnafu)?;

    println!(
        "Merged {} blocks into {} in {:.2}s.",
        report.blocks,
        base.display(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn cmd_pack(source: &Path, dest: &Path, options: PackOptions, progress: &dyn Progress) -> Result<()> {
    let start = std::time::Instant::now();
    let report = cowfile::pack(source, dest, options, progress).context(PackSnafu)?;

    println!(
        "Packed {} blocks into {} ({} seeks) in {:.2}s.",
        report.blocks,
        dest.display(),
        report.seeks,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn cmd_unpack(
    source: &Path,
    dest: &Path,
    options: PackOptions,
    progress: &dyn Progress,
) -> Result<()> {
    let start = std::time::Instant::now();
    let report = cowfile::unpack(source, dest, options, progress).context(UnpackSnafu)?;

    println!(
        "Unpacked {} blocks into {} ({} seeks) in {:.2}s.",
        report.blocks,
        dest.display(),
        report.seeks,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}
