use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cowfile-util")]
#[command(about = "Copy-on-write overlay file utility", long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display the header of a cowfile
    Info {
        /// Path to the cowfile
        #[arg(value_name = "COWFILE")]
        path: PathBuf,

        /// The cowfile is a compressed packed cowfile
        #[arg(short = 'z', long)]
        compressed: bool,
    },

    /// Create an empty cowfile for a base file
    Create {
        /// Path to the base file
        #[arg(value_name = "BASE")]
        base: PathBuf,

        /// Path of the cowfile to create
        #[arg(value_name = "COWFILE")]
        overlay: PathBuf,

        /// Block size in bytes (power of two, 512 to 1048576)
        #[arg(short, long, default_value_t = cowfile::DEFAULT_MAPUNIT)]
        mapunit: u64,
    },

    /// Rebuild the bitmap of a cowfile after an unclean shutdown
    Repair {
        /// Path to the cowfile
        #[arg(value_name = "COWFILE")]
        path: PathBuf,

        /// Repair even if the cowfile is not marked dirty
        #[arg(short, long)]
        force: bool,

        /// Only report what would be corrected
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Write the blocks of a cowfile back into its base file
    Merge {
        /// Path to the cowfile
        #[arg(value_name = "COWFILE")]
        overlay: PathBuf,

        /// Path to the base file, modified in place
        #[arg(value_name = "BASE")]
        base: PathBuf,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Store only the used blocks of a cowfile
    Pack {
        /// Path to the raw cowfile
        #[arg(value_name = "COWFILE")]
        source: PathBuf,

        /// Path of the packed cowfile to write
        #[arg(value_name = "PACKED")]
        dest: PathBuf,

        /// Compress the packed cowfile with gzip
        #[arg(short = 'z', long)]
        compressed: bool,
    },

    /// Restore a raw cowfile from a packed one
    Unpack {
        /// Path to the packed cowfile
        #[arg(value_name = "PACKED")]
        source: PathBuf,

        /// Path of the raw cowfile to write
        #[arg(value_name = "COWFILE")]
        dest: PathBuf,

        /// The packed cowfile is gzip compressed
        #[arg(short = 'z', long)]
        compressed: bool,
    },
}
