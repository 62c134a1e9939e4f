//! Library and helpers behind the `cowfile-util` command line tool.
//!
//! The heavy lifting lives in the [`cowfile`] crate. This crate adds what a
//! terminal front end needs on top of it: the merge confirmation prompt, a
//! human readable header summary and, with the `cli` feature, a console
//! progress bar.
//!
//! # Example
//!
//! ```no_run
//! use cowfile_util::{confirm_merge, MergePlan, SilentProgress};
//! use std::io;
//! use std::path::Path;
//!
//! let (overlay, base) = (Path::new("disk.cow"), Path::new("disk.img"));
//! let plan = MergePlan::prepare(overlay, base).expect("cannot merge");
//!
//! if confirm_merge(&mut io::stdin().lock(), &mut io::stdout(), base, overlay).unwrap() {
//!     plan.apply(&SilentProgress).expect("merge failed");
//! }
//! ```

#[cfg(feature = "cli")]
mod progress;

pub use cowfile::{
    CowHeader, MergePlan, PackOptions, Progress, RepairOptions, SilentProgress,
};

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;

use std::io::{self, BufRead, Write};
use std::path::Path;

/// Asks whether `base` may be overwritten with the blocks of `overlay`.
///
/// Only an answer starting with `y` or `Y` confirms. End of input declines.
pub fn confirm_merge<R, W>(input: &mut R, output: &mut W, base: &Path, overlay: &Path) -> io::Result<bool>
where
    R: BufRead + ?Sized,
    W: Write + ?Sized,
{
    write!(
        output,
        "Really want to modify {} with updates from {} (Y/N)? ",
        base.display(),
        overlay.display()
    )?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;

    Ok(matches!(answer.trim_start().chars().next(), Some('y' | 'Y')))
}

/// Renders the fields of `header` the way the `info` command prints them.
pub fn describe(header: &CowHeader) -> String {
    format!(
        "State:          {}\n\
         Version:        {}\n\
         Block Size:     {} bytes\n\
         Bitmap Offset:  0x{:X}\n\
         Bitmap Size:    {} bytes\n\
         Data Offset:    0x{:X}\n\
         Base Blocks:    {}\n\
         Blocks In Use:  {}\n\
         Fingerprint:    0x{:08X}\n",
        header.flags(),
        header.version(),
        header.mapunit(),
        header.bitmap_offset(),
        header.mapsize(),
        header.doffset(),
        header.rdoblocks(),
        header.cowused(),
        header.rdofingerprint(),
    )
}
