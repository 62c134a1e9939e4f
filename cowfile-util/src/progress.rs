use cowfile::{Operation, Progress};

/// Console progress reporter using an indicatif progress bar.
///
/// The bar stays hidden until an operation starts and is cleared when it
/// finishes, so nothing is drawn for operations that fail validation.
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: indicatif::ProgressBar::hidden(),
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for ConsoleProgress {
    fn start(&self, operation: Operation, total: u64) {
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_message(operation.to_string());

        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{msg:>6} {bar:40.cyan/blue} {pos}/{len} blocks [{elapsed_precise}]")
        {
            self.bar.set_style(style.progress_chars("━╸─"));
        }

        self.bar.reset();
    }

    fn block_done(&self, _block: u64) {
        self.bar.inc(1);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
