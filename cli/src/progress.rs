use indicatif::{ProgressBar, ProgressStyle};
use larder_core::progress::{ProgressSink, ProgressUpdate};

/// Renders task tree updates as one percentage bar.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(100)
        };
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

impl ProgressSink for BarSink {
    fn report(&self, update: ProgressUpdate<'_>) {
        self.bar.set_position(update.percent.round() as u64);
        self.bar
            .set_message(format!("{} {}/{}", update.task, update.done, update.total));
    }
}
