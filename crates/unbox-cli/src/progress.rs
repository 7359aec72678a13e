//! Terminal progress bar

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use unbox_core::ProgressReporter;

/// Byte-based progress bar fed by the engine's callbacks
pub struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressReporter for BarReporter {
    fn on_start(&self, total_bytes: Option<u64>, total_files: Option<usize>) {
        if let Some(total) = total_bytes {
            self.bar.set_length(total);
        }
        if let Some(files) = total_files {
            self.bar.set_message(format!("{} files", files));
        }
    }

    fn on_progress(
        &self,
        name: &str,
        _bytes_so_far: u64,
        _total_for_entry: Option<u64>,
        file_index: usize,
        total_files: Option<usize>,
    ) {
        match total_files {
            Some(total) => self.bar.set_message(format!("({}/{}) {}", file_index + 1, total, name)),
            None => self.bar.set_message(name.to_string()),
        }
    }

    fn on_totals(&self, _files_done: usize, bytes_done: u64) {
        self.bar.set_position(bytes_done);
    }

    fn on_complete(&self) {
        self.bar.finish_with_message("Complete");
    }

    fn on_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("Failed: {}", message));
    }
}
