//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use unbox_core::{Config, Extractor, ProgressReporter, SharedConfig};
use unbox_testing::helpers::EventLog;

/// Progress reporter that logs one line per callback
#[derive(Default)]
pub struct Recorder {
    pub log: EventLog,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ProgressReporter for Recorder {
    fn on_start(&self, total_bytes: Option<u64>, total_files: Option<usize>) {
        self.log.push(format!("start {:?} {:?}", total_bytes, total_files));
    }

    fn on_progress(
        &self,
        name: &str,
        bytes_so_far: u64,
        _total_for_entry: Option<u64>,
        _file_index: usize,
        _total_files: Option<usize>,
    ) {
        self.log.push(format!("progress {} {}", name, bytes_so_far));
    }

    fn on_file_complete(&self, name: &str, size: u64) {
        self.log.push(format!("file {} {}", name, size));
    }

    fn on_totals(&self, files_done: usize, bytes_done: u64) {
        self.log.push(format!("totals {} {}", files_done, bytes_done));
    }

    fn on_complete(&self) {
        self.log.push("complete");
    }

    fn on_error(&self, message: &str) {
        self.log.push(format!("error {}", message));
    }
}

/// Engine over an in-memory store holding `config`
pub fn extractor(config: Config, concurrent: bool) -> Extractor {
    Extractor::new(Arc::new(SharedConfig::new(config)), concurrent)
}

/// Default configuration with `threads` workers
pub fn config_with_threads(threads: usize) -> Config {
    let mut config = Config::default();
    config.performance.threads = threads;
    config
}
