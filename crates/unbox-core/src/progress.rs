//! Progress reporting protocol
//!
//! Callers implement [`ProgressReporter`]; the engine only talks to it through
//! a [`ProgressTracker`], which guarantees the ordering contract: `on_start` at
//! most once and before anything else, then any number of progress events,
//! then exactly one of `on_complete` or `on_error`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Caller-supplied progress sink.
///
/// In concurrent mode callbacks arrive from worker threads in no particular
/// entry order; the cumulative counts passed to
/// [`on_totals`](ProgressReporter::on_totals) never decrease.
pub trait ProgressReporter: Send + Sync {
    /// Best-effort totals; `None` when not knowable upfront
    fn on_start(&self, total_bytes: Option<u64>, total_files: Option<usize>);

    /// Bytes written so far for one entry
    fn on_progress(
        &self,
        name: &str,
        bytes_so_far: u64,
        total_for_entry: Option<u64>,
        file_index: usize,
        total_files: Option<usize>,
    );

    /// An entry was fully written
    fn on_file_complete(&self, _name: &str, _size: u64) {}

    /// Files finished and bytes written across the whole call so far
    fn on_totals(&self, _files_done: usize, _bytes_done: u64) {}

    fn on_complete(&self);

    fn on_error(&self, message: &str);
}

/// No-op progress reporter
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_start(&self, _total_bytes: Option<u64>, _total_files: Option<usize>) {}
    fn on_progress(&self, _: &str, _: u64, _: Option<u64>, _: usize, _: Option<usize>) {}
    fn on_complete(&self) {}
    fn on_error(&self, _message: &str) {}
}

/// Cumulative counters for one call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub files: usize,
    pub bytes: u64,
}

/// Enforces the callback contract around an optional reporter
pub struct ProgressTracker {
    reporter: Option<Arc<dyn ProgressReporter>>,
    /// Set by the first event of any kind; `on_start` only fires if it wins
    opened: AtomicBool,
    /// Events are delivered under the read lock and the terminal callback
    /// under the write lock, so no event follows it
    finished: RwLock<bool>,
    totals: Mutex<Totals>,
}

impl ProgressTracker {
    pub fn new(reporter: Option<Arc<dyn ProgressReporter>>) -> Self {
        Self {
            reporter,
            opened: AtomicBool::new(false),
            finished: RwLock::new(false),
            totals: Mutex::new(Totals::default()),
        }
    }

    fn deliver(&self, event: impl FnOnce(&dyn ProgressReporter)) {
        let finished = self.finished.read().unwrap_or_else(|e| e.into_inner());
        if *finished {
            return;
        }
        if let Some(reporter) = self.reporter.as_deref() {
            event(reporter);
        }
    }

    fn finish(&self, event: impl FnOnce(&dyn ProgressReporter)) {
        let mut finished = self.finished.write().unwrap_or_else(|e| e.into_inner());
        if *finished {
            return;
        }
        *finished = true;
        if let Some(reporter) = self.reporter.as_deref() {
            event(reporter);
        }
    }

    pub fn start(&self, total_bytes: Option<u64>, total_files: Option<usize>) {
        if self.opened.swap(true, Ordering::AcqRel) {
            return;
        }
        self.deliver(|reporter| reporter.on_start(total_bytes, total_files));
    }

    pub fn progress(
        &self,
        name: &str,
        bytes_so_far: u64,
        total_for_entry: Option<u64>,
        file_index: usize,
        total_files: Option<usize>,
    ) {
        self.opened.store(true, Ordering::Release);
        self.deliver(|reporter| {
            reporter.on_progress(name, bytes_so_far, total_for_entry, file_index, total_files)
        });
    }

    pub fn file_complete(&self, name: &str, size: u64) {
        self.opened.store(true, Ordering::Release);
        self.deliver(|reporter| reporter.on_file_complete(name, size));
    }

    /// Add to the cumulative counters and report the new totals.
    ///
    /// Updates are applied and delivered one at a time, so a reporter sees
    /// them in increasing order even when workers race.
    pub fn advance(&self, files: usize, bytes: u64) {
        self.opened.store(true, Ordering::Release);
        let finished = self.finished.read().unwrap_or_else(|e| e.into_inner());
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.files += files;
        totals.bytes += bytes;
        if let (false, Some(reporter)) = (*finished, self.reporter.as_deref()) {
            reporter.on_totals(totals.files, totals.bytes);
        }
    }

    pub fn totals(&self) -> Totals {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emit `on_complete` unless a terminal callback already fired
    pub fn complete(&self) {
        self.finish(|reporter| reporter.on_complete());
    }

    /// Emit `on_error` unless a terminal callback already fired
    pub fn error(&self, message: &str) {
        self.finish(|reporter| reporter.on_error(message));
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        // Never leave the reporter without a terminal callback, even on unwind
        self.error("extraction aborted");
    }
}
