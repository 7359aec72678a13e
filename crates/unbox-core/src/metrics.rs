//! Operational metrics
//!
//! The engine only needs the narrow [`MetricsRecorder`] capability; storage and
//! persistence belong to whoever implements it. [`MetricsCollector`] is the
//! in-process implementation: lock-free counters and high-water-mark gauges.

use crate::error::ErrorKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Record-only view of a metrics sink
pub trait MetricsRecorder: Send + Sync {
    /// Bytes written for extracted entries
    fn record_bytes(&self, bytes: u64);

    /// One entry extracted
    fn record_file(&self);

    /// One call finished successfully
    fn record_success(&self);

    fn record_error(&self, kind: ErrorKind);

    /// A worker task began; feeds the max-concurrency gauge
    fn task_started(&self);

    fn task_finished(&self);

    /// Bytes currently held in memory by one call; feeds the peak gauge
    fn record_memory(&self, bytes: u64);
}

/// Immutable copy of the collector state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub bytes: u64,
    pub files: u64,
    pub successes: u64,
    pub errors: BTreeMap<ErrorKind, u64>,
    pub peak_memory: u64,
    pub max_concurrent_tasks: usize,
}

impl MetricsSnapshot {
    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }
}

/// Atomic counters and gauges
#[derive(Debug)]
pub struct MetricsCollector {
    bytes: AtomicU64,
    files: AtomicU64,
    successes: AtomicU64,
    errors: [AtomicU64; ErrorKind::ALL.len()],
    peak_memory: AtomicU64,
    active_tasks: AtomicUsize,
    max_concurrent_tasks: AtomicUsize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            files: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            peak_memory: AtomicU64::new(0),
            active_tasks: AtomicUsize::new(0),
            max_concurrent_tasks: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = ErrorKind::ALL
            .iter()
            .filter_map(|kind| {
                let count = self.errors[kind.ordinal()].load(Ordering::Relaxed);
                (count > 0).then_some((*kind, count))
            })
            .collect();

        MetricsSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors,
            peak_memory: self.peak_memory.load(Ordering::Relaxed),
            max_concurrent_tasks: self.max_concurrent_tasks.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter and gauge. Tasks still running keep counting as active.
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.files.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        for counter in &self.errors {
            counter.store(0, Ordering::Relaxed);
        }
        self.peak_memory.store(0, Ordering::Relaxed);
        self.max_concurrent_tasks
            .store(self.active_tasks.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl MetricsRecorder for MetricsCollector {
    fn record_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_file(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, kind: ErrorKind) {
        self.errors[kind.ordinal()].fetch_add(1, Ordering::Relaxed);
    }

    fn task_started(&self) {
        let active = self.active_tasks.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_concurrent_tasks.fetch_max(active, Ordering::AcqRel);
    }

    fn task_finished(&self) {
        // Saturate so a stray call cannot wrap the gauge
        let _ = self
            .active_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn record_memory(&self, bytes: u64) {
        self.peak_memory.fetch_max(bytes, Ordering::Relaxed);
    }
}
