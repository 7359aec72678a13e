//! Unbox - a policy-enforcing archive extraction engine
//!
//! This library classifies archive bytes, dispatches them to a registered
//! extraction strategy and extracts entries under a configurable security
//! policy, either sequentially or on a worker pool.

pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod metrics;
pub mod progress;
pub mod security;
pub mod strategy;
pub mod temp;

pub use error::{Error, ErrorKind, Result};

// Re-export commonly used types
pub use archive::{ArchiveEntry, EntryKind};
pub use config::{Config, ConfigStore, FileConfigStore, SecurityPolicy, SharedConfig};
pub use engine::{
    ContentInspector, EntryFailure, EntryKey, ExtractOptions, ExtractedFile, ExtractionOutput,
    Extractor,
};
pub use format::{ArchiveFormat, FormatSniffer};
pub use metrics::{MetricsCollector, MetricsRecorder, MetricsSnapshot};
pub use progress::{NoProgress, ProgressReporter};
pub use strategy::{ExtractionStrategy, StrategyRegistry};
