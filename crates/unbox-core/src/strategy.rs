//! Extraction strategies and the format dispatch table
//!
//! A strategy turns raw input into something the engine can drive: an opened
//! container, or the decoded payload of a single-file compressor. Whether a
//! container is extracted sequentially or concurrently is a property of the
//! strategy (it owns the worker pool or it doesn't).

use crate::archive::{create_decoder, ArchiveDecoder, ArchiveHandle, ArchiveSource, StreamDecoder};
use crate::config::SecurityPolicy;
use crate::error::SizeLimitKind;
use crate::format::{probe_compound, ArchiveFormat, Codec};
use crate::security::{Breach, LimitedWriter};
use crate::temp::TempFiles;
use crate::{Error, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// What a strategy hands back to the engine
pub enum Prepared {
    /// An opened multi-entry archive
    Container(Box<dyn ArchiveHandle>),
    /// The decoded payload of a single-file compressor
    Decompressed { bytes: Vec<u8>, name: String },
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prepared::Container(_) => f.write_str("Container"),
            Prepared::Decompressed { bytes, name } => f
                .debug_struct("Decompressed")
                .field("name", name)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

/// Extraction capability registered per format
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn prepare(
        &self,
        source: ArchiveSource,
        password: Option<&str>,
        policy: &SecurityPolicy,
    ) -> Result<Prepared>;

    /// Worker pool for concurrent extraction; `None` means sequential
    fn pool(&self) -> Result<Option<Arc<ThreadPool>>> {
        Ok(None)
    }

    /// Release owned resources. Further use fails with `Interrupted`.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens a container for sequential extraction on the caller's thread
pub struct ContainerStrategy {
    decoder: Arc<dyn ArchiveDecoder>,
}

impl ContainerStrategy {
    pub fn new(decoder: Arc<dyn ArchiveDecoder>) -> Self {
        Self { decoder }
    }
}

impl ExtractionStrategy for ContainerStrategy {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn prepare(
        &self,
        source: ArchiveSource,
        password: Option<&str>,
        _policy: &SecurityPolicy,
    ) -> Result<Prepared> {
        debug!(decoder = self.decoder.format_name(), "Opening container");
        Ok(Prepared::Container(self.decoder.open(source, password)?))
    }
}

enum PoolState {
    Idle,
    Running(Arc<ThreadPool>),
    Closed,
}

/// Opens a container for concurrent extraction on an owned worker pool.
///
/// The pool is built on first use, reused across calls, and dropped by
/// [`ExtractionStrategy::close`].
pub struct ConcurrentStrategy {
    decoder: Arc<dyn ArchiveDecoder>,
    threads: usize,
    pool: Mutex<PoolState>,
}

impl ConcurrentStrategy {
    /// `threads == 0` sizes the pool to the hardware parallelism
    pub fn new(decoder: Arc<dyn ArchiveDecoder>, threads: usize) -> Self {
        Self {
            decoder,
            threads,
            pool: Mutex::new(PoolState::Idle),
        }
    }

    fn closed() -> Error {
        Error::Interrupted("strategy closed".to_string())
    }
}

/// Build a named worker pool
pub fn build_pool(threads: usize) -> Result<Arc<ThreadPool>> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("unbox-worker-{}", i))
        .build()
        .map_err(|e| Error::unknown("failed to build worker pool", e))?;
    info!(threads = pool.current_num_threads(), "Started worker pool");
    Ok(Arc::new(pool))
}

impl ExtractionStrategy for ConcurrentStrategy {
    fn name(&self) -> &'static str {
        "concurrent"
    }

    fn prepare(
        &self,
        source: ArchiveSource,
        password: Option<&str>,
        _policy: &SecurityPolicy,
    ) -> Result<Prepared> {
        if matches!(
            *self.pool.lock().map_err(|_| Self::closed())?,
            PoolState::Closed
        ) {
            return Err(Self::closed());
        }
        debug!(decoder = self.decoder.format_name(), "Opening container");
        Ok(Prepared::Container(self.decoder.open(source, password)?))
    }

    fn pool(&self) -> Result<Option<Arc<ThreadPool>>> {
        let mut state = self.pool.lock().map_err(|_| Self::closed())?;
        let pool = match &*state {
            PoolState::Running(pool) => Arc::clone(pool),
            PoolState::Closed => return Err(Self::closed()),
            PoolState::Idle => {
                let pool = build_pool(self.threads)?;
                *state = PoolState::Running(Arc::clone(&pool));
                pool
            }
        };
        Ok(Some(pool))
    }

    fn close(&self) -> Result<()> {
        let mut state = self.pool.lock().map_err(|_| Self::closed())?;
        if matches!(*state, PoolState::Running(_)) {
            debug!("Releasing worker pool");
        }
        // Workers finish their current task once the last Arc is gone
        *state = PoolState::Closed;
        Ok(())
    }
}

/// Decodes a single-file compressor (also the outer layer of a compound format)
pub struct DecompressStrategy {
    decoder: StreamDecoder,
}

impl DecompressStrategy {
    pub fn new(codec: Codec) -> Self {
        Self {
            decoder: StreamDecoder::new(codec),
        }
    }
}

impl ExtractionStrategy for DecompressStrategy {
    fn name(&self) -> &'static str {
        "decompress"
    }

    fn prepare(
        &self,
        source: ArchiveSource,
        password: Option<&str>,
        policy: &SecurityPolicy,
    ) -> Result<Prepared> {
        // The decoded layer is held in memory, so it is bounded while decoding
        let (limit, kind) = layer_limit(self.decoder.codec(), &source, policy);
        let handle = self.decoder.open(source, password)?;
        let name = handle
            .entries()?
            .next()
            .transpose()?
            .map(|entry| entry.path)
            .ok_or_else(|| Error::InvalidFormat("empty stream".to_string()))?;

        let mut sink = LimitedWriter::new(Vec::new(), limit);
        match handle.extract_entry(0, password, &mut sink) {
            Ok(_) => {}
            Err(e) => {
                return Err(match sink.breach() {
                    Some(Breach::PerFile(limit)) => Error::SizeLimitExceeded {
                        kind,
                        limit,
                        path: Some(name),
                    },
                    Some(breach) => breach.into_error(&name),
                    None => e,
                })
            }
        }

        let bytes = sink.into_inner();
        debug!(codec = ?self.decoder.codec(), len = bytes.len(), "Decoded single-file layer");
        Ok(Prepared::Decompressed { bytes, name })
    }
}

/// Ceiling for a decoded single-file layer.
///
/// A layer that opens with a tar header is only a container and answers to
/// the aggregate ceiling. Anything else is the extracted file itself, so the
/// per-file ceiling bounds what gets buffered.
fn layer_limit(
    codec: Codec,
    source: &ArchiveSource,
    policy: &SecurityPolicy,
) -> (Option<u64>, SizeLimitKind) {
    let total = policy.checks.total_size.then_some(policy.max_total_size);
    if probe_compound(codec, source.as_bytes()) {
        return (total, SizeLimitKind::CompoundInput);
    }

    let per_file = policy.checks.file_size.then_some(policy.max_file_size);
    match (per_file, total) {
        (Some(per_file), Some(total)) if total < per_file => (Some(total), SizeLimitKind::Aggregate),
        (None, Some(total)) => (Some(total), SizeLimitKind::Aggregate),
        (per_file, _) => (per_file, SizeLimitKind::PerFile),
    }
}

/// Format to strategy dispatch table
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<ArchiveFormat, Arc<dyn ExtractionStrategy>>,
}

impl StrategyRegistry {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard table: every container format to a container strategy
    /// (one shared pool when `concurrent`), every single-file and compound
    /// format to a decompress strategy for its outer codec.
    pub fn with_defaults(policy: &SecurityPolicy, concurrent: bool) -> Self {
        let temp = TempFiles::new(policy.temp_dir.clone());
        let mut registry = Self::new();
        let shared_pool: Arc<Mutex<Option<Arc<ThreadPool>>>> = Arc::new(Mutex::new(None));

        for format in ArchiveFormat::ALL {
            let strategy: Arc<dyn ExtractionStrategy> = if format.is_container() {
                let Some(decoder) = create_decoder(format, &temp) else {
                    continue;
                };
                if concurrent {
                    Arc::new(LazyPoolStrategy {
                        inner: ConcurrentStrategy::new(decoder, policy.threads),
                        shared: Arc::clone(&shared_pool),
                    })
                } else {
                    Arc::new(ContainerStrategy::new(decoder))
                }
            } else if let Some(codec) = format.codec() {
                Arc::new(DecompressStrategy::new(codec))
            } else {
                continue;
            };
            registry.register(format, strategy);
        }

        registry
    }

    /// Map `format` to `strategy`, returning the one it replaces
    pub fn register(
        &mut self,
        format: ArchiveFormat,
        strategy: Arc<dyn ExtractionStrategy>,
    ) -> Option<Arc<dyn ExtractionStrategy>> {
        debug!(format = %format, strategy = strategy.name(), "Registering strategy");
        self.strategies.insert(format, strategy)
    }

    /// Strategy for `format`, or `UnsupportedFormat`
    pub fn lookup(&self, format: ArchiveFormat) -> Result<Arc<dyn ExtractionStrategy>> {
        self.strategies
            .get(&format)
            .cloned()
            .ok_or(Error::UnsupportedFormat(format))
    }

    /// Unmap `format`; no-op if absent
    pub fn remove(&mut self, format: ArchiveFormat) -> Option<Arc<dyn ExtractionStrategy>> {
        self.strategies.remove(&format)
    }

    /// Registered formats in a stable order
    pub fn formats(&self) -> Vec<ArchiveFormat> {
        self.strategies.keys().copied().collect()
    }

    /// Close every registered strategy, returning the first error
    pub fn close_all(&self) -> Result<()> {
        let mut first = None;
        for strategy in self.strategies.values() {
            if let Err(e) = strategy.close() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Concurrent strategy whose pool is shared with its siblings in a default
/// table, so one registry owns one pool regardless of how many formats it serves
struct LazyPoolStrategy {
    inner: ConcurrentStrategy,
    shared: Arc<Mutex<Option<Arc<ThreadPool>>>>,
}

impl ExtractionStrategy for LazyPoolStrategy {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn prepare(
        &self,
        source: ArchiveSource,
        password: Option<&str>,
        policy: &SecurityPolicy,
    ) -> Result<Prepared> {
        self.inner.prepare(source, password, policy)
    }

    fn pool(&self) -> Result<Option<Arc<ThreadPool>>> {
        let mut state = self.inner.pool.lock().map_err(|_| ConcurrentStrategy::closed())?;
        match &*state {
            PoolState::Running(pool) => return Ok(Some(Arc::clone(pool))),
            PoolState::Closed => return Err(ConcurrentStrategy::closed()),
            PoolState::Idle => {}
        }

        let mut shared = self.shared.lock().map_err(|_| ConcurrentStrategy::closed())?;
        let pool = match &*shared {
            Some(pool) => Arc::clone(pool),
            None => {
                let pool = build_pool(self.inner.threads)?;
                *shared = Some(Arc::clone(&pool));
                pool
            }
        };
        *state = PoolState::Running(Arc::clone(&pool));
        Ok(Some(pool))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()?;
        if let Ok(mut shared) = self.shared.lock() {
            shared.take();
        }
        Ok(())
    }
}
