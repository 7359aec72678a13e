//! Extraction engine
//!
//! [`Extractor`] classifies the input, picks the registered strategy and drives
//! extraction entry by entry. Sequential mode is all-or-nothing: every entry is
//! validated before any byte is decoded, disk writes go to a hidden staging
//! directory that is only committed on success, and the first error aborts
//! the call. Concurrent mode runs one task per entry on the strategy's pool;
//! a failing entry is recorded in [`ExtractionOutput::failures`] while its
//! siblings continue, and a timeout returns whatever was recorded so far.

use crate::archive::{ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind, ZipDecoder};
use crate::config::{ConfigStore, SecurityPolicy, SharedConfig};
use crate::error::{ErrorKind, SecurityViolation};
use crate::format::{ArchiveFormat, FormatSniffer};
use crate::metrics::MetricsRecorder;
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::security::{
    check_entry_count, check_input_size, check_total_size, confine, validate_entry, LimitedWriter,
};
use crate::strategy::{Prepared, StrategyRegistry};
use crate::{Error, Result};
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Identity of an extracted entry. The archive index keeps two entries apart
/// even when their paths normalise to the same string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntryKey {
    pub index: usize,
    /// Normalised relative path, `/`-separated
    pub path: String,
}

/// One extracted file
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedFile {
    /// Normalised relative path, `/`-separated
    pub path: String,
    /// Bytes actually written
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub modified: Option<i64>,
    /// Content, unless the caller wrote to disk without retaining bytes
    #[serde(skip)]
    pub bytes: Option<Vec<u8>>,
    /// Final location on disk when an output directory was given
    pub location: Option<PathBuf>,
    /// blake3 hex digest when the checksum check is on
    pub digest: Option<String>,
}

/// An entry dropped in concurrent mode
#[derive(Debug, Clone, Serialize)]
pub struct EntryFailure {
    pub index: usize,
    /// Raw path as stored in the archive
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one extraction call
#[derive(Debug, Clone)]
pub struct ExtractionOutput {
    pub format: ArchiveFormat,
    pub files: BTreeMap<EntryKey, ExtractedFile>,
    /// Entries that failed in concurrent mode; always empty in sequential mode
    pub failures: Vec<EntryFailure>,
    /// Raw paths of symlinks and special entries that were not extracted
    pub skipped: Vec<String>,
}

impl ExtractionOutput {
    pub fn new(format: ArchiveFormat) -> Self {
        Self {
            format,
            files: BTreeMap::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// True when no entry was dropped
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Look a file up by its normalised path (first match in archive order)
    pub fn get(&self, path: &str) -> Option<&ExtractedFile> {
        self.files
            .iter()
            .find(|(key, _)| key.path == path)
            .map(|(_, file)| file)
    }
}

/// Virus-scan integration point, consulted when `checks.virus_scan` is on
pub trait ContentInspector: Send + Sync {
    /// Return the rejection reason for content that must not be extracted
    fn inspect(&self, path: &str, content: &[u8]) -> std::result::Result<(), String>;
}

/// Per-call options
#[derive(Clone)]
pub struct ExtractOptions {
    pub password: Option<String>,
    /// Write files under this directory as well as returning them
    pub output_dir: Option<PathBuf>,
    pub progress: Option<Arc<dyn ProgressReporter>>,
    /// Skip sniffing and treat the input as this format
    pub format: Option<ArchiveFormat>,
    /// Keep file contents in memory when writing to disk
    pub retain_bytes: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            password: None,
            output_dir: None,
            progress: None,
            format: None,
            retain_bytes: true,
        }
    }
}

impl ExtractOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn format(mut self, format: ArchiveFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn retain_bytes(mut self, retain: bool) -> Self {
        self.retain_bytes = retain;
        self
    }
}

impl std::fmt::Debug for ExtractOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractOptions")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("output_dir", &self.output_dir)
            .field("progress", &self.progress.is_some())
            .field("format", &self.format)
            .field("retain_bytes", &self.retain_bytes)
            .finish()
    }
}

/// Per-call state shared with worker tasks
struct CallContext {
    policy: SecurityPolicy,
    password: Option<String>,
    tracker: ProgressTracker,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    inspector: Option<Arc<dyn ContentInspector>>,
    retain: bool,
    cancel: AtomicBool,
    /// Bytes written so far, checked against the aggregate ceiling
    written: AtomicU64,
    retained: AtomicU64,
    input_len: u64,
}

impl CallContext {
    fn record_memory(&self, extra: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_memory(self.input_len + extra);
        }
    }
}

/// A validated entry ready to extract
#[derive(Debug, Clone)]
struct PlannedEntry {
    entry: ArchiveEntry,
    relative: PathBuf,
    key: EntryKey,
    /// Position among regular files, for progress
    file_index: usize,
}

/// The extraction engine
pub struct Extractor {
    registry: StrategyRegistry,
    config: Arc<dyn ConfigStore>,
    sniffer: FormatSniffer,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    inspector: Option<Arc<dyn ContentInspector>>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(Arc::new(SharedConfig::default()), false)
    }
}

impl Extractor {
    /// Engine with the default dispatch table. `concurrent` selects pooled
    /// extraction for container formats.
    pub fn new(config: Arc<dyn ConfigStore>, concurrent: bool) -> Self {
        let registry = StrategyRegistry::with_defaults(&config.policy(), concurrent);
        Self::with_registry(config, registry)
    }

    /// Engine with a caller-built dispatch table
    pub fn with_registry(config: Arc<dyn ConfigStore>, registry: StrategyRegistry) -> Self {
        Self {
            registry,
            config,
            sniffer: FormatSniffer::new().with_fallback(Box::new(ZipDecoder::new())),
            metrics: None,
            inspector: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ContentInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn with_sniffer(mut self, sniffer: FormatSniffer) -> Self {
        self.sniffer = sniffer;
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut StrategyRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    /// Classify input bytes
    pub fn detect(&self, input: &[u8]) -> ArchiveFormat {
        self.sniffer.sniff(input)
    }

    /// Release every strategy's resources
    pub fn close(&self) -> Result<()> {
        self.registry.close_all()
    }

    /// List entries without extracting anything
    pub fn inspect(
        &self,
        input: &[u8],
        password: Option<&str>,
    ) -> Result<(ArchiveFormat, Vec<ArchiveEntry>)> {
        let policy = self.config.policy();
        check_input_size(input.len() as u64, &policy)?;

        let format = self.classify(input)?;
        let prepared = self
            .registry
            .lookup(format)?
            .prepare(ArchiveSource::new(input), password, &policy)?;

        match self.unwrap_compound(format, prepared, password, &policy)? {
            (format, Prepared::Container(mut handle)) => {
                let entries = handle.entries()?.collect::<Result<Vec<_>>>()?;
                handle.close()?;
                Ok((format, entries))
            }
            (format, Prepared::Decompressed { bytes, name }) => Ok((
                format,
                vec![ArchiveEntry {
                    index: 0,
                    path: name,
                    size: bytes.len() as u64,
                    modified: None,
                    kind: EntryKind::File,
                    encrypted: false,
                }],
            )),
        }
    }

    /// Extract from a reader, refusing input above the configured ceiling
    /// while reading
    pub fn extract_reader<R: Read>(&self, reader: R, options: ExtractOptions) -> Result<ExtractionOutput> {
        let policy = self.config.policy();
        let mut buffer = Vec::new();
        if policy.checks.input_size {
            reader
                .take(policy.max_input_size.saturating_add(1))
                .read_to_end(&mut buffer)?;
        } else {
            let mut reader = reader;
            reader.read_to_end(&mut buffer)?;
        }
        self.extract_source(ArchiveSource::new(buffer), options)
    }

    /// Extract from an in-memory buffer
    pub fn extract(&self, input: &[u8], options: ExtractOptions) -> Result<ExtractionOutput> {
        self.extract_source(ArchiveSource::new(input), options)
    }

    /// Extract from shared bytes without copying them
    pub fn extract_source(&self, source: ArchiveSource, options: ExtractOptions) -> Result<ExtractionOutput> {
        let started = Instant::now();
        let ctx = Arc::new(CallContext {
            // One snapshot for the whole call
            policy: self.config.policy(),
            password: options.password.clone(),
            tracker: ProgressTracker::new(options.progress.clone()),
            metrics: self.metrics.clone(),
            inspector: self.inspector.clone(),
            retain: options.retain_bytes || options.output_dir.is_none(),
            cancel: AtomicBool::new(false),
            written: AtomicU64::new(0),
            retained: AtomicU64::new(0),
            input_len: source.len() as u64,
        });

        let result = self.run(source, &options, &ctx);

        match &result {
            Ok(output) => {
                ctx.tracker.complete();
                if let Some(metrics) = &self.metrics {
                    metrics.record_success();
                }
                info!(
                    format = %output.format,
                    files = output.files.len(),
                    failures = output.failures.len(),
                    bytes = output.total_bytes(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Extraction complete"
                );
            }
            Err(e) => {
                ctx.tracker.error(&e.to_string());
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(e.kind());
                }
                error!(error = %e, "Extraction failed");
            }
        }
        result
    }

    fn classify(&self, input: &[u8]) -> Result<ArchiveFormat> {
        match self.sniffer.sniff(input) {
            ArchiveFormat::Unknown => Err(Error::InvalidFormat(
                "input does not match any supported format".to_string(),
            )),
            format => Ok(format),
        }
    }

    /// One level of compound recursion: a decoded layer that is itself a TAR
    /// is reopened through the TAR strategy; anything else stays opaque.
    fn unwrap_compound(
        &self,
        format: ArchiveFormat,
        prepared: Prepared,
        password: Option<&str>,
        policy: &SecurityPolicy,
    ) -> Result<(ArchiveFormat, Prepared)> {
        let (bytes, name) = match prepared {
            Prepared::Decompressed { bytes, name } => (bytes, name),
            container => return Ok((format, container)),
        };

        let Some(codec) = format.codec() else {
            return Ok((format, Prepared::Decompressed { bytes, name }));
        };

        if self.sniffer.sniff(&bytes) != ArchiveFormat::Tar {
            if format.is_compound() {
                warn!(format = %format, "Decoded layer is not a tar archive, keeping it opaque");
            }
            return Ok((codec.format(), Prepared::Decompressed { bytes, name }));
        }

        let compound = ArchiveFormat::compound_of(codec).unwrap_or(format);
        debug!(outer = %format, detected = %compound, "Decoded layer is a tar archive");
        let tar = self.registry.lookup(ArchiveFormat::Tar)?;
        let inner = tar.prepare(ArchiveSource::new(bytes), password, policy)?;
        match inner {
            Prepared::Container(handle) => Ok((compound, Prepared::Container(handle))),
            // Never recurse a second time
            Prepared::Decompressed { bytes, name } => {
                Ok((codec.format(), Prepared::Decompressed { bytes, name }))
            }
        }
    }

    fn run(
        &self,
        source: ArchiveSource,
        options: &ExtractOptions,
        ctx: &Arc<CallContext>,
    ) -> Result<ExtractionOutput> {
        let policy = &ctx.policy;
        check_input_size(source.len() as u64, policy)?;

        let format = match options.format {
            Some(format) => format,
            None => self.classify(source.as_bytes())?,
        };
        info!(format = %format, len = source.len(), "Extracting");

        let strategy = self.registry.lookup(format)?;
        let password = ctx.password.as_deref();
        let prepared = strategy.prepare(source, password, policy)?;
        if let Prepared::Decompressed { bytes, .. } = &prepared {
            ctx.record_memory(bytes.len() as u64);
        }

        let (format, prepared) = self.unwrap_compound(format, prepared, password, policy)?;
        let output_dir = options.output_dir.as_deref();

        match prepared {
            Prepared::Container(handle) => {
                // Compound payloads run on the TAR strategy's mode
                let driver = if format.is_compound() {
                    self.registry.lookup(ArchiveFormat::Tar)?
                } else {
                    strategy
                };
                match driver.pool()? {
                    Some(pool) => extract_concurrent(format, handle, &pool, ctx, output_dir),
                    None => extract_sequential(format, handle, ctx, output_dir),
                }
            }
            Prepared::Decompressed { bytes, name } => {
                let handle = Box::new(BufferHandle::new(name, bytes));
                extract_sequential(format, handle, ctx, output_dir)
            }
        }
    }
}

/// The decoded payload of a single-file format, presented as one entry
struct BufferHandle {
    entry: ArchiveEntry,
    bytes: Vec<u8>,
}

impl BufferHandle {
    fn new(name: String, bytes: Vec<u8>) -> Self {
        Self {
            entry: ArchiveEntry {
                index: 0,
                path: name,
                size: bytes.len() as u64,
                modified: None,
                kind: EntryKind::File,
                encrypted: false,
            },
            bytes,
        }
    }
}

impl ArchiveHandle for BufferHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new(std::iter::once(Ok(self.entry.clone()))))
    }

    fn extract_entry(&self, index: usize, _password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        if index != 0 {
            return Err(Error::InvalidFormat(format!("no entry at index {}", index)));
        }
        for chunk in self.bytes.chunks(64 * 1024) {
            sink.write_all(chunk)?;
        }
        Ok(self.bytes.len() as u64)
    }
}

/// Enumerate every entry, stopping as soon as the file count is exceeded
fn collect_entries(handle: &dyn ArchiveHandle, policy: &SecurityPolicy) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    let mut files = 0usize;
    for entry in handle.entries()? {
        let entry = entry?;
        if !entry.is_dir() {
            files += 1;
            check_entry_count(files, policy)?;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Split entries into extractable ones and skipped links/special files
fn partition(entries: Vec<ArchiveEntry>, skipped: &mut Vec<String>) -> Vec<ArchiveEntry> {
    entries
        .into_iter()
        .filter(|entry| match entry.kind {
            EntryKind::Symlink | EntryKind::Other => {
                warn!(path = ?entry.path, kind = ?entry.kind, "Skipping link or special entry");
                skipped.push(entry.path.clone());
                false
            }
            EntryKind::File | EntryKind::Directory => true,
        })
        .collect()
}

fn key_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn plan_entry(entry: ArchiveEntry, file_index: usize, policy: &SecurityPolicy) -> Result<PlannedEntry> {
    let relative = validate_entry(&entry, policy)?;
    let key = EntryKey {
        index: entry.index,
        path: key_path(&relative),
    };
    Ok(PlannedEntry {
        entry,
        relative,
        key,
        file_index,
    })
}

fn totals<'a>(entries: impl IntoIterator<Item = &'a ArchiveEntry>) -> (u64, usize) {
    entries
        .into_iter()
        .filter(|e| e.is_file())
        .fold((0, 0), |(bytes, files), e| (bytes.saturating_add(e.size), files + 1))
}

/// Reports progress while bytes flow into an entry's destinations
struct EntrySink<'a> {
    file: Option<BufWriter<File>>,
    buffer: Option<Vec<u8>>,
    hasher: Option<blake3::Hasher>,
    ctx: &'a CallContext,
    planned: &'a PlannedEntry,
    total_files: usize,
    written: u64,
    reported: u64,
    step: u64,
}

impl EntrySink<'_> {
    fn report(&mut self) {
        let delta = self.written - self.reported;
        self.reported = self.written;
        self.ctx.tracker.advance(0, delta);
        self.ctx.tracker.progress(
            &self.planned.key.path,
            self.written,
            Some(self.planned.entry.size),
            self.planned.file_index,
            Some(self.total_files),
        );
    }
}

impl Write for EntrySink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.extend_from_slice(buf);
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(buf);
        }
        self.written += buf.len() as u64;
        if self.written - self.reported >= self.step {
            self.report();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Core of one entry, after validation: decode under the ceilings into memory
/// and/or `dest_root`, then run the content checks
fn extract_file(
    handle: &dyn ArchiveHandle,
    planned: &PlannedEntry,
    ctx: &CallContext,
    dest_root: Option<&Path>,
    total_files: usize,
) -> Result<ExtractedFile> {
    let policy = &ctx.policy;
    let raw_path = planned.entry.path.as_str();
    let inspect = policy.checks.virus_scan && ctx.inspector.is_some();

    let target = match dest_root {
        Some(root) => {
            let target = confine(root, &planned.relative)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            Some(target)
        }
        None => None,
    };

    let sink = EntrySink {
        file: match &target {
            Some(path) => Some(BufWriter::with_capacity(policy.buffer_size.max(1), File::create(path)?)),
            None => None,
        },
        buffer: (ctx.retain || inspect).then(Vec::new),
        hasher: policy.checks.checksum.then(blake3::Hasher::new),
        ctx,
        planned,
        total_files,
        written: 0,
        reported: 0,
        step: policy.buffer_size.max(1) as u64,
    };

    let per_file = policy.checks.file_size.then_some(policy.max_file_size);
    let mut writer = LimitedWriter::new(sink, per_file).with_cancel(&ctx.cancel);
    if policy.checks.total_size {
        writer = writer.with_aggregate(&ctx.written, policy.max_total_size);
    }

    debug!(path = ?raw_path, index = planned.entry.index, "Extracting entry");
    let outcome = handle
        .extract_entry(planned.entry.index, ctx.password.as_deref(), &mut writer)
        .and_then(|_| writer.flush().map_err(Error::from));

    if let Err(e) = outcome {
        let err = match writer.breach() {
            Some(breach) => breach.into_error(raw_path),
            None => e,
        };
        drop(writer);
        if let Some(path) = &target {
            let _ = fs::remove_file(path);
        }
        return Err(err);
    }

    let written = writer.written();
    let mut sink = writer.into_inner();
    if sink.written != sink.reported || sink.written == 0 {
        sink.report();
    }
    let EntrySink {
        file,
        buffer,
        hasher,
        ..
    } = sink;
    if let Some(file) = file {
        file.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    }

    if inspect {
        if let (Some(inspector), Some(content)) = (&ctx.inspector, buffer.as_deref()) {
            if let Err(reason) = inspector.inspect(&planned.key.path, content) {
                error!(path = ?raw_path, reason = %reason, "Content rejected");
                if let Some(path) = &target {
                    let _ = fs::remove_file(path);
                }
                return Err(Error::SecurityViolation(SecurityViolation::ContentRejected {
                    path: raw_path.to_string(),
                    reason,
                }));
            }
        }
    }

    if let (Some(path), Some(mtime)) = (&target, planned.entry.modified) {
        filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime, 0))?;
    }

    let bytes = if ctx.retain { buffer } else { None };
    if bytes.is_some() {
        let retained = ctx.retained.fetch_add(written, Ordering::Relaxed) + written;
        ctx.record_memory(retained);
    }
    if let Some(metrics) = &ctx.metrics {
        metrics.record_bytes(written);
        metrics.record_file();
    }
    ctx.tracker.advance(1, 0);
    ctx.tracker.file_complete(&planned.key.path, written);

    Ok(ExtractedFile {
        path: planned.key.path.clone(),
        size: written,
        modified: planned.entry.modified,
        bytes,
        location: target,
        digest: hasher.map(|h| h.finalize().to_hex().to_string()),
    })
}

/// Hidden directory under the output root that receives all writes until
/// the call succeeds
struct Staging {
    root: PathBuf,
    dir: tempfile::TempDir,
}

impl Staging {
    fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(".unbox-staging-")
            .tempdir_in(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Move staged entries into place
    fn commit(self, dirs: &[PathBuf], files: &mut BTreeMap<EntryKey, ExtractedFile>) -> Result<()> {
        for dir in dirs {
            fs::create_dir_all(confine(&self.root, dir)?)?;
        }

        for file in files.values_mut() {
            let relative = PathBuf::from(&file.path);
            let staged = self.dir.path().join(&relative);
            let dest = confine(&self.root, &relative)?;

            // Several entries may share one path; the last one written wins
            if staged.exists() {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                if dest.is_file() {
                    fs::remove_file(&dest)?;
                }
                fs::rename(&staged, &dest)?;
            }
            file.location = Some(dest);
        }

        debug!(root = ?self.root, files = files.len(), "Committed staged files");
        self.dir.close()?;
        Ok(())
    }
}

/// All-or-nothing extraction on the caller's thread
fn extract_sequential(
    format: ArchiveFormat,
    mut handle: Box<dyn ArchiveHandle>,
    ctx: &Arc<CallContext>,
    output_dir: Option<&Path>,
) -> Result<ExtractionOutput> {
    let policy = &ctx.policy;
    let mut output = ExtractionOutput::new(format);

    let entries = partition(collect_entries(handle.as_ref(), policy)?, &mut output.skipped);

    // Nothing is decoded until every entry has passed the metadata checks
    let mut plan = Vec::with_capacity(entries.len());
    let mut file_index = 0;
    for entry in entries {
        let is_file = entry.is_file();
        plan.push(plan_entry(entry, file_index, policy)?);
        if is_file {
            file_index += 1;
        }
    }

    let (total_bytes, total_files) = totals(plan.iter().map(|p| &p.entry));
    // Declared sizes can lie; the writer enforces the same ceiling on real bytes
    check_total_size(total_bytes, policy)?;
    ctx.tracker.start(Some(total_bytes), Some(total_files));

    let staging = output_dir.map(Staging::new).transpose()?;
    let mut dirs = Vec::new();

    for planned in &plan {
        if planned.entry.is_dir() {
            if !planned.relative.as_os_str().is_empty() {
                if let Some(staging) = &staging {
                    fs::create_dir_all(confine(staging.path(), &planned.relative)?)?;
                }
                dirs.push(planned.relative.clone());
            }
            continue;
        }

        let file = extract_file(
            handle.as_ref(),
            planned,
            ctx,
            staging.as_ref().map(|s| s.path()),
            total_files,
        )?;
        output.files.insert(planned.key.clone(), file);
    }

    if let Some(staging) = staging {
        staging.commit(&dirs, &mut output.files)?;
    }

    handle.close()?;
    Ok(output)
}

/// Results shared between worker tasks and the waiting caller
#[derive(Default)]
struct SharedResults {
    files: BTreeMap<EntryKey, ExtractedFile>,
    failures: Vec<EntryFailure>,
}

/// One task per entry on `pool`, bounded by the policy timeout
fn extract_concurrent(
    format: ArchiveFormat,
    handle: Box<dyn ArchiveHandle>,
    pool: &rayon::ThreadPool,
    ctx: &Arc<CallContext>,
    output_dir: Option<&Path>,
) -> Result<ExtractionOutput> {
    let policy = &ctx.policy;
    let mut skipped = Vec::new();
    let entries = partition(collect_entries(handle.as_ref(), policy)?, &mut skipped);
    let (total_bytes, total_files) = totals(&entries);

    if let Some(dir) = output_dir {
        fs::create_dir_all(dir)?;
    }
    let output_dir: Option<Arc<Path>> = output_dir.map(Arc::from);

    ctx.tracker.start(Some(total_bytes), Some(total_files));

    let handle: Arc<dyn ArchiveHandle> = Arc::from(handle);
    let results = Arc::new(Mutex::new(SharedResults::default()));
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();

    let mut file_index = 0;
    let task_count = entries.len();
    for entry in entries {
        let index = file_index;
        if entry.is_file() {
            file_index += 1;
        }

        let handle = Arc::clone(&handle);
        let results = Arc::clone(&results);
        let ctx = Arc::clone(ctx);
        let output_dir = output_dir.clone();
        let done_tx = done_tx.clone();

        pool.spawn(move || {
            if let Some(metrics) = &ctx.metrics {
                metrics.task_started();
            }
            let raw_path = entry.path.clone();
            let entry_index = entry.index;

            let outcome = if ctx.cancel.load(Ordering::Acquire) {
                Err(Error::Interrupted("extraction cancelled".to_string()))
            } else {
                run_task(handle.as_ref(), entry, index, &ctx, output_dir.as_deref(), total_files)
            };

            {
                let mut shared = results.lock().unwrap_or_else(|e| e.into_inner());
                // After a timeout the caller owns the snapshot; late results are dropped
                if !ctx.cancel.load(Ordering::Acquire) {
                    match outcome {
                        Ok(Some((key, file))) => {
                            shared.files.insert(key, file);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(path = ?raw_path, error = %e, "Dropping entry");
                            if let Some(metrics) = &ctx.metrics {
                                metrics.record_error(e.kind());
                            }
                            shared.failures.push(EntryFailure {
                                index: entry_index,
                                path: raw_path,
                                kind: e.kind(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }

            if let Some(metrics) = &ctx.metrics {
                metrics.task_finished();
            }
            // Release the handle before signalling so the caller can close it
            drop(handle);
            let _ = done_tx.send(());
        });
    }
    drop(done_tx);

    // A timeout too large to represent as an instant means no deadline
    let deadline = Instant::now().checked_add(policy.timeout);
    let mut finished = 0;
    while finished < task_count {
        let received = match deadline {
            Some(deadline) => done_rx.recv_deadline(deadline),
            None => done_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(()) => finished += 1,
            Err(RecvTimeoutError::Timeout) => {
                ctx.cancel.store(true, Ordering::Release);
                let shared = results.lock().unwrap_or_else(|e| e.into_inner());
                warn!(
                    finished,
                    total = task_count,
                    timeout = ?policy.timeout,
                    "Concurrent extraction timed out"
                );
                let mut partial = ExtractionOutput::new(format);
                partial.files = shared.files.clone();
                partial.failures = shared.failures.clone();
                partial.skipped = skipped;
                return Err(Error::Timeout {
                    timeout: policy.timeout,
                    partial: Box::new(partial),
                });
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let shared = std::mem::take(&mut *results.lock().unwrap_or_else(|e| e.into_inner()));
    let mut failures = shared.failures;
    failures.sort_by_key(|f| f.index);

    let mut handle = handle;
    match Arc::get_mut(&mut handle) {
        Some(handle) => handle.close()?,
        None => warn!("Archive handle still shared after all tasks finished, releasing on drop"),
    }

    Ok(ExtractionOutput {
        format,
        files: shared.files,
        failures,
        skipped,
    })
}

/// Validate and extract one entry inside a worker task. Directories yield `None`.
fn run_task(
    handle: &dyn ArchiveHandle,
    entry: ArchiveEntry,
    file_index: usize,
    ctx: &CallContext,
    output_dir: Option<&Path>,
    total_files: usize,
) -> Result<Option<(EntryKey, ExtractedFile)>> {
    let planned = plan_entry(entry, file_index, &ctx.policy)?;

    if planned.entry.is_dir() {
        if let (Some(root), false) = (output_dir, planned.relative.as_os_str().is_empty()) {
            fs::create_dir_all(confine(root, &planned.relative)?)?;
        }
        return Ok(None);
    }

    let file = extract_file(handle, &planned, ctx, output_dir, total_files)?;
    Ok(Some((planned.key, file)))
}
