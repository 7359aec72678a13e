//! Security checks for archive extraction
//!
//! Every check is a pure function of a value and the [`SecurityPolicy`] and
//! honours that check's toggle. Per-entry size enforcement happens while
//! bytes are written, through [`LimitedWriter`], since declared sizes come
//! from the archive and cannot be trusted.

use crate::archive::ArchiveEntry;
use crate::config::SecurityPolicy;
use crate::error::{SecurityViolation, SizeLimitKind};
use crate::{Error, Result};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{error, warn};

/// Resolve a raw entry path into a relative path under the extraction root.
///
/// Backslashes count as separators, `.` segments are dropped and `..` pops the
/// previous segment. Absolute, drive-prefixed and UNC paths, NUL bytes, and any
/// `..` that would climb above the root are rejected. The result may be empty
/// when the entry names the root itself (e.g. `./`).
pub fn resolve_entry_path(raw: &str) -> Result<PathBuf> {
    if raw.contains('\0') {
        error!(path = ?raw, "Path contains NUL byte");
        return Err(Error::path_traversal(raw));
    }

    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        error!(path = ?raw, "Path is absolute");
        return Err(Error::path_traversal(raw));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    error!(path = ?raw, "Path escapes extraction root");
                    return Err(Error::path_traversal(raw));
                }
            }
            name => segments.push(name),
        }
    }

    Ok(segments.iter().collect())
}

/// Like [`resolve_entry_path`] but never fails: hostile segments are dropped
/// instead. Used when the traversal check is switched off so that disk writes
/// stay inside the root regardless.
pub fn flatten_entry_path(raw: &str) -> PathBuf {
    let normalized = raw.replace(['\\', '\0'], "/");
    let mut segments: Vec<&str> = Vec::new();
    for (i, segment) in normalized.split('/').enumerate() {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name if i == 0 && is_drive(name) => {}
            name => segments.push(name),
        }
    }
    segments.iter().collect()
}

fn is_drive(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Join a resolved relative path onto `root` for writing.
///
/// Re-verifies against the canonical root, including through directories that
/// already exist on disk, so a symlink planted earlier cannot redirect writes.
pub fn confine(root: &Path, relative: &Path) -> Result<PathBuf> {
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        error!(path = ?relative, "Relative path has non-normal components");
        return Err(Error::path_traversal(relative.to_string_lossy()));
    }

    let canonical_root = root.canonicalize()?;
    let target = canonical_root.join(relative);

    // Deepest ancestor that already exists decides where the write really lands
    let mut existing = target.as_path();
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    let resolved = existing.canonicalize()?;
    if !resolved.starts_with(&canonical_root) {
        error!(root = ?canonical_root, path = ?relative, resolved = ?resolved, "Path escapes base directory");
        return Err(Error::path_traversal(relative.to_string_lossy()));
    }

    Ok(target)
}

/// Lower-cased suffix after the final `.` of the file name, `""` if none
pub fn extension_of(path: &str) -> String {
    let name = path
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("");
    match name.rfind('.') {
        Some(pos) => name[pos + 1..].to_lowercase(),
        None => String::new(),
    }
}

/// Reject files whose extension is not allow-listed
pub fn check_extension(path: &str, policy: &SecurityPolicy) -> Result<()> {
    if !policy.checks.extension {
        return Ok(());
    }

    let extension = extension_of(path);
    if policy.allowed_extensions.contains(&extension) {
        return Ok(());
    }

    warn!(path = ?path, extension = %extension, "File type not allowed");
    Err(Error::SecurityViolation(
        SecurityViolation::DisallowedFileType {
            path: path.to_string(),
            extension,
        },
    ))
}

/// Reject archives holding more files than the policy allows
pub fn check_entry_count(count: usize, policy: &SecurityPolicy) -> Result<()> {
    if policy.checks.file_count && count > policy.max_file_count {
        error!(count, limit = policy.max_file_count, "Too many entries");
        return Err(Error::CountLimitExceeded {
            count,
            limit: policy.max_file_count,
        });
    }
    Ok(())
}

/// Reject raw input above the ceiling before any decoding
pub fn check_input_size(len: u64, policy: &SecurityPolicy) -> Result<()> {
    if policy.checks.input_size && len > policy.max_input_size {
        error!(len, limit = policy.max_input_size, "Input exceeds size limit");
        return Err(Error::SizeLimitExceeded {
            kind: SizeLimitKind::Input,
            limit: policy.max_input_size,
            path: None,
        });
    }
    Ok(())
}

/// Reject once the bytes written in one call exceed the aggregate ceiling
pub fn check_total_size(total: u64, policy: &SecurityPolicy) -> Result<()> {
    if policy.checks.total_size && total > policy.max_total_size {
        error!(total, limit = policy.max_total_size, "Extraction exceeds aggregate size limit");
        return Err(Error::SizeLimitExceeded {
            kind: SizeLimitKind::Aggregate,
            limit: policy.max_total_size,
            path: None,
        });
    }
    Ok(())
}

/// Run the metadata checks for one entry and return its relative output path
pub fn validate_entry(entry: &ArchiveEntry, policy: &SecurityPolicy) -> Result<PathBuf> {
    let relative = if policy.checks.path_traversal {
        resolve_entry_path(&entry.path)?
    } else {
        flatten_entry_path(&entry.path)
    };

    if !entry.is_dir() {
        if relative.as_os_str().is_empty() {
            error!(path = ?entry.path, "File entry resolves to the extraction root");
            return Err(Error::path_traversal(&entry.path));
        }
        check_extension(&entry.path, policy)?;
    }

    Ok(relative)
}

/// Which ceiling stopped a [`LimitedWriter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    PerFile(u64),
    Aggregate(u64),
    Cancelled,
}

impl Breach {
    /// The engine-level error for this breach
    pub fn into_error(self, path: &str) -> Error {
        match self {
            Breach::PerFile(limit) => Error::SizeLimitExceeded {
                kind: SizeLimitKind::PerFile,
                limit,
                path: Some(path.to_string()),
            },
            Breach::Aggregate(limit) => Error::SizeLimitExceeded {
                kind: SizeLimitKind::Aggregate,
                limit,
                path: Some(path.to_string()),
            },
            Breach::Cancelled => Error::Interrupted(format!("extraction of {:?} cancelled", path)),
        }
    }

    fn io_error(self) -> io::Error {
        match self {
            Breach::PerFile(limit) => io::Error::other(format!("per-file limit of {} bytes exceeded", limit)),
            Breach::Aggregate(limit) => io::Error::other(format!("aggregate limit of {} bytes exceeded", limit)),
            // Not `Interrupted`: `io::copy` would retry it
            Breach::Cancelled => io::Error::other("extraction cancelled"),
        }
    }
}

/// Writer that counts the bytes actually written and refuses the first write
/// that would cross a ceiling.
///
/// The breach is remembered on the writer, so callers can report it precisely
/// even when a decoder wraps or replaces the returned I/O error.
pub struct LimitedWriter<'a, W> {
    inner: W,
    written: u64,
    per_file: Option<u64>,
    aggregate: Option<(&'a AtomicU64, u64)>,
    cancel: Option<&'a AtomicBool>,
    breach: Option<Breach>,
}

impl<'a, W: Write> LimitedWriter<'a, W> {
    /// Wrap `inner`, allowing at most `per_file` bytes when set
    pub fn new(inner: W, per_file: Option<u64>) -> Self {
        Self {
            inner,
            written: 0,
            per_file,
            aggregate: None,
            cancel: None,
            breach: None,
        }
    }

    /// Also count into a counter shared across entries
    pub fn with_aggregate(mut self, counter: &'a AtomicU64, limit: u64) -> Self {
        self.aggregate = Some((counter, limit));
        self
    }

    /// Stop at the next write once `flag` is raised
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Bytes accepted so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn breach(&self) -> Option<Breach> {
        self.breach
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn refuse(&mut self, breach: Breach) -> io::Error {
        self.breach = Some(breach);
        breach.io_error()
    }
}

impl<W: Write> Write for LimitedWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(breach) = self.breach {
            return Err(breach.io_error());
        }
        if self.cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return Err(self.refuse(Breach::Cancelled));
        }

        let len = buf.len() as u64;
        if let Some(limit) = self.per_file {
            if self.written.saturating_add(len) > limit {
                warn!(limit, written = self.written, "Per-file size limit reached mid-stream");
                return Err(self.refuse(Breach::PerFile(limit)));
            }
        }

        if let Some((counter, limit)) = self.aggregate {
            let before = counter.fetch_add(len, Ordering::AcqRel);
            if before.saturating_add(len) > limit {
                counter.fetch_sub(len, Ordering::AcqRel);
                warn!(limit, total = before, "Aggregate size limit reached mid-stream");
                return Err(self.refuse(Breach::Aggregate(limit)));
            }
        }

        let n = match self.inner.write(buf) {
            Ok(n) => n,
            Err(e) => {
                if let Some((counter, _)) = self.aggregate {
                    counter.fetch_sub(len, Ordering::AcqRel);
                }
                return Err(e);
            }
        };
        if let Some((counter, _)) = self.aggregate {
            counter.fetch_sub(len - n as u64, Ordering::AcqRel);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
