//! Decoder traits consumed by the extraction engine

use crate::Result;
use serde::Serialize;
use std::io::{Cursor, Write};
use std::sync::Arc;

/// Kind of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Hard links, devices, fifos and other special entries
    Other,
}

/// Entry in an archive as reported by a decoder.
///
/// Every field is untrusted metadata taken from the archive itself.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    /// Position of the entry in archive order
    pub index: usize,
    /// Raw path as stored in the archive
    pub path: String,
    /// Declared uncompressed size in bytes
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub modified: Option<i64>,
    /// Entry kind
    pub kind: EntryKind,
    /// Whether the entry is stored encrypted
    pub encrypted: bool,
}

impl ArchiveEntry {
    /// Whether this is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Whether this is a regular file
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Immutable archive bytes shared between the caller thread and workers
#[derive(Clone)]
pub struct ArchiveSource(Arc<[u8]>);

impl ArchiveSource {
    /// Wrap bytes
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A seekable reader over the shared bytes
    pub fn cursor(&self) -> Cursor<ArchiveSource> {
        Cursor::new(self.clone())
    }
}

impl AsRef<[u8]> for ArchiveSource {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ArchiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSource").field("len", &self.len()).finish()
    }
}

/// Opens archives of one format family
pub trait ArchiveDecoder: Send + Sync {
    /// Get the format name for this decoder
    fn format_name(&self) -> &'static str;

    /// Open the archive. Header-level encryption may already need the password.
    fn open(&self, source: ArchiveSource, password: Option<&str>)
        -> Result<Box<dyn ArchiveHandle>>;
}

/// An opened archive.
///
/// Handles are shared between worker threads, so every method takes `&self`
/// and keeps per-call decoder state local. Dropping a handle releases
/// everything it holds; [`ArchiveHandle::close`] does so eagerly.
pub trait ArchiveHandle: Send + Sync {
    /// Lazily enumerate entries in archive order
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>>;

    /// Stream the decoded bytes of entry `index` into `sink`, returning the
    /// number of bytes written
    fn extract_entry(&self, index: usize, password: Option<&str>, sink: &mut dyn Write)
        -> Result<u64>;

    /// Release decoder resources ahead of drop
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Convert MS-DOS date/time fields into a Unix timestamp (UTC assumed)
pub(crate) fn dos_to_unix(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> i64 {
    let days = days_from_civil(year as i64, month as i64, day as i64);
    days * 86_400 + hour as i64 * 3_600 + minute as i64 * 60 + second as i64
}

// Howard Hinnant's days-from-civil
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
