//! Zip decoder implementation

use super::decoder::{dos_to_unix, ArchiveDecoder, ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind};
use crate::format::{ArchiveFormat, FormatProbe};
use crate::Result;
use std::io::{self, Cursor, Write};
use zip::ZipArchive;

/// Unix `S_IFMT` / `S_IFLNK`
const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Zip decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipDecoder;

impl ZipDecoder {
    /// Create a new zip decoder
    pub fn new() -> Self {
        Self
    }
}

impl ArchiveDecoder for ZipDecoder {
    fn format_name(&self) -> &'static str {
        "zip"
    }

    fn open(&self, source: ArchiveSource, _password: Option<&str>) -> Result<Box<dyn ArchiveHandle>> {
        let archive = ZipArchive::new(source.cursor())?;
        Ok(Box::new(ZipHandle { archive }))
    }
}

/// Recognises zips whose local headers are not at offset zero
/// (self-extracting stubs, prepended junk) by locating the central directory.
impl FormatProbe for ZipDecoder {
    fn probe(&self, input: &[u8]) -> Option<ArchiveFormat> {
        ZipArchive::new(Cursor::new(input))
            .ok()
            .map(|_| ArchiveFormat::Zip)
    }
}

struct ZipHandle {
    archive: ZipArchive<Cursor<ArchiveSource>>,
}

impl ZipHandle {
    fn entry_at(&self, index: usize) -> Result<ArchiveEntry> {
        // ZipArchive clones share the parsed central directory
        let mut archive = self.archive.clone();
        let file = archive.by_index_raw(index)?;

        let is_symlink = file
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK);
        let kind = if file.is_dir() {
            EntryKind::Directory
        } else if is_symlink {
            EntryKind::Symlink
        } else {
            EntryKind::File
        };

        Ok(ArchiveEntry {
            index,
            path: file.name().to_string(),
            size: file.size(),
            modified: file.last_modified().map(|dt| {
                dos_to_unix(dt.year(), dt.month(), dt.day(), dt.hour(), dt.minute(), dt.second())
            }),
            kind,
            encrypted: file.encrypted(),
        })
    }
}

impl ArchiveHandle for ZipHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new((0..self.archive.len()).map(move |i| self.entry_at(i))))
    }

    fn extract_entry(&self, index: usize, password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        let mut archive = self.archive.clone();
        let mut file = match password {
            Some(password) => archive.by_index_decrypt(index, password.as_bytes())?,
            None => archive.by_index(index)?,
        };
        Ok(io::copy(&mut file, sink)?)
    }
}
