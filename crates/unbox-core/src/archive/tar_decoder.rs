//! Tar decoder implementation

use super::decoder::{ArchiveDecoder, ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind};
use crate::{Error, Result};
use std::io::{Cursor, Write};
use tar::{Archive, EntryType};
use tracing::debug;

/// Tar decoder.
///
/// Tar has no central directory, so opening walks the headers once and keeps
/// the offset of every entry's data; extraction then slices the shared buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarDecoder;

impl TarDecoder {
    /// Create a new tar decoder
    pub fn new() -> Self {
        Self
    }
}

struct TarRecord {
    entry: ArchiveEntry,
    offset: u64,
    /// Bytes stored in the archive for this entry
    stored: u64,
}

impl ArchiveDecoder for TarDecoder {
    fn format_name(&self) -> &'static str {
        "tar"
    }

    fn open(&self, source: ArchiveSource, _password: Option<&str>) -> Result<Box<dyn ArchiveHandle>> {
        let records = index_tar(source.as_bytes())?;
        debug!(entries = records.len(), "Indexed tar archive");
        Ok(Box::new(TarHandle { source, records }))
    }
}

fn invalid(err: std::io::Error) -> Error {
    Error::InvalidFormat(format!("tar: {}", err))
}

fn index_tar(bytes: &[u8]) -> Result<Vec<TarRecord>> {
    let mut archive = Archive::new(Cursor::new(bytes));
    let mut records = Vec::new();

    for (index, entry) in archive.entries().map_err(invalid)?.enumerate() {
        let entry = entry.map_err(invalid)?;
        let header = entry.header();

        let kind = match header.entry_type() {
            EntryType::Regular | EntryType::Continuous => EntryKind::File,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink,
            _ => EntryKind::Other,
        };

        // `path_bytes` already folds in GNU long names and PAX paths
        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let stored = entry.size();

        records.push(TarRecord {
            entry: ArchiveEntry {
                index,
                path,
                size: stored,
                modified: header.mtime().ok().map(|t| t as i64),
                kind,
                encrypted: false,
            },
            offset: entry.raw_file_position(),
            stored,
        });
    }

    Ok(records)
}

struct TarHandle {
    source: ArchiveSource,
    records: Vec<TarRecord>,
}

impl ArchiveHandle for TarHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new(self.records.iter().map(|r| Ok(r.entry.clone()))))
    }

    fn extract_entry(&self, index: usize, _password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        let record = self
            .records
            .get(index)
            .ok_or_else(|| Error::InvalidFormat(format!("tar: no entry at index {}", index)))?;

        let start = record.offset as usize;
        let end = start
            .checked_add(record.stored as usize)
            .filter(|end| *end <= self.source.len())
            .ok_or_else(|| Error::InvalidFormat(format!("tar: truncated entry {:?}", record.entry.path)))?;

        let data = &self.source.as_bytes()[start..end];
        let mut written = 0u64;
        // Chunked so a size ceiling on the sink trips before the whole entry is copied
        for chunk in data.chunks(64 * 1024) {
            sink.write_all(chunk)?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_index_and_extract() {
        let bytes = build_tar(&[("one.txt", b"first"), ("nested/two.txt", b"second!")]);
        let handle = TarDecoder::new().open(ArchiveSource::new(bytes), None).unwrap();

        let entries: Vec<_> = handle.entries().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].path, "nested/two.txt");
        assert_eq!(entries[1].size, 7);
        assert_eq!(entries[0].modified, Some(1_700_000_000));

        let mut out = Vec::new();
        assert_eq!(handle.extract_entry(1, None, &mut out).unwrap(), 7);
        assert_eq!(out, b"second!");
    }

    #[test]
    fn test_long_names_survive() {
        let long = format!("{}/file.txt", "d".repeat(150));
        let bytes = build_tar(&[(long.as_str(), b"x")]);
        let handle = TarDecoder::new().open(ArchiveSource::new(bytes), None).unwrap();
        let entry = handle.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path, long);
    }

    #[test]
    fn test_missing_index() {
        let bytes = build_tar(&[("a", b"a")]);
        let handle = TarDecoder::new().open(ArchiveSource::new(bytes), None).unwrap();
        assert!(handle.extract_entry(5, None, &mut Vec::new()).is_err());
    }
}
