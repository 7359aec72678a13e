//! 7z decoder implementation

use super::decoder::{ArchiveDecoder, ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind};
use crate::{Error, Result};
use sevenz_rust::{Password, SevenZArchiveEntry, SevenZReader};
use std::io::{self, Cursor, Write};
use tracing::debug;

/// 7z decoder.
///
/// `sevenz-rust` only streams entries front to back (solid blocks force it),
/// so each extraction reopens the shared buffer and walks until it reaches
/// the requested entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct SevenZDecoder;

impl SevenZDecoder {
    /// Create a new 7z decoder
    pub fn new() -> Self {
        Self
    }
}

fn password_of(password: Option<&str>) -> Password {
    password.map(Password::from).unwrap_or_else(Password::empty)
}

fn open_reader(source: &ArchiveSource, password: Option<&str>) -> Result<SevenZReader<Cursor<ArchiveSource>>> {
    Ok(SevenZReader::new(
        source.cursor(),
        source.len() as u64,
        password_of(password),
    )?)
}

/// Identity of an entry that survives reopening the archive
#[derive(Debug, Clone)]
struct Slot {
    name: String,
    /// Position among same-named entries in decode order
    ordinal: usize,
}

impl ArchiveDecoder for SevenZDecoder {
    fn format_name(&self) -> &'static str {
        "7z"
    }

    fn open(&self, source: ArchiveSource, password: Option<&str>) -> Result<Box<dyn ArchiveHandle>> {
        let reader = open_reader(&source, password)?;
        let files = &reader.archive().files;

        let entries: Vec<ArchiveEntry> = files
            .iter()
            .enumerate()
            .map(|(index, file)| ArchiveEntry {
                index,
                path: file.name.clone(),
                size: file.size,
                modified: None,
                kind: if file.is_directory {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                encrypted: false,
            })
            .collect();
        let slots = decode_order_slots(files);

        debug!(entries = entries.len(), "Opened 7z archive");
        Ok(Box::new(SevenZHandle {
            source,
            entries,
            slots,
        }))
    }
}

/// Entries with data are decoded block by block in index order; empty files
/// and directories come afterwards. Ordinals follow that order.
fn decode_order_slots(files: &[SevenZArchiveEntry]) -> Vec<Slot> {
    let rank = |i: usize| (!files[i].has_stream, i);
    (0..files.len())
        .map(|i| Slot {
            name: files[i].name.clone(),
            ordinal: (0..files.len())
                .filter(|&j| files[j].name == files[i].name && rank(j) < rank(i))
                .count(),
        })
        .collect()
}

struct SevenZHandle {
    source: ArchiveSource,
    entries: Vec<ArchiveEntry>,
    slots: Vec<Slot>,
}

impl ArchiveHandle for SevenZHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new(self.entries.iter().cloned().map(Ok)))
    }

    fn extract_entry(&self, index: usize, password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| Error::InvalidFormat(format!("7z: no entry at index {}", index)))?;

        let mut reader = open_reader(&self.source, password)?;
        let mut seen = 0usize;
        let mut written = None;
        let mut sink_error = None;

        let walk = reader.for_each_entries(|entry, data| {
            if entry.name != slot.name {
                return Ok(true);
            }
            if seen < slot.ordinal {
                seen += 1;
                return Ok(true);
            }
            match io::copy(&mut *data, &mut *sink) {
                Ok(n) => written = Some(n),
                // Keep the sink's own error so ceilings surface unchanged
                Err(e) => sink_error = Some(e),
            }
            Ok(false)
        });

        if let Some(e) = sink_error {
            return Err(Error::Io(e));
        }
        walk?;
        written.ok_or_else(|| Error::InvalidFormat(format!("7z: entry {:?} not found", slot.name)))
    }
}
