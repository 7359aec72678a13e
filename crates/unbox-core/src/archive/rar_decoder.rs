//! RAR decoder implementation (feature `rar`)

use super::decoder::{ArchiveDecoder, ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind};
use crate::temp::{TempFile, TempFiles};
use crate::{Error, Result};
use std::io::Write;
use tracing::debug;
use unrar::Archive;

/// RAR decoder.
///
/// The unrar library only opens archives by path, so the buffer is spilled to
/// a temp file that lives as long as the handle.
#[derive(Debug, Clone, Default)]
pub struct RarDecoder {
    temp: TempFiles,
}

impl RarDecoder {
    pub fn new(temp: TempFiles) -> Self {
        Self { temp }
    }
}

fn rar_error(err: unrar::error::UnrarError) -> Error {
    use unrar::error::Code;
    match err.code {
        Code::MissingPassword => Error::PasswordRequired,
        Code::BadPassword => Error::PasswordIncorrect,
        Code::BadArchive | Code::UnknownFormat | Code::BadData => {
            Error::InvalidFormat(format!("rar: {}", err))
        }
        _ => Error::unknown("rar decoder", err),
    }
}

impl ArchiveDecoder for RarDecoder {
    fn format_name(&self) -> &'static str {
        "rar"
    }

    fn open(&self, source: ArchiveSource, password: Option<&str>) -> Result<Box<dyn ArchiveHandle>> {
        let file = self.temp.spill(source.as_bytes(), ".rar")?;

        let archive = match password {
            Some(pw) => Archive::with_password(file.path(), pw),
            None => Archive::new(file.path()),
        };
        let listing = archive.open_for_listing().map_err(rar_error)?;

        let mut entries = Vec::new();
        for (index, header) in listing.enumerate() {
            let header = header.map_err(rar_error)?;
            entries.push(ArchiveEntry {
                index,
                path: header.filename.to_string_lossy().replace('\\', "/"),
                size: header.unpacked_size,
                modified: None,
                kind: if header.is_directory() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                encrypted: header.is_encrypted(),
            });
        }

        debug!(entries = entries.len(), path = ?file.path(), "Opened rar archive");
        Ok(Box::new(RarHandle {
            file: Some(file),
            entries,
        }))
    }
}

struct RarHandle {
    file: Option<TempFile>,
    entries: Vec<ArchiveEntry>,
}

impl ArchiveHandle for RarHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new(self.entries.iter().cloned().map(Ok)))
    }

    fn extract_entry(&self, index: usize, password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        let path = match self.file.as_ref() {
            Some(file) => file.path().to_path_buf(),
            None => return Err(Error::Interrupted("rar handle closed".to_string())),
        };

        let archive = match password {
            Some(pw) => Archive::with_password(&path, pw),
            None => Archive::new(&path),
        };
        let mut cursor = archive.open_for_processing().map_err(rar_error)?;
        let mut position = 0usize;

        while let Some(header) = cursor.read_header().map_err(rar_error)? {
            if position == index {
                let (data, _rest) = header.read().map_err(rar_error)?;
                sink.write_all(&data)?;
                return Ok(data.len() as u64);
            }
            cursor = header.skip().map_err(rar_error)?;
            position += 1;
        }

        Err(Error::InvalidFormat(format!("rar: no entry at index {}", index)))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.close()?;
        }
        Ok(())
    }
}
