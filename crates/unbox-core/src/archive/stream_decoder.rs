//! Single-file compressor decoder

use super::decoder::{ArchiveDecoder, ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind};
use crate::format::Codec;
use crate::{Error, Result};
use std::io::{self, Read, Write};

/// Name given to a payload whose container records none
pub const DEFAULT_ENTRY_NAME: &str = "data";

/// Presents a gzip/bzip2/xz/lzma/snappy/lz4 stream as a one-entry archive
#[derive(Debug, Clone, Copy)]
pub struct StreamDecoder {
    codec: Codec,
}

impl StreamDecoder {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }
}

/// Original file name from a gzip `FNAME` header field
fn gzip_name(bytes: &[u8]) -> Option<String> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    // The header is parsed on the first read
    let mut probe = [0u8; 1];
    decoder.read(&mut probe).ok()?;
    let name = decoder.header()?.filename()?;
    let name = String::from_utf8_lossy(name).into_owned();
    (!name.is_empty()).then_some(name)
}

fn decode_error(codec: Codec, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            Error::InvalidFormat(format!("{:?}: {}", codec, err))
        }
        _ => Error::Io(err),
    }
}

impl ArchiveDecoder for StreamDecoder {
    fn format_name(&self) -> &'static str {
        self.codec.format().extension()
    }

    fn open(&self, source: ArchiveSource, _password: Option<&str>) -> Result<Box<dyn ArchiveHandle>> {
        let name = match self.codec {
            Codec::Gzip => gzip_name(source.as_bytes()),
            _ => None,
        }
        .unwrap_or_else(|| DEFAULT_ENTRY_NAME.to_string());

        Ok(Box::new(StreamHandle {
            codec: self.codec,
            source,
            entry: ArchiveEntry {
                index: 0,
                path: name,
                // Single-file formats carry no trustworthy size
                size: 0,
                modified: None,
                kind: EntryKind::File,
                encrypted: false,
            },
        }))
    }
}

struct StreamHandle {
    codec: Codec,
    source: ArchiveSource,
    entry: ArchiveEntry,
}

impl ArchiveHandle for StreamHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new(std::iter::once(Ok(self.entry.clone()))))
    }

    fn extract_entry(&self, index: usize, _password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        if index != 0 {
            return Err(Error::InvalidFormat(format!(
                "{:?}: single-file stream has no entry {}",
                self.codec, index
            )));
        }

        let mut decoder = self
            .codec
            .decoder(self.source.cursor())
            .map_err(|e| decode_error(self.codec, e))?;

        let mut buffer = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let n = match decoder.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(decode_error(self.codec, e)),
            };
            // Sink errors pass through untouched
            sink.write_all(&buffer[..n])?;
            written += n as u64;
        }
        Ok(written)
    }
}
