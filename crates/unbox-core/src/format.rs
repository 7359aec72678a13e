//! Archive format classification
//!
//! Classification is a pure function of the input prefix: fixed magic-byte
//! signatures are compared first, then the single-file compressors that have a
//! TAR-wrapped variant are speculatively decoded (at most 512 output bytes) to
//! look for the POSIX `ustar` magic at offset 257. Only when nothing matches are
//! the registered fallback probes consulted.

use serde::Serialize;
use std::fmt;
use std::io::{self, Cursor, Read};
use tracing::{debug, trace};

/// Offset of the `ustar` magic inside a TAR header block
pub const TAR_MAGIC_OFFSET: usize = 257;

/// POSIX / GNU TAR magic prefix
pub const TAR_MAGIC: &[u8] = b"ustar";

/// Decoded bytes needed to run the compound probe
pub const COMPOUND_PROBE_LEN: usize = 512;

/// Raw prefix buffered by [`FormatSniffer::sniff_reader`]
pub const SNIFF_BUFFER_LEN: usize = 64 * 1024;

/// Supported archive and compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZip,
    Tar,
    Gzip,
    Bzip2,
    Xz,
    Lzma,
    Snappy,
    Lz4,
    TarGz,
    TarBz2,
    TarXz,
    Unknown,
}

impl ArchiveFormat {
    /// Every format, including `Unknown`
    pub const ALL: [ArchiveFormat; 14] = [
        ArchiveFormat::Zip,
        ArchiveFormat::Rar,
        ArchiveFormat::SevenZip,
        ArchiveFormat::Tar,
        ArchiveFormat::Gzip,
        ArchiveFormat::Bzip2,
        ArchiveFormat::Xz,
        ArchiveFormat::Lzma,
        ArchiveFormat::Snappy,
        ArchiveFormat::Lz4,
        ArchiveFormat::TarGz,
        ArchiveFormat::TarBz2,
        ArchiveFormat::TarXz,
        ArchiveFormat::Unknown,
    ];

    /// A single-file compressor wrapped around a TAR container
    pub fn is_compound(self) -> bool {
        matches!(
            self,
            ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz
        )
    }

    /// Formats that bundle multiple named entries
    pub fn is_container(self) -> bool {
        matches!(
            self,
            ArchiveFormat::Zip | ArchiveFormat::Rar | ArchiveFormat::SevenZip | ArchiveFormat::Tar
        )
    }

    /// Formats that wrap exactly one unnamed byte stream
    pub fn is_single_file(self) -> bool {
        self.codec().is_some() && !self.is_compound()
    }

    /// The outer compressor of a single-file or compound format
    pub fn codec(self) -> Option<Codec> {
        match self {
            ArchiveFormat::Gzip | ArchiveFormat::TarGz => Some(Codec::Gzip),
            ArchiveFormat::Bzip2 | ArchiveFormat::TarBz2 => Some(Codec::Bzip2),
            ArchiveFormat::Xz | ArchiveFormat::TarXz => Some(Codec::Xz),
            ArchiveFormat::Lzma => Some(Codec::Lzma),
            ArchiveFormat::Snappy => Some(Codec::Snappy),
            ArchiveFormat::Lz4 => Some(Codec::Lz4),
            _ => None,
        }
    }

    /// Compound variant for a codec, if one exists
    pub fn compound_of(codec: Codec) -> Option<ArchiveFormat> {
        match codec {
            Codec::Gzip => Some(ArchiveFormat::TarGz),
            Codec::Bzip2 => Some(ArchiveFormat::TarBz2),
            Codec::Xz => Some(ArchiveFormat::TarXz),
            Codec::Lzma | Codec::Snappy | Codec::Lz4 => None,
        }
    }

    /// Conventional file extension
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Gzip => "gz",
            ArchiveFormat::Bzip2 => "bz2",
            ArchiveFormat::Xz => "xz",
            ArchiveFormat::Lzma => "lzma",
            ArchiveFormat::Snappy => "sz",
            ArchiveFormat::Lz4 => "lz4",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::Unknown => "",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveFormat::SevenZip => write!(f, "7z"),
            ArchiveFormat::Snappy => write!(f, "snappy"),
            ArchiveFormat::Gzip => write!(f, "gzip"),
            ArchiveFormat::Bzip2 => write!(f, "bzip2"),
            ArchiveFormat::Unknown => write!(f, "unknown"),
            other => write!(f, "{}", other.extension()),
        }
    }
}

impl std::str::FromStr for ArchiveFormat {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "rar" => Ok(ArchiveFormat::Rar),
            "7z" | "sevenzip" => Ok(ArchiveFormat::SevenZip),
            "tar" => Ok(ArchiveFormat::Tar),
            "gz" | "gzip" => Ok(ArchiveFormat::Gzip),
            "bz2" | "bzip2" => Ok(ArchiveFormat::Bzip2),
            "xz" => Ok(ArchiveFormat::Xz),
            "lzma" => Ok(ArchiveFormat::Lzma),
            "sz" | "snappy" => Ok(ArchiveFormat::Snappy),
            "lz4" => Ok(ArchiveFormat::Lz4),
            "tar.gz" | "tgz" => Ok(ArchiveFormat::TarGz),
            "tar.bz2" | "tbz2" | "tbz" => Ok(ArchiveFormat::TarBz2),
            "tar.xz" | "txz" => Ok(ArchiveFormat::TarXz),
            _ => Err(()),
        }
    }
}

/// Single-file compression codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Gzip,
    Bzip2,
    Xz,
    Lzma,
    Snappy,
    Lz4,
}

impl Codec {
    /// Wrap a reader in the matching streaming decoder
    pub fn decoder<'a, R: Read + 'a>(self, reader: R) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Codec::Gzip => Box::new(flate2::read::MultiGzDecoder::new(reader)),
            Codec::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
            Codec::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(reader)),
            Codec::Lzma => {
                let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Box::new(xz2::read::XzDecoder::new_stream(reader, stream))
            }
            Codec::Snappy => Box::new(snap::read::FrameDecoder::new(reader)),
            Codec::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        })
    }

    /// The format this codec produces when it wraps an opaque payload
    pub fn format(self) -> ArchiveFormat {
        match self {
            Codec::Gzip => ArchiveFormat::Gzip,
            Codec::Bzip2 => ArchiveFormat::Bzip2,
            Codec::Xz => ArchiveFormat::Xz,
            Codec::Lzma => ArchiveFormat::Lzma,
            Codec::Snappy => ArchiveFormat::Snappy,
            Codec::Lz4 => ArchiveFormat::Lz4,
        }
    }
}

/// Fixed magic-byte signatures, checked in order
const SIGNATURES: &[(&[u8], ArchiveFormat)] = &[
    (b"PK\x03\x04", ArchiveFormat::Zip),
    (b"PK\x05\x06", ArchiveFormat::Zip),
    (b"PK\x07\x08", ArchiveFormat::Zip),
    (b"Rar!\x1a\x07\x01\x00", ArchiveFormat::Rar),
    (b"Rar!\x1a\x07\x00", ArchiveFormat::Rar),
    (b"7z\xbc\xaf\x27\x1c", ArchiveFormat::SevenZip),
    (b"\xfd7zXZ\x00", ArchiveFormat::Xz),
    (b"\xff\x06\x00\x00sNaPpY", ArchiveFormat::Snappy),
    (b"\x04\x22\x4d\x18", ArchiveFormat::Lz4),
    (b"\x1f\x8b", ArchiveFormat::Gzip),
    (b"BZh", ArchiveFormat::Bzip2),
    (b"\x5d\x00\x00", ArchiveFormat::Lzma),
];

/// Match the fixed signature table against a prefix
pub fn match_signature(prefix: &[u8]) -> Option<ArchiveFormat> {
    SIGNATURES
        .iter()
        .find(|(magic, _)| prefix.starts_with(magic))
        .map(|(_, format)| *format)
}

/// True if `block` carries the `ustar` magic at offset 257
pub fn has_tar_magic(block: &[u8]) -> bool {
    block
        .get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len())
        .is_some_and(|magic| magic == TAR_MAGIC)
}

/// Decode up to [`COMPOUND_PROBE_LEN`] bytes and look for a TAR header.
///
/// Truncated or corrupt input simply yields `false`.
pub fn probe_compound(codec: Codec, prefix: &[u8]) -> bool {
    let Ok(mut decoder) = codec.decoder(Cursor::new(prefix)) else {
        return false;
    };

    let mut block = [0u8; COMPOUND_PROBE_LEN];
    let mut filled = 0;
    while filled < block.len() {
        match decoder.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!(?codec, error = %e, filled, "Compound probe stopped early");
                break;
            }
        }
    }

    has_tar_magic(&block[..filled])
}

/// Last-resort format recognition supplied by a decoder
pub trait FormatProbe: Send + Sync {
    /// Returns the format if the decoder recognises the input
    fn probe(&self, input: &[u8]) -> Option<ArchiveFormat>;
}

/// Classifies input bytes into an [`ArchiveFormat`]
#[derive(Default)]
pub struct FormatSniffer {
    fallbacks: Vec<Box<dyn FormatProbe>>,
}

impl FormatSniffer {
    /// Create a sniffer with no fallback probes
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fallback probe consulted when no signature matches
    pub fn with_fallback(mut self, probe: Box<dyn FormatProbe>) -> Self {
        self.fallbacks.push(probe);
        self
    }

    /// Classify the input. `Unknown` is a valid result, not an error.
    pub fn sniff(&self, input: &[u8]) -> ArchiveFormat {
        // A tar header opens with the first member's name, which may itself
        // look like a short signature such as `BZh` or `PK\x03\x04`
        if has_tar_magic(input) {
            debug!("Detected tar from ustar magic");
            return ArchiveFormat::Tar;
        }

        if let Some(format) = match_signature(input) {
            let refined = match format.codec().and_then(|codec| {
                ArchiveFormat::compound_of(codec).map(|compound| (codec, compound))
            }) {
                Some((codec, compound)) if probe_compound(codec, input) => compound,
                _ => format,
            };
            debug!(format = %refined, "Detected format from signature");
            return refined;
        }

        for probe in &self.fallbacks {
            if let Some(format) = probe.probe(input) {
                debug!(format = %format, "Detected format from fallback probe");
                return format;
            }
        }

        ArchiveFormat::Unknown
    }

    /// Classify a stream without losing the bytes inspected.
    ///
    /// Buffers up to [`SNIFF_BUFFER_LEN`] bytes and returns a reader that
    /// replays them before continuing with the rest of the source.
    pub fn sniff_reader<R: Read>(&self, mut reader: R) -> io::Result<(ArchiveFormat, ReplayReader<R>)> {
        let mut prefix = Vec::with_capacity(SNIFF_BUFFER_LEN);
        (&mut reader)
            .take(SNIFF_BUFFER_LEN as u64)
            .read_to_end(&mut prefix)?;
        let format = self.sniff(&prefix);
        Ok((format, ReplayReader::new(prefix, reader)))
    }
}

/// A composite stream: a buffered prefix followed by the remaining source
pub struct ReplayReader<R> {
    inner: io::Chain<Cursor<Vec<u8>>, R>,
}

impl<R: Read> ReplayReader<R> {
    /// Build from an already-consumed prefix and the untouched rest
    pub fn new(prefix: Vec<u8>, rest: R) -> Self {
        Self {
            inner: Cursor::new(prefix).chain(rest),
        }
    }

    /// The buffered prefix
    pub fn prefix(&self) -> &[u8] {
        self.inner.get_ref().0.get_ref()
    }
}

impl<R: Read> Read for ReplayReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_block() -> Vec<u8> {
        let mut block = vec![0u8; 512];
        block[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5].copy_from_slice(TAR_MAGIC);
        block
    }

    #[test]
    fn test_signatures() {
        let sniffer = FormatSniffer::new();
        assert_eq!(sniffer.sniff(b"PK\x03\x04rest"), ArchiveFormat::Zip);
        assert_eq!(sniffer.sniff(b"Rar!\x1a\x07\x00xx"), ArchiveFormat::Rar);
        assert_eq!(sniffer.sniff(b"Rar!\x1a\x07\x01\x00"), ArchiveFormat::Rar);
        assert_eq!(sniffer.sniff(b"7z\xbc\xaf\x27\x1c\x00\x04"), ArchiveFormat::SevenZip);
        assert_eq!(sniffer.sniff(b"BZh91AY&SY"), ArchiveFormat::Bzip2);
        assert_eq!(sniffer.sniff(b"\xfd7zXZ\x00\x00"), ArchiveFormat::Xz);
        assert_eq!(sniffer.sniff(b"\x5d\x00\x00\x80\x00"), ArchiveFormat::Lzma);
        assert_eq!(sniffer.sniff(b"\xff\x06\x00\x00sNaPpY"), ArchiveFormat::Snappy);
        assert_eq!(sniffer.sniff(b"\x04\x22\x4d\x18\x64"), ArchiveFormat::Lz4);
        assert_eq!(sniffer.sniff(&tar_block()), ArchiveFormat::Tar);
    }

    #[test]
    fn test_unknown_is_not_an_error() {
        let sniffer = FormatSniffer::new();
        assert_eq!(sniffer.sniff(b""), ArchiveFormat::Unknown);
        assert_eq!(sniffer.sniff(b"hello world"), ArchiveFormat::Unknown);
    }

    #[test]
    fn test_truncated_gzip_stays_plain() {
        // Valid gzip magic with a body that cannot be decoded
        let sniffer = FormatSniffer::new();
        assert_eq!(sniffer.sniff(b"\x1f\x8b\x08\x00garbage"), ArchiveFormat::Gzip);
    }

    #[test]
    fn test_compound_probe_sees_tar_inside_gzip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_block()).unwrap();
        let gz = encoder.finish().unwrap();

        assert!(probe_compound(Codec::Gzip, &gz));
        assert_eq!(FormatSniffer::new().sniff(&gz), ArchiveFormat::TarGz);
    }

    #[test]
    fn test_fallback_probe_consulted_last() {
        struct Always;
        impl FormatProbe for Always {
            fn probe(&self, _input: &[u8]) -> Option<ArchiveFormat> {
                Some(ArchiveFormat::Zip)
            }
        }

        let sniffer = FormatSniffer::new().with_fallback(Box::new(Always));
        assert_eq!(sniffer.sniff(b"anything"), ArchiveFormat::Zip);
        // Signatures still win
        assert_eq!(sniffer.sniff(b"BZh9"), ArchiveFormat::Bzip2);
    }

    #[test]
    fn test_sniff_reader_replays_prefix() {
        let data = b"BZh9 plus the rest of the stream".to_vec();
        let (format, mut replay) = FormatSniffer::new()
            .sniff_reader(Cursor::new(data.clone()))
            .unwrap();
        assert_eq!(format, ArchiveFormat::Bzip2);

        let mut all = Vec::new();
        replay.read_to_end(&mut all).unwrap();
        assert_eq!(all, data);
    }

    #[test]
    fn test_format_properties() {
        assert!(ArchiveFormat::TarGz.is_compound());
        assert!(!ArchiveFormat::Gzip.is_compound());
        assert!(ArchiveFormat::Gzip.is_single_file());
        assert!(ArchiveFormat::Zip.is_container());
        assert_eq!(ArchiveFormat::TarXz.codec(), Some(Codec::Xz));
        assert_eq!(ArchiveFormat::compound_of(Codec::Lz4), None);
        assert_eq!("tgz".parse::<ArchiveFormat>(), Ok(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::SevenZip.to_string(), "7z");
    }
}
