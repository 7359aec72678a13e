//! Decoder collaborators
//!
//! The engine never parses containers or runs compression math itself; it
//! goes through [`ArchiveDecoder`] and [`ArchiveHandle`] implemented here on
//! top of the codec crates.

pub mod decoder;
#[cfg(feature = "rar")]
pub mod rar_decoder;
pub mod sevenz_decoder;
pub mod stream_decoder;
pub mod tar_decoder;
pub mod zip_decoder;

pub use decoder::{ArchiveDecoder, ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind};
#[cfg(feature = "rar")]
pub use rar_decoder::RarDecoder;
pub use sevenz_decoder::SevenZDecoder;
pub use stream_decoder::StreamDecoder;
pub use tar_decoder::TarDecoder;
pub use zip_decoder::ZipDecoder;

use crate::format::ArchiveFormat;
use crate::temp::TempFiles;
use std::sync::Arc;

/// Create the decoder for a container or single-file format.
///
/// Compound formats are decoded in two steps (codec, then TAR), so they map to
/// their outer codec here. Returns `None` for `Unknown` and for RAR when the
/// `rar` feature is off.
#[cfg_attr(not(feature = "rar"), allow(unused_variables))]
pub fn create_decoder(format: ArchiveFormat, temp: &TempFiles) -> Option<Arc<dyn ArchiveDecoder>> {
    match format {
        ArchiveFormat::Zip => Some(Arc::new(ZipDecoder::new())),
        ArchiveFormat::Tar => Some(Arc::new(TarDecoder::new())),
        ArchiveFormat::SevenZip => Some(Arc::new(SevenZDecoder::new())),
        #[cfg(feature = "rar")]
        ArchiveFormat::Rar => Some(Arc::new(RarDecoder::new(temp.clone()))),
        ArchiveFormat::Unknown => None,
        other => other
            .codec()
            .map(|codec| Arc::new(StreamDecoder::new(codec)) as Arc<dyn ArchiveDecoder>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_known_format_has_a_decoder() {
        let temp = TempFiles::default();
        for format in ArchiveFormat::ALL {
            let decoder = create_decoder(format, &temp);
            match format {
                ArchiveFormat::Unknown => assert!(decoder.is_none()),
                ArchiveFormat::Rar => assert_eq!(decoder.is_some(), cfg!(feature = "rar")),
                _ => assert!(decoder.is_some(), "{format} has no decoder"),
            }
        }
    }

    #[test]
    fn test_compound_maps_to_outer_codec() {
        let decoder = create_decoder(ArchiveFormat::TarXz, &TempFiles::default()).unwrap();
        assert_eq!(decoder.format_name(), "xz");
    }
}
