//! In-memory archive builders
//!
//! Entry names ending in `/` become directory entries. Builders that take
//! "raw" names write the bytes straight into the header, bypassing the
//! sanitising the writer crates normally apply, so hostile archives can be
//! produced for security tests.

use anyhow::{anyhow, Result};
use std::io::{Cursor, Write};
use zip::write::{FileOptions, SimpleFileOptions};
use zip::CompressionMethod;

/// One archive member: name and content
pub type Member<'a> = (&'a str, &'a [u8]);

/// Deflated zip
pub fn zip_archive(members: &[Member<'_>]) -> Result<Vec<u8>> {
    zip_with(members, SimpleFileOptions::default().compression_method(CompressionMethod::Deflated))
}

/// Stored (uncompressed) zip
pub fn zip_stored(members: &[Member<'_>]) -> Result<Vec<u8>> {
    zip_with(members, SimpleFileOptions::default().compression_method(CompressionMethod::Stored))
}

/// AES-256 encrypted zip
pub fn zip_encrypted(members: &[Member<'_>], password: &str) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .with_aes_encryption(zip::AesMode::Aes256, password);
    zip_with(members, options)
}

fn zip_with(members: &[Member<'_>], options: FileOptions<'_, ()>) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in members {
        if name.ends_with('/') {
            writer.add_directory(*name, options.clone())?;
        } else {
            writer.start_file(*name, options.clone())?;
            writer.write_all(data)?;
        }
    }
    Ok(writer.finish()?.into_inner())
}

/// A deflated zip holding `count` small files named `file_00000.txt` onwards
pub fn zip_many(count: usize) -> Result<Vec<u8>> {
    let names: Vec<String> = (0..count).map(|i| format!("file_{:05}.txt", i)).collect();
    let contents: Vec<String> = (0..count).map(|i| format!("content of file {}\n", i)).collect();
    let members: Vec<Member<'_>> = names
        .iter()
        .zip(&contents)
        .map(|(name, content)| (name.as_str(), content.as_bytes()))
        .collect();
    zip_archive(&members)
}

/// A small zip that inflates to `size` zero bytes
pub fn zip_bomb(name: &str, size: usize) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(size as u64 >= u32::MAX as u64);
    writer.start_file(name, options)?;
    let chunk = vec![0u8; 1024 * 1024];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        writer.write_all(&chunk[..n])?;
        remaining -= n;
    }
    Ok(writer.finish()?.into_inner())
}

/// Plain tar
pub fn tar_archive(members: &[Member<'_>]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        if name.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, std::io::empty())?;
        } else {
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, *data)?;
        }
    }
    Ok(builder.into_inner()?)
}

/// Tar whose names are written verbatim, `..` and leading `/` included
pub fn tar_raw(members: &[Member<'_>]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        let field = &mut header.as_old_mut().name;
        let raw = name.as_bytes();
        if raw.len() > field.len() {
            return Err(anyhow!("raw tar name too long: {}", name));
        }
        field[..raw.len()].copy_from_slice(raw);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *data)?;
    }
    Ok(builder.into_inner()?)
}

/// Tar holding one regular file and one symlink pointing at `target`
pub fn tar_with_symlink(file: Member<'_>, link: &str, target: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(file.1.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, file.0, file.1)?;

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    builder.append_link(&mut header, link, target)?;

    Ok(builder.into_inner()?)
}

pub fn tar_gz(members: &[Member<'_>]) -> Result<Vec<u8>> {
    gzip(None, &tar_archive(members)?)
}

pub fn tar_bz2(members: &[Member<'_>]) -> Result<Vec<u8>> {
    bzip2(&tar_archive(members)?)
}

pub fn tar_xz(members: &[Member<'_>]) -> Result<Vec<u8>> {
    xz(&tar_archive(members)?)
}

/// Gzip stream, optionally recording the original file name in the header
pub fn gzip(name: Option<&str>, data: &[u8]) -> Result<Vec<u8>> {
    let mut builder = flate2::GzBuilder::new();
    if let Some(name) = name {
        builder = builder.filename(name);
    }
    let mut encoder = builder.write(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn bzip2(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn xz(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// LZ4 frame format
pub fn lz4(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Snappy framing format
pub fn snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::write::FrameEncoder::new(Vec::new());
    encoder.write_all(data)?;
    encoder
        .into_inner()
        .map_err(|e| anyhow!("snappy encoder: {}", e.error()))
}

/// Deterministic pseudo-random bytes that do not compress well
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
