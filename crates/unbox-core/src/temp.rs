//! Temporary files for decoders that need a real path
//!
//! Every file lives under the configured temp directory and is removed when
//! its [`TempFile`] is dropped or closed. Paths are also recorded in a
//! process-wide registry so a front-end can sweep leftovers with
//! [`cleanup_registered`] before exiting.

use crate::Result;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const PREFIX: &str = "unbox_";

fn registry() -> &'static Mutex<HashSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register(path: &Path) {
    if let Ok(mut set) = registry().lock() {
        set.insert(path.to_path_buf());
    }
}

fn unregister(path: &Path) {
    if let Ok(mut set) = registry().lock() {
        set.remove(path);
    }
}

/// Creates temp files in one directory
#[derive(Debug, Clone, Default)]
pub struct TempFiles {
    dir: Option<PathBuf>,
}

impl TempFiles {
    /// Use `dir`, or the system temp directory when `None`
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Directory new files are created in
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Write `bytes` to a fresh temp file
    pub fn spill(&self, bytes: &[u8], suffix: &str) -> Result<TempFile> {
        let dir = self.dir();
        fs::create_dir_all(&dir)?;

        let file = tempfile::Builder::new()
            .prefix(PREFIX)
            .suffix(suffix)
            .tempfile_in(&dir)?;
        register(file.path());

        let temp = TempFile { file: Some(file) };
        if let Some(file) = temp.file.as_ref() {
            let mut handle = file.as_file();
            handle.write_all(bytes)?;
            handle.flush()?;
        }
        debug!(path = ?temp.path(), len = bytes.len(), "Spilled buffer to temp file");
        Ok(temp)
    }
}

/// A temp file deleted on drop
#[derive(Debug)]
pub struct TempFile {
    file: Option<NamedTempFile>,
}

impl TempFile {
    pub fn path(&self) -> &Path {
        self.file
            .as_ref()
            .map(|f| f.path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Delete the file now, reporting failures that drop would swallow
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            let result = file.close();
            unregister(&path);
            result?;
        }
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to remove temp file");
        }
    }
}

/// Remove every registered temp file that still exists.
///
/// Returns the number of files removed.
pub fn cleanup_registered() -> usize {
    let paths: Vec<PathBuf> = match registry().lock() {
        Ok(mut set) => set.drain().collect(),
        Err(_) => return 0,
    };

    paths
        .into_iter()
        .filter(|path| match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to remove leftover temp file");
                false
            }
        })
        .count()
}
