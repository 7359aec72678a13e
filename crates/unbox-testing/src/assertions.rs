//! Common assertions for unbox testing

use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Asserts that `dir` holds exactly the given files (relative, `/`-separated)
/// with the given contents. Directories are ignored.
pub fn assert_tree_eq(dir: &Path, expected: &[(&str, &[u8])]) -> Result<()> {
    let actual = collect_files(dir)?;
    let mut expected_names: Vec<String> = expected.iter().map(|(name, _)| name.to_string()).collect();
    expected_names.sort();

    let actual_names: Vec<String> = actual.iter().map(|(name, _)| name.clone()).collect();
    assert_eq!(actual_names, expected_names, "File set mismatch under {:?}", dir);

    for (name, content) in expected {
        let data = std::fs::read(dir.join(name))?;
        assert_eq!(&data[..], *content, "Content mismatch for {:?}", name);
    }

    Ok(())
}

/// Asserts that nothing but hidden staging leftovers exist under `dir`
pub fn assert_dir_empty(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let files = collect_files(dir)?;
    assert!(files.is_empty(), "Expected no files under {:?}, found {:?}", dir, files);
    Ok(())
}

/// Asserts that two directory structures are identical
pub fn assert_dirs_equal(dir1: &Path, dir2: &Path) -> Result<()> {
    let files1 = collect_files(dir1)?;
    let files2 = collect_files(dir2)?;

    assert_eq!(
        files1.len(),
        files2.len(),
        "Different number of files: {} vs {}",
        files1.len(),
        files2.len()
    );

    for ((name1, path1), (name2, path2)) in files1.iter().zip(files2.iter()) {
        assert_eq!(name1, name2, "Different file names");
        let content1 = std::fs::read(path1)?;
        let content2 = std::fs::read(path2)?;
        assert_eq!(content1, content2, "Content mismatch for {:?}", name1);
    }

    Ok(())
}

/// Regular files under `dir` as sorted (relative name, absolute path) pairs
fn collect_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((name, entry.path().to_path_buf()));
    }
    files.sort();
    Ok(files)
}
