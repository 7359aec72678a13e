//! Integration tests for the security policy

mod common;

use common::{extractor, Recorder};
use unbox_core::config::Config;
use unbox_core::error::{SecurityViolation, SizeLimitKind};
use unbox_core::security::{confine, resolve_entry_path};
use std::sync::Arc;
use unbox_core::{Error, ErrorKind, ExtractOptions, Extractor, MetricsCollector};
use unbox_testing::{assertions, fixtures, TestDir};

#[test]
fn test_path_traversal_protection() {
    // Normal paths resolve
    assert!(resolve_entry_path("normal/file.txt").is_ok());
    assert!(resolve_entry_path("./normal/file.txt").is_ok());
    assert!(resolve_entry_path("a/../b/file.txt").is_ok());

    // Escapes and absolute paths are rejected
    for hostile in [
        "../etc/passwd",
        "../../etc/passwd",
        "/etc/passwd",
        "subdir/../../etc/passwd",
        "..\\..\\windows\\system32",
        "C:\\Windows\\evil.dll",
        "a/./../../b",
    ] {
        let err = resolve_entry_path(hostile).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal, "{}", hostile);
    }
}

#[test]
fn test_traversal_in_zip_writes_nothing() {
    let input = fixtures::zip_archive(&[
        ("a.txt", b"12345678"),
        ("dir/b.txt", b"0123456789abcdef"),
        ("../evil.txt", b"pwned"),
    ])
    .unwrap();

    let root = TestDir::new().unwrap();
    let out = root.create_dir("out").unwrap();
    let recorder = Recorder::new();

    let err = Extractor::default()
        .extract(&input, ExtractOptions::new().output_dir(&out).progress(recorder.clone()))
        .unwrap_err();

    assert!(matches!(
        err,
        Error::SecurityViolation(SecurityViolation::PathTraversal { ref path }) if path == "../evil.txt"
    ));
    assertions::assert_dir_empty(root.path()).unwrap();
    assert!(!root.join("evil.txt").exists());
    assert_eq!(recorder.log.count("progress"), 0);
    assert_eq!(recorder.log.count("error"), 1);
}

#[test]
fn test_absolute_path_in_tar_is_rejected() {
    let input = fixtures::tar_raw(&[("/etc/passwd", b"root:x:0:0")]).unwrap();
    let err = Extractor::default().extract(&input, ExtractOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathTraversal);
}

#[test]
fn test_traversal_check_off_still_confines() {
    let mut config = Config::default();
    config.checks.path_traversal = false;

    let input = fixtures::tar_raw(&[("../../escape.txt", b"contained")]).unwrap();
    let root = TestDir::new().unwrap();
    let out = root.create_dir("deep/out").unwrap();

    let output = extractor(config, false)
        .extract(&input, ExtractOptions::new().output_dir(&out))
        .unwrap();

    assert_eq!(output.files.len(), 1);
    assert_eq!(std::fs::read(out.join("escape.txt")).unwrap(), b"contained");
    assert!(!root.join("escape.txt").exists());
    assert!(!root.join("deep/escape.txt").exists());
}

#[test]
fn test_extension_allow_list() {
    let mut config = Config::default();
    config.checks.extension = true;
    config.limits.allowed_extensions = vec!["txt".to_string(), ".MD".to_string()];
    let extractor = extractor(config, false);

    let ok = fixtures::zip_archive(&[("a.TXT", b"a"), ("docs/", b""), ("docs/readme.md", b"#")]).unwrap();
    assert_eq!(extractor.extract(&ok, ExtractOptions::new()).unwrap().files.len(), 2);

    let bad = fixtures::zip_archive(&[("a.txt", b"a"), ("run.exe", b"MZ")]).unwrap();
    let err = extractor.extract(&bad, ExtractOptions::new()).unwrap_err();
    assert!(matches!(
        err,
        Error::SecurityViolation(SecurityViolation::DisallowedFileType { ref extension, .. }) if extension == "exe"
    ));

    // No suffix means the empty extension, which is not listed
    let bare = fixtures::zip_archive(&[("Makefile", b"all:")]).unwrap();
    let err = extractor.extract(&bare, ExtractOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DisallowedFileType);
}

#[test]
fn test_zip_bomb_aborts_mid_stream() {
    let mut config = Config::default();
    config.limits.max_file_size = 1024 * 1024;
    let input = fixtures::zip_bomb("zeros.txt", 16 * 1024 * 1024).unwrap();
    assert!(input.len() < 64 * 1024);

    let dir = TestDir::new().unwrap();
    let err = extractor(config, false)
        .extract(&input, ExtractOptions::new().output_dir(dir.path()))
        .unwrap_err();

    match err {
        Error::SizeLimitExceeded { kind, limit, path } => {
            assert_eq!(kind, SizeLimitKind::PerFile);
            assert_eq!(limit, 1024 * 1024);
            assert_eq!(path.as_deref(), Some("zeros.txt"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assertions::assert_dir_empty(dir.path()).unwrap();
}

#[test]
fn test_aggregate_ceiling() {
    let mut config = Config::default();
    config.limits.max_total_size = 100;
    let input = fixtures::tar_archive(&[("a.txt", &[b'a'; 60]), ("b.txt", &[b'b'; 60])]).unwrap();

    let err = extractor(config, false).extract(&input, ExtractOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SizeLimitAggregate);
}

#[test]
fn test_compound_layer_is_bounded() {
    let mut config = Config::default();
    config.limits.max_total_size = 4096;
    let big = vec![b'x'; 64 * 1024];
    let input = fixtures::tar_gz(&[("big.txt", big.as_slice())]).unwrap();

    let err = extractor(config, false).extract(&input, ExtractOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SizeLimitCompoundInput);
}

#[test]
fn test_count_ceiling_fails_before_any_extraction() {
    let mut config = Config::default();
    config.limits.max_file_count = 5;
    let input = fixtures::zip_many(6).unwrap();

    let recorder = Recorder::new();
    let dir = TestDir::new().unwrap();
    let err = extractor(config, false)
        .extract(
            &input,
            ExtractOptions::new().output_dir(dir.path()).progress(recorder.clone()),
        )
        .unwrap_err();

    assert!(matches!(err, Error::CountLimitExceeded { count: 6, limit: 5 }));
    assert_eq!(recorder.log.count("file"), 0);
    assertions::assert_dir_empty(dir.path()).unwrap();

    // Exactly at the ceiling is fine
    let mut config = Config::default();
    config.limits.max_file_count = 6;
    assert_eq!(
        extractor(config, false)
            .extract(&input, ExtractOptions::new())
            .unwrap()
            .files
            .len(),
        6
    );
}

#[test]
fn test_directories_do_not_count() {
    let mut config = Config::default();
    config.limits.max_file_count = 1;
    let input = fixtures::zip_archive(&[("a/", b""), ("a/b/", b""), ("a/b/c.txt", b"c")]).unwrap();
    assert_eq!(
        extractor(config, false)
            .extract(&input, ExtractOptions::new())
            .unwrap()
            .files
            .len(),
        1
    );
}

#[test]
fn test_input_ceiling_rejects_before_decoding() {
    let mut config = Config::default();
    config.limits.max_input_size = 16;
    let input = fixtures::zip_archive(&[("a.txt", b"a")]).unwrap();
    let extractor = extractor(config, false);

    let err = extractor.extract(&input, ExtractOptions::new()).unwrap_err();
    assert!(matches!(
        err,
        Error::SizeLimitExceeded { kind: SizeLimitKind::Input, limit: 16, .. }
    ));

    let err = extractor
        .extract_reader(std::io::Cursor::new(input), ExtractOptions::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SizeLimitInput);
}

#[test]
fn test_disabled_size_checks() {
    let mut config = Config::default();
    config.limits.max_file_size = 10;
    config.checks.file_size = false;
    let input = fixtures::zip_archive(&[("a.txt", &[b'a'; 100])]).unwrap();
    let output = extractor(config, false).extract(&input, ExtractOptions::new()).unwrap();
    assert_eq!(output.get("a.txt").unwrap().size, 100);
}

#[cfg(unix)]
#[test]
fn test_symlinked_output_subdir_is_not_followed() {
    let root = TestDir::new().unwrap();
    let out = root.create_dir("out").unwrap();
    let outside = root.create_dir("outside").unwrap();
    std::os::unix::fs::symlink(&outside, out.join("link")).unwrap();

    let err = confine(&out, std::path::Path::new("link/file.txt")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathTraversal);

    let input = fixtures::tar_archive(&[("link/file.txt", b"escape")]).unwrap();
    let err = Extractor::default()
        .extract(&input, ExtractOptions::new().output_dir(&out))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathTraversal);
    assert!(!outside.join("file.txt").exists());
}

#[test]
fn test_gzip_bomb_stops_at_file_size_before_buffering() {
    let mut config = Config::default();
    config.limits.max_file_size = 1024 * 1024;
    let input = fixtures::gzip(Some("zeros.txt"), &vec![0u8; 32 * 1024 * 1024]).unwrap();
    assert!(input.len() < 64 * 1024);

    let metrics = Arc::new(MetricsCollector::new());
    let err = extractor(config.clone(), false)
        .with_metrics(metrics.clone())
        .extract(&input, ExtractOptions::new())
        .unwrap_err();

    match err {
        Error::SizeLimitExceeded { kind, limit, path } => {
            assert_eq!(kind, SizeLimitKind::PerFile);
            assert_eq!(limit, 1024 * 1024);
            assert_eq!(path.as_deref(), Some("zeros.txt"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(metrics.snapshot().peak_memory < 2 * 1024 * 1024);

    // Under the ceiling the payload is still extracted
    let input = fixtures::gzip(Some("zeros.txt"), &vec![0u8; 900 * 1024]).unwrap();
    let output = extractor(config, false)
        .with_metrics(metrics.clone())
        .extract(&input, ExtractOptions::new())
        .unwrap();
    assert_eq!(output.total_bytes(), 900 * 1024);
    assert!(metrics.snapshot().peak_memory < 2 * 1024 * 1024);
}
