//! Concurrent mode: equivalence, failure isolation and timeouts

mod common;

use common::{config_with_threads, extractor, Recorder};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use unbox_core::archive::{ArchiveEntry, ArchiveHandle, ArchiveSource, EntryKind};
use unbox_core::config::SecurityPolicy;
use unbox_core::strategy::{build_pool, Prepared};
use unbox_core::{
    ArchiveFormat, Error, ErrorKind, ExtractOptions, ExtractionOutput, ExtractionStrategy,
    Extractor, MetricsCollector, Result, SharedConfig, StrategyRegistry,
};
use unbox_testing::{assertions, fixtures, TestDir};

fn contents(output: &ExtractionOutput) -> BTreeMap<String, Vec<u8>> {
    output
        .files
        .values()
        .map(|f| (f.path.clone(), f.bytes.clone().unwrap_or_default()))
        .collect()
}

#[test]
fn test_thousand_entries_match_sequential() {
    let input = fixtures::zip_many(1000).unwrap();

    let sequential = extractor(config_with_threads(4), false)
        .extract(&input, ExtractOptions::new())
        .unwrap();
    let concurrent = extractor(config_with_threads(4), true)
        .extract(&input, ExtractOptions::new())
        .unwrap();

    assert_eq!(sequential.files.len(), 1000);
    assert!(concurrent.is_complete());
    assert_eq!(contents(&sequential), contents(&concurrent));
    // Same keys, not just the same contents
    assert!(sequential.files.keys().eq(concurrent.files.keys()));
}

#[test]
fn test_concurrent_to_disk_matches_sequential() {
    let members: Vec<(String, Vec<u8>)> = (0..64)
        .map(|i| (format!("d{}/f{}.txt", i % 8, i), fixtures::noise(1000 + i, i as u64)))
        .collect();
    let borrowed: Vec<(&str, &[u8])> = members
        .iter()
        .map(|(name, data)| (name.as_str(), data.as_slice()))
        .collect();
    let input = fixtures::tar_gz(&borrowed).unwrap();

    let one = TestDir::new().unwrap();
    let two = TestDir::new().unwrap();
    extractor(config_with_threads(4), false)
        .extract(&input, ExtractOptions::new().output_dir(one.path()))
        .unwrap();
    let output = extractor(config_with_threads(4), true)
        .extract(&input, ExtractOptions::new().output_dir(two.path()))
        .unwrap();

    assert_eq!(output.format, ArchiveFormat::TarGz);
    assertions::assert_dirs_equal(one.path(), two.path()).unwrap();
}

#[test]
fn test_failed_entries_do_not_abort_siblings() {
    let input = fixtures::zip_archive(&[
        ("ok.txt", b"fine"),
        ("../evil.txt", b"pwned"),
        ("sub/also_ok.txt", b"also fine"),
    ])
    .unwrap();

    let recorder = Recorder::new();
    let output = extractor(config_with_threads(2), true)
        .extract(&input, ExtractOptions::new().progress(recorder.clone()))
        .unwrap();

    assert_eq!(output.files.len(), 2);
    assert!(!output.is_complete());
    assert_eq!(output.failures.len(), 1);
    assert_eq!(output.failures[0].path, "../evil.txt");
    assert_eq!(output.failures[0].index, 1);
    assert_eq!(output.failures[0].kind, ErrorKind::PathTraversal);

    // The terminal callback is still a success
    assert_eq!(recorder.log.count("complete"), 1);
    assert_eq!(recorder.log.count("error"), 0);
}

#[test]
fn test_whole_archive_failures_still_abort() {
    let mut config = config_with_threads(2);
    config.limits.max_file_count = 10;
    let input = fixtures::zip_many(11).unwrap();

    let err = extractor(config, true)
        .extract(&input, ExtractOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::CountLimitExceeded { count: 11, limit: 10 }));
}

#[test]
fn test_progress_counts_never_decrease() {
    let big = fixtures::noise(300 * 1024, 1);
    let input = fixtures::zip_stored(&[
        ("a.bin", big.as_slice()),
        ("b.bin", big.as_slice()),
        ("c.bin", big.as_slice()),
    ])
    .unwrap();

    let recorder = Recorder::new();
    extractor(config_with_threads(3), true)
        .extract(&input, ExtractOptions::new().progress(recorder.clone()))
        .unwrap();

    let events = recorder.log.events();
    assert!(events[0].starts_with("start "));
    assert_eq!(events.last().map(String::as_str), Some("complete"));

    let mut last: BTreeMap<String, u64> = BTreeMap::new();
    for event in recorder.log.matching("progress ") {
        let mut parts = event.split(' ').skip(1);
        let name = parts.next().unwrap().to_string();
        let bytes: u64 = parts.next().unwrap().parse().unwrap();
        let previous = last.insert(name, bytes).unwrap_or(0);
        assert!(bytes >= previous, "{}", event);
    }
    assert_eq!(last.len(), 3);
    assert!(last.values().all(|&b| b == big.len() as u64));
}

#[test]
fn test_max_concurrency_gauge_respects_pool_size() {
    let metrics = Arc::new(MetricsCollector::new());
    let extractor = extractor(config_with_threads(3), true).with_metrics(metrics.clone());
    extractor
        .extract(&fixtures::zip_many(200).unwrap(), ExtractOptions::new())
        .unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.files, 200);
    assert!(snapshot.max_concurrent_tasks >= 1);
    assert!(snapshot.max_concurrent_tasks <= 3);
}

#[test]
fn test_pool_is_reused_and_released_on_close() {
    let extractor = extractor(config_with_threads(2), true);
    let input = fixtures::zip_archive(&[("a.txt", b"a")]).unwrap();
    for _ in 0..3 {
        extractor.extract(&input, ExtractOptions::new()).unwrap();
    }

    extractor.close().unwrap();
    let err = extractor.extract(&input, ExtractOptions::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interrupted);
}

#[test]
fn test_shuffled_order_yields_same_keys() {
    let mut names: Vec<String> = (0..50).map(|i| format!("n{:02}.txt", i)).collect();
    names.shuffle(&mut rand::thread_rng());
    let borrowed: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), n.as_bytes())).collect();
    let input = fixtures::zip_archive(&borrowed).unwrap();

    let output = extractor(config_with_threads(4), true)
        .extract(&input, ExtractOptions::new())
        .unwrap();
    for (key, file) in &output.files {
        assert_eq!(names[key.index], key.path);
        assert_eq!(file.bytes.as_deref(), Some(names[key.index].as_bytes()));
    }
}

/// Handle with one instant entry and one that trickles bytes slowly
struct SlowHandle;

impl SlowHandle {
    fn entry(index: usize, path: &str) -> ArchiveEntry {
        ArchiveEntry {
            index,
            path: path.to_string(),
            size: 0,
            modified: None,
            kind: EntryKind::File,
            encrypted: false,
        }
    }
}

impl ArchiveHandle for SlowHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new(
            vec![Ok(Self::entry(0, "fast.txt")), Ok(Self::entry(1, "slow.txt"))].into_iter(),
        ))
    }

    fn extract_entry(&self, index: usize, _password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        if index == 0 {
            sink.write_all(b"quick")?;
            return Ok(5);
        }
        let mut written = 0;
        for _ in 0..200 {
            thread::sleep(Duration::from_millis(50));
            sink.write_all(b".")?;
            written += 1;
        }
        Ok(written)
    }
}

struct SlowStrategy {
    pool: Arc<rayon::ThreadPool>,
}

impl ExtractionStrategy for SlowStrategy {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn prepare(&self, _source: ArchiveSource, _password: Option<&str>, _policy: &SecurityPolicy) -> Result<Prepared> {
        Ok(Prepared::Container(Box::new(SlowHandle)))
    }

    fn pool(&self) -> Result<Option<Arc<rayon::ThreadPool>>> {
        Ok(Some(Arc::clone(&self.pool)))
    }
}

#[test]
fn test_timeout_returns_partial_output() {
    let mut config = config_with_threads(2);
    config.performance.timeout_secs = 1;

    let mut registry = StrategyRegistry::new();
    registry.register(
        ArchiveFormat::Zip,
        Arc::new(SlowStrategy {
            pool: build_pool(2).unwrap(),
        }),
    );
    let metrics = Arc::new(MetricsCollector::new());
    let extractor = Extractor::with_registry(Arc::new(SharedConfig::new(config)), registry)
        .with_metrics(metrics.clone());

    let recorder = Recorder::new();
    let started = Instant::now();
    let err = extractor
        .extract(
            b"ignored",
            ExtractOptions::new()
                .format(ArchiveFormat::Zip)
                .progress(recorder.clone()),
        )
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        Error::Timeout { timeout, partial } => {
            assert_eq!(timeout, Duration::from_secs(1));
            assert!(partial.get("fast.txt").is_some());
            assert!(partial.get("slow.txt").is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
    // Returned at the deadline, not after the slow entry finished
    assert!(elapsed < Duration::from_secs(8), "{:?}", elapsed);
    assert_eq!(recorder.log.count("error"), 1);
    assert_eq!(recorder.log.count("complete"), 0);
    assert_eq!(metrics.snapshot().errors.get(&ErrorKind::Timeout), Some(&1));
}

#[test]
fn test_cumulative_totals_span_all_entries() {
    let big = fixtures::noise(300 * 1024, 2);
    let input = fixtures::zip_stored(&[
        ("a.bin", big.as_slice()),
        ("b.bin", big.as_slice()),
        ("c.bin", big.as_slice()),
    ])
    .unwrap();

    for concurrent in [true, false] {
        let recorder = Recorder::new();
        extractor(config_with_threads(3), concurrent)
            .extract(&input, ExtractOptions::new().progress(recorder.clone()))
            .unwrap();

        let totals: Vec<(usize, u64)> = recorder
            .log
            .matching("totals ")
            .iter()
            .map(|event| {
                let mut parts = event.split(' ').skip(1);
                let files: usize = parts.next().unwrap().parse().unwrap();
                let bytes: u64 = parts.next().unwrap().parse().unwrap();
                (files, bytes)
            })
            .collect();

        assert!(totals.len() > 3, "mode concurrent={}", concurrent);
        for pair in totals.windows(2) {
            assert!(pair[1].0 >= pair[0].0 && pair[1].1 >= pair[0].1, "{:?}", pair);
        }
        // Cumulative, not per entry: bytes run past any single file
        assert_eq!(totals.last(), Some(&(3, 3 * big.len() as u64)));
        assert_eq!(recorder.log.events().last().map(String::as_str), Some("complete"));
    }
}

#[test]
fn test_huge_timeout_means_no_deadline() {
    let mut config = config_with_threads(2);
    config.performance.timeout_secs = u64::MAX;
    config.validate().unwrap();
    let input = fixtures::zip_many(8).unwrap();

    let output = extractor(config, true)
        .extract(&input, ExtractOptions::new())
        .unwrap();
    assert_eq!(output.files.len(), 8);
    assert!(output.is_complete());
}

/// Handle that counts how often it is closed
struct ClosingHandle {
    closed: Arc<AtomicUsize>,
}

impl ArchiveHandle for ClosingHandle {
    fn entries(&self) -> Result<Box<dyn Iterator<Item = Result<ArchiveEntry>> + '_>> {
        Ok(Box::new((0..16).map(|i| Ok(SlowHandle::entry(i, &format!("f{}.txt", i))))))
    }

    fn extract_entry(&self, index: usize, _password: Option<&str>, sink: &mut dyn Write) -> Result<u64> {
        let data = format!("entry {}", index);
        sink.write_all(data.as_bytes())?;
        Ok(data.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

struct ClosingStrategy {
    pool: Arc<rayon::ThreadPool>,
    closed: Arc<AtomicUsize>,
}

impl ExtractionStrategy for ClosingStrategy {
    fn name(&self) -> &'static str {
        "closing"
    }

    fn prepare(&self, _source: ArchiveSource, _password: Option<&str>, _policy: &SecurityPolicy) -> Result<Prepared> {
        Ok(Prepared::Container(Box::new(ClosingHandle {
            closed: Arc::clone(&self.closed),
        })))
    }

    fn pool(&self) -> Result<Option<Arc<rayon::ThreadPool>>> {
        Ok(Some(Arc::clone(&self.pool)))
    }
}

#[test]
fn test_handle_closed_after_concurrent_run() {
    let closed = Arc::new(AtomicUsize::new(0));
    let mut registry = StrategyRegistry::new();
    registry.register(
        ArchiveFormat::Zip,
        Arc::new(ClosingStrategy {
            pool: build_pool(4).unwrap(),
            closed: Arc::clone(&closed),
        }),
    );
    let extractor = Extractor::with_registry(Arc::new(SharedConfig::new(config_with_threads(4))), registry);

    for round in 1..=5 {
        let output = extractor
            .extract(b"ignored", ExtractOptions::new().format(ArchiveFormat::Zip))
            .unwrap();
        assert_eq!(output.files.len(), 16);
        assert_eq!(closed.load(AtomicOrdering::SeqCst), round);
    }
}
