//! Suffix and prefix truncation across segment boundaries.

use bytes::Bytes;
use strata_core::batch::RecordBatchBuilder;
use strata_core::RecordBatch;
use strata_storage::{AppendOptions, Error, LogConfig, LogManager, Ntp, ReadOptions};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> LogConfig {
    let mut config = LogConfig::new(dir.path());
    config.writer_flush_period = std::time::Duration::from_secs(3600);
    config
}

fn data_batch(base_offset: u64, timestamp: i64, value: &str) -> RecordBatch {
    RecordBatchBuilder::data(base_offset)
        .record(timestamp, None, Bytes::from(value.to_string()))
        .build()
}

async fn read_from(log: &strata_storage::Log, start_offset: u64) -> Vec<RecordBatch> {
    let mut reader = log
        .make_reader(ReadOptions {
            start_offset,
            ..ReadOptions::default()
        })
        .await
        .unwrap();
    reader.read_all().await.unwrap()
}

/// S2: truncation landing inside a segment shrinks the file in place.
#[tokio::test]
async fn test_truncate_mid_segment() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(test_config(&dir));
    let log = manager.manage(Ntp::new("ns", "t", 0), None).await.unwrap();

    let batches: Vec<_> = (0..6).map(|i| data_batch(i, 10 + i as i64, "v")).collect();
    log.append(batches.clone(), AppendOptions { fsync: true })
        .await
        .unwrap();

    log.truncate(batches[4].base_offset()).await.unwrap();

    let offsets = log.offsets();
    assert_eq!(offsets.dirty_offset, Some(batches[3].last_offset()));
    assert_eq!(offsets.committed_offset, Some(batches[3].last_offset()));

    let read = read_from(&log, 0).await;
    assert_eq!(read, batches[..4].to_vec());
}

/// S3: truncating at the start clears the whole log, across term groups.
#[tokio::test]
async fn test_truncate_whole_log() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(test_config(&dir));
    let log = manager.manage(Ntp::new("ns", "t", 0), None).await.unwrap();

    for term in 0..10u64 {
        log.set_term(term).await.unwrap();
        log.append(
            vec![data_batch(term, 100 + term as i64, "term-group")],
            AppendOptions { fsync: true },
        )
        .await
        .unwrap();
    }
    assert_eq!(log.offsets().dirty_offset, Some(9));
    assert_eq!(log.offsets().last_term, 9);

    log.truncate(0).await.unwrap();

    let offsets = log.offsets();
    assert_eq!(offsets.dirty_offset, None);
    assert_eq!(offsets.committed_offset, None);
    assert!(read_from(&log, 0).await.is_empty());

    // The log is usable again; offsets restart at the old start.
    log.append(
        vec![data_batch(0, 1, "after-clear")],
        AppendOptions { fsync: true },
    )
    .await
    .unwrap();
    assert_eq!(log.offsets().dirty_offset, Some(0));
}

/// Truncating at a segment boundary deletes whole segment files.
#[tokio::test]
async fn test_truncate_drops_whole_segments() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_segment_batches = Some(2);
    let manager = LogManager::new(config);
    let ntp = Ntp::new("ns", "t", 0);
    let log = manager.manage(ntp.clone(), None).await.unwrap();

    for i in 0..8u64 {
        log.append(
            vec![data_batch(i, 1 + i as i64, "x")],
            AppendOptions { fsync: true },
        )
        .await
        .unwrap();
    }
    let partition_dir = dir.path().join(ntp.path());
    let segment_files = |dir: &std::path::Path| {
        let mut logs: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| {
                let name = e.unwrap().file_name().into_string().unwrap();
                name.ends_with(".log").then_some(name)
            })
            .collect();
        logs.sort();
        logs
    };
    assert_eq!(segment_files(&partition_dir).len(), 4);

    // Offset 4 is the base of the third segment: it and everything after
    // disappear from disk.
    log.truncate(4).await.unwrap();
    assert_eq!(segment_files(&partition_dir).len(), 2);
    assert_eq!(log.offsets().dirty_offset, Some(3));
    assert_eq!(read_from(&log, 0).await.len(), 4);

    // Appends continue on a fresh tail segment.
    log.append(vec![data_batch(4, 99, "new")], AppendOptions { fsync: true })
        .await
        .unwrap();
    assert_eq!(read_from(&log, 0).await.len(), 5);
}

/// Invariant 5: after truncate(at), dirty == at - 1 and reads from `at`
/// yield nothing.
#[tokio::test]
async fn test_truncate_then_read_at_boundary() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(test_config(&dir));
    let log = manager.manage(Ntp::new("ns", "t", 0), None).await.unwrap();

    for i in 0..10u64 {
        log.append(
            vec![data_batch(i, 1, "payload")],
            AppendOptions { fsync: true },
        )
        .await
        .unwrap();
    }
    log.truncate(7).await.unwrap();

    assert_eq!(log.offsets().dirty_offset, Some(6));
    assert!(read_from(&log, 7).await.is_empty());
    assert_eq!(read_from(&log, 6).await.len(), 1);
}

/// Truncating past the end is a caller error.
#[tokio::test]
async fn test_truncate_future_offset_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(test_config(&dir));
    let log = manager.manage(Ntp::new("ns", "t", 0), None).await.unwrap();

    log.append(vec![data_batch(0, 1, "v")], AppendOptions { fsync: true })
        .await
        .unwrap();
    assert!(matches!(
        log.truncate(5).await,
        Err(Error::InvalidArgument(_))
    ));
}

/// In-flight readers keep their snapshot across a truncation; new readers
/// see the truncated state.
#[tokio::test]
async fn test_truncate_does_not_disturb_existing_reader() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(test_config(&dir));
    let log = manager.manage(Ntp::new("ns", "t", 0), None).await.unwrap();

    for i in 0..6u64 {
        log.append(
            vec![data_batch(i, 1, "stable")],
            AppendOptions { fsync: true },
        )
        .await
        .unwrap();
    }

    let mut reader = log.make_reader(ReadOptions::default()).await.unwrap();
    // Pull the first batch, then truncate underneath the reader.
    let first = reader.next_batch().await.unwrap().unwrap();
    assert_eq!(first.base_offset(), 0);
    log.truncate(2).await.unwrap();

    // The snapshot still drains everything it covered at creation.
    let rest = reader.read_all().await.unwrap();
    assert_eq!(rest.len(), 5);

    // A fresh reader observes the truncated log.
    assert_eq!(read_from(&log, 0).await.len(), 2);
}

/// Invariant 6: prefix truncation advances the start offset; earlier
/// offsets are gone.
#[tokio::test]
async fn test_truncate_prefix() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.max_segment_batches = Some(2);
    let manager = LogManager::new(config);
    let ntp = Ntp::new("ns", "t", 0);
    let log = manager.manage(ntp.clone(), None).await.unwrap();

    for i in 0..8u64 {
        log.append(
            vec![data_batch(i, 1, "keep-or-drop")],
            AppendOptions { fsync: true },
        )
        .await
        .unwrap();
    }

    log.truncate_prefix(5).await.unwrap();
    let offsets = log.offsets();
    assert_eq!(offsets.start_offset, 5);
    // The dirty offset is untouched.
    assert_eq!(offsets.dirty_offset, Some(7));

    assert!(matches!(
        log.make_reader(ReadOptions {
            start_offset: 4,
            ..ReadOptions::default()
        })
        .await,
        Err(Error::OutOfRange { .. })
    ));
    let read = read_from(&log, 5).await;
    assert_eq!(read.len(), 3);
    assert_eq!(read[0].base_offset(), 5);

    // Segments wholly below offset 5 are deleted from disk; the one
    // containing offset 5 is kept (it also holds offset 4).
    let partition_dir = dir.path().join(ntp.path());
    let remaining: Vec<_> = std::fs::read_dir(&partition_dir)
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            name.ends_with(".log").then_some(name)
        })
        .collect();
    assert_eq!(remaining.len(), 2);
}

/// Prefix truncation is idempotent and never moves backwards.
#[tokio::test]
async fn test_truncate_prefix_monotonic() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(test_config(&dir));
    let log = manager.manage(Ntp::new("ns", "t", 0), None).await.unwrap();

    for i in 0..4u64 {
        log.append(vec![data_batch(i, 1, "v")], AppendOptions { fsync: true })
            .await
            .unwrap();
    }
    log.truncate_prefix(3).await.unwrap();
    assert_eq!(log.offsets().start_offset, 3);
    // Going backwards is a silent no-op.
    log.truncate_prefix(1).await.unwrap();
    assert_eq!(log.offsets().start_offset, 3);
}

/// A term bump forces the next append onto a new segment named with the
/// new term.
#[tokio::test]
async fn test_term_change_rolls_segment() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::new(test_config(&dir));
    let ntp = Ntp::new("ns", "t", 0);
    let log = manager.manage(ntp.clone(), None).await.unwrap();

    log.append(vec![data_batch(0, 1, "term0")], AppendOptions { fsync: true })
        .await
        .unwrap();
    log.set_term(3).await.unwrap();
    log.append(vec![data_batch(1, 2, "term3")], AppendOptions { fsync: true })
        .await
        .unwrap();

    let partition_dir = dir.path().join(ntp.path());
    let mut names: Vec<_> = std::fs::read_dir(&partition_dir)
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            name.ends_with(".log").then_some(name)
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["0-0-v1.log", "1-3-v1.log"]);

    // Batches carry the term of the segment that holds them.
    let read = read_from(&log, 0).await;
    assert_eq!(read[0].term, 0);
    assert_eq!(read[1].term, 3);

    // Terms never regress.
    assert!(matches!(
        log.set_term(2).await,
        Err(Error::InvalidArgument(_))
    ));
}
