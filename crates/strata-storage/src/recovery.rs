//! Crash Recovery
//!
//! Only the *last* segment of a partition can hold torn writes — earlier
//! segments were sealed, and sealing implies a durable flush. Recovery
//! scans the tail segment, finds the last valid batch boundary and drops
//! everything after it:
//!
//! 1. Load the persisted index if one exists and rescan from its last
//!    sample (or from byte 0 without one).
//! 2. Validate every batch: header CRC, body bounds, body CRC. The first
//!    failure fixes the truncation point at the previous boundary.
//! 3. Decide the outcome:
//!    - nothing valid + empty file → delete the segment
//!    - nothing valid + non-empty file → quarantine as `*.cannotrecover`
//!      for operator inspection
//!    - otherwise → truncate the file to the boundary, persist the rebuilt
//!      index and reopen the segment as the active tail
//!
//! The same scan primitive rebuilds indices for sealed segments, where any
//! mid-file failure is fatal instead of repairable.
//!
//! Scans yield to the runtime every few dozen batches and honor an abort
//! token at batch boundaries.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::events::SegmentEventSender;
use crate::index::SegmentIndex;
use crate::reader::SegmentReadStream;
use crate::segment::{Segment, SegmentMeta};

/// Batches scanned between cooperative yields.
const YIELD_EVERY: usize = 64;

#[derive(Debug)]
pub(crate) struct ScanOutcome {
    /// Last offset of the final valid batch.
    pub last_offset: Option<u64>,
    /// File position one past the final valid batch.
    pub valid_len: u64,
    /// Valid batches seen.
    pub batches: usize,
    /// What ended the scan; `None` means it reached the bound cleanly.
    pub stopper: Option<strata_core::Error>,
}

/// Walk batches in `[start, end)` of `path`, validating headers and
/// bodies. Corruption ends the scan and is reported in the outcome; I/O
/// errors and aborts surface as errors.
pub(crate) async fn scan_batches(
    path: &Path,
    start: u64,
    end: u64,
    chunk: usize,
    mut index: Option<&mut SegmentIndex>,
    abort: Option<&CancellationToken>,
) -> Result<ScanOutcome> {
    let mut stream = SegmentReadStream::open(path, start, end, chunk).await?;
    let mut outcome = ScanOutcome {
        last_offset: None,
        valid_len: start,
        batches: 0,
        stopper: None,
    };

    loop {
        if abort.is_some_and(|token| token.is_cancelled()) {
            return Err(Error::Aborted);
        }
        if outcome.batches > 0 && outcome.batches % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }

        let header = match stream.next_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(Error::Codec(e)) => {
                outcome.stopper = Some(e);
                break;
            }
            Err(e) => return Err(e),
        };
        let position = stream.position();
        match stream.take(&header).await {
            Ok(_) => {}
            Err(Error::Codec(e)) => {
                outcome.stopper = Some(e);
                break;
            }
            Err(e) => return Err(e),
        }

        if let Some(idx) = index.as_mut() {
            idx.maybe_track(&header, position);
        }
        outcome.last_offset = Some(header.last_offset());
        outcome.valid_len = stream.position();
        outcome.batches += 1;
    }

    Ok(outcome)
}

/// Rebuild a sealed segment's index by scanning the whole file. Sealed
/// data is immutable by invariant, so any invalid byte is fatal.
pub(crate) async fn rebuild_index(
    path: &Path,
    index: &mut SegmentIndex,
    size: u64,
    chunk: usize,
) -> Result<ScanOutcome> {
    index.clear();
    let outcome = scan_batches(path, 0, size, chunk, Some(index), None).await?;
    if outcome.valid_len != size {
        let cause = outcome.stopper.unwrap_or(strata_core::Error::ShortRead {
            needed: size as usize,
            remaining: outcome.valid_len as usize,
        });
        return Err(Error::Codec(cause));
    }
    index.flush().await?;
    info!(path = ?path, batches = outcome.batches, "segment index rebuilt");
    Ok(outcome)
}

/// Recover the tail segment of a partition. Returns the segment reopened
/// for appending, or `None` when the file was deleted or quarantined.
pub(crate) async fn recover_segment(
    path: &Path,
    meta: SegmentMeta,
    config: &LogConfig,
    events: Option<SegmentEventSender>,
    abort: Option<&CancellationToken>,
) -> Result<Option<Arc<Segment>>> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::io("stat", path, e))?
        .len();
    let chunk = config.default_read_buffer_size;

    let mut index = SegmentIndex::new(path, meta.base_offset, config.index_step);
    let materialized = index.materialize().await?;
    let mut start = if materialized {
        index.prepare_rescan().min(size)
    } else {
        0
    };

    let mut outcome = scan_batches(path, start, size, chunk, Some(&mut index), abort).await?;
    if outcome.batches == 0 && start > 0 {
        // The indexed tail did not validate; distrust the whole index and
        // rescan from the beginning.
        warn!(path = ?path, "index sample did not validate, rescanning from the start");
        index.clear();
        start = 0;
        outcome = scan_batches(path, 0, size, chunk, Some(&mut index), abort).await?;
    }

    if let Some(cause) = &outcome.stopper {
        warn!(path = ?path, %cause, valid_len = outcome.valid_len, "tail scan stopped");
    }

    if outcome.batches == 0 && start == 0 {
        index.remove_files().await?;
        if size == 0 {
            info!(path = ?path, "removing empty tail segment");
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| Error::io("unlink", path, e))?;
        } else {
            let quarantine = format!("{}.cannotrecover", path.display());
            warn!(
                path = ?path,
                quarantine = %quarantine,
                size,
                "tail segment has no valid batches, quarantining",
            );
            tokio::fs::rename(path, &quarantine)
                .await
                .map_err(|e| Error::io("rename", path, e))?;
        }
        return Ok(None);
    }

    if outcome.valid_len < size {
        warn!(
            path = ?path,
            dropped = size - outcome.valid_len,
            "truncating torn segment tail",
        );
        crate::segment::truncate_file(path, outcome.valid_len).await?;
    }
    index.flush().await?;

    let segment = Segment::open_recovered(
        path,
        meta,
        config,
        events,
        index,
        outcome.last_offset,
        outcome.valid_len,
        outcome.batches as u32,
    )
    .await?;
    info!(
        path = ?path,
        last_offset = ?outcome.last_offset,
        batches = outcome.batches,
        "segment recovered",
    );
    Ok(Some(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{parse_segment_filename, segment_filename};
    use bytes::Bytes;
    use strata_core::batch::{RecordBatch, RecordBatchBuilder};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> LogConfig {
        let mut config = LogConfig::new(dir.path());
        config.writer_flush_period = std::time::Duration::from_secs(3600);
        config.index_step = 1;
        config
    }

    /// Build a segment on disk with `n` batches, sealed so the index is
    /// persisted, and return (path, meta, batches).
    async fn build_segment(
        dir: &TempDir,
        config: &LogConfig,
        base: u64,
        n: usize,
    ) -> (std::path::PathBuf, SegmentMeta, Vec<RecordBatch>) {
        let segment = Segment::create(dir.path(), base, 1, config, None).await.unwrap();
        let mut batches = Vec::new();
        let mut offset = base;
        for i in 0..n {
            let mut batch = RecordBatchBuilder::data(offset)
                .record(
                    100 + i as i64,
                    Some(Bytes::from(format!("k{i}"))),
                    Bytes::from(format!("payload-{i}")),
                )
                .build();
            segment.append(&mut batch).await.unwrap();
            offset = batch.last_offset() + 1;
            batches.push(batch);
        }
        segment.seal().await.unwrap();
        let path = segment.path().to_path_buf();
        let meta = parse_segment_filename(path.file_name().unwrap().to_str().unwrap()).unwrap();
        (path, meta, batches)
    }

    #[tokio::test]
    async fn test_recover_clean_segment() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (path, meta, batches) = build_segment(&dir, &config, 0, 5).await;

        let segment = recover_segment(&path, meta, &config, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(segment.dirty_offset(), Some(4));
        assert_eq!(segment.committed_offset(), Some(4));
        assert!(!segment.is_sealed());
        let expected: u64 = batches.iter().map(|b| b.size_bytes() as u64).sum();
        assert_eq!(segment.size_bytes(), expected);
    }

    #[tokio::test]
    async fn test_recover_truncates_random_noise_tail() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (path, meta, batches) = build_segment(&dir, &config, 0, 4).await;

        let clean_len = std::fs::metadata(&path).unwrap().len();
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(&[0xA5; 37]);
        std::fs::write(&path, raw).unwrap();

        let segment = recover_segment(&path, meta, &config, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(segment.dirty_offset(), Some(batches.last().unwrap().last_offset()));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
    }

    #[tokio::test]
    async fn test_recover_truncates_corrupt_last_batch() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (path, meta, batches) = build_segment(&dir, &config, 0, 4).await;

        // Corrupt the final batch's body.
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let segment = recover_segment(&path, meta, &config, None, None)
            .await
            .unwrap()
            .unwrap();
        // The last batch is gone; the first three survive.
        assert_eq!(segment.dirty_offset(), Some(batches[2].last_offset()));
        let expected: u64 = batches[..3].iter().map(|b| b.size_bytes() as u64).sum();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[tokio::test]
    async fn test_recover_deletes_empty_segment() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let path = dir.path().join(segment_filename(0, 0, 1));
        std::fs::write(&path, b"").unwrap();
        let meta = parse_segment_filename(path.file_name().unwrap().to_str().unwrap()).unwrap();

        let result = recover_segment(&path, meta, &config, None, None).await.unwrap();
        assert!(result.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_recover_quarantines_garbage_segment() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let path = dir.path().join(segment_filename(0, 0, 1));
        std::fs::write(&path, vec![0x42; 2048]).unwrap();
        let meta = parse_segment_filename(path.file_name().unwrap().to_str().unwrap()).unwrap();

        let result = recover_segment(&path, meta, &config, None, None).await.unwrap();
        assert!(result.is_none());
        assert!(!path.exists());
        let quarantine = format!("{}.cannotrecover", path.display());
        assert!(std::path::Path::new(&quarantine).exists());
    }

    #[tokio::test]
    async fn test_recover_without_index_files() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (path, meta, _) = build_segment(&dir, &config, 10, 3).await;

        // Drop both side files; recovery must scan from byte zero.
        crate::index::SegmentIndex::new(&path, 10, 1)
            .remove_files()
            .await
            .unwrap();

        let segment = recover_segment(&path, meta, &config, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(segment.dirty_offset(), Some(12));
        assert_eq!(segment.base_offset(), 10);
    }

    #[tokio::test]
    async fn test_recovered_segment_accepts_appends() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (path, meta, _) = build_segment(&dir, &config, 0, 2).await;

        let segment = recover_segment(&path, meta, &config, None, None)
            .await
            .unwrap()
            .unwrap();
        let mut batch = RecordBatchBuilder::data(2)
            .record(999, None, Bytes::from("after-recovery"))
            .build();
        segment.append(&mut batch).await.unwrap();
        segment.flush().await.unwrap();
        assert_eq!(segment.dirty_offset(), Some(2));
        assert_eq!(segment.committed_offset(), Some(2));
    }

    #[tokio::test]
    async fn test_rebuild_index_rejects_midfile_corruption() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (path, _, _) = build_segment(&dir, &config, 0, 5).await;

        let mut raw = std::fs::read(&path).unwrap();
        raw[70] ^= 0xFF; // inside the second batch region
        let size = raw.len() as u64;
        std::fs::write(&path, raw).unwrap();

        let mut index = SegmentIndex::new(&path, 0, 1);
        let err = rebuild_index(&path, &mut index, size, 4096).await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_scan_honors_abort() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (path, _, _) = build_segment(&dir, &config, 0, 3).await;
        let size = std::fs::metadata(&path).unwrap().len();

        let token = CancellationToken::new();
        token.cancel();
        let err = scan_batches(&path, 0, size, 4096, None, Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }
}
