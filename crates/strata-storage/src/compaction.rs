//! Retention & Key Compaction
//!
//! Space is reclaimed in two ways, both restricted to sealed segments (the
//! active segment is never touched, so appends proceed in parallel):
//!
//! - **Retention** drops whole segments from the front of the set once they
//!   fall below the time watermark or push the partition over its size
//!   budget. A segment is only reclaimable when consensus has moved the
//!   *collectible offset* past it and no reader holds a reference; held
//!   candidates are deferred to the next cycle.
//! - **Key compaction** rewrites a sealed segment keeping, per key, only
//!   the record with the greatest offset. Offsets never change — batches
//!   keep their base offset and last-offset delta, so dropped records leave
//!   gaps, never reordering.
//!
//! ## Rewrite protocol
//!
//! ```text
//! scan segment ──► latest-offset-per-key map
//! write <segment>.log.compacted ──► fsync ──► rename over <segment>.log
//! swap in rebuilt index, mark segment compacted
//! ```
//!
//! The rename is atomic; a reader holding the old file descriptor keeps
//! seeing the original bytes until it drops the handle.
//!
//! The per-log cycle is a small state machine driven by [`crate::Log::compact`]:
//! `idle → scanning → evicting → compacting → idle`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::appender::SegmentAppender;
use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::index::SegmentIndex;
use crate::segment::Segment;
use strata_core::batch::{BatchBody, BatchType};
use strata_core::codec;

/// Batches processed between cooperative yields.
const YIELD_EVERY: usize = 32;

/// Where a log's garbage-collection cycle currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompactionPhase {
    #[default]
    Idle,
    Scanning,
    Evicting,
    Compacting,
}

/// One garbage-collection request.
#[derive(Debug, Clone, Default)]
pub struct GcConfig {
    /// Evict sealed segments whose batches all predate this timestamp.
    pub eviction_time_ms: Option<i64>,
    /// Evict oldest segments while the partition exceeds this many bytes.
    pub max_bytes: Option<u64>,
    pub abort: Option<CancellationToken>,
}

/// What one garbage-collection cycle accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub segments_evicted: usize,
    /// Eviction candidates still pinned by readers.
    pub segments_deferred: usize,
    pub segments_compacted: usize,
    pub records_removed: u64,
    pub bytes_reclaimed: u64,
}

impl CompactionReport {
    pub fn merge(&mut self, other: &CompactionReport) {
        self.segments_evicted += other.segments_evicted;
        self.segments_deferred += other.segments_deferred;
        self.segments_compacted += other.segments_compacted;
        self.records_removed += other.records_removed;
        self.bytes_reclaimed += other.bytes_reclaimed;
    }
}

pub(crate) struct SelfCompaction {
    pub records_removed: u64,
    pub bytes_reclaimed: u64,
    /// False when the segment had no duplicate keys and was left alone.
    pub rewritten: bool,
}

fn check_abort(abort: &Option<CancellationToken>) -> Result<()> {
    if abort.as_ref().is_some_and(|t| t.is_cancelled()) {
        return Err(Error::Aborted);
    }
    Ok(())
}

/// Rewrite one sealed segment keeping only the latest record per key.
///
/// Keyless records and non-data batches always survive; opaque compressed
/// bodies are carried through whole (their keys are not visible without
/// decompression). Two records sharing a key *and* an offset would make
/// "latest" meaningless and panic as an invariant violation.
pub(crate) async fn self_compact_segment(
    segment: &Arc<Segment>,
    config: &LogConfig,
    abort: &Option<CancellationToken>,
) -> Result<SelfCompaction> {
    let old_size = segment.size_bytes();
    let (latest, duplicates) = build_key_map(segment, old_size, abort).await?;
    if duplicates == 0 {
        debug!(path = ?segment.path(), "segment has no duplicate keys, skipping rewrite");
        segment.mark_compacted();
        return Ok(SelfCompaction {
            records_removed: 0,
            bytes_reclaimed: 0,
            rewritten: false,
        });
    }

    let tmp_path = std::path::PathBuf::from(format!("{}.compacted", segment.path().display()));
    match tokio::fs::remove_file(&tmp_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io("unlink", &tmp_path, e)),
    }

    let mut appender = SegmentAppender::open(&tmp_path, config, None).await?;
    let mut new_index = SegmentIndex::new(segment.path(), segment.base_offset(), config.index_step);
    let mut records_removed = 0u64;

    let mut stream = segment.read_stream_at(0, old_size).await?;
    let mut processed = 0usize;
    while let Some(header) = stream.next_header().await? {
        check_abort(abort)?;
        if processed > 0 && processed % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
        processed += 1;

        let mut batch = stream.take(&header).await?;
        if header.batch_type == BatchType::Data && !header.attrs.is_compressed() {
            let replacement = match &batch.body {
                BatchBody::Records(records) => {
                    let kept: Vec<_> = records
                        .iter()
                        .filter(|record| {
                            let Some(key) = &record.key else {
                                return true;
                            };
                            let offset = header.base_offset + record.offset_delta as u64;
                            latest.get(key) == Some(&offset)
                        })
                        .cloned()
                        .collect();
                    let removed = records.len() - kept.len();
                    (removed > 0).then_some((kept, removed))
                }
                BatchBody::Opaque(_) => None,
            };
            if let Some((kept, removed)) = replacement {
                records_removed += removed as u64;
                if kept.is_empty() {
                    continue;
                }
                batch.header.record_count = kept.len() as u32;
                batch.body = BatchBody::Records(kept);
            }
        }

        let position = appender.file_byte_offset();
        let encoded = codec::encode(&mut batch);
        appender.append(&encoded).await?;
        new_index.maybe_track(&batch.header, position);
    }

    appender.flush().await?;
    let new_len = appender.file_byte_offset();
    appender.close().await?;

    tokio::fs::rename(&tmp_path, segment.path())
        .await
        .map_err(|e| Error::io("rename", &tmp_path, e))?;
    segment.install_compacted(new_index, new_len).await?;

    let bytes_reclaimed = old_size - new_len;
    info!(
        path = ?segment.path(),
        records_removed,
        bytes_reclaimed,
        "segment compacted",
    );
    Ok(SelfCompaction {
        records_removed,
        bytes_reclaimed,
        rewritten: true,
    })
}

/// First pass: map every key to the greatest offset holding it, and count
/// superseded records.
async fn build_key_map(
    segment: &Arc<Segment>,
    size: u64,
    abort: &Option<CancellationToken>,
) -> Result<(HashMap<Bytes, u64>, u64)> {
    let mut latest: HashMap<Bytes, u64> = HashMap::new();
    let mut duplicates = 0u64;
    let mut stream = segment.read_stream_at(0, size).await?;
    let mut processed = 0usize;

    while let Some(header) = stream.next_header().await? {
        check_abort(abort)?;
        if processed > 0 && processed % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
        processed += 1;

        if header.batch_type != BatchType::Data || header.attrs.is_compressed() {
            stream.skip(&header).await?;
            continue;
        }
        let batch = stream.take(&header).await?;
        let BatchBody::Records(records) = &batch.body else {
            continue;
        };
        for record in records {
            let Some(key) = &record.key else {
                continue;
            };
            let offset = header.base_offset + record.offset_delta as u64;
            match latest.get_mut(key) {
                Some(existing) => {
                    assert!(
                        *existing != offset,
                        "two records share key and offset {offset} in {:?}",
                        segment.path(),
                    );
                    if offset > *existing {
                        *existing = offset;
                    }
                    duplicates += 1;
                }
                None => {
                    latest.insert(key.clone(), offset);
                }
            }
        }
    }
    Ok((latest, duplicates))
}
