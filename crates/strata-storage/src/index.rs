//! Segment Index
//!
//! Two sparse tables per segment, kept in memory and persisted to side
//! files next to the segment:
//!
//! - **offset index** (`*.log.base_index`): `(relative_offset, file_position)`
//!   sampled every `index_step` bytes written. `find_position` returns the
//!   greatest sampled position at or below a target offset; the reader scans
//!   forward from there to the exact batch.
//! - **timestamp index** (`*.log.timestamp_index`): `(max_timestamp,
//!   relative_offset)` on the same cadence, answering "first offset at or
//!   after time T".
//!
//! The first batch of a segment is always sampled so lookups never fall off
//! the front.
//!
//! ## Side-file format
//!
//! ```text
//! magic (u32) · version (u16) · base_offset (u64) · max_offset (u64)
//! · max_timestamp (i64) · entry_count (u32) · entries · crc32c (u32)
//! ```
//!
//! `max_offset` doubles as recovered state: materializing a sealed
//! segment's index yields its offsets without scanning the file. A missing
//! or corrupt side file is not an error — `materialize` reports `false` and
//! the caller rebuilds the index with a full scan.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use strata_core::batch::BatchHeader;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub(crate) const OFFSET_INDEX_SUFFIX: &str = "base_index";
pub(crate) const TIME_INDEX_SUFFIX: &str = "timestamp_index";

const INDEX_MAGIC: u32 = 0x5354_4958; // "STIX"
const INDEX_VERSION: u16 = 1;
const NO_MAX_OFFSET: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetIndexEntry {
    pub relative_offset: u32,
    pub file_position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeIndexEntry {
    pub timestamp: i64,
    pub relative_offset: u32,
}

pub struct SegmentIndex {
    base_offset: u64,
    offset_path: PathBuf,
    time_path: PathBuf,
    step: u32,
    offsets: Vec<OffsetIndexEntry>,
    times: Vec<TimeIndexEntry>,
    acc_bytes: u64,
    max_offset: Option<u64>,
    max_timestamp: i64,
    dirty: bool,
}

pub(crate) fn side_path(log_path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{suffix}", log_path.display()))
}

impl SegmentIndex {
    pub fn new(log_path: &Path, base_offset: u64, step: u32) -> Self {
        Self {
            base_offset,
            offset_path: side_path(log_path, OFFSET_INDEX_SUFFIX),
            time_path: side_path(log_path, TIME_INDEX_SUFFIX),
            step,
            offsets: Vec::new(),
            times: Vec::new(),
            acc_bytes: 0,
            max_offset: None,
            max_timestamp: strata_core::batch::NO_TIMESTAMP,
            dirty: false,
        }
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn max_offset(&self) -> Option<u64> {
        self.max_offset
    }

    pub fn max_timestamp(&self) -> i64 {
        self.max_timestamp
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    /// Observe a batch written at `file_position`, sampling it if the step
    /// threshold was crossed (the first batch is always sampled).
    pub fn maybe_track(&mut self, header: &BatchHeader, file_position: u64) {
        assert!(
            header.base_offset >= self.base_offset,
            "batch offset {} below segment base {}",
            header.base_offset,
            self.base_offset,
        );
        let relative = (header.base_offset - self.base_offset) as u32;
        if self.offsets.is_empty() || self.acc_bytes >= self.step as u64 {
            self.offsets.push(OffsetIndexEntry {
                relative_offset: relative,
                file_position,
            });
            self.times.push(TimeIndexEntry {
                timestamp: header.max_timestamp,
                relative_offset: relative,
            });
            self.acc_bytes = 0;
        }
        self.acc_bytes += header.size_bytes as u64;
        self.max_offset = Some(
            self.max_offset
                .map_or(header.last_offset(), |m| m.max(header.last_offset())),
        );
        self.max_timestamp = self.max_timestamp.max(header.max_timestamp);
        self.dirty = true;
    }

    /// File position to start scanning from when looking for `target`.
    pub fn find_position(&self, target: u64) -> u64 {
        if target < self.base_offset {
            return 0;
        }
        let relative = (target - self.base_offset).min(u32::MAX as u64) as u32;
        let idx = self
            .offsets
            .partition_point(|e| e.relative_offset <= relative);
        if idx == 0 {
            0
        } else {
            self.offsets[idx - 1].file_position
        }
    }

    /// First indexed offset whose sampled batch timestamp is at or past
    /// `timestamp`. The reader still scans forward to the exact batch.
    pub fn find_offset_for_time(&self, timestamp: i64) -> Option<u64> {
        let idx = self.times.partition_point(|e| e.timestamp < timestamp);
        self.times
            .get(idx)
            .map(|e| self.base_offset + e.relative_offset as u64)
    }

    /// Drop all samples for offsets at or after `at` and pull the tracked
    /// maximum back accordingly.
    pub fn truncate(&mut self, at: u64) {
        if at <= self.base_offset {
            self.offsets.clear();
            self.times.clear();
            self.max_offset = None;
            self.max_timestamp = strata_core::batch::NO_TIMESTAMP;
        } else {
            let relative = (at - self.base_offset).min(u32::MAX as u64) as u32;
            self.offsets.retain(|e| e.relative_offset < relative);
            self.times.retain(|e| e.relative_offset < relative);
            self.max_offset = Some(at - 1);
        }
        self.acc_bytes = 0;
        self.dirty = true;
    }

    /// Prepare for a recovery rescan: drop the last offset sample (it will
    /// be re-tracked by the scan) and return the file position to scan
    /// from. An empty index scans from the start of the file.
    pub(crate) fn prepare_rescan(&mut self) -> u64 {
        let Some(last) = self.offsets.pop() else {
            self.clear();
            return 0;
        };
        self.times
            .retain(|e| e.relative_offset < last.relative_offset);
        // Arm the sampler so the rescan re-tracks the popped batch.
        self.acc_bytes = self.step as u64;
        self.max_offset = None;
        self.max_timestamp = self
            .times
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(strata_core::batch::NO_TIMESTAMP);
        self.dirty = true;
        last.file_position
    }

    pub(crate) fn clear(&mut self) {
        self.offsets.clear();
        self.times.clear();
        self.acc_bytes = 0;
        self.max_offset = None;
        self.max_timestamp = strata_core::batch::NO_TIMESTAMP;
        self.dirty = true;
    }

    /// Persist both side files. Cheap no-op when nothing changed.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let offsets = self.encode_offsets();
        let times = self.encode_times();
        write_side_file(&self.offset_path, &offsets).await?;
        write_side_file(&self.time_path, &times).await?;
        self.dirty = false;
        debug!(
            path = ?self.offset_path,
            entries = self.offsets.len(),
            "segment index flushed"
        );
        Ok(())
    }

    /// Load both side files. Returns `false` when either is missing or
    /// corrupt, in which case the caller rebuilds by scanning the segment.
    pub async fn materialize(&mut self) -> Result<bool> {
        let offset_raw = match read_side_file(&self.offset_path).await? {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let time_raw = match read_side_file(&self.time_path).await? {
            Some(raw) => raw,
            None => return Ok(false),
        };

        let Some((offsets, max_offset, max_timestamp)) =
            self.parse(&offset_raw, &self.offset_path, |buf| OffsetIndexEntry {
                relative_offset: buf.get_u32(),
                file_position: buf.get_u64(),
            })
        else {
            return Ok(false);
        };
        let Some((times, _, _)) = self.parse(&time_raw, &self.time_path, |buf| TimeIndexEntry {
            timestamp: buf.get_i64(),
            relative_offset: buf.get_u32(),
        }) else {
            return Ok(false);
        };

        self.offsets = offsets;
        self.times = times;
        self.max_offset = max_offset;
        self.max_timestamp = max_timestamp;
        self.acc_bytes = 0;
        self.dirty = false;
        Ok(true)
    }

    pub async fn remove_files(&self) -> Result<()> {
        for path in [&self.offset_path, &self.time_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io("unlink", path, e)),
            }
        }
        Ok(())
    }

    fn encode_offsets(&self) -> BytesMut {
        self.encode_with(self.offsets.len(), |buf| {
            for e in &self.offsets {
                buf.put_u32(e.relative_offset);
                buf.put_u64(e.file_position);
            }
        })
    }

    fn encode_times(&self) -> BytesMut {
        self.encode_with(self.times.len(), |buf| {
            for e in &self.times {
                buf.put_i64(e.timestamp);
                buf.put_u32(e.relative_offset);
            }
        })
    }

    fn encode_with(&self, count: usize, entries: impl FnOnce(&mut BytesMut)) -> BytesMut {
        let mut buf = BytesMut::with_capacity(34 + count * 12);
        buf.put_u32(INDEX_MAGIC);
        buf.put_u16(INDEX_VERSION);
        buf.put_u64(self.base_offset);
        buf.put_u64(self.max_offset.unwrap_or(NO_MAX_OFFSET));
        buf.put_i64(self.max_timestamp);
        buf.put_u32(count as u32);
        entries(&mut buf);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32(crc);
        buf
    }

    /// Parse a side file; `None` means corrupt (the caller rebuilds).
    fn parse<E>(
        &self,
        raw: &[u8],
        path: &Path,
        mut entry: impl FnMut(&mut &[u8]) -> E,
    ) -> Option<(Vec<E>, Option<u64>, i64)> {
        const HEADER: usize = 4 + 2 + 8 + 8 + 8 + 4;
        if raw.len() < HEADER + 4 {
            warn!(path = ?path, size = raw.len(), "index file too small, rebuilding");
            return None;
        }
        let (body, crc_bytes) = raw.split_at(raw.len() - 4);
        let stored_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
        if crc32c::crc32c(body) != stored_crc {
            warn!(path = ?path, "index file crc mismatch, rebuilding");
            return None;
        }

        let mut buf = body;
        if buf.get_u32() != INDEX_MAGIC {
            warn!(path = ?path, "index file has wrong magic, rebuilding");
            return None;
        }
        if buf.get_u16() != INDEX_VERSION {
            warn!(path = ?path, "index file has unknown version, rebuilding");
            return None;
        }
        if buf.get_u64() != self.base_offset {
            warn!(path = ?path, "index file base offset mismatch, rebuilding");
            return None;
        }
        let max_offset = match buf.get_u64() {
            NO_MAX_OFFSET => None,
            v => Some(v),
        };
        let max_timestamp = buf.get_i64();
        let count = buf.get_u32() as usize;
        if buf.remaining() != count * 12 {
            warn!(path = ?path, "index file entry count mismatch, rebuilding");
            return None;
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(entry(&mut buf));
        }
        Some((entries, max_offset, max_timestamp))
    }
}

async fn write_side_file(path: &Path, payload: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| Error::io("create", path, e))?;
    file.write_all(payload)
        .await
        .map_err(|e| Error::io("write", path, e))?;
    file.sync_data()
        .await
        .map_err(|e| Error::io("fsync", path, e))?;
    Ok(())
}

async fn read_side_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io("read", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::batch::{BatchAttrs, BatchType};
    use tempfile::TempDir;

    fn header(base_offset: u64, last_delta: u32, size: u32, max_ts: i64) -> BatchHeader {
        BatchHeader {
            header_crc: 0,
            size_bytes: size,
            base_offset,
            batch_type: BatchType::Data,
            crc: 0,
            attrs: BatchAttrs::default(),
            last_offset_delta: last_delta,
            first_timestamp: max_ts,
            max_timestamp: max_ts,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            record_count: last_delta + 1,
        }
    }

    fn index_at(dir: &TempDir, base: u64, step: u32) -> SegmentIndex {
        SegmentIndex::new(&dir.path().join(format!("{base}-0-v1.log")), base, step)
    }

    #[test]
    fn test_first_batch_always_sampled() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 100, 1024);
        index.maybe_track(&header(100, 0, 64, 10), 0);
        assert_eq!(index.entry_count(), 1);
        assert_eq!(index.find_position(100), 0);
        assert_eq!(index.max_offset(), Some(100));
    }

    #[test]
    fn test_sampling_cadence() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 0, 1000);
        let mut pos = 0u64;
        for i in 0..10 {
            index.maybe_track(&header(i, 0, 400, i as i64), pos);
            pos += 400;
        }
        // Samples at batch 0, then whenever 1000 accumulated bytes passed:
        // batches 3, 6, 9 (acc hits 1200 after three 400-byte batches).
        assert_eq!(index.entry_count(), 4);
        assert_eq!(index.max_offset(), Some(9));
    }

    #[test]
    fn test_find_position_picks_greatest_at_or_below() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 0, 100);
        index.maybe_track(&header(0, 4, 150, 10), 0);
        index.maybe_track(&header(5, 4, 150, 20), 150);
        index.maybe_track(&header(10, 4, 150, 30), 300);
        assert_eq!(index.find_position(0), 0);
        assert_eq!(index.find_position(7), 150);
        assert_eq!(index.find_position(12), 300);
        assert_eq!(index.find_position(10_000), 300);
    }

    #[test]
    fn test_find_offset_for_time() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 50, 1);
        index.maybe_track(&header(50, 0, 64, 1_000), 0);
        index.maybe_track(&header(51, 0, 64, 2_000), 64);
        index.maybe_track(&header(52, 0, 64, 3_000), 128);
        assert_eq!(index.find_offset_for_time(0), Some(50));
        assert_eq!(index.find_offset_for_time(1_500), Some(51));
        assert_eq!(index.find_offset_for_time(3_000), Some(52));
        assert_eq!(index.find_offset_for_time(3_001), None);
    }

    #[test]
    fn test_truncate_drops_tail_samples() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 0, 1);
        for i in 0..5 {
            index.maybe_track(&header(i, 0, 64, i as i64), i * 64);
        }
        assert_eq!(index.entry_count(), 5);
        index.truncate(2);
        assert_eq!(index.entry_count(), 2);
        assert_eq!(index.max_offset(), Some(1));
        assert_eq!(index.find_position(4), 64);
    }

    #[test]
    fn test_truncate_to_base_clears() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 10, 1);
        index.maybe_track(&header(10, 0, 64, 5), 0);
        index.truncate(10);
        assert_eq!(index.entry_count(), 0);
        assert_eq!(index.max_offset(), None);
    }

    #[tokio::test]
    async fn test_flush_and_materialize_roundtrip() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("0-1-v1.log");
        let mut index = SegmentIndex::new(&log_path, 0, 1);
        for i in 0..8 {
            index.maybe_track(&header(i, 0, 100, 1_000 + i as i64), i * 100);
        }
        index.flush().await.unwrap();

        let mut reloaded = SegmentIndex::new(&log_path, 0, 1);
        assert!(reloaded.materialize().await.unwrap());
        assert_eq!(reloaded.entry_count(), 8);
        assert_eq!(reloaded.max_offset(), Some(7));
        assert_eq!(reloaded.max_timestamp(), 1_007);
        assert_eq!(reloaded.find_position(5), 500);
        assert_eq!(reloaded.find_offset_for_time(1_003), Some(3));
    }

    #[tokio::test]
    async fn test_materialize_missing_files() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 0, 1);
        assert!(!index.materialize().await.unwrap());
    }

    #[tokio::test]
    async fn test_materialize_corrupt_file_requests_rebuild() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("0-0-v1.log");
        let mut index = SegmentIndex::new(&log_path, 0, 1);
        index.maybe_track(&header(0, 0, 64, 1), 0);
        index.flush().await.unwrap();

        // Flip a byte in the offset index payload.
        let side = side_path(&log_path, OFFSET_INDEX_SUFFIX);
        let mut raw = std::fs::read(&side).unwrap();
        raw[10] ^= 0xFF;
        std::fs::write(&side, raw).unwrap();

        let mut reloaded = SegmentIndex::new(&log_path, 0, 1);
        assert!(!reloaded.materialize().await.unwrap());
    }

    #[tokio::test]
    async fn test_prepare_rescan_pops_last_sample() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 0, 1);
        index.maybe_track(&header(0, 0, 64, 1), 0);
        index.maybe_track(&header(1, 0, 64, 2), 64);
        index.maybe_track(&header(2, 0, 64, 3), 128);

        let pos = index.prepare_rescan();
        assert_eq!(pos, 128);
        assert_eq!(index.entry_count(), 2);
        // Re-tracking the popped batch restores it.
        index.maybe_track(&header(2, 0, 64, 3), 128);
        assert_eq!(index.entry_count(), 3);
        assert_eq!(index.max_offset(), Some(2));
    }

    #[tokio::test]
    async fn test_prepare_rescan_empty_index() {
        let dir = TempDir::new().unwrap();
        let mut index = index_at(&dir, 0, 1);
        assert_eq!(index.prepare_rescan(), 0);
    }

    #[tokio::test]
    async fn test_remove_files() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("0-0-v1.log");
        let mut index = SegmentIndex::new(&log_path, 0, 1);
        index.maybe_track(&header(0, 0, 64, 1), 0);
        index.flush().await.unwrap();
        assert!(side_path(&log_path, OFFSET_INDEX_SUFFIX).exists());

        index.remove_files().await.unwrap();
        assert!(!side_path(&log_path, OFFSET_INDEX_SUFFIX).exists());
        assert!(!side_path(&log_path, TIME_INDEX_SUFFIX).exists());
        // Removing twice is fine.
        index.remove_files().await.unwrap();
    }
}
