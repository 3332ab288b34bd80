//! Segment
//!
//! One contiguous slice of a partition's offset space, written in a single
//! term and backed by three files:
//!
//! ```text
//! <base_offset>-<term>-v<version>.log        the batches
//! <...>.log.base_index                       sparse offset → position index
//! <...>.log.timestamp_index                  sparse time → offset index
//! ```
//!
//! A segment bundles the appender, the index and the offset tracker. The
//! tracker's offsets are atomics so readers observe them without taking the
//! segment lock:
//!
//! - `dirty_offset`: greatest offset written (possibly unflushed)
//! - `committed_offset`: greatest offset known durable
//! - `flushed_bytes`: the byte bound readers may see
//!
//! ## States
//!
//! *Active* (has an appender) → *sealed* (`seal()` releases the appender and
//! persists the index) → *tombstoned* (files pending removal once the last
//! reader reference drops).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use strata_core::{codec, RecordBatch};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::appender::SegmentAppender;
use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::events::{self, SegmentEvent, SegmentEventSender};
use crate::index::SegmentIndex;
use crate::reader::SegmentReadStream;
use crate::recovery;

pub(crate) const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Metadata carried by a segment file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentMeta {
    pub base_offset: u64,
    pub term: u64,
    pub version: u32,
}

pub(crate) fn segment_filename(base_offset: u64, term: u64, version: u32) -> String {
    format!("{base_offset}-{term}-v{version}.log")
}

/// Parse `<base_offset>-<term>-v<version>.log`; anything else is not a
/// segment file.
pub(crate) fn parse_segment_filename(name: &str) -> Option<SegmentMeta> {
    let stem = name.strip_suffix(".log")?;
    let mut parts = stem.splitn(3, '-');
    let base_offset = parts.next()?.parse().ok()?;
    let term = parts.next()?.parse().ok()?;
    let version = parts.next()?.strip_prefix('v')?.parse().ok()?;
    Some(SegmentMeta {
        base_offset,
        term,
        version,
    })
}

fn opt_offset(raw: i64) -> Option<u64> {
    (raw >= 0).then_some(raw as u64)
}

fn raw_offset(offset: Option<u64>) -> i64 {
    offset.map_or(-1, |o| o as i64)
}

struct SegmentInner {
    appender: Option<SegmentAppender>,
    index: SegmentIndex,
}

pub struct Segment {
    path: PathBuf,
    base_offset: u64,
    term: u64,
    version: u32,
    read_chunk: usize,

    dirty_offset: AtomicI64,
    committed_offset: AtomicI64,
    flushed_bytes: AtomicU64,
    written_bytes: AtomicU64,
    max_timestamp: AtomicI64,
    batch_count: AtomicU32,

    sealed: AtomicBool,
    tombstone: AtomicBool,
    compacted: AtomicBool,

    events: Option<SegmentEventSender>,
    inner: Mutex<SegmentInner>,
}

impl Segment {
    /// Create a fresh active segment at
    /// `<dir>/<base_offset>-<term>-v1.log`.
    pub(crate) async fn create(
        dir: &Path,
        base_offset: u64,
        term: u64,
        config: &LogConfig,
        events: Option<SegmentEventSender>,
    ) -> Result<Arc<Segment>> {
        let path = dir.join(segment_filename(base_offset, term, SEGMENT_FORMAT_VERSION));
        info!(path = ?path, "creating new segment");
        let appender = SegmentAppender::open(&path, config, events.clone()).await?;
        let index = SegmentIndex::new(&path, base_offset, config.index_step);
        events::emit(&events, SegmentEvent::Created { path: path.clone() });
        Ok(Arc::new(Segment {
            path,
            base_offset,
            term,
            version: SEGMENT_FORMAT_VERSION,
            read_chunk: config.default_read_buffer_size,
            dirty_offset: AtomicI64::new(-1),
            committed_offset: AtomicI64::new(-1),
            flushed_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            max_timestamp: AtomicI64::new(strata_core::batch::NO_TIMESTAMP),
            batch_count: AtomicU32::new(0),
            sealed: AtomicBool::new(false),
            tombstone: AtomicBool::new(false),
            compacted: AtomicBool::new(false),
            events,
            inner: Mutex::new(SegmentInner {
                appender: Some(appender),
                index,
            }),
        }))
    }

    /// Open an existing segment read-only. The index is loaded from its
    /// side files or rebuilt with a full scan; mid-file corruption in a
    /// sealed segment is fatal and surfaces here.
    pub(crate) async fn open_sealed(
        path: &Path,
        meta: SegmentMeta,
        config: &LogConfig,
    ) -> Result<Arc<Segment>> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::io("stat", path, e))?
            .len();
        let mut index = SegmentIndex::new(path, meta.base_offset, config.index_step);
        let mut batches = 0u32;
        if !index.materialize().await? {
            warn!(path = ?path, "segment index missing or corrupt, rebuilding");
            let outcome = recovery::rebuild_index(
                path,
                &mut index,
                size,
                config.default_read_buffer_size,
            )
            .await?;
            batches = outcome.batches as u32;
        }
        let max_offset = index.max_offset();
        let max_timestamp = index.max_timestamp();

        Ok(Arc::new(Segment {
            path: path.to_path_buf(),
            base_offset: meta.base_offset,
            term: meta.term,
            version: meta.version,
            read_chunk: config.default_read_buffer_size,
            dirty_offset: AtomicI64::new(raw_offset(max_offset)),
            committed_offset: AtomicI64::new(raw_offset(max_offset)),
            flushed_bytes: AtomicU64::new(size),
            written_bytes: AtomicU64::new(size),
            max_timestamp: AtomicI64::new(max_timestamp),
            batch_count: AtomicU32::new(batches),
            sealed: AtomicBool::new(true),
            tombstone: AtomicBool::new(false),
            compacted: AtomicBool::new(false),
            events: None,
            inner: Mutex::new(SegmentInner {
                appender: None,
                index,
            }),
        }))
    }

    /// Open a recovered segment as the partition's active tail. The caller
    /// (recovery) has already truncated tail garbage, rebuilt the index and
    /// established the last valid offset.
    pub(crate) async fn open_recovered(
        path: &Path,
        meta: SegmentMeta,
        config: &LogConfig,
        events: Option<SegmentEventSender>,
        index: SegmentIndex,
        last_offset: Option<u64>,
        size: u64,
        batches: u32,
    ) -> Result<Arc<Segment>> {
        let appender = SegmentAppender::open(path, config, events.clone()).await?;
        let max_timestamp = index.max_timestamp();
        Ok(Arc::new(Segment {
            path: path.to_path_buf(),
            base_offset: meta.base_offset,
            term: meta.term,
            version: meta.version,
            read_chunk: config.default_read_buffer_size,
            dirty_offset: AtomicI64::new(raw_offset(last_offset)),
            committed_offset: AtomicI64::new(raw_offset(last_offset)),
            flushed_bytes: AtomicU64::new(size),
            written_bytes: AtomicU64::new(size),
            max_timestamp: AtomicI64::new(max_timestamp),
            batch_count: AtomicU32::new(batches),
            sealed: AtomicBool::new(false),
            tombstone: AtomicBool::new(false),
            compacted: AtomicBool::new(false),
            events,
            inner: Mutex::new(SegmentInner {
                appender: Some(appender),
                index,
            }),
        }))
    }

    // --- accessors -------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn dirty_offset(&self) -> Option<u64> {
        opt_offset(self.dirty_offset.load(Ordering::Acquire))
    }

    pub fn committed_offset(&self) -> Option<u64> {
        opt_offset(self.committed_offset.load(Ordering::Acquire))
    }

    /// Greatest offset in the segment; equal to the committed offset once
    /// sealed.
    pub fn max_offset(&self) -> Option<u64> {
        self.dirty_offset()
    }

    pub fn size_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Acquire)
    }

    pub fn max_timestamp(&self) -> i64 {
        self.max_timestamp.load(Ordering::Acquire)
    }

    pub fn batch_count(&self) -> u32 {
        self.batch_count.load(Ordering::Acquire)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted.load(Ordering::Acquire)
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone.load(Ordering::Acquire)
    }

    pub(crate) fn mark_tombstone(&self) {
        self.tombstone.store(true, Ordering::Release);
    }

    pub(crate) fn mark_compacted(&self) {
        self.compacted.store(true, Ordering::Release);
    }

    // --- write path ------------------------------------------------------

    /// Encode and append one batch. The batch's `size_bytes` and checksums
    /// are stamped by the encoder; its base offset must be exactly the next
    /// expected offset — anything else is an engine bug, not an error.
    pub(crate) async fn append(&self, batch: &mut RecordBatch) -> Result<()> {
        let mut inner = self.inner.lock().await;
        assert!(!self.is_sealed(), "append to sealed segment {:?}", self.path);
        assert!(
            batch.header.base_offset >= self.base_offset,
            "batch base offset {} below segment base {}",
            batch.header.base_offset,
            self.base_offset,
        );
        if let Some(dirty) = self.dirty_offset() {
            assert_eq!(
                batch.header.base_offset,
                dirty + 1,
                "non-monotonic append to {:?}",
                self.path,
            );
        }

        let encoded = codec::encode(batch);
        let appender = inner
            .appender
            .as_mut()
            .expect("active segment must own an appender");
        let start_position = appender.file_byte_offset();
        appender.append(&encoded).await?;
        inner.index.maybe_track(&batch.header, start_position);

        self.dirty_offset
            .store(batch.last_offset() as i64, Ordering::Release);
        self.written_bytes
            .fetch_add(batch.header.size_bytes as u64, Ordering::AcqRel);
        self.max_timestamp
            .fetch_max(batch.header.max_timestamp, Ordering::AcqRel);
        self.batch_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Make every appended batch durable and advance the committed offset
    /// and the readers' byte bound.
    pub(crate) async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(appender) = inner.appender.as_mut() else {
            return Ok(());
        };
        let dirty = self.dirty_offset.load(Ordering::Acquire);
        appender.flush().await?;
        let stable = appender.stable_bytes();
        self.committed_offset.store(dirty, Ordering::Release);
        self.flushed_bytes.store(stable, Ordering::Release);
        Ok(())
    }

    /// Flush, persist the index, release the appender and transition to
    /// read-only. Idempotent.
    pub(crate) async fn seal(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut appender) = inner.appender.take() {
            let dirty = self.dirty_offset.load(Ordering::Acquire);
            appender.flush().await?;
            let stable = appender.stable_bytes();
            appender.close().await?;
            self.committed_offset.store(dirty, Ordering::Release);
            self.flushed_bytes.store(stable, Ordering::Release);
            inner.index.flush().await?;
        }
        if !self.sealed.swap(true, Ordering::AcqRel) {
            info!(path = ?self.path, max_offset = ?self.max_offset(), "segment sealed");
            events::emit(
                &self.events,
                SegmentEvent::Sealed {
                    path: self.path.clone(),
                    base_offset: self.base_offset,
                    max_offset: self.max_offset(),
                },
            );
        }
        Ok(())
    }

    // --- read path -------------------------------------------------------

    /// A batch stream positioned at the greatest index sample at or below
    /// `from_offset`, bounded by the flushed bytes.
    pub(crate) async fn read_stream(&self, from_offset: u64) -> Result<SegmentReadStream> {
        let position = {
            let inner = self.inner.lock().await;
            inner.index.find_position(from_offset)
        };
        let end = self.flushed_bytes.load(Ordering::Acquire);
        SegmentReadStream::open(&self.path, position.min(end), end, self.read_chunk).await
    }

    /// A batch stream at an explicit file position.
    pub(crate) async fn read_stream_at(&self, position: u64, end: u64) -> Result<SegmentReadStream> {
        SegmentReadStream::open(&self.path, position, end, self.read_chunk).await
    }

    /// First offset at or after `timestamp`, from the sparse time index.
    pub(crate) async fn offset_for_time(&self, timestamp: i64) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.index.find_offset_for_time(timestamp)
    }

    // --- structural changes ----------------------------------------------

    /// Discard every batch with `base_offset >= at`: locate the physical
    /// position of the first such batch, shrink the file and pull the
    /// tracker and index back.
    pub(crate) async fn truncate(&self, at: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(appender) = inner.appender.as_mut() {
            appender.flush().await?;
        }
        let current_len = match inner.appender.as_ref() {
            Some(appender) => appender.file_byte_offset(),
            None => self.written_bytes.load(Ordering::Acquire),
        };

        let (physical, new_dirty) = if at <= self.base_offset {
            (0, None)
        } else {
            let mut stream = SegmentReadStream::open(
                &self.path,
                inner.index.find_position(at).min(current_len),
                current_len,
                self.read_chunk,
            )
            .await?;
            while let Some(header) = stream.next_header().await? {
                if header.base_offset >= at {
                    break;
                }
                stream.skip(&header).await?;
            }
            (stream.position(), Some(at - 1))
        };

        info!(
            path = ?self.path,
            at,
            physical,
            dropped = current_len - physical,
            "truncating segment",
        );

        match inner.appender.as_mut() {
            Some(appender) => appender.truncate(physical).await?,
            None => truncate_file(&self.path, physical).await?,
        }
        inner.index.truncate(at);
        if self.is_sealed() {
            inner.index.flush().await?;
        }

        let raw_dirty = raw_offset(new_dirty);
        self.dirty_offset.store(raw_dirty, Ordering::Release);
        let committed = self.committed_offset.load(Ordering::Acquire);
        self.committed_offset
            .store(committed.min(raw_dirty), Ordering::Release);
        self.written_bytes.store(physical, Ordering::Release);
        let flushed = self.flushed_bytes.load(Ordering::Acquire);
        self.flushed_bytes
            .store(flushed.min(physical), Ordering::Release);
        Ok(())
    }

    /// Swap in the rewritten state after key compaction replaced the file.
    pub(crate) async fn install_compacted(
        &self,
        mut index: SegmentIndex,
        new_len: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        index.flush().await?;
        inner.index = index;
        self.written_bytes.store(new_len, Ordering::Release);
        self.flushed_bytes.store(new_len, Ordering::Release);
        self.compacted.store(true, Ordering::Release);
        Ok(())
    }

    /// Flush and release file handles. The segment object stays usable for
    /// metadata queries.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut appender) = inner.appender.take() {
            let dirty = self.dirty_offset.load(Ordering::Acquire);
            appender.flush().await?;
            let stable = appender.stable_bytes();
            appender.close().await?;
            self.committed_offset.store(dirty, Ordering::Release);
            self.flushed_bytes.store(stable, Ordering::Release);
        }
        inner.index.flush().await?;
        Ok(())
    }

    /// Remove the segment file and its index companions.
    pub(crate) async fn remove_files(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.appender = None;
        info!(path = ?self.path, "removing segment files");
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("unlink", &self.path, e)),
        }
        inner.index.remove_files().await
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("base_offset", &self.base_offset)
            .field("term", &self.term)
            .field("dirty_offset", &self.dirty_offset())
            .field("committed_offset", &self.committed_offset())
            .field("size_bytes", &self.size_bytes())
            .field("sealed", &self.is_sealed())
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}

pub(crate) async fn truncate_file(path: &Path, len: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| Error::io("open", path, e))?;
    file.set_len(len)
        .await
        .map_err(|e| Error::io("truncate", path, e))?;
    file.sync_data()
        .await
        .map_err(|e| Error::io("fsync", path, e))?;
    Ok(())
}
