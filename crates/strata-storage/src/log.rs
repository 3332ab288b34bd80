//! Log — The Per-Partition Public Object
//!
//! A `Log` owns one partition's segment set and is the only entry point
//! collaborators touch: append, flush, snapshot readers, suffix/prefix
//! truncation, garbage collection, and the term/collectible-offset inputs
//! supplied by consensus.
//!
//! ## Offset accounting
//!
//! ```text
//! start_offset     first readable offset (advanced by prefix truncation)
//! committed_offset greatest durable offset (advanced by flush/fsync)
//! dirty_offset     greatest written offset (possibly unflushed)
//! ```
//!
//! An empty log has no dirty/committed offset (`None`). Appends assign
//! `base_offset = dirty + 1` (or `start_offset` when empty) and stamp the
//! log's current term; bumping the term forces the next append onto a
//! fresh segment.
//!
//! ## Concurrency
//!
//! One async mutex (the *op lock*) serializes every operation that mutates
//! the segment set or the active segment: append, flush, roll, truncate,
//! and the scan/evict phases of garbage collection. Readers take a
//! snapshot under a brief lock acquisition and then run lock-free against
//! their pinned segments; the committed offset they observe is fixed at
//! creation, so a reader never sees data that was dirty when it started.
//! Compaction rewrites happen outside the op lock (they never touch the
//! active segment) but hold a separate lock that makes them exclusive with
//! truncation.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use strata_core::batch::BatchType;
use strata_core::RecordBatch;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch_cache::BatchCache;
use crate::compaction::{self, CompactionPhase, CompactionReport, GcConfig};
use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::events::SegmentEventSender;
use crate::ntp::Ntp;
use crate::reader::SegmentReadStream;
use crate::recovery;
use crate::segment::{self, Segment, SEGMENT_FORMAT_VERSION};
use crate::segment_set::SegmentSet;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn opt_offset(raw: i64) -> Option<u64> {
    (raw >= 0).then_some(raw as u64)
}

fn raw_offset(offset: Option<u64>) -> i64 {
    offset.map_or(-1, |o| o as i64)
}

/// Per-append knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendOptions {
    /// Flush before returning; on success the appended batches are durable
    /// and the committed offset covers them.
    pub fsync: bool,
}

/// What an append accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendInfo {
    pub base_offset: u64,
    pub last_offset: u64,
    pub byte_size: u64,
    pub append_time_ms: i64,
}

/// Reader configuration.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub start_offset: u64,
    /// Stop after accumulating this many batch bytes (the batch crossing
    /// the bound is still delivered). Zero means unlimited.
    pub max_bytes: u64,
    /// The deadline is only honored once at least this many bytes were
    /// delivered.
    pub min_bytes: u64,
    /// Only yield batches of this type; others are skipped without
    /// materializing their bodies.
    pub type_filter: Option<BatchType>,
    pub deadline: Option<Instant>,
    pub abort: Option<CancellationToken>,
}

/// The public offsets view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOffsets {
    pub start_offset: u64,
    pub committed_offset: Option<u64>,
    pub dirty_offset: Option<u64>,
    pub last_term: u64,
}

struct LogState {
    segments: SegmentSet,
    term: u64,
    /// Offset the next appended batch receives.
    next_offset: u64,
    dirty: Option<u64>,
    committed: Option<u64>,
    collectible: Option<u64>,
    phase: CompactionPhase,
}

struct LogInner {
    ntp: Ntp,
    dir: PathBuf,
    config: LogConfig,
    state: Mutex<LogState>,
    /// Exclusive between garbage collection and truncation; acquired
    /// before the op lock when both are needed.
    gc_lock: Mutex<()>,
    committed: AtomicI64,
    dirty: AtomicI64,
    start_offset: AtomicU64,
    term: AtomicU64,
    closed: AtomicBool,
    cache: Option<Arc<BatchCache>>,
    events: Option<SegmentEventSender>,
}

/// One partition's log. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Log {
    inner: Arc<LogInner>,
}

impl Log {
    /// Open (or create) the log for `ntp` under `config.base_dir`,
    /// discovering existing segments and recovering the tail.
    pub(crate) async fn open(
        ntp: Ntp,
        config: LogConfig,
        cache: Option<Arc<BatchCache>>,
        events: Option<SegmentEventSender>,
    ) -> Result<Log> {
        let dir = config.base_dir.join(ntp.path());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io("mkdir", &dir, e))?;

        let metas = discover_segments(&dir).await?;
        let mut segments = SegmentSet::new();
        let count = metas.len();
        for (i, (meta, path)) in metas.into_iter().enumerate() {
            if i + 1 == count {
                if let Some(tail) =
                    recovery::recover_segment(&path, meta, &config, events.clone(), None).await?
                {
                    segments.insert(tail);
                }
            } else {
                segments.insert(Segment::open_sealed(&path, meta, &config).await?);
            }
        }

        let start_offset = segments.first().map_or(0, |s| s.base_offset());
        let term = segments.last().map_or(0, |s| s.term());
        let dirty = segments
            .iter()
            .rev()
            .find_map(|s| s.dirty_offset());
        let next_offset = dirty.map_or(start_offset, |d| d + 1);

        info!(
            ntp = %ntp,
            segments = segments.len(),
            start_offset,
            dirty_offset = ?dirty,
            "log opened",
        );

        Ok(Log {
            inner: Arc::new(LogInner {
                ntp,
                dir,
                config,
                state: Mutex::new(LogState {
                    segments,
                    term,
                    next_offset,
                    dirty,
                    committed: dirty,
                    collectible: None,
                    phase: CompactionPhase::Idle,
                }),
                gc_lock: Mutex::new(()),
                committed: AtomicI64::new(raw_offset(dirty)),
                dirty: AtomicI64::new(raw_offset(dirty)),
                start_offset: AtomicU64::new(start_offset),
                term: AtomicU64::new(term),
                closed: AtomicBool::new(false),
                cache,
                events,
            }),
        })
    }

    pub fn ntp(&self) -> &Ntp {
        &self.inner.ntp
    }

    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    /// The current offsets view; lock-free.
    pub fn offsets(&self) -> LogOffsets {
        LogOffsets {
            start_offset: self.inner.start_offset.load(Ordering::Acquire),
            committed_offset: opt_offset(self.inner.committed.load(Ordering::Acquire)),
            dirty_offset: opt_offset(self.inner.dirty.load(Ordering::Acquire)),
            last_term: self.inner.term.load(Ordering::Acquire),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    // --- write path ------------------------------------------------------

    /// Append a set of batches, assigning offsets and stamping the current
    /// term. Rolls onto a fresh segment when the active one crossed its
    /// size/batch budget or carries an older term.
    pub async fn append(
        &self,
        mut batches: Vec<RecordBatch>,
        options: AppendOptions,
    ) -> Result<AppendInfo> {
        self.check_open()?;
        if batches.is_empty() {
            return Err(Error::InvalidArgument("append of zero batches".to_string()));
        }
        let mut state = self.inner.state.lock().await;

        let base_offset = state.next_offset;
        let mut byte_size = 0u64;
        for batch in &mut batches {
            self.maybe_roll(&mut state).await?;
            batch.header.base_offset = state.next_offset;
            batch.term = state.term;

            let active = state
                .segments
                .last()
                .expect("roll guarantees an active segment")
                .clone();
            active.append(batch).await?;

            byte_size += batch.header.size_bytes as u64;
            state.next_offset = batch.last_offset() + 1;
            state.dirty = Some(batch.last_offset());
            self.inner
                .dirty
                .store(batch.last_offset() as i64, Ordering::Release);

            if let Some(cache) = &self.inner.cache {
                cache.put(&self.inner.ntp, batch.clone()).await;
            }
        }
        let last_offset = state.next_offset - 1;

        if options.fsync {
            self.flush_locked(&mut state).await?;
        }

        Ok(AppendInfo {
            base_offset,
            last_offset,
            byte_size,
            append_time_ms: now_ms(),
        })
    }

    /// Make every appended batch durable; afterwards
    /// `committed_offset == dirty_offset`.
    pub async fn flush(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut LogState) -> Result<()> {
        if let Some(active) = state.segments.last() {
            if !active.is_sealed() {
                active.flush().await?;
            }
        }
        state.committed = state.dirty;
        self.inner
            .committed
            .store(raw_offset(state.committed), Ordering::Release);
        Ok(())
    }

    /// Roll to a fresh segment if the active one cannot take the next
    /// append in the current term.
    async fn maybe_roll(&self, state: &mut LogState) -> Result<()> {
        let reason = match state.segments.last().cloned() {
            None => "first segment",
            Some(active) if active.is_sealed() => "tail is sealed",
            Some(active) if active.term() != state.term => {
                if active.dirty_offset().is_none() {
                    // An empty active segment of an older term is useless:
                    // replace it rather than sealing an empty file.
                    state.segments.pop_back();
                    active.mark_tombstone();
                    active.close().await?;
                    active.remove_files().await?;
                } else {
                    active.seal().await?;
                }
                "term changed"
            }
            Some(active) if active.size_bytes() >= self.inner.config.max_segment_size => {
                active.seal().await?;
                "segment size budget"
            }
            Some(active)
                if self
                    .inner
                    .config
                    .max_segment_batches
                    .is_some_and(|max| active.batch_count() >= max) =>
            {
                active.seal().await?;
                "segment batch budget"
            }
            Some(_) => return Ok(()),
        };

        info!(ntp = %self.inner.ntp, base_offset = state.next_offset, reason, "rolling segment");
        let segment = Segment::create(
            &self.inner.dir,
            state.next_offset,
            state.term,
            &self.inner.config,
            self.inner.events.clone(),
        )
        .await?;
        state.segments.insert(segment);
        Ok(())
    }

    // --- read path -------------------------------------------------------

    /// Build a reader over `[start_offset, committed]` as of now. The
    /// reader pins every segment it visits; pinned segments survive
    /// retention until the reader drops.
    pub async fn make_reader(&self, options: ReadOptions) -> Result<LogReader> {
        self.check_open()?;
        let state = self.inner.state.lock().await;
        let log_start = self.inner.start_offset.load(Ordering::Acquire);
        if options.start_offset < log_start || options.start_offset > state.next_offset {
            return Err(Error::OutOfRange {
                offset: options.start_offset,
                start: log_start,
                next: state.next_offset,
            });
        }
        let committed = state.committed;
        let mut segments = VecDeque::new();
        if let Some(committed) = committed {
            for segment in state.segments.iter() {
                let Some(max) = segment.max_offset() else {
                    continue;
                };
                if max < options.start_offset || segment.base_offset() > committed {
                    continue;
                }
                segments.push_back(segment.clone());
            }
        }
        drop(state);

        Ok(LogReader {
            ntp: self.inner.ntp.clone(),
            cache: self.inner.cache.clone(),
            segments,
            visited: Vec::new(),
            stream: None,
            current_term: 0,
            committed,
            options,
            bytes_emitted: 0,
            done: false,
        })
    }

    /// First offset whose batch timestamp reaches `timestamp`, for
    /// time-based reads.
    pub async fn offset_for_time(&self, timestamp: i64) -> Result<Option<u64>> {
        self.check_open()?;
        let segments: Vec<Arc<Segment>> = {
            let state = self.inner.state.lock().await;
            state.segments.iter().cloned().collect()
        };
        for segment in segments {
            if segment.max_timestamp() < timestamp {
                continue;
            }
            if let Some(offset) = segment.offset_for_time(timestamp).await {
                return Ok(Some(offset));
            }
            return Ok(Some(segment.base_offset()));
        }
        Ok(None)
    }

    // --- truncation ------------------------------------------------------

    /// Suffix truncate: discard every batch with `base_offset >= at`.
    ///
    /// `at` at or below the start offset clears the whole log (the
    /// documented resolution of the boundary case). Truncating beyond the
    /// end is an `InvalidArgument`. Readers created before the call keep
    /// their snapshot; new readers observe the truncated state.
    pub async fn truncate(&self, at: u64) -> Result<()> {
        self.check_open()?;
        let _gc = self.inner.gc_lock.lock().await;
        let mut state = self.inner.state.lock().await;
        if at > state.next_offset {
            return Err(Error::InvalidArgument(format!(
                "truncation offset {at} past the end of the log ({})",
                state.next_offset
            )));
        }

        let start = self.inner.start_offset.load(Ordering::Acquire);
        if at <= start {
            info!(ntp = %self.inner.ntp, at, "truncating whole log");
            for segment in state.segments.drain() {
                segment.mark_tombstone();
                segment.close().await?;
                segment.remove_files().await?;
            }
            state.next_offset = start;
            state.dirty = None;
            state.committed = None;
        } else {
            info!(ntp = %self.inner.ntp, at, "truncating log suffix");
            while let Some(last) = state.segments.last() {
                if last.base_offset() < at {
                    break;
                }
                let removed = state.segments.pop_back().expect("checked non-empty");
                removed.mark_tombstone();
                removed.close().await?;
                removed.remove_files().await?;
            }
            if let Some(last) = state.segments.last().cloned() {
                if last.dirty_offset().is_some_and(|d| d >= at) {
                    last.truncate(at).await?;
                }
            }
            state.dirty = state.segments.last().and_then(|s| s.dirty_offset());
            state.committed = match (state.committed, state.dirty) {
                (Some(c), Some(d)) => Some(c.min(d)),
                _ => state.dirty,
            };
            state.next_offset = at;
        }

        self.inner
            .dirty
            .store(raw_offset(state.dirty), Ordering::Release);
        self.inner
            .committed
            .store(raw_offset(state.committed), Ordering::Release);
        if let Some(cache) = &self.inner.cache {
            let invalidate_from = if at <= start { 0 } else { at };
            cache.truncate(&self.inner.ntp, invalidate_from).await;
        }
        Ok(())
    }

    /// Prefix truncate: advance the start offset to `at` and delete whole
    /// segments entirely below it. The containing segment is not
    /// rewritten; reads below `at` fail with `OutOfRange`.
    pub async fn truncate_prefix(&self, at: u64) -> Result<()> {
        self.check_open()?;
        let _gc = self.inner.gc_lock.lock().await;
        let mut state = self.inner.state.lock().await;
        let start = self.inner.start_offset.load(Ordering::Acquire);
        if at <= start {
            return Ok(());
        }

        info!(ntp = %self.inner.ntp, at, "truncating log prefix");
        while let Some(first) = state.segments.first() {
            match first.max_offset() {
                Some(max) if max < at => {
                    let removed = state.segments.pop_front().expect("checked non-empty");
                    removed.mark_tombstone();
                    removed.close().await?;
                    removed.remove_files().await?;
                }
                _ => break,
            }
        }
        self.inner.start_offset.store(at, Ordering::Release);
        if at > state.next_offset {
            state.next_offset = at;
            state.dirty = None;
            state.committed = None;
            self.inner.dirty.store(-1, Ordering::Release);
            self.inner.committed.store(-1, Ordering::Release);
        }
        Ok(())
    }

    // --- garbage collection ----------------------------------------------

    /// Run one retention + compaction cycle:
    /// `idle → scanning → evicting → compacting → idle`.
    pub async fn compact(&self, gc: &GcConfig) -> Result<CompactionReport> {
        self.check_open()?;
        let _gc_guard = self.inner.gc_lock.lock().await;
        let mut report = CompactionReport::default();

        // Scanning + evicting mutate the set and run under the op lock.
        let mut state = self.inner.state.lock().await;
        state.phase = CompactionPhase::Scanning;
        let candidates = if self.inner.config.cleanup_policy.has_deletion() {
            self.retention_candidates(&state, gc)
        } else {
            Vec::new()
        };

        state.phase = CompactionPhase::Evicting;
        let mut deferred = false;
        for base_offset in candidates {
            if gc.abort.as_ref().is_some_and(|t| t.is_cancelled()) {
                state.phase = CompactionPhase::Idle;
                return Err(Error::Aborted);
            }
            let Some(first) = state.segments.first() else {
                break;
            };
            if first.base_offset() != base_offset || deferred {
                report.segments_deferred += 1;
                continue;
            }
            if Arc::strong_count(first) > 1 {
                // A reader still pins this segment; everything behind it
                // must wait too, or the log would grow a hole.
                deferred = true;
                report.segments_deferred += 1;
                continue;
            }
            let removed = state.segments.pop_front().expect("checked non-empty");
            let new_start = removed.max_offset().map_or(removed.base_offset(), |m| m + 1);
            removed.mark_tombstone();
            removed.close().await?;
            report.bytes_reclaimed += removed.size_bytes();
            removed.remove_files().await?;
            let start = self.inner.start_offset.load(Ordering::Acquire);
            self.inner
                .start_offset
                .store(start.max(new_start), Ordering::Release);
            report.segments_evicted += 1;
            info!(
                ntp = %self.inner.ntp,
                base_offset,
                new_start_offset = start.max(new_start),
                "segment evicted by retention",
            );
        }

        // Compaction rewrites run without the op lock; appends proceed.
        let compactable: Vec<Arc<Segment>> = if self.inner.config.cleanup_policy.has_compaction() {
            state
                .segments
                .iter()
                .filter(|s| s.is_sealed() && !s.is_compacted() && !s.is_tombstone())
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        state.phase = CompactionPhase::Compacting;
        drop(state);

        let mut rewrite_result = Ok(());
        for segment in compactable {
            // Two references are ours (the set and this loop); more means
            // a reader pins the segment — its bytes must not change under
            // the handle, so the rewrite waits for the next cycle.
            if Arc::strong_count(&segment) > 2 {
                report.segments_deferred += 1;
                continue;
            }
            match compaction::self_compact_segment(&segment, &self.inner.config, &gc.abort).await {
                Ok(outcome) if outcome.rewritten => {
                    if let Some(cache) = &self.inner.cache {
                        cache.truncate(&self.inner.ntp, segment.base_offset()).await;
                    }
                    report.segments_compacted += 1;
                    report.records_removed += outcome.records_removed;
                    report.bytes_reclaimed += outcome.bytes_reclaimed;
                }
                Ok(_) => {}
                Err(e) => {
                    rewrite_result = Err(e);
                    break;
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        state.phase = CompactionPhase::Idle;
        drop(state);
        rewrite_result?;
        Ok(report)
    }

    /// Sealed prefix of the set eligible for retention eviction.
    fn retention_candidates(&self, state: &LogState, gc: &GcConfig) -> Vec<u64> {
        let Some(collectible) = state.collectible else {
            return Vec::new();
        };
        let total_size = state.segments.size_bytes();
        let mut excess = gc
            .max_bytes
            .map_or(0, |budget| total_size.saturating_sub(budget));

        let mut candidates = Vec::new();
        for segment in state.segments.iter() {
            if !segment.is_sealed() {
                break;
            }
            let Some(max) = segment.max_offset() else {
                break;
            };
            if max > collectible {
                break;
            }
            let by_time = gc
                .eviction_time_ms
                .is_some_and(|watermark| segment.max_timestamp() < watermark);
            let by_size = excess > 0;
            if !by_time && !by_size {
                break;
            }
            if by_size {
                excess = excess.saturating_sub(segment.size_bytes());
            }
            candidates.push(segment.base_offset());
        }
        candidates
    }

    /// Where the garbage-collection cycle currently stands.
    pub async fn compaction_phase(&self) -> CompactionPhase {
        self.inner.state.lock().await.phase
    }

    // --- consensus inputs ------------------------------------------------

    /// Bump the term; the next append rolls onto a fresh segment. Terms
    /// never go backwards.
    pub async fn set_term(&self, term: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock().await;
        if term < state.term {
            return Err(Error::InvalidArgument(format!(
                "term {term} below the current term {}",
                state.term
            )));
        }
        state.term = term;
        self.inner.term.store(term, Ordering::Release);
        Ok(())
    }

    /// Raise the upper bound retention may collect up to.
    pub async fn set_collectible_offset(&self, offset: u64) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.state.lock().await;
        if state.collectible.is_some_and(|cur| offset < cur) {
            return Err(Error::InvalidArgument(format!(
                "collectible offset {offset} below the current bound {}",
                state.collectible.unwrap()
            )));
        }
        state.collectible = Some(offset);
        Ok(())
    }

    /// Flush everything and release file handles. Every later operation
    /// fails with `AlreadyClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _gc = self.inner.gc_lock.lock().await;
        let mut state = self.inner.state.lock().await;
        let flush_result = async {
            if let Some(active) = state.segments.last() {
                if !active.is_sealed() {
                    active.flush().await?;
                }
            }
            Ok::<_, Error>(())
        }
        .await;
        if flush_result.is_ok() {
            state.committed = state.dirty;
            self.inner
                .committed
                .store(raw_offset(state.committed), Ordering::Release);
        }
        for segment in state.segments.iter() {
            segment.close().await?;
        }
        info!(ntp = %self.inner.ntp, "log closed");
        flush_result
    }
}

/// Discover `(meta, path)` pairs for every segment file in `dir`, clean up
/// stale compaction intermediates, and remove orphaned index side files.
async fn discover_segments(
    dir: &PathBuf,
) -> Result<Vec<(segment::SegmentMeta, PathBuf)>> {
    let mut metas = Vec::new();
    let mut index_files = Vec::new();

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io("readdir", dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io("readdir", dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            warn!(path = ?entry.path(), "skipping non-utf8 file name");
            continue;
        };
        if name.ends_with(".compacted") {
            warn!(path = ?entry.path(), "removing stale compaction intermediate");
            tokio::fs::remove_file(entry.path())
                .await
                .map_err(|e| Error::io("unlink", entry.path(), e))?;
            continue;
        }
        if name.ends_with(".cannotrecover") {
            warn!(path = ?entry.path(), "ignoring quarantined segment");
            continue;
        }
        if name.ends_with(".base_index") || name.ends_with(".timestamp_index") {
            index_files.push(entry.path());
            continue;
        }
        if name == crate::snapshot::SNAPSHOT_FILENAME
            || name == crate::snapshot::SNAPSHOT_PARTIAL_FILENAME
        {
            continue;
        }
        match segment::parse_segment_filename(name) {
            Some(meta) if meta.version == SEGMENT_FORMAT_VERSION => {
                metas.push((meta, entry.path()));
            }
            Some(meta) => {
                warn!(path = ?entry.path(), version = meta.version, "skipping segment with unsupported version");
            }
            None => {
                warn!(path = ?entry.path(), "skipping unrecognized file");
            }
        }
    }

    metas.sort_by_key(|(meta, _)| meta.base_offset);

    // Index side files without a living segment are orphans.
    for index_path in index_files {
        let as_str = index_path.to_string_lossy();
        let log_path = as_str
            .strip_suffix(".base_index")
            .or_else(|| as_str.strip_suffix(".timestamp_index"))
            .map(PathBuf::from);
        let orphaned = log_path.map_or(true, |log| !metas.iter().any(|(_, p)| *p == log));
        if orphaned {
            warn!(path = ?index_path, "removing orphaned index file");
            tokio::fs::remove_file(&index_path)
                .await
                .map_err(|e| Error::io("unlink", &index_path, e))?;
        }
    }

    Ok(metas)
}

/// A snapshot reader over one log. Yields batches in offset order, pinning
/// every segment it visits so retention cannot delete them mid-read.
pub struct LogReader {
    ntp: Ntp,
    cache: Option<Arc<BatchCache>>,
    segments: VecDeque<Arc<Segment>>,
    /// Segments already opened, kept to pin them for the reader's
    /// lifetime.
    visited: Vec<Arc<Segment>>,
    stream: Option<SegmentReadStream>,
    current_term: u64,
    committed: Option<u64>,
    options: ReadOptions,
    bytes_emitted: u64,
    done: bool,
}

impl LogReader {
    /// The next batch, or `None` when the snapshot is exhausted or a
    /// limit was reached.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self
                .options
                .abort
                .as_ref()
                .is_some_and(|t| t.is_cancelled())
            {
                return Err(Error::Aborted);
            }
            let Some(committed) = self.committed else {
                self.done = true;
                return Ok(None);
            };
            if self.bytes_emitted >= self.options.min_bytes {
                if let Some(deadline) = self.options.deadline {
                    if Instant::now() >= deadline {
                        self.done = true;
                        return Ok(None);
                    }
                }
            }

            if self.stream.is_none() {
                let Some(segment) = self.segments.pop_front() else {
                    self.done = true;
                    return Ok(None);
                };
                let from = self.options.start_offset.max(segment.base_offset());
                self.stream = Some(segment.read_stream(from).await?);
                self.current_term = segment.term();
                self.visited.push(segment);
            }
            let stream = self.stream.as_mut().expect("stream just ensured");

            let Some(header) = stream.next_header().await? else {
                self.stream = None;
                continue;
            };
            if header.last_offset() < self.options.start_offset {
                stream.skip(&header).await?;
                continue;
            }
            if header.base_offset > committed {
                self.done = true;
                return Ok(None);
            }
            if self
                .options
                .type_filter
                .is_some_and(|t| t != header.batch_type)
            {
                stream.skip(&header).await?;
                continue;
            }

            let batch = match &self.cache {
                Some(cache) => match cache.get(&self.ntp, header.base_offset).await {
                    Some(cached) => {
                        stream.skip(&header).await?;
                        cached
                    }
                    None => {
                        let mut batch = stream.take(&header).await?;
                        batch.term = self.current_term;
                        batch
                    }
                },
                None => {
                    let mut batch = stream.take(&header).await?;
                    batch.term = self.current_term;
                    batch
                }
            };

            self.bytes_emitted += batch.header.size_bytes as u64;
            if self.options.max_bytes > 0 && self.bytes_emitted >= self.options.max_bytes {
                self.done = true;
            }
            return Ok(Some(batch));
        }
    }

    /// Drain the reader into a vector.
    pub async fn read_all(&mut self) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            out.push(batch);
        }
        Ok(out)
    }

    /// Segments this reader holds open (and thereby protects from
    /// deletion).
    pub fn pinned_segments(&self) -> usize {
        self.visited.len() + self.segments.len()
    }
}
