//! Strata Storage Engine
//!
//! An append-only, segmented, per-partition log. Record batches are
//! persisted in order, indexed for offset- and time-based random access,
//! recovered after unclean shutdown, truncated on divergence, and reclaimed
//! by retention or key compaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  manage(ntp)   ┌─────────────┐
//! │ LogManager │ ─────────────► │     Log     │  append / read / truncate
//! └────────────┘                └──────┬──────┘
//!        │ shares                      │ owns
//!        ▼                             ▼
//! ┌────────────┐                ┌─────────────┐      ┌──────────────────┐
//! │ BatchCache │                │ SegmentSet  │ ───► │     Segment      │
//! └────────────┘                └─────────────┘      │ appender + index │
//!                                                    └──────────────────┘
//! ```
//!
//! On disk, one directory per partition:
//!
//! ```text
//! <base_dir>/<namespace>/<topic>/<partition>/
//!     0-1-v1.log                     segment: batches of term 1
//!     0-1-v1.log.base_index          sparse offset → position index
//!     0-1-v1.log.timestamp_index     sparse time → offset index
//!     4711-2-v1.log                  the active segment (term 2)
//!     snapshot                       consensus snapshot
//! ```
//!
//! ## Guarantees
//!
//! - Appends are totally ordered; batch `base_offset`s are assigned
//!   contiguously and never reused.
//! - A successful flush means every prior append is on stable storage and
//!   covered by the committed offset.
//! - Readers are snapshots: they never observe dirty data, and the
//!   segments they visit cannot be deleted under them.
//! - Recovery truncates torn tail writes; sealed segments are immutable
//!   and any corruption inside them is surfaced, never repaired silently.
//!
//! ## Example
//!
//! ```ignore
//! use strata_storage::{AppendOptions, LogConfig, LogManager, Ntp, ReadOptions};
//!
//! let manager = LogManager::new(LogConfig::new("/var/lib/strata"));
//! let log = manager.manage(Ntp::new("kafka", "orders", 0), None).await?;
//!
//! log.append(batches, AppendOptions { fsync: true }).await?;
//!
//! let mut reader = log.make_reader(ReadOptions::default()).await?;
//! while let Some(batch) = reader.next_batch().await? {
//!     // ...
//! }
//! ```

pub mod appender;
pub mod batch_cache;
pub mod compaction;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod log;
pub mod manager;
pub mod ntp;
pub mod reader;
pub mod recovery;
pub mod segment;
pub mod segment_set;
pub mod snapshot;

pub use batch_cache::{BatchCache, BatchCacheStats};
pub use compaction::{CompactionPhase, CompactionReport, GcConfig};
pub use config::{CleanupPolicy, LogConfig, NtpOverrides, Retention};
pub use error::{Error, Result};
pub use events::{SegmentEvent, SegmentEventReceiver, SegmentEventSender};
pub use log::{AppendInfo, AppendOptions, Log, LogOffsets, LogReader, ReadOptions};
pub use manager::LogManager;
pub use ntp::Ntp;
pub use segment::Segment;
pub use snapshot::{SnapshotManager, SnapshotMeta};
