//! Storage Configuration
//!
//! `LogConfig` controls how segments are created, flushed, indexed, read and
//! reclaimed:
//!
//! - **max_segment_size**: roll the active segment on the next append once it
//!   crosses this size (default: 64 MiB)
//! - **writer_flush_period**: durable-flush cadence for active segments
//!   (default: 100 ms)
//! - **max_bytes_in_writer_cache**: dirty bytes the appender may hold before
//!   the write path backpressures (default: 1 MiB)
//! - **index_step**: bytes between offset-index samples (default: 32 KiB)
//! - **default_read_buffer_size**: reader coalescing size (default: 128 KiB)
//! - **cleanup_policy**: whole-segment deletion, key compaction, or both
//! - **retention_bytes / retention_time_ms**: tri-state retention bounds —
//!   inherit the process default, disabled, or an explicit limit
//! - **sanitize_files**: debug mode hook for I/O fault injection
//!
//! Per-partition deviations from the process-wide config travel as
//! [`NtpOverrides`] through `LogManager::manage`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Root of the storage tree.
    pub base_dir: PathBuf,

    /// Soft segment size cap triggering a roll on the next append.
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Periodic fsync cadence for active segments.
    #[serde(default = "default_writer_flush_period", with = "duration_ms")]
    pub writer_flush_period: Duration,

    /// Soft upper bound on dirty bytes in the writer cache.
    #[serde(default = "default_writer_cache_bytes")]
    pub max_bytes_in_writer_cache: usize,

    /// Bytes between offset-index samples.
    #[serde(default = "default_index_step")]
    pub index_step: u32,

    /// Initial reader coalescing size.
    #[serde(default = "default_read_buffer_size")]
    pub default_read_buffer_size: usize,

    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,

    #[serde(default)]
    pub retention_bytes: Retention,

    #[serde(default)]
    pub retention_time_ms: Retention,

    /// Debug mode inserting I/O fault injection hooks.
    #[serde(default)]
    pub sanitize_files: bool,

    /// Byte budget of the shared decoded-batch cache.
    #[serde(default = "default_batch_cache_bytes")]
    pub batch_cache_bytes: u64,

    /// Optional cap on batches per segment; crossing it rolls the segment.
    #[serde(default)]
    pub max_segment_batches: Option<u32>,
}

impl LogConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_segment_size: default_max_segment_size(),
            writer_flush_period: default_writer_flush_period(),
            max_bytes_in_writer_cache: default_writer_cache_bytes(),
            index_step: default_index_step(),
            default_read_buffer_size: default_read_buffer_size(),
            cleanup_policy: CleanupPolicy::default(),
            retention_bytes: Retention::default(),
            retention_time_ms: Retention::default(),
            sanitize_files: false,
            batch_cache_bytes: default_batch_cache_bytes(),
            max_segment_batches: None,
        }
    }

    /// Apply per-partition overrides on top of this config.
    pub(crate) fn with_overrides(&self, overrides: &NtpOverrides) -> LogConfig {
        let mut config = self.clone();
        if let Some(policy) = overrides.cleanup_policy {
            config.cleanup_policy = policy;
        }
        if let Some(retention) = overrides.retention_bytes {
            config.retention_bytes = retention;
        }
        if let Some(retention) = overrides.retention_time_ms {
            config.retention_time_ms = retention;
        }
        if let Some(size) = overrides.max_segment_size {
            config.max_segment_size = size;
        }
        if let Some(batches) = overrides.max_segment_batches {
            config.max_segment_batches = Some(batches);
        }
        config
    }
}

/// How space is reclaimed for a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Whole-segment deletion by retention.
    #[default]
    Delete,
    /// Key compaction of sealed segments.
    Compact,
    /// Both.
    DeleteAndCompact,
}

impl CleanupPolicy {
    pub fn has_deletion(&self) -> bool {
        matches!(self, CleanupPolicy::Delete | CleanupPolicy::DeleteAndCompact)
    }

    pub fn has_compaction(&self) -> bool {
        matches!(self, CleanupPolicy::Compact | CleanupPolicy::DeleteAndCompact)
    }
}

/// Tri-state retention bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Inherit the process-wide default.
    #[default]
    Inherit,
    /// Retention explicitly switched off.
    Disabled,
    /// An explicit limit (bytes or milliseconds, by field).
    Limit(u64),
}

impl Retention {
    pub fn resolve(&self, inherited: Option<u64>) -> Option<u64> {
        match self {
            Retention::Inherit => inherited,
            Retention::Disabled => None,
            Retention::Limit(value) => Some(*value),
        }
    }
}

/// Per-partition config deviations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NtpOverrides {
    pub cleanup_policy: Option<CleanupPolicy>,
    pub retention_bytes: Option<Retention>,
    pub retention_time_ms: Option<Retention>,
    pub max_segment_size: Option<u64>,
    pub max_segment_batches: Option<u32>,
}

/// Serde helpers for Duration fields expressed in milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

fn default_max_segment_size() -> u64 {
    64 * 1024 * 1024
}

fn default_writer_flush_period() -> Duration {
    Duration::from_millis(100)
}

fn default_writer_cache_bytes() -> usize {
    1024 * 1024
}

fn default_index_step() -> u32 {
    32 * 1024
}

fn default_read_buffer_size() -> usize {
    128 * 1024
}

fn default_batch_cache_bytes() -> u64 {
    8 * 1024 * 1024
}
