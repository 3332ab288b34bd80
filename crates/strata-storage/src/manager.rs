//! Log Manager
//!
//! The access point for creating, obtaining and shutting down logs. Each
//! partition must be brought under management before use:
//!
//! ```ignore
//! let manager = LogManager::new(LogConfig::new("/var/lib/strata"));
//! let log = manager.manage(Ntp::new("kafka", "orders", 0), None).await?;
//! log.append(batches, AppendOptions { fsync: true }).await?;
//! ```
//!
//! `manage` creates the partition directory, discovers and opens existing
//! segments, recovers the tail after an unclean shutdown, and registers the
//! log under its NTP. Resources shared across partitions live here: the
//! decoded-batch cache and the segment event channel.
//!
//! ## Shutdown
//!
//! `stop` closes every managed log in parallel and refuses further
//! `manage` calls. Individual close failures are logged and do not keep
//! the remaining logs from closing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::batch_cache::BatchCache;
use crate::compaction::{CompactionReport, GcConfig};
use crate::config::{LogConfig, NtpOverrides};
use crate::error::{Error, Result};
use crate::events::{self, SegmentEventReceiver, SegmentEventSender};
use crate::log::Log;
use crate::ntp::Ntp;

pub struct LogManager {
    config: LogConfig,
    logs: RwLock<HashMap<Ntp, Log>>,
    cache: Arc<BatchCache>,
    events_tx: SegmentEventSender,
    events_rx: std::sync::Mutex<Option<SegmentEventReceiver>>,
    stopped: AtomicBool,
}

impl LogManager {
    pub fn new(config: LogConfig) -> Self {
        let (events_tx, events_rx) = events::channel();
        let cache = Arc::new(BatchCache::new(config.batch_cache_bytes));
        Self {
            config,
            logs: RwLock::new(HashMap::new()),
            cache,
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// The segment event stream. Can be taken once; `None` afterwards.
    pub fn take_event_stream(&self) -> Option<SegmentEventReceiver> {
        self.events_rx.lock().expect("event receiver lock").take()
    }

    /// Bring a partition under management, opening or recovering its log.
    /// Managing the same NTP twice returns the existing log.
    pub async fn manage(&self, ntp: Ntp, overrides: Option<NtpOverrides>) -> Result<Log> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        {
            let logs = self.logs.read().await;
            if let Some(log) = logs.get(&ntp) {
                return Ok(log.clone());
            }
        }

        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get(&ntp) {
            return Ok(log.clone());
        }

        let config = match &overrides {
            Some(overrides) => self.config.with_overrides(overrides),
            None => self.config.clone(),
        };
        let log = Log::open(
            ntp.clone(),
            config,
            Some(self.cache.clone()),
            Some(self.events_tx.clone()),
        )
        .await?;
        logs.insert(ntp.clone(), log.clone());
        info!(ntp = %ntp, total_logs = logs.len(), "partition under management");
        Ok(log)
    }

    /// The log for `ntp`, if managed.
    pub async fn get(&self, ntp: &Ntp) -> Option<Log> {
        self.logs.read().await.get(ntp).cloned()
    }

    /// Number of managed logs.
    pub async fn size(&self) -> usize {
        self.logs.read().await.len()
    }

    pub fn cache(&self) -> &Arc<BatchCache> {
        &self.cache
    }

    /// Run a retention/compaction cycle on every managed log. Retention
    /// watermarks are derived from each log's tri-state retention config;
    /// logs without any resolved bound are skipped.
    pub async fn housekeeping(&self, now_ms: i64) -> Result<Vec<(Ntp, CompactionReport)>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        let logs: Vec<(Ntp, Log)> = {
            let logs = self.logs.read().await;
            logs.iter().map(|(n, l)| (n.clone(), l.clone())).collect()
        };

        let mut reports = Vec::new();
        for (ntp, log) in logs {
            let config = log.config();
            let retention_ms = config.retention_time_ms.resolve(None);
            let retention_bytes = config.retention_bytes.resolve(None);
            let compacting = config.cleanup_policy.has_compaction();
            if retention_ms.is_none() && retention_bytes.is_none() && !compacting {
                continue;
            }
            let gc = GcConfig {
                eviction_time_ms: retention_ms.map(|ms| now_ms.saturating_sub(ms as i64)),
                max_bytes: retention_bytes,
                abort: None,
            };
            let report = log.compact(&gc).await?;
            reports.push((ntp, report));
        }
        Ok(reports)
    }

    /// Close every managed log in parallel. The manager refuses new work
    /// afterwards.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let logs: Vec<(Ntp, Log)> = {
            let mut logs = self.logs.write().await;
            logs.drain().collect()
        };
        info!(count = logs.len(), "stopping log manager");

        let closes = logs.into_iter().map(|(ntp, log)| async move {
            if let Err(e) = log.close().await {
                error!(ntp = %ntp, error = %e, "failed to close log");
                return Err(e);
            }
            Ok(())
        });
        let results = futures::future::join_all(closes).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::AppendOptions;
    use bytes::Bytes;
    use strata_core::batch::RecordBatchBuilder;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> LogConfig {
        let mut config = LogConfig::new(dir.path());
        config.writer_flush_period = std::time::Duration::from_secs(3600);
        config
    }

    fn one_batch(value: &str) -> Vec<strata_core::RecordBatch> {
        vec![RecordBatchBuilder::data(0)
            .record(1_000, None, Bytes::from(value.to_string()))
            .build()]
    }

    #[tokio::test]
    async fn test_manage_creates_partition_directory() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::new(test_config(&dir));
        let ntp = Ntp::new("kafka", "orders", 2);
        manager.manage(ntp.clone(), None).await.unwrap();
        assert!(dir.path().join("kafka/orders/2").is_dir());
        assert_eq!(manager.size().await, 1);
    }

    #[tokio::test]
    async fn test_manage_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::new(test_config(&dir));
        let ntp = Ntp::new("kafka", "orders", 0);
        let first = manager.manage(ntp.clone(), None).await.unwrap();
        first
            .append(one_batch("a"), AppendOptions { fsync: true })
            .await
            .unwrap();

        let second = manager.manage(ntp, None).await.unwrap();
        // Same underlying log: the second handle sees the append.
        assert_eq!(second.offsets().dirty_offset, Some(0));
        assert_eq!(manager.size().await, 1);
    }

    #[tokio::test]
    async fn test_get_unmanaged_is_none() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::new(test_config(&dir));
        assert!(manager.get(&Ntp::new("a", "b", 0)).await.is_none());
    }

    #[tokio::test]
    async fn test_overrides_take_effect() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::new(test_config(&dir));
        let overrides = NtpOverrides {
            max_segment_size: Some(1),
            ..NtpOverrides::default()
        };
        let log = manager
            .manage(Ntp::new("kafka", "tiny", 0), Some(overrides))
            .await
            .unwrap();
        assert_eq!(log.config().max_segment_size, 1);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_work() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::new(test_config(&dir));
        let ntp = Ntp::new("kafka", "orders", 0);
        let log = manager.manage(ntp.clone(), None).await.unwrap();
        manager.stop().await.unwrap();

        assert!(matches!(
            manager.manage(ntp, None).await,
            Err(Error::AlreadyClosed)
        ));
        assert!(matches!(
            log.append(one_batch("x"), AppendOptions::default()).await,
            Err(Error::AlreadyClosed)
        ));
        // Stopping twice is fine.
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_stream_single_consumer() {
        let dir = TempDir::new().unwrap();
        let manager = LogManager::new(test_config(&dir));
        assert!(manager.take_event_stream().is_some());
        assert!(manager.take_event_stream().is_none());
    }

    #[tokio::test]
    async fn test_reopen_after_stop_with_new_manager() {
        let dir = TempDir::new().unwrap();
        let ntp = Ntp::new("kafka", "orders", 1);
        {
            let manager = LogManager::new(test_config(&dir));
            let log = manager.manage(ntp.clone(), None).await.unwrap();
            log.append(one_batch("persisted"), AppendOptions { fsync: true })
                .await
                .unwrap();
            manager.stop().await.unwrap();
        }

        let manager = LogManager::new(test_config(&dir));
        let log = manager.manage(ntp, None).await.unwrap();
        let offsets = log.offsets();
        assert_eq!(offsets.dirty_offset, Some(0));
        assert_eq!(offsets.committed_offset, Some(0));
    }
}
