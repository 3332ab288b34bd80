//! Decoded-Batch Cache
//!
//! A byte-budgeted LRU of decoded batches shared across all logs of a
//! manager. Appends publish their batches here; readers consult the cache
//! by base offset after peeking a batch header and skip the body read and
//! decode on a hit. Hot-tail consumers therefore rarely touch the file at
//! all.
//!
//! Truncation invalidates every cached batch of the partition at or past
//! the truncation point so stale data can never resurface.

use lru::LruCache;
use strata_core::RecordBatch;
use tokio::sync::Mutex;

use crate::ntp::Ntp;

type CacheKey = (Ntp, u64);

pub struct BatchCache {
    max_bytes: u64,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    lru: LruCache<CacheKey, RecordBatch>,
    bytes: u64,
    hits: u64,
    misses: u64,
}

impl BatchCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner {
                // Entry count is unbounded; the byte budget governs.
                lru: LruCache::unbounded(),
                bytes: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Cache a batch under its base offset. Oversized batches are simply
    /// not cached.
    pub async fn put(&self, ntp: &Ntp, batch: RecordBatch) {
        let size = batch.size_bytes() as u64;
        if size > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.lru.put((ntp.clone(), batch.base_offset()), batch) {
            inner.bytes -= old.size_bytes() as u64;
        }
        inner.bytes += size;
        while inner.bytes > self.max_bytes {
            let Some((_, evicted)) = inner.lru.pop_lru() else {
                break;
            };
            inner.bytes -= evicted.size_bytes() as u64;
        }
    }

    /// Exact-base-offset lookup.
    pub async fn get(&self, ntp: &Ntp, base_offset: u64) -> Option<RecordBatch> {
        let mut inner = self.inner.lock().await;
        match inner.lru.get(&(ntp.clone(), base_offset)).cloned() {
            Some(batch) => {
                inner.hits += 1;
                Some(batch)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Drop every cached batch of `ntp` with `base_offset >= at`.
    pub async fn truncate(&self, ntp: &Ntp, at: u64) {
        let mut inner = self.inner.lock().await;
        let stale: Vec<CacheKey> = inner
            .lru
            .iter()
            .filter(|((n, base), _)| n == ntp && *base >= at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(batch) = inner.lru.pop(&key) {
                inner.bytes -= batch.size_bytes() as u64;
            }
        }
    }

    pub async fn stats(&self) -> BatchCacheStats {
        let inner = self.inner.lock().await;
        BatchCacheStats {
            bytes: inner.bytes,
            max_bytes: self.max_bytes,
            entries: inner.lru.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCacheStats {
    pub bytes: u64,
    pub max_bytes: u64,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use strata_core::batch::RecordBatchBuilder;

    fn batch(base: u64, value_len: usize) -> RecordBatch {
        RecordBatchBuilder::data(base)
            .record(1, None, Bytes::from(vec![b'x'; value_len]))
            .build()
    }

    fn ntp() -> Ntp {
        Ntp::new("kafka", "orders", 0)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let cache = BatchCache::new(1024 * 1024);
        let b = batch(42, 100);
        cache.put(&ntp(), b.clone()).await;
        assert_eq!(cache.get(&ntp(), 42).await, Some(b));
        assert_eq!(cache.get(&ntp(), 43).await, None);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let cache = BatchCache::new(1024 * 1024);
        cache.put(&ntp(), batch(0, 10)).await;
        let other = Ntp::new("kafka", "orders", 1);
        assert!(cache.get(&other, 0).await.is_none());
    }

    #[tokio::test]
    async fn test_byte_budget_evicts_lru() {
        let one = batch(0, 300).size_bytes() as u64;
        // Room for two batches, not three.
        let cache = BatchCache::new(one * 2 + one / 2);
        cache.put(&ntp(), batch(0, 300)).await;
        cache.put(&ntp(), batch(1, 300)).await;
        // Touch 0 so 1 becomes the LRU victim.
        cache.get(&ntp(), 0).await.unwrap();
        cache.put(&ntp(), batch(2, 300)).await;

        assert!(cache.get(&ntp(), 0).await.is_some());
        assert!(cache.get(&ntp(), 1).await.is_none());
        assert!(cache.get(&ntp(), 2).await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_batch_not_cached() {
        let cache = BatchCache::new(64);
        cache.put(&ntp(), batch(0, 1024)).await;
        assert!(cache.get(&ntp(), 0).await.is_none());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_truncate_invalidates_suffix() {
        let cache = BatchCache::new(1024 * 1024);
        for base in 0..6 {
            cache.put(&ntp(), batch(base, 20)).await;
        }
        cache.truncate(&ntp(), 3).await;
        for base in 0..3 {
            assert!(cache.get(&ntp(), base).await.is_some(), "lost offset {base}");
        }
        for base in 3..6 {
            assert!(cache.get(&ntp(), base).await.is_none(), "kept offset {base}");
        }
    }

    #[tokio::test]
    async fn test_stats_track_bytes_and_hits() {
        let cache = BatchCache::new(1024 * 1024);
        let b = batch(0, 50);
        let size = b.size_bytes() as u64;
        cache.put(&ntp(), b).await;
        cache.get(&ntp(), 0).await;
        cache.get(&ntp(), 9).await;

        let stats = cache.stats().await;
        assert_eq!(stats.bytes, size);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
