//! Segment Appender
//!
//! The serial writer behind one segment file. Appends land in an in-memory
//! cache first; the cache drains to the kernel when it crosses
//! `max_bytes_in_writer_cache`, which makes the bound double as
//! backpressure — a producer outrunning the disk suspends inside `append`
//! until the drain completes.
//!
//! Durability runs on a cadence: every append checks the time since the last
//! durable flush and, past `writer_flush_period`, drains + fsyncs and emits a
//! [`SegmentEvent::Flushed`] notification so rolling/retention policies can
//! observe growth without touching the file. An explicit `flush()` gives the
//! same guarantee on demand: when it returns, every prior append is on
//! stable storage.
//!
//! ## Failure latch
//!
//! A failed write or fsync leaves the file in an unknown state, so the first
//! failure marks the appender *broken*; every later append or flush fails
//! fast with `Error::Broken` until the segment is closed and reopened
//! through recovery.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use strata_core::FragBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::events::{self, SegmentEvent, SegmentEventSender};

pub struct SegmentAppender {
    path: PathBuf,
    file: File,
    cache: BytesMut,
    cache_limit: usize,
    flush_period: Duration,
    last_flush: Instant,
    /// Bytes handed to the kernel.
    file_bytes: u64,
    /// Bytes known durable.
    stable_bytes: u64,
    broken: Option<String>,
    events: Option<SegmentEventSender>,
}

impl SegmentAppender {
    /// Open (or create) the file for appending; an existing file is
    /// continued at its current end.
    pub async fn open(
        path: &Path,
        config: &LogConfig,
        events: Option<SegmentEventSender>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::io("open", path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::io("stat", path, e))?
            .len();

        debug!(path = ?path, size = len, "segment appender opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            cache: BytesMut::with_capacity(config.max_bytes_in_writer_cache.min(64 * 1024)),
            cache_limit: config.max_bytes_in_writer_cache,
            flush_period: config.writer_flush_period,
            last_flush: Instant::now(),
            file_bytes: len,
            stable_bytes: len,
            broken: None,
            events,
        })
    }

    /// Logical end of the file: kernel bytes plus cached bytes.
    pub fn file_byte_offset(&self) -> u64 {
        self.file_bytes + self.cache.len() as u64
    }

    /// Bytes known to be on stable storage.
    pub fn stable_bytes(&self) -> u64 {
        self.stable_bytes
    }

    fn check_broken(&self) -> Result<()> {
        match &self.broken {
            Some(reason) => Err(Error::Broken(reason.clone())),
            None => Ok(()),
        }
    }

    fn latch_broken(&mut self, err: &Error) {
        if self.broken.is_none() {
            self.broken = Some(err.to_string());
        }
    }

    /// Stage `buf` at the logical tail. Returns the number of bytes
    /// accepted, which is always `buf.size_bytes()` on success.
    pub async fn append(&mut self, buf: &FragBuf) -> Result<u64> {
        self.check_broken()?;
        for frag in buf.iter_fragments() {
            self.cache.extend_from_slice(frag);
        }
        if self.cache.len() >= self.cache_limit {
            self.drain().await?;
        }
        if self.last_flush.elapsed() >= self.flush_period {
            self.flush().await?;
        }
        Ok(buf.size_bytes() as u64)
    }

    async fn drain(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all(&self.cache).await {
            let err = Error::io("write", &self.path, e);
            self.latch_broken(&err);
            return Err(err);
        }
        self.file_bytes += self.cache.len() as u64;
        self.cache.clear();
        Ok(())
    }

    /// Make every prior append durable.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_broken()?;
        self.drain().await?;
        if let Err(e) = self.file.sync_data().await {
            let err = Error::io("fsync", &self.path, e);
            self.latch_broken(&err);
            return Err(err);
        }
        self.stable_bytes = self.file_bytes;
        self.last_flush = Instant::now();
        events::emit(
            &self.events,
            SegmentEvent::Flushed {
                path: self.path.clone(),
                size_bytes: self.stable_bytes,
            },
        );
        Ok(())
    }

    /// Shrink the file to `size` bytes. The cache must be drained first;
    /// callers truncate only between appends, under the log's op lock.
    pub async fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_broken()?;
        assert!(
            self.cache.is_empty(),
            "truncate with {} undrained cache bytes",
            self.cache.len()
        );
        self.file
            .set_len(size)
            .await
            .map_err(|e| Error::io("truncate", &self.path, e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| Error::io("fsync", &self.path, e))?;
        self.file_bytes = size;
        self.stable_bytes = self.stable_bytes.min(size);
        Ok(())
    }

    /// Flush and close. The appender is consumed; a broken appender closes
    /// without flushing.
    pub async fn close(mut self) -> Result<()> {
        if self.broken.is_none() {
            self.flush().await?;
            self.file
                .sync_all()
                .await
                .map_err(|e| Error::io("fsync", &self.path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> LogConfig {
        let mut config = LogConfig::new(dir.path());
        // Keep the cadence out of the way unless a test wants it.
        config.writer_flush_period = Duration::from_secs(3600);
        config
    }

    fn frag(data: &[u8]) -> FragBuf {
        FragBuf::from(data)
    }

    #[tokio::test]
    async fn test_append_then_flush_is_durable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-v1.log");
        let mut appender = SegmentAppender::open(&path, &config_for(&dir), None)
            .await
            .unwrap();

        appender.append(&frag(b"hello ")).await.unwrap();
        appender.append(&frag(b"world")).await.unwrap();
        assert_eq!(appender.file_byte_offset(), 11);
        // Nothing promised durable yet.
        assert_eq!(appender.stable_bytes(), 0);

        appender.flush().await.unwrap();
        assert_eq!(appender.stable_bytes(), 11);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_cache_threshold_drains_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-v1.log");
        let mut config = config_for(&dir);
        config.max_bytes_in_writer_cache = 64;
        let mut appender = SegmentAppender::open(&path, &config, None).await.unwrap();

        appender.append(&frag(&[7u8; 100])).await.unwrap();
        // Crossing the bound forces the cache down to the kernel even
        // without a flush.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
        assert_eq!(appender.stable_bytes(), 0);
    }

    #[tokio::test]
    async fn test_flush_cadence_emits_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-v1.log");
        let mut config = config_for(&dir);
        config.writer_flush_period = Duration::from_millis(0);
        let (tx, mut rx) = crate::events::channel();
        let mut appender = SegmentAppender::open(&path, &config, Some(tx)).await.unwrap();

        appender.append(&frag(b"abc")).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            SegmentEvent::Flushed {
                path: path.clone(),
                size_bytes: 3
            }
        );
    }

    #[tokio::test]
    async fn test_reopen_continues_at_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-v1.log");
        let config = config_for(&dir);
        {
            let mut appender = SegmentAppender::open(&path, &config, None).await.unwrap();
            appender.append(&frag(b"first")).await.unwrap();
            appender.close().await.unwrap();
        }
        let mut appender = SegmentAppender::open(&path, &config, None).await.unwrap();
        assert_eq!(appender.file_byte_offset(), 5);
        appender.append(&frag(b"|second")).await.unwrap();
        appender.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first|second");
    }

    #[tokio::test]
    async fn test_truncate_shrinks_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-v1.log");
        let mut appender = SegmentAppender::open(&path, &config_for(&dir), None)
            .await
            .unwrap();
        appender.append(&frag(b"0123456789")).await.unwrap();
        appender.flush().await.unwrap();

        appender.truncate(4).await.unwrap();
        assert_eq!(appender.file_byte_offset(), 4);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123");

        // Appends continue at the new end.
        appender.append(&frag(b"ab")).await.unwrap();
        appender.flush().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"0123ab");
    }

    #[tokio::test]
    async fn test_multi_fragment_append_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0-0-v1.log");
        let mut appender = SegmentAppender::open(&path, &config_for(&dir), None)
            .await
            .unwrap();

        let mut buf = FragBuf::new();
        buf.append_slice(b"head|");
        buf.append_bytes(bytes::Bytes::from(vec![b'x'; 2048]));
        buf.append_slice(b"|tail");
        let written = appender.append(&buf).await.unwrap();
        assert_eq!(written, buf.size_bytes() as u64);
        appender.flush().await.unwrap();

        let data = std::fs::read(&path).unwrap();
        assert!(data.starts_with(b"head|"));
        assert!(data.ends_with(b"|tail"));
        assert_eq!(data.len(), buf.size_bytes());
    }
}
