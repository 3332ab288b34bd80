//! Segment Read Stream
//!
//! A positional, buffered batch stream over one segment file. The stream
//! owns its read-only file handle — readers never share descriptors with
//! the appender — and coalesces small reads into
//! `default_read_buffer_size` chunks.
//!
//! ## Skip semantics
//!
//! Consumers drive the stream in two steps so that filtered-out batches are
//! never materialized:
//!
//! ```ignore
//! while let Some(header) = stream.next_header().await? {
//!     if !wanted(&header) {
//!         stream.skip(&header).await?;   // advance, no body read
//!         continue;
//!     }
//!     let batch = stream.take(&header).await?;
//! }
//! ```
//!
//! `skip` drops buffered body bytes and seeks past the rest; `take` reads
//! and CRC-validates the body. Both leave the stream at the next batch
//! boundary.
//!
//! ## Bounds
//!
//! The stream reads `[start, end)` where `end` is fixed at construction —
//! callers pass the segment's flushed byte count, so bytes still sitting in
//! the appender cache are structurally invisible. A stream can be rebuilt
//! at any file position obtained from the offset index.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use strata_core::batch::{BatchHeader, RecordBatch};
use strata_core::{codec, BATCH_HEADER_SIZE};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

pub struct SegmentReadStream {
    path: PathBuf,
    file: File,
    /// Buffered bytes; `buf[0]` sits at file offset `buf_start`.
    buf: BytesMut,
    /// Absolute file offset of the first buffered byte.
    buf_start: u64,
    /// Absolute file offset the next read will fill from.
    file_pos: u64,
    /// Exclusive read bound.
    end: u64,
    chunk: usize,
}

impl SegmentReadStream {
    pub async fn open(path: &Path, start: u64, end: u64, chunk: usize) -> Result<Self> {
        let mut file = File::open(path)
            .await
            .map_err(|e| Error::io("open", path, e))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| Error::io("seek", path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            buf: BytesMut::with_capacity(chunk.min(64 * 1024)),
            buf_start: start,
            file_pos: start,
            end,
            chunk: chunk.max(BATCH_HEADER_SIZE),
        })
    }

    /// File offset of the next batch boundary.
    pub fn position(&self) -> u64 {
        self.buf_start
    }

    /// Bytes left inside the read bound.
    pub fn remaining(&self) -> u64 {
        self.end - self.buf_start
    }

    /// Buffer at least `need` bytes unless the bound or EOF cuts us short.
    async fn fill(&mut self, need: usize) -> Result<()> {
        while self.buf.len() < need && self.file_pos < self.end {
            let budget = (self.end - self.file_pos) as usize;
            let want = self.chunk.max(need - self.buf.len()).min(budget);
            let mut scratch = vec![0u8; want];
            let n = self
                .file
                .read(&mut scratch)
                .await
                .map_err(|e| Error::io("read", &self.path, e))?;
            if n == 0 {
                break;
            }
            self.buf.extend_from_slice(&scratch[..n]);
            self.file_pos += n as u64;
        }
        Ok(())
    }

    /// Peek the header of the next batch without consuming it.
    ///
    /// Returns `None` at the read bound. Fewer than a header's worth of
    /// bytes before the bound is a torn tail and surfaces as `ShortRead`;
    /// recovery interprets it as the end of the valid region.
    pub async fn next_header(&mut self) -> Result<Option<BatchHeader>> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        self.fill(BATCH_HEADER_SIZE).await?;
        if self.buf.len() < BATCH_HEADER_SIZE {
            return Err(Error::Codec(strata_core::Error::ShortRead {
                needed: BATCH_HEADER_SIZE,
                remaining: self.buf.len(),
            }));
        }
        let header = codec::decode_header(&self.buf[..BATCH_HEADER_SIZE])?;
        if self.buf_start + header.size_bytes as u64 > self.end {
            // The batch claims to extend past the bound: torn tail.
            return Err(Error::Codec(strata_core::Error::ShortRead {
                needed: header.size_bytes as usize,
                remaining: (self.end - self.buf_start) as usize,
            }));
        }
        Ok(Some(header))
    }

    /// Advance past a batch without materializing its body.
    pub async fn skip(&mut self, header: &BatchHeader) -> Result<()> {
        let total = header.size_bytes as usize;
        if self.buf.len() >= total {
            self.buf.advance(total);
        } else {
            self.buf.clear();
            let target = self.buf_start + total as u64;
            self.file
                .seek(SeekFrom::Start(target))
                .await
                .map_err(|e| Error::io("seek", &self.path, e))?;
            self.file_pos = target;
        }
        self.buf_start += total as u64;
        Ok(())
    }

    /// Read, validate and decode the batch under `header`. The returned
    /// batch carries term 0; the caller stamps the segment's term.
    pub async fn take(&mut self, header: &BatchHeader) -> Result<RecordBatch> {
        let total = header.size_bytes as usize;
        self.fill(total).await?;
        if self.buf.len() < total {
            return Err(Error::Codec(strata_core::Error::ShortRead {
                needed: total,
                remaining: self.buf.len(),
            }));
        }
        let whole = self.buf.split_to(total).freeze();
        self.buf_start += total as u64;
        let body = whole.slice(BATCH_HEADER_SIZE..);
        let decoded = codec::decode_body(header, body)?;
        Ok(RecordBatch {
            header: *header,
            term: 0,
            body: decoded,
        })
    }
}
