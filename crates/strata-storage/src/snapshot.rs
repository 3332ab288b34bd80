//! Snapshot Manager
//!
//! Consensus keeps one snapshot per partition next to the segment files.
//! The snapshot is a single file written atomically:
//!
//! ```text
//! ┌──────────────┬───────┬──────────────────────────────────────────┐
//! │ magic        │ u32   │ "SNAP"                                   │
//! │ version      │ u32   │                                          │
//! │ last_included_offset │ u64 │ greatest offset folded in          │
//! │ last_included_term   │ u64 │ its term                           │
//! │ header crc   │ u32   │ CRC-32C over the fields above            │
//! │ payload      │ bytes │ opaque state machine data                │
//! │ payload crc  │ u32   │ CRC-32C terminator                       │
//! └──────────────┴───────┴──────────────────────────────────────────┘
//! ```
//!
//! Writes land in `snapshot.partial`, are fsynced, renamed into place and
//! the directory synced — a crash leaves either the old snapshot or the
//! new one, never a torn file.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{info, warn};

use crate::error::{Error, Result};
use tokio::io::AsyncWriteExt;

pub(crate) const SNAPSHOT_FILENAME: &str = "snapshot";
pub(crate) const SNAPSHOT_PARTIAL_FILENAME: &str = "snapshot.partial";

const SNAPSHOT_MAGIC: u32 = 0x534e_4150; // "SNAP"
const SNAPSHOT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 8 + 8 + 4;

/// What a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_included_offset: u64,
    pub last_included_term: u64,
}

/// Reads and writes the partition's snapshot file.
pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILENAME)
    }

    fn partial_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_PARTIAL_FILENAME)
    }

    /// Atomically replace the snapshot.
    pub async fn write(&self, meta: SnapshotMeta, payload: Bytes) -> Result<()> {
        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_u32(SNAPSHOT_MAGIC);
        header.put_u32(SNAPSHOT_VERSION);
        header.put_u64(meta.last_included_offset);
        header.put_u64(meta.last_included_term);
        let header_crc = crc32c::crc32c(&header);
        header.put_u32(header_crc);
        let payload_crc = crc32c::crc32c(&payload);

        let partial = self.partial_path();
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| Error::io("create", &partial, e))?;
        file.write_all(&header)
            .await
            .map_err(|e| Error::io("write", &partial, e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| Error::io("write", &partial, e))?;
        file.write_all(&payload_crc.to_be_bytes())
            .await
            .map_err(|e| Error::io("write", &partial, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io("fsync", &partial, e))?;
        drop(file);

        let path = self.snapshot_path();
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| Error::io("rename", &partial, e))?;
        sync_dir(&self.dir)?;

        info!(
            path = ?path,
            last_included_offset = meta.last_included_offset,
            last_included_term = meta.last_included_term,
            size = payload.len(),
            "snapshot written",
        );
        Ok(())
    }

    /// Load and validate the snapshot. `None` when no snapshot exists.
    pub async fn read(&self) -> Result<Option<(SnapshotMeta, Bytes)>> {
        let path = self.snapshot_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("read", &path, e)),
        };
        if raw.len() < HEADER_SIZE + 4 {
            return Err(Error::Codec(strata_core::Error::CorruptHeader(format!(
                "snapshot too small: {} bytes",
                raw.len()
            ))));
        }

        let mut buf = &raw[..HEADER_SIZE];
        let magic = buf.get_u32();
        let version = buf.get_u32();
        let last_included_offset = buf.get_u64();
        let last_included_term = buf.get_u64();
        let stored_header_crc = buf.get_u32();
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Codec(strata_core::Error::CorruptHeader(
                "snapshot has wrong magic".to_string(),
            )));
        }
        if version != SNAPSHOT_VERSION {
            return Err(Error::Codec(strata_core::Error::CorruptHeader(format!(
                "unsupported snapshot version {version}"
            ))));
        }
        if crc32c::crc32c(&raw[..HEADER_SIZE - 4]) != stored_header_crc {
            return Err(Error::Codec(strata_core::Error::CorruptHeader(
                "snapshot header crc mismatch".to_string(),
            )));
        }

        let payload = Bytes::copy_from_slice(&raw[HEADER_SIZE..raw.len() - 4]);
        let stored_payload_crc =
            u32::from_be_bytes(raw[raw.len() - 4..].try_into().expect("4 bytes"));
        if crc32c::crc32c(&payload) != stored_payload_crc {
            return Err(Error::Codec(strata_core::Error::CorruptBody(
                "snapshot payload crc mismatch".to_string(),
            )));
        }

        Ok(Some((
            SnapshotMeta {
                last_included_offset,
                last_included_term,
            },
            payload,
        )))
    }

    /// Remove the snapshot and any stale partial file.
    pub async fn remove(&self) -> Result<()> {
        for path in [self.snapshot_path(), self.partial_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io("unlink", &path, e)),
            }
        }
        Ok(())
    }
}

fn sync_dir(dir: &Path) -> Result<()> {
    match std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Some filesystems refuse directory fsync; the rename itself
            // is still ordered after the file fsync.
            warn!(dir = ?dir, error = %e, "directory sync failed");
            Ok(())
        }
    }
}
