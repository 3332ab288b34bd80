//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Data errors
//! - `Codec`: a batch failed CRC or structural validation. During recovery
//!   these are repaired by truncating the torn tail; mid-file they surface
//!   to the caller.
//!
//! ### I/O errors
//! - `Io`: a file operation failed; carries the operation name and path.
//!   On the write path the owning segment is marked broken and the log
//!   refuses further appends until reopened.
//! - `Broken`: an append or flush against a writer that already failed.
//!
//! ### Caller errors
//! - `OutOfRange`: read below the start offset or beyond the dirty offset.
//! - `InvalidArgument`: malformed configuration, a decreasing term, or a
//!   truncation target past the end of the log.
//! - `AlreadyClosed`: operation against a stopped log or manager.
//!
//! ### Cancellation
//! - `Aborted`: an abort source fired; the operation stopped at its next
//!   suspension point.
//!
//! Invariant violations (non-monotonic offsets inside the engine, duplicate
//! key at an identical offset during compaction) are assertions, not errors.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{op} failed on {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Codec(#[from] strata_core::Error),

    #[error("offset {offset} out of range [{start}, {next})")]
    OutOfRange { offset: u64, start: u64, next: u64 },

    #[error("operation aborted")]
    Aborted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("log already closed")]
    AlreadyClosed,

    #[error("segment writer broken: {0}")]
    Broken(String),
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this error indicates corrupt on-disk data (as opposed to an
    /// I/O failure or caller mistake).
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Codec(_))
    }
}
