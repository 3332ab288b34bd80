//! Codec Error Types
//!
//! Decoding distinguishes four failure kinds so that callers can react
//! differently to each:
//!
//! - `CorruptHeader`: the fixed batch header failed CRC or sanity checks.
//!   During recovery this marks the end of the valid region of a segment.
//! - `CorruptBody`: the header was intact but the body failed its CRC or
//!   could not be parsed.
//! - `UnsupportedFormat`: an unknown batch type byte.
//! - `ShortRead`: fewer bytes were available than the format requires. At
//!   the tail of a file this is equivalent to a torn write; mid-file it is
//!   fatal.
//!
//! Encoding never fails.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("corrupt batch header: {0}")]
    CorruptHeader(String),

    #[error("corrupt batch body: {0}")]
    CorruptBody(String),

    #[error("unsupported batch type: {0:#x}")]
    UnsupportedFormat(u8),

    #[error("short read: needed {needed} bytes, {remaining} remaining")]
    ShortRead { needed: usize, remaining: usize },
}
