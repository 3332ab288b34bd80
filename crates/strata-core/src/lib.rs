//! Strata Core
//!
//! Data-plane primitives shared by the Strata storage engine:
//!
//! 1. **FragBuf**: a fragmented byte buffer with O(1) append/prepend and
//!    ref-counted sharing — the workhorse of the I/O path
//! 2. **Varints**: zig-zag variable-length integer encoding used by record
//!    bodies
//! 3. **Record batches**: the atomic unit of append, replication and read
//! 4. **Batch codec**: the fixed on-disk framing with CRC validation
//!
//! ## Data Flow
//!
//! ```text
//! ┌────────────┐  build   ┌─────────────┐  encode   ┌──────────┐
//! │  Records   │ ───────► │ RecordBatch │ ────────► │ FragBuf  │ ──► file
//! └────────────┘          └─────────────┘           └──────────┘
//!                                ▲                       │
//!                                └──────── decode ◄──────┘
//! ```
//!
//! Everything here is synchronous, allocation-light CPU work; all file I/O
//! lives in `strata-storage`.

pub mod batch;
pub mod codec;
pub mod error;
pub mod fragbuf;
pub mod varint;

pub use batch::{
    BatchAttrs, BatchBody, BatchHeader, BatchType, Record, RecordBatch, RecordBatchBuilder,
    RecordHeader,
};
pub use codec::BATCH_HEADER_SIZE;
pub use error::{Error, Result};
pub use fragbuf::{FragBuf, FragCursor, Placeholder};
