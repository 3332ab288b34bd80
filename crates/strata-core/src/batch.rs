//! Record Batch Model
//!
//! A record batch is the atomic unit of append, replication and read. Each
//! batch carries a fixed header (offsets, timestamps, producer identity,
//! checksums) and a body that is either a list of individual records or an
//! opaque, caller-compressed byte blob the engine passes through untouched.
//!
//! ## Offsets
//!
//! `base_offset` is assigned by the log at append time; every record inside
//! the batch addresses itself relative to it via `offset_delta`, and
//! `last_offset_delta` fixes the batch's inclusive upper bound:
//!
//! ```text
//! last_offset = base_offset + last_offset_delta
//! ```
//!
//! ## Terms
//!
//! The consensus term is *not* serialized in the batch header — the segment
//! file name carries it, and readers stamp it onto every batch they yield.
//!
//! ## Timestamps
//!
//! Millisecond timestamps since the epoch; `-1` means "not set". Records
//! carry deltas against the batch's `first_timestamp`.

use bytes::Bytes;

/// Timestamp sentinel for "not set".
pub const NO_TIMESTAMP: i64 = -1;

/// What a batch carries. The numeric values are the on-disk type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BatchType {
    /// Regular payload records.
    Data = 1,
    /// Replicated configuration changes.
    Configuration = 2,
    /// Consensus checkpoint markers.
    Checkpoint = 3,
}

impl BatchType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(BatchType::Data),
            2 => Some(BatchType::Configuration),
            3 => Some(BatchType::Checkpoint),
            _ => None,
        }
    }
}

/// Packed batch attributes: bits 0-2 are the compression code, bit 3 the
/// timestamp type (0 = create time, 1 = append time).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BatchAttrs(pub u16);

impl BatchAttrs {
    const COMPRESSION_MASK: u16 = 0x7;
    const TIMESTAMP_TYPE_BIT: u16 = 0x8;

    pub fn with_compression(code: u8) -> Self {
        BatchAttrs((code as u16) & Self::COMPRESSION_MASK)
    }

    /// Raw compression code; `0` means uncompressed.
    pub fn compression(&self) -> u8 {
        (self.0 & Self::COMPRESSION_MASK) as u8
    }

    pub fn is_compressed(&self) -> bool {
        self.compression() != 0
    }

    pub fn is_append_time(&self) -> bool {
        self.0 & Self::TIMESTAMP_TYPE_BIT != 0
    }
}

/// The fixed 61-byte batch header. All fields are big-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// CRC-32C over every header field after this one.
    pub header_crc: u32,
    /// Total batch size on disk, header included.
    pub size_bytes: u32,
    pub base_offset: u64,
    pub batch_type: BatchType,
    /// CRC-32C over the body bytes as they appear on disk.
    pub crc: u32,
    pub attrs: BatchAttrs,
    pub last_offset_delta: u32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub record_count: u32,
}

impl BatchHeader {
    /// Inclusive offset of the last record in the batch.
    pub fn last_offset(&self) -> u64 {
        self.base_offset + self.last_offset_delta as u64
    }

    /// Body size implied by `size_bytes`.
    pub fn body_size(&self) -> usize {
        self.size_bytes as usize - crate::codec::BATCH_HEADER_SIZE
    }
}

/// A key/value header attached to an individual record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: Bytes,
    pub value: Bytes,
}

/// One record inside an uncompressed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub attrs: i8,
    pub timestamp_delta: i64,
    pub offset_delta: i64,
    /// `None` is encoded as a `-1` key length on disk.
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    pub fn new(timestamp_delta: i64, offset_delta: i64, key: Option<Bytes>, value: Bytes) -> Self {
        Self {
            attrs: 0,
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers: Vec::new(),
        }
    }
}

/// Batch payload: parsed records, or opaque compressed bytes stored and
/// served verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchBody {
    Records(Vec<Record>),
    Opaque(Bytes),
}

/// The atomic unit of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub header: BatchHeader,
    /// Consensus term, carried out-of-band (see module docs).
    pub term: u64,
    pub body: BatchBody,
}

impl RecordBatch {
    pub fn base_offset(&self) -> u64 {
        self.header.base_offset
    }

    pub fn last_offset(&self) -> u64 {
        self.header.last_offset()
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    pub fn size_bytes(&self) -> u32 {
        self.header.size_bytes
    }

    pub fn batch_type(&self) -> BatchType {
        self.header.batch_type
    }

    pub fn max_timestamp(&self) -> i64 {
        self.header.max_timestamp
    }

    pub fn is_compressed(&self) -> bool {
        self.header.attrs.is_compressed()
    }
}

/// Assembles a [`RecordBatch`], computing deltas, counts and checksums.
///
/// ```ignore
/// let batch = RecordBatchBuilder::data(base_offset)
///     .record(now_ms, Some(Bytes::from("user-1")), Bytes::from("payload"))
///     .record(now_ms, None, Bytes::from("second"))
///     .build();
/// ```
#[derive(Debug)]
pub struct RecordBatchBuilder {
    batch_type: BatchType,
    base_offset: u64,
    attrs: BatchAttrs,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    first_timestamp: i64,
    max_timestamp: i64,
    records: Vec<Record>,
}

impl RecordBatchBuilder {
    pub fn new(batch_type: BatchType, base_offset: u64) -> Self {
        Self {
            batch_type,
            base_offset,
            attrs: BatchAttrs::default(),
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            first_timestamp: NO_TIMESTAMP,
            max_timestamp: NO_TIMESTAMP,
            records: Vec::new(),
        }
    }

    /// Shorthand for a data batch.
    pub fn data(base_offset: u64) -> Self {
        Self::new(BatchType::Data, base_offset)
    }

    pub fn producer(mut self, id: i64, epoch: i16, base_sequence: i32) -> Self {
        self.producer_id = id;
        self.producer_epoch = epoch;
        self.base_sequence = base_sequence;
        self
    }

    /// Append a record with an absolute millisecond timestamp; deltas are
    /// derived from the first record added.
    pub fn record(mut self, timestamp_ms: i64, key: Option<Bytes>, value: Bytes) -> Self {
        self.push_record(timestamp_ms, key, value, Vec::new());
        self
    }

    /// Append a record carrying headers.
    pub fn record_with_headers(
        mut self,
        timestamp_ms: i64,
        key: Option<Bytes>,
        value: Bytes,
        headers: Vec<RecordHeader>,
    ) -> Self {
        self.push_record(timestamp_ms, key, value, headers);
        self
    }

    fn push_record(
        &mut self,
        timestamp_ms: i64,
        key: Option<Bytes>,
        value: Bytes,
        headers: Vec<RecordHeader>,
    ) {
        if self.first_timestamp == NO_TIMESTAMP {
            self.first_timestamp = timestamp_ms;
        }
        self.max_timestamp = self.max_timestamp.max(timestamp_ms);
        let offset_delta = self.records.len() as i64;
        self.records.push(Record {
            attrs: 0,
            timestamp_delta: timestamp_ms - self.first_timestamp,
            offset_delta,
            key,
            value,
            headers,
        });
    }

    /// Finalize. Panics when no records were added — empty batches never
    /// reach the log.
    pub fn build(self) -> RecordBatch {
        assert!(!self.records.is_empty(), "batch must contain records");
        let last_offset_delta = (self.records.len() - 1) as u32;
        let record_count = self.records.len() as u32;
        let mut batch = RecordBatch {
            header: BatchHeader {
                header_crc: 0,
                size_bytes: 0,
                base_offset: self.base_offset,
                batch_type: self.batch_type,
                crc: 0,
                attrs: self.attrs,
                last_offset_delta,
                first_timestamp: self.first_timestamp,
                max_timestamp: self.max_timestamp,
                producer_id: self.producer_id,
                producer_epoch: self.producer_epoch,
                base_sequence: self.base_sequence,
                record_count,
            },
            term: 0,
            body: BatchBody::Records(self.records),
        };
        // Stamp size and checksums so the in-memory batch equals its
        // decoded form.
        let _ = crate::codec::encode(&mut batch);
        batch
    }

    /// Build a batch whose body is caller-compressed opaque bytes.
    /// `record_count` and `last_offset_delta` describe the compressed
    /// contents and are trusted as given.
    pub fn build_opaque(
        self,
        compression: u8,
        record_count: u32,
        last_offset_delta: u32,
        first_timestamp: i64,
        max_timestamp: i64,
        payload: Bytes,
    ) -> RecordBatch {
        assert!(compression != 0, "opaque bodies require a compression code");
        let mut batch = RecordBatch {
            header: BatchHeader {
                header_crc: 0,
                size_bytes: 0,
                base_offset: self.base_offset,
                batch_type: self.batch_type,
                crc: 0,
                attrs: BatchAttrs::with_compression(compression),
                last_offset_delta,
                first_timestamp,
                max_timestamp,
                producer_id: self.producer_id,
                producer_epoch: self.producer_epoch,
                base_sequence: self.base_sequence,
                record_count,
            },
            term: 0,
            body: BatchBody::Opaque(payload),
        };
        let _ = crate::codec::encode(&mut batch);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_type_roundtrip() {
        for t in [BatchType::Data, BatchType::Configuration, BatchType::Checkpoint] {
            assert_eq!(BatchType::from_u8(t as u8), Some(t));
        }
        assert_eq!(BatchType::from_u8(0), None);
        assert_eq!(BatchType::from_u8(99), None);
    }

    #[test]
    fn test_attrs_compression_bits() {
        let attrs = BatchAttrs::with_compression(3);
        assert_eq!(attrs.compression(), 3);
        assert!(attrs.is_compressed());
        assert!(!attrs.is_append_time());

        let none = BatchAttrs::default();
        assert!(!none.is_compressed());
    }

    #[test]
    fn test_builder_assigns_deltas() {
        let batch = RecordBatchBuilder::data(100)
            .record(1_000, Some(Bytes::from("a")), Bytes::from("1"))
            .record(1_005, None, Bytes::from("2"))
            .record(1_002, None, Bytes::from("3"))
            .build();

        assert_eq!(batch.base_offset(), 100);
        assert_eq!(batch.last_offset(), 102);
        assert_eq!(batch.record_count(), 3);
        assert_eq!(batch.header.first_timestamp, 1_000);
        assert_eq!(batch.header.max_timestamp, 1_005);

        let BatchBody::Records(records) = &batch.body else {
            panic!("expected records");
        };
        assert_eq!(records[0].offset_delta, 0);
        assert_eq!(records[1].offset_delta, 1);
        assert_eq!(records[2].offset_delta, 2);
        assert_eq!(records[1].timestamp_delta, 5);
        assert_eq!(records[2].timestamp_delta, 2);
    }

    #[test]
    fn test_builder_stamps_size_and_crcs() {
        let batch = RecordBatchBuilder::data(0)
            .record(0, None, Bytes::from("v"))
            .build();
        assert!(batch.header.size_bytes as usize > crate::codec::BATCH_HEADER_SIZE);
        assert_ne!(batch.header.header_crc, 0);
    }

    #[test]
    #[should_panic(expected = "batch must contain records")]
    fn test_builder_empty_panics() {
        let _ = RecordBatchBuilder::data(0).build();
    }

    #[test]
    fn test_last_offset_arithmetic() {
        let batch = RecordBatchBuilder::data(10)
            .record(5, None, Bytes::from("x"))
            .record(6, None, Bytes::from("y"))
            .build();
        assert_eq!(
            batch.last_offset(),
            batch.base_offset() + batch.header.last_offset_delta as u64
        );
        assert_eq!(batch.last_offset(), 11);
    }

    #[test]
    fn test_opaque_builder() {
        let payload = Bytes::from(vec![0xAA; 256]);
        let batch = RecordBatchBuilder::data(7).build_opaque(2, 10, 9, 100, 200, payload.clone());
        assert!(batch.is_compressed());
        assert_eq!(batch.record_count(), 10);
        assert_eq!(batch.last_offset(), 16);
        assert_eq!(batch.body, BatchBody::Opaque(payload));
    }
}
