//! Batch Codec — On-Disk Framing
//!
//! Serializes record batches into the fixed storage layout and parses the
//! inverse. The layout is a 61-byte big-endian header followed by the body:
//!
//! ```text
//! ┌──────────────┬───────┬─────────────────────────────────────────────┐
//! │ Field        │ Width │ Notes                                       │
//! ├──────────────┼───────┼─────────────────────────────────────────────┤
//! │ header_crc   │ u32   │ CRC-32C over all subsequent header fields   │
//! │ size_bytes   │ u32   │ total batch size including the header       │
//! │ base_offset  │ u64   │                                             │
//! │ type         │ u8    │ 1=data, 2=configuration, 3=checkpoint       │
//! │ crc          │ u32   │ CRC-32C over the body bytes                 │
//! │ attrs        │ u16   │ bits 0-2 compression, bit 3 timestamp type  │
//! │ last_offset_delta │ u32 │                                          │
//! │ first_timestamp   │ i64 │ ms since epoch, -1 = missing             │
//! │ max_timestamp     │ i64 │                                          │
//! │ producer_id       │ i64 │                                          │
//! │ producer_epoch    │ i16 │                                          │
//! │ base_sequence     │ i32 │                                          │
//! │ record_count      │ u32 │                                          │
//! └──────────────┴───────┴─────────────────────────────────────────────┘
//! ```
//!
//! Uncompressed bodies hold `record_count` length-delimited records whose
//! small fields are zig-zag varints; compressed bodies are opaque bytes
//! passed through as given. Decoding validates the header CRC before
//! allocating anything for the body, so corrupt tails are rejected at the
//! cost of a 61-byte read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::batch::{BatchAttrs, BatchBody, BatchHeader, BatchType, Record, RecordBatch, RecordHeader};
use crate::error::{Error, Result};
use crate::fragbuf::FragBuf;
use crate::varint;

/// Fixed size of the on-disk batch header.
pub const BATCH_HEADER_SIZE: usize = 61;

/// Serialize a batch, computing `size_bytes`, the body CRC and the header
/// CRC on the fly and stamping them back into `batch.header` so the
/// in-memory batch compares equal to its decoded form.
pub fn encode(batch: &mut RecordBatch) -> FragBuf {
    let mut body = FragBuf::new();
    match &batch.body {
        BatchBody::Records(records) => {
            let mut out = BytesMut::new();
            for record in records {
                encode_record(&mut out, record);
            }
            body.append_bytes(out.freeze());
        }
        BatchBody::Opaque(bytes) => body.append_bytes(bytes.clone()),
    }

    let mut crc = 0u32;
    for frag in body.iter_fragments() {
        crc = crc32c::crc32c_append(crc, frag);
    }
    batch.header.crc = crc;
    batch.header.size_bytes = (BATCH_HEADER_SIZE + body.size_bytes()) as u32;

    // Header fields after header_crc, in layout order.
    let mut tail = BytesMut::with_capacity(BATCH_HEADER_SIZE - 4);
    tail.put_u32(batch.header.size_bytes);
    tail.put_u64(batch.header.base_offset);
    tail.put_u8(batch.header.batch_type as u8);
    tail.put_u32(batch.header.crc);
    tail.put_u16(batch.header.attrs.0);
    tail.put_u32(batch.header.last_offset_delta);
    tail.put_i64(batch.header.first_timestamp);
    tail.put_i64(batch.header.max_timestamp);
    tail.put_i64(batch.header.producer_id);
    tail.put_i16(batch.header.producer_epoch);
    tail.put_i32(batch.header.base_sequence);
    tail.put_u32(batch.header.record_count);
    batch.header.header_crc = crc32c::crc32c(&tail);

    let mut header = BytesMut::with_capacity(BATCH_HEADER_SIZE);
    header.put_u32(batch.header.header_crc);
    header.extend_from_slice(&tail);

    body.prepend(FragBuf::from(header.freeze()));
    body
}

/// Parse and validate the fixed header from the first
/// [`BATCH_HEADER_SIZE`] bytes of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<BatchHeader> {
    if bytes.len() < BATCH_HEADER_SIZE {
        return Err(Error::ShortRead {
            needed: BATCH_HEADER_SIZE,
            remaining: bytes.len(),
        });
    }
    let mut buf = &bytes[..BATCH_HEADER_SIZE];
    let header_crc = buf.get_u32();
    let computed = crc32c::crc32c(&bytes[4..BATCH_HEADER_SIZE]);
    if computed != header_crc {
        return Err(Error::CorruptHeader(format!(
            "header crc mismatch: stored {header_crc:#010x}, computed {computed:#010x}"
        )));
    }

    let size_bytes = buf.get_u32();
    let base_offset = buf.get_u64();
    let type_byte = buf.get_u8();
    let batch_type = BatchType::from_u8(type_byte).ok_or(Error::UnsupportedFormat(type_byte))?;
    let crc = buf.get_u32();
    let attrs = BatchAttrs(buf.get_u16());
    let last_offset_delta = buf.get_u32();
    let first_timestamp = buf.get_i64();
    let max_timestamp = buf.get_i64();
    let producer_id = buf.get_i64();
    let producer_epoch = buf.get_i16();
    let base_sequence = buf.get_i32();
    let record_count = buf.get_u32();

    if (size_bytes as usize) < BATCH_HEADER_SIZE {
        return Err(Error::CorruptHeader(format!(
            "batch size {size_bytes} smaller than the header"
        )));
    }

    Ok(BatchHeader {
        header_crc,
        size_bytes,
        base_offset,
        batch_type,
        crc,
        attrs,
        last_offset_delta,
        first_timestamp,
        max_timestamp,
        producer_id,
        producer_epoch,
        base_sequence,
        record_count,
    })
}

/// Parse and validate a batch body against its header. `body` must hold
/// exactly the `header.body_size()` bytes following the header on disk.
pub fn decode_body(header: &BatchHeader, body: Bytes) -> Result<BatchBody> {
    let expected = header.body_size();
    if body.len() < expected {
        return Err(Error::ShortRead {
            needed: expected,
            remaining: body.len(),
        });
    }
    if body.len() > expected {
        return Err(Error::CorruptBody(format!(
            "body is {} bytes, header claims {expected}",
            body.len()
        )));
    }
    let computed = crc32c::crc32c(&body);
    if computed != header.crc {
        return Err(Error::CorruptBody(format!(
            "body crc mismatch: stored {:#010x}, computed {computed:#010x}",
            header.crc
        )));
    }

    if header.attrs.is_compressed() {
        return Ok(BatchBody::Opaque(body));
    }

    let mut buf = body;
    let mut records = Vec::with_capacity(header.record_count as usize);
    for _ in 0..header.record_count {
        records.push(decode_record(&mut buf)?);
    }
    if buf.has_remaining() {
        return Err(Error::CorruptBody(format!(
            "{} trailing bytes after the last record",
            buf.remaining()
        )));
    }
    Ok(BatchBody::Records(records))
}

/// Decode a whole batch from a buffer. The batch term is not on the wire;
/// callers stamp it from the containing segment.
pub fn decode(buf: &FragBuf) -> Result<RecordBatch> {
    let mut cursor = buf.cursor();
    let header_bytes: [u8; BATCH_HEADER_SIZE] = cursor.read_array()?;
    let header = decode_header(&header_bytes)?;
    let body = cursor.read_bytes(header.body_size())?;
    Ok(RecordBatch {
        header,
        term: 0,
        body: decode_body(&header, body)?,
    })
}

fn encode_record(out: &mut BytesMut, record: &Record) {
    let mut body = BytesMut::new();
    body.put_i8(record.attrs);
    varint::encode_varint(&mut body, record.timestamp_delta);
    varint::encode_varint(&mut body, record.offset_delta);
    match &record.key {
        Some(key) => {
            varint::encode_varint(&mut body, key.len() as i64);
            body.put_slice(key);
        }
        None => varint::encode_varint(&mut body, -1),
    }
    varint::encode_varint(&mut body, record.value.len() as i64);
    body.put_slice(&record.value);
    varint::encode_varint(&mut body, record.headers.len() as i64);
    for header in &record.headers {
        varint::encode_varint(&mut body, header.key.len() as i64);
        body.put_slice(&header.key);
        varint::encode_varint(&mut body, header.value.len() as i64);
        body.put_slice(&header.value);
    }

    varint::encode_varint(out, body.len() as i64);
    out.put_slice(&body);
}

fn decode_record(buf: &mut Bytes) -> Result<Record> {
    let length = varint::decode_varint(buf)?;
    if length < 0 {
        return Err(Error::CorruptBody(format!("negative record length {length}")));
    }
    let length = length as usize;
    if buf.remaining() < length {
        return Err(Error::CorruptBody(format!(
            "record length {length} exceeds the {} bytes left in the body",
            buf.remaining()
        )));
    }
    let mut rec = buf.split_to(length);

    if !rec.has_remaining() {
        return Err(Error::CorruptBody("empty record".to_string()));
    }
    let attrs = rec.get_i8();
    let timestamp_delta = varint::decode_varint(&mut rec)?;
    let offset_delta = varint::decode_varint(&mut rec)?;
    let key = read_sized(&mut rec, "record key")?;
    let value = read_sized(&mut rec, "record value")?
        .ok_or_else(|| Error::CorruptBody("record value may not be null".to_string()))?;

    let header_count = varint::decode_varint(&mut rec)?;
    if header_count < 0 {
        return Err(Error::CorruptBody(format!(
            "negative header count {header_count}"
        )));
    }
    let mut headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let key = read_sized(&mut rec, "header key")?
            .ok_or_else(|| Error::CorruptBody("header key may not be null".to_string()))?;
        let value = read_sized(&mut rec, "header value")?
            .ok_or_else(|| Error::CorruptBody("header value may not be null".to_string()))?;
        headers.push(RecordHeader { key, value });
    }
    if rec.has_remaining() {
        return Err(Error::CorruptBody(format!(
            "{} trailing bytes inside a record",
            rec.remaining()
        )));
    }

    Ok(Record {
        attrs,
        timestamp_delta,
        offset_delta,
        key,
        value,
        headers,
    })
}

/// Read a varint-length-prefixed field; `-1` means null.
fn read_sized(buf: &mut Bytes, what: &str) -> Result<Option<Bytes>> {
    let len = varint::decode_varint(buf)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(Error::CorruptBody(format!("negative {what} length {len}")));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(Error::CorruptBody(format!(
            "{what} length {len} exceeds the {} bytes remaining",
            buf.remaining()
        )));
    }
    Ok(Some(buf.split_to(len)))
}
