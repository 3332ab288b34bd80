//! Fragmented Byte Buffer
//!
//! `FragBuf` holds an ordered byte sequence as a list of fragments instead of
//! one contiguous allocation. It supports prepend and append but no edits in
//! the middle, and provides a sequential cursor for byte scanning and
//! parsing. This is the workhorse of the storage data path: encoded batches,
//! read windows and snapshot payloads all travel as `FragBuf`s.
//!
//! ## Operations
//!
//! - Append / prepend — O(1) amortized
//! - `share(pos, len)` — O(fragments), no byte copies (ref-count clones)
//! - `==` — O(n) byte-wise, independent of fragmentation
//!
//! ## Fragments
//!
//! A fragment is either *sealed* (an immutable, ref-counted [`Bytes`] chunk)
//! or *open* (a writable [`BytesMut`] tail that later appends pack into).
//! Sealing happens lazily: appending a whole buffer, sharing, or reserving a
//! placeholder freezes the current tail. Small appends therefore coalesce
//! while large ones are linked in without copying.
//!
//! ## Allocation policy
//!
//! New tail fragments follow a doubling schedule from 512 bytes up to 16 MiB
//! so that many small appends amortize to O(1) allocations while a mostly
//! empty buffer stays small.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Smallest tail fragment allocated by the growth schedule.
pub const MIN_ALLOCATION_SIZE: usize = 512;
/// Largest tail fragment allocated by the growth schedule.
pub const MAX_ALLOCATION_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug)]
enum Frag {
    Sealed(Bytes),
    Open(BytesMut),
}

impl Frag {
    fn len(&self) -> usize {
        match self {
            Frag::Sealed(b) => b.len(),
            Frag::Open(b) => b.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Frag::Sealed(b) => b,
            Frag::Open(b) => b,
        }
    }

    fn spare_capacity(&self) -> usize {
        match self {
            Frag::Sealed(_) => 0,
            Frag::Open(b) => b.capacity() - b.len(),
        }
    }

    fn seal(&mut self) {
        if let Frag::Open(b) = self {
            let frozen = std::mem::take(b).freeze();
            *self = Frag::Sealed(frozen);
        }
    }

    fn into_sealed(mut self) -> Bytes {
        self.seal();
        match self {
            Frag::Sealed(b) => b,
            Frag::Open(_) => unreachable!(),
        }
    }
}

/// A reserved, writable window at a fixed position in a [`FragBuf`].
///
/// Created by [`FragBuf::reserve`]; filled in place with
/// [`FragBuf::fill`]. The reserved bytes are zero until written and count
/// toward [`FragBuf::size_bytes`] from the moment of reservation.
#[derive(Debug)]
pub struct Placeholder {
    frag: usize,
    offset: usize,
    remaining: usize,
}

impl Placeholder {
    /// Bytes of the reservation not yet written.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Ordered sequence of owned byte fragments.
#[derive(Debug, Default)]
pub struct FragBuf {
    frags: Vec<Frag>,
    size: usize,
    alloc_step: usize,
}

impl FragBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held, including unfilled placeholder reservations.
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of fragments currently backing the buffer.
    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    /// Next fragment size the growth schedule would pick for a write of
    /// `minimum` bytes.
    fn next_allocation_size(&mut self, minimum: usize) -> usize {
        let step = if self.alloc_step == 0 {
            MIN_ALLOCATION_SIZE
        } else {
            (self.alloc_step * 2).min(MAX_ALLOCATION_SIZE)
        };
        self.alloc_step = step;
        step.max(minimum)
    }

    fn push_open(&mut self, minimum: usize) {
        let cap = self.next_allocation_size(minimum);
        self.frags.push(Frag::Open(BytesMut::with_capacity(cap)));
    }

    fn seal_tail(&mut self) {
        if let Some(last) = self.frags.last_mut() {
            last.seal();
        }
    }

    fn seal_all(&mut self) {
        for f in &mut self.frags {
            f.seal();
        }
    }

    /// Append raw bytes, packing into the open tail fragment when space
    /// remains and growing by the allocation schedule otherwise.
    pub fn append_slice(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let spare = self.frags.last().map_or(0, Frag::spare_capacity);
            if spare == 0 {
                self.push_open(src.len());
                continue;
            }
            let take = spare.min(src.len());
            match self.frags.last_mut() {
                Some(Frag::Open(b)) => b.extend_from_slice(&src[..take]),
                _ => unreachable!("spare capacity implies an open tail"),
            }
            self.size += take;
            src = &src[take..];
        }
    }

    /// Append an owned chunk. Packs into the tail if it fits in the spare
    /// capacity; otherwise links the chunk in without copying.
    pub fn append_bytes(&mut self, src: Bytes) {
        if src.is_empty() {
            return;
        }
        if src.len() <= self.frags.last().map_or(0, Frag::spare_capacity) {
            self.append_slice(&src);
            return;
        }
        self.seal_tail();
        self.size += src.len();
        self.frags.push(Frag::Sealed(src));
    }

    /// Append the contents of another buffer; its fragments are moved, not
    /// copied.
    pub fn append(&mut self, other: FragBuf) {
        self.seal_tail();
        self.size += other.size;
        self.frags
            .extend(other.frags.into_iter().map(|f| Frag::Sealed(f.into_sealed())));
    }

    /// Prepend the contents of another buffer in front of this one.
    pub fn prepend(&mut self, other: FragBuf) {
        self.size += other.size;
        self.frags.splice(
            0..0,
            other
                .frags
                .into_iter()
                .map(|f| Frag::Sealed(f.into_sealed())),
        );
    }

    /// Reserve `n` writable zero bytes at the tail and return a placeholder
    /// for filling them in later. The reservation is counted in
    /// [`size_bytes`](Self::size_bytes) immediately.
    ///
    /// The window lives inside a single fragment; sharing the buffer before
    /// the placeholder is fully written freezes the zeros in place.
    pub fn reserve(&mut self, n: usize) -> Placeholder {
        if self.frags.last().map_or(0, Frag::spare_capacity) < n {
            self.seal_tail();
            self.push_open(n);
        }
        let frag = self.frags.len() - 1;
        let offset = match self.frags.last_mut() {
            Some(Frag::Open(b)) => {
                let at = b.len();
                b.resize(at + n, 0);
                at
            }
            _ => unreachable!("reserve always lands on an open tail"),
        };
        self.size += n;
        Placeholder {
            frag,
            offset,
            remaining: n,
        }
    }

    /// Write `src` into a reserved window, advancing the placeholder.
    ///
    /// Panics when writing past the reservation or after the fragment was
    /// sealed — both indicate a bookkeeping bug in the caller.
    pub fn fill(&mut self, ph: &mut Placeholder, src: &[u8]) {
        assert!(
            src.len() <= ph.remaining,
            "placeholder overflow: writing {} bytes into a window of {}",
            src.len(),
            ph.remaining,
        );
        match &mut self.frags[ph.frag] {
            Frag::Open(b) => b[ph.offset..ph.offset + src.len()].copy_from_slice(src),
            Frag::Sealed(_) => panic!("placeholder fragment was sealed before fill"),
        }
        ph.offset += src.len();
        ph.remaining -= src.len();
    }

    /// Remove and return the first fragment.
    pub fn pop_front(&mut self) -> Option<Bytes> {
        if self.frags.is_empty() {
            return None;
        }
        let frag = self.frags.remove(0).into_sealed();
        self.size -= frag.len();
        Some(frag)
    }

    /// Drop the first `n` bytes.
    pub fn trim_front(&mut self, mut n: usize) {
        while n > 0 && !self.frags.is_empty() {
            let len = self.frags[0].len();
            if len > n {
                match &mut self.frags[0] {
                    Frag::Sealed(b) => b.advance(n),
                    Frag::Open(b) => b.advance(n),
                }
                self.size -= n;
                return;
            }
            self.frags.remove(0);
            self.size -= len;
            n -= len;
        }
    }

    pub fn clear(&mut self) {
        self.frags.clear();
        self.size = 0;
        self.alloc_step = 0;
    }

    /// A view of `len` bytes starting at `pos` backed by the same memory.
    /// Fragments are ref-count cloned, never copied.
    ///
    /// Panics when the range falls outside the buffer.
    pub fn share(&mut self, pos: usize, len: usize) -> FragBuf {
        assert!(
            pos + len <= self.size,
            "share out of range: [{pos}, {}) of {}",
            pos + len,
            self.size,
        );
        self.seal_all();
        let mut out = FragBuf::new();
        let mut skip = pos;
        let mut want = len;
        for frag in &self.frags {
            if want == 0 {
                break;
            }
            let b = match frag {
                Frag::Sealed(b) => b,
                Frag::Open(_) => unreachable!("seal_all leaves no open fragments"),
            };
            if skip >= b.len() {
                skip -= b.len();
                continue;
            }
            let take = (b.len() - skip).min(want);
            out.append_bytes(b.slice(skip..skip + take));
            skip = 0;
            want -= take;
        }
        out
    }

    /// A deep copy; the result owns fresh memory.
    pub fn copy(&self) -> FragBuf {
        let mut out = FragBuf::new();
        for frag in &self.frags {
            out.append_slice(frag.as_slice());
        }
        out
    }

    /// Collapse into a single contiguous [`Bytes`]. Zero-copy when the
    /// buffer already holds exactly one sealed fragment.
    pub fn to_bytes(&self) -> Bytes {
        match self.frags.as_slice() {
            [] => Bytes::new(),
            [Frag::Sealed(b)] => b.clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.size);
                for frag in &self.frags {
                    out.extend_from_slice(frag.as_slice());
                }
                out.freeze()
            }
        }
    }

    /// Iterate over every byte in order.
    pub fn iter_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.frags
            .iter()
            .flat_map(|f| f.as_slice().iter().copied())
    }

    /// Iterate over the fragment slices in order.
    pub fn iter_fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.frags.iter().map(Frag::as_slice)
    }

    /// Sequential parsing cursor over the buffer.
    pub fn cursor(&self) -> FragCursor<'_> {
        FragCursor {
            frags: &self.frags,
            frag: 0,
            offset: 0,
            remaining: self.size,
        }
    }
}

impl PartialEq for FragBuf {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.iter_bytes().eq(other.iter_bytes())
    }
}

impl Eq for FragBuf {}

impl From<Bytes> for FragBuf {
    fn from(b: Bytes) -> Self {
        let mut buf = FragBuf::new();
        buf.append_bytes(b);
        buf
    }
}

impl From<&[u8]> for FragBuf {
    fn from(b: &[u8]) -> Self {
        FragBuf::from(Bytes::copy_from_slice(b))
    }
}

/// Forward-only reader over a [`FragBuf`].
///
/// Implements [`Buf`] so fixed-width and varint readers compose with the
/// rest of the `bytes` ecosystem; the `read_*` helpers return
/// [`Error::ShortRead`] instead of panicking when the buffer is exhausted.
pub struct FragCursor<'a> {
    frags: &'a [Frag],
    frag: usize,
    offset: usize,
    remaining: usize,
}

impl<'a> FragCursor<'a> {
    fn ensure(&self, needed: usize) -> Result<()> {
        if self.remaining < needed {
            return Err(Error::ShortRead {
                needed,
                remaining: self.remaining,
            });
        }
        Ok(())
    }

    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ensure(dst.len())?;
        let mut filled = 0;
        while filled < dst.len() {
            let chunk = self.chunk();
            let take = chunk.len().min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&chunk[..take]);
            filled += take;
            self.advance(take);
        }
        Ok(())
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Read `n` bytes as an owned chunk. Slices the backing fragment
    /// (no copy) when the range is contiguous and sealed.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        if let Frag::Sealed(b) = &self.frags[self.frag] {
            if b.len() - self.offset >= n {
                let out = b.slice(self.offset..self.offset + n);
                self.advance(n);
                return Ok(out);
            }
        }
        let mut out = BytesMut::with_capacity(n);
        let mut want = n;
        while want > 0 {
            let chunk = self.chunk();
            let take = chunk.len().min(want);
            out.extend_from_slice(&chunk[..take]);
            self.advance(take);
            want -= take;
        }
        Ok(out.freeze())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.advance(n);
        Ok(())
    }
}

impl Buf for FragCursor<'_> {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        if self.frag >= self.frags.len() {
            return &[];
        }
        &self.frags[self.frag].as_slice()[self.offset..]
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.remaining, "advance past end of FragCursor");
        self.remaining -= cnt;
        while cnt > 0 {
            let avail = self.frags[self.frag].len() - self.offset;
            if cnt < avail {
                self.offset += cnt;
                return;
            }
            cnt -= avail;
            self.frag += 1;
            self.offset = 0;
        }
    }
}
