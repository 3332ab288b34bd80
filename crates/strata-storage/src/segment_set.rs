//! Segment Set
//!
//! The ordered collection of one partition's segments, keyed by base
//! offset. Exactly one segment — the one with the greatest base offset —
//! may be active; everything before it is sealed. Lookups answer "which
//! segment holds offset X" with a range query:
//!
//! ```text
//! BTreeMap<u64, Arc<Segment>>
//!   0     -> [0, 999]
//!   1000  -> [1000, 4999]
//!   5000  -> [5000, ...]      (active)
//!
//! lookup(3_200): range(..=3200).next_back() -> segment @ 1000
//! ```
//!
//! All mutation happens under the owning log's op lock; the set itself adds
//! no synchronization.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::segment::Segment;

#[derive(Debug, Default)]
pub struct SegmentSet {
    segments: BTreeMap<u64, Arc<Segment>>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Insert at the tail. Segments arrive in base-offset order with
    /// disjoint ranges; violations are engine bugs.
    pub fn insert(&mut self, segment: Arc<Segment>) {
        if let Some((_, last)) = self.segments.last_key_value() {
            assert!(
                segment.base_offset() > last.base_offset(),
                "segment {} inserted behind {}",
                segment.base_offset(),
                last.base_offset(),
            );
            if let Some(max) = last.max_offset() {
                assert!(
                    segment.base_offset() > max,
                    "segment {} overlaps predecessor ending at {}",
                    segment.base_offset(),
                    max,
                );
            }
        }
        self.segments.insert(segment.base_offset(), segment);
    }

    /// The segment with the greatest base offset at or below `offset`.
    pub fn lookup(&self, offset: u64) -> Option<&Arc<Segment>> {
        self.segments.range(..=offset).next_back().map(|(_, s)| s)
    }

    pub fn first(&self) -> Option<&Arc<Segment>> {
        self.segments.first_key_value().map(|(_, s)| s)
    }

    pub fn last(&self) -> Option<&Arc<Segment>> {
        self.segments.last_key_value().map(|(_, s)| s)
    }

    pub fn pop_front(&mut self) -> Option<Arc<Segment>> {
        self.segments.pop_first().map(|(_, s)| s)
    }

    pub fn pop_back(&mut self) -> Option<Arc<Segment>> {
        self.segments.pop_last().map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Segment>> {
        self.segments.values()
    }

    /// Drain every segment, front to back.
    pub fn drain(&mut self) -> Vec<Arc<Segment>> {
        std::mem::take(&mut self.segments).into_values().collect()
    }

    /// Total bytes across all segments.
    pub fn size_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.size_bytes()).sum()
    }
}
