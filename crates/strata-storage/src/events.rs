//! Segment Lifecycle Events
//!
//! Retention and rolling policies want to observe segment growth without
//! stat-ing files. The engine publishes typed notifications on an unbounded
//! channel owned by the log manager; consumers that fall behind or go away
//! never block the write path.

use std::path::PathBuf;

use tokio::sync::mpsc;

/// Notifications emitted by segments as they move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// A new segment file was created.
    Created { path: PathBuf },
    /// A durable flush completed; `size_bytes` is the stable file size.
    Flushed { path: PathBuf, size_bytes: u64 },
    /// The segment was sealed and will accept no further appends.
    Sealed {
        path: PathBuf,
        base_offset: u64,
        max_offset: Option<u64>,
    },
}

pub type SegmentEventSender = mpsc::UnboundedSender<SegmentEvent>;
pub type SegmentEventReceiver = mpsc::UnboundedReceiver<SegmentEvent>;

pub fn channel() -> (SegmentEventSender, SegmentEventReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) fn emit(sender: &Option<SegmentEventSender>, event: SegmentEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}
