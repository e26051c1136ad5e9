//! Receive-side reordering: buffer ahead-of-sequence segments and deliver a
//! strictly ordered byte stream.
//!
//! [`Reorderer`] implements the receiver's acceptance policy:
//!
//! - A segment at exactly the expected offset is delivered immediately, and
//!   any buffered entries made contiguous by it drain in the same step.
//! - A segment ahead of the expected offset is buffered, keyed by sequence
//!   number and deduplicated.
//! - A segment below the expected offset was already delivered and is
//!   discarded — acceptance is strictly cumulative, with no replay window.
//!
//! Delivery is append-only: once bytes leave the reorderer they are never
//! rewritten or reordered.
//!
//! This module only manages state; the [`ReorderHandler`] adapter at the
//! bottom forwards delivered chunks into the session's delivery channel.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use crate::engine::{DataHandler, DataOutcome};
use crate::packet::seq_lt;

// ---------------------------------------------------------------------------
// Reorderer
// ---------------------------------------------------------------------------

/// What happened to an inbound data segment.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// In-order: these chunks (the segment's payload, then any drained
    /// buffered entries) are ready for the sink, oldest first.
    Delivered(Vec<Vec<u8>>),
    /// Ahead of the expected offset; stored until the gap fills.
    Buffered,
    /// Below the expected offset, or already buffered — dropped.
    Duplicate,
}

/// Out-of-order buffer for one connection's inbound stream.
#[derive(Debug, Default)]
pub struct Reorderer {
    /// Entries ahead of the expected offset, keyed by sequence number.
    buffered: BTreeMap<u32, Vec<u8>>,
}

impl Reorderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments currently buffered ahead of the expected offset.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Process one inbound data segment against the expected offset
    /// `rcv_nxt`, advancing it past everything delivered.
    pub fn on_segment(&mut self, rcv_nxt: &mut u32, seq: u32, payload: &[u8]) -> Disposition {
        if seq == *rcv_nxt {
            let mut ready = vec![payload.to_vec()];
            *rcv_nxt = rcv_nxt.wrapping_add(payload.len() as u32);
            // Drain buffered entries made contiguous by this delivery.
            while let Some(chunk) = self.buffered.remove(rcv_nxt) {
                *rcv_nxt = rcv_nxt.wrapping_add(chunk.len() as u32);
                ready.push(chunk);
            }
            Disposition::Delivered(ready)
        } else if seq_lt(*rcv_nxt, seq) {
            if self.buffered.contains_key(&seq) {
                Disposition::Duplicate
            } else {
                self.buffered.insert(seq, payload.to_vec());
                Disposition::Buffered
            }
        } else {
            // Already delivered.
            Disposition::Duplicate
        }
    }
}

// ---------------------------------------------------------------------------
// ReorderHandler — the receiving role's DataHandler
// ---------------------------------------------------------------------------

/// Reorder-and-deliver variant of [`DataHandler`]: ordered chunks go out on
/// the session's delivery channel as they become contiguous.
pub struct ReorderHandler {
    reorderer: Reorderer,
    delivery: mpsc::UnboundedSender<Vec<u8>>,
}

impl ReorderHandler {
    pub fn new(delivery: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            reorderer: Reorderer::new(),
            delivery,
        }
    }
}

impl DataHandler for ReorderHandler {
    fn on_data_segment(&mut self, rcv_nxt: &mut u32, seq: u32, payload: &[u8]) -> DataOutcome {
        match self.reorderer.on_segment(rcv_nxt, seq, payload) {
            Disposition::Delivered(chunks) => {
                let mut bytes = 0;
                for chunk in chunks {
                    bytes += chunk.len();
                    // The application dropping its receive side is not a
                    // protocol error; keep draining state either way.
                    let _ = self.delivery.send(chunk);
                }
                DataOutcome::Delivered { bytes }
            }
            Disposition::Buffered => DataOutcome::Buffered,
            Disposition::Duplicate => DataOutcome::Duplicate,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_segment_delivers_immediately() {
        let mut r = Reorderer::new();
        let mut expected = 100;
        let d = r.on_segment(&mut expected, 100, b"hello");
        assert_eq!(d, Disposition::Delivered(vec![b"hello".to_vec()]));
        assert_eq!(expected, 105);
    }

    #[test]
    fn ahead_of_sequence_is_buffered_then_drained() {
        let mut r = Reorderer::new();
        let mut expected = 0;

        assert_eq!(r.on_segment(&mut expected, 5, b"world"), Disposition::Buffered);
        assert_eq!(expected, 0, "expected offset must not advance on a gap");
        assert_eq!(r.buffered_len(), 1);

        // Filling the gap delivers both chunks in order.
        let d = r.on_segment(&mut expected, 0, b"hello");
        assert_eq!(
            d,
            Disposition::Delivered(vec![b"hello".to_vec(), b"world".to_vec()])
        );
        assert_eq!(expected, 10);
        assert_eq!(r.buffered_len(), 0);
    }

    #[test]
    fn drain_stops_at_the_next_gap() {
        let mut r = Reorderer::new();
        let mut expected = 0;
        r.on_segment(&mut expected, 3, b"def");
        r.on_segment(&mut expected, 9, b"jkl"); // gap at 6..9 remains

        let d = r.on_segment(&mut expected, 0, b"abc");
        assert_eq!(
            d,
            Disposition::Delivered(vec![b"abc".to_vec(), b"def".to_vec()])
        );
        assert_eq!(expected, 6);
        assert_eq!(r.buffered_len(), 1);

        let d = r.on_segment(&mut expected, 6, b"ghi");
        assert_eq!(
            d,
            Disposition::Delivered(vec![b"ghi".to_vec(), b"jkl".to_vec()])
        );
        assert_eq!(expected, 12);
    }

    #[test]
    fn duplicate_of_buffered_segment_is_dropped() {
        let mut r = Reorderer::new();
        let mut expected = 0;
        assert_eq!(r.on_segment(&mut expected, 8, b"x"), Disposition::Buffered);
        assert_eq!(r.on_segment(&mut expected, 8, b"x"), Disposition::Duplicate);
        assert_eq!(r.buffered_len(), 1);
    }

    #[test]
    fn below_expected_is_discarded() {
        let mut r = Reorderer::new();
        let mut expected = 0;
        r.on_segment(&mut expected, 0, b"hello");
        assert_eq!(expected, 5);

        // Retransmission of already-delivered bytes: strictly cumulative
        // acceptance, no replay window.
        assert_eq!(r.on_segment(&mut expected, 0, b"hello"), Disposition::Duplicate);
        assert_eq!(expected, 5);
    }

    #[test]
    fn sequence_wrap_around() {
        let start = u32::MAX - 2;
        let mut r = Reorderer::new();
        let mut expected = start;
        let d = r.on_segment(&mut expected, start, b"abcde");
        assert!(matches!(d, Disposition::Delivered(_)));
        assert_eq!(expected, start.wrapping_add(5));
    }

    #[tokio::test]
    async fn handler_forwards_ordered_chunks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut h = ReorderHandler::new(tx);
        let mut expected = 0u32;

        assert_eq!(
            h.on_data_segment(&mut expected, 4, b"efgh"),
            DataOutcome::Buffered
        );
        assert_eq!(
            h.on_data_segment(&mut expected, 0, b"abcd"),
            DataOutcome::Delivered { bytes: 8 }
        );
        assert_eq!(rx.recv().await.unwrap(), b"abcd");
        assert_eq!(rx.recv().await.unwrap(), b"efgh");
    }
}
