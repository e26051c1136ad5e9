//! Adaptive retransmission: RTT estimation, the in-flight segment registry,
//! and the flow-control gate.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`RttEstimator`] — Jacobson-style EWMA of round-trip samples, producing
//!   the current retransmission timeout (RTO).
//! - [`RetransmitQueue`] — one entry per segment awaiting acknowledgment,
//!   oldest first, together with a deadline registry.  The queue also acts
//!   as the flow-control gate: [`RetransmitQueue::can_send`] is false while
//!   the configured window is full.
//!
//! Deadlines live in a priority heap of epoch-tagged tokens.  Acknowledging
//! a segment does not hunt down its token; the token simply becomes stale
//! and is skipped when it surfaces.  Cancellation is therefore idempotent —
//! a deadline firing after its segment was acked is a no-op — and at most
//! one *live* token exists per in-flight segment.
//!
//! This module only manages state; all socket I/O and clock reads are the
//! caller's responsibility.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use crate::packet::{seq_le, Segment};

/// Consecutive retransmissions of one segment before the connection aborts.
pub const MAX_RETRIES: u32 = 16;

/// RTO before the first round-trip sample arrives.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Lower clamp on the RTO.  Loopback round trips are microseconds; an RTO
/// that small retransmits faster than ACKs can arrive.
pub const MIN_RTO: Duration = Duration::from_millis(10);

/// Upper clamp on the RTO.
pub const MAX_RTO: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// RttEstimator
// ---------------------------------------------------------------------------

/// Smoothed round-trip estimator.
///
/// First sample:  `SRTT = s`, `SDEV = 0`, `RTO = 2·s`.
/// Later samples: `dev  = |s − SRTT|`
///                `SRTT = 7/8·SRTT + 1/8·s`
///                `SDEV = 3/4·SDEV + 1/4·dev`
///                `RTO  = SRTT + 4·SDEV`
/// The resulting RTO is clamped to `[MIN_RTO, MAX_RTO]`.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    sdev: Duration,
    rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration) -> Self {
        Self {
            srtt: None,
            sdev: Duration::ZERO,
            rto: initial_rto,
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed round-trip time, if at least one sample has been recorded.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Feed one round-trip sample and recompute the RTO.
    pub fn sample(&mut self, s: Duration) {
        let raw = match self.srtt {
            None => {
                self.srtt = Some(s);
                self.sdev = Duration::ZERO;
                2 * s
            }
            Some(srtt) => {
                let dev = if s > srtt { s - srtt } else { srtt - s };
                let srtt = srtt * 7 / 8 + s / 8;
                self.srtt = Some(srtt);
                self.sdev = self.sdev * 3 / 4 + dev / 4;
                srtt + 4 * self.sdev
            }
        };
        self.rto = raw.clamp(MIN_RTO, MAX_RTO);
    }
}

// ---------------------------------------------------------------------------
// RetransmitQueue
// ---------------------------------------------------------------------------

/// A sent segment awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingSegment {
    /// The segment as first transmitted (timestamp and ack are refreshed on
    /// each retransmission by the engine).
    pub segment: Segment,
    /// Times this segment has been retransmitted.
    pub retries: u32,
    /// When the current retransmit deadline fires.
    pub deadline: Instant,
    /// Matches the live token in the deadline heap; older tokens are stale.
    epoch: u64,
}

/// Token in the deadline heap.  Ordered by deadline so the earliest surfaces
/// first; `seq`/`epoch` identify the pending entry it belongs to.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DeadlineToken {
    at: Instant,
    seq: u32,
    epoch: u64,
}

/// Result of a deadline expiry or a fast-retransmit request.
#[derive(Debug)]
pub enum Expiry {
    /// Resend this copy; its deadline has been rescheduled.
    Retransmit(Segment),
    /// The segment hit [`MAX_RETRIES`]; the connection must abort.
    RetryLimit,
}

/// Registry of in-flight segments, ordered oldest-first.
///
/// ```text
///   front (oldest unacked)                     back (newest)
///     │                                          │
///  ───┼──────────────────────────────────────────┼──▶ seq space
///     │ ◀───────── in flight ≤ window ─────────▶ │
/// ```
#[derive(Debug)]
pub struct RetransmitQueue {
    window: usize,
    in_flight: VecDeque<PendingSegment>,
    deadlines: BinaryHeap<Reverse<DeadlineToken>>,
    next_epoch: u64,
}

impl RetransmitQueue {
    /// `window` is the maximum number of simultaneously unacked segments.
    pub fn new(window: usize) -> Self {
        assert!(window >= 1, "window must be at least 1");
        Self {
            window,
            in_flight: VecDeque::with_capacity(window),
            deadlines: BinaryHeap::new(),
            next_epoch: 0,
        }
    }

    /// Flow-control gate: `true` while another segment may enter the window.
    pub fn can_send(&self) -> bool {
        self.in_flight.len() < self.window
    }

    /// Number of segments currently awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// `true` when at least one segment is awaiting acknowledgment.
    pub fn has_unacked(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Register a just-transmitted segment with deadline `now + rto`.
    pub fn register(&mut self, segment: Segment, now: Instant, rto: Duration) {
        debug_assert!(
            self.can_send(),
            "register called on a full window ({} / {})",
            self.in_flight.len(),
            self.window
        );
        let epoch = self.alloc_epoch();
        let deadline = now + rto;
        self.deadlines.push(Reverse(DeadlineToken {
            at: deadline,
            seq: segment.seq,
            epoch,
        }));
        self.in_flight.push_back(PendingSegment {
            segment,
            retries: 0,
            deadline,
            epoch,
        });
    }

    /// Release every segment whose end offset is covered by the cumulative
    /// ack `ack`.  Returns the number of segments released.  Their deadline
    /// tokens are left to go stale — cancellation is lazy and idempotent.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let mut released = 0;
        while let Some(front) = self.in_flight.front() {
            if seq_le(front.segment.end_offset(), ack) {
                self.in_flight.pop_front();
                released += 1;
            } else {
                break;
            }
        }
        released
    }

    /// Earliest live retransmit deadline, or `None` when nothing is in
    /// flight.  Stale tokens encountered on the way are discarded.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(token)) = self.deadlines.peek() {
            if self.is_live(token) {
                return Some(token.at);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Handle a fired deadline: bump the retry count of the expired segment
    /// and reschedule it.
    ///
    /// Returns `None` when no live deadline has actually passed (the timer
    /// raced with an acknowledgment — a no-op by design of the token
    /// scheme).
    pub fn expire(&mut self, now: Instant, rto: Duration) -> Option<Expiry> {
        loop {
            let token = match self.deadlines.peek() {
                Some(Reverse(t)) => t,
                None => return None,
            };
            if !self.is_live(token) {
                self.deadlines.pop();
                continue;
            }
            if token.at > now {
                return None;
            }
            let seq = token.seq;
            self.deadlines.pop();

            let idx = self
                .in_flight
                .iter()
                .position(|p| p.segment.seq == seq)
                .expect("live token without a pending segment");
            self.in_flight[idx].retries += 1;
            if self.in_flight[idx].retries >= MAX_RETRIES {
                return Some(Expiry::RetryLimit);
            }
            let epoch = self.alloc_epoch();
            let entry = &mut self.in_flight[idx];
            entry.deadline = now + rto;
            entry.epoch = epoch;
            let copy = entry.segment.clone();
            self.deadlines.push(Reverse(DeadlineToken {
                at: now + rto,
                seq,
                epoch,
            }));
            return Some(Expiry::Retransmit(copy));
        }
    }

    /// Immediately retransmit the pending segment starting at `seq` (the
    /// oldest unacked, identified by the duplicated ack value), bypassing
    /// its deadline.  The retry count is not bumped — only genuine timeouts
    /// count toward the limit — but a segment already at the limit still
    /// aborts.
    pub fn fast_retransmit(&mut self, seq: u32, now: Instant, rto: Duration) -> Option<Expiry> {
        let idx = self.in_flight.iter().position(|p| p.segment.seq == seq)?;
        if self.in_flight[idx].retries >= MAX_RETRIES {
            return Some(Expiry::RetryLimit);
        }
        let epoch = self.alloc_epoch();
        let entry = &mut self.in_flight[idx];
        entry.deadline = now + rto;
        entry.epoch = epoch;
        let copy = entry.segment.clone();
        self.deadlines.push(Reverse(DeadlineToken {
            at: now + rto,
            seq,
            epoch,
        }));
        Some(Expiry::Retransmit(copy))
    }

    /// Drop every pending segment and deadline (connection teardown).
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.deadlines.clear();
    }

    fn is_live(&self, token: &DeadlineToken) -> bool {
        self.in_flight
            .iter()
            .any(|p| p.segment.seq == token.seq && p.epoch == token.epoch)
    }

    fn alloc_epoch(&mut self) -> u64 {
        let e = self.next_epoch;
        self.next_epoch += 1;
        e
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::flags;

    fn data_segment(seq: u32, len: usize) -> Segment {
        Segment {
            seq,
            ack: 0,
            timestamp: 0,
            flags: 0,
            payload: vec![0u8; len],
        }
    }

    fn fin_segment(seq: u32) -> Segment {
        Segment {
            seq,
            ack: 0,
            timestamp: 0,
            flags: flags::FIN,
            payload: vec![],
        }
    }

    const RTO: Duration = Duration::from_millis(100);

    // -- RttEstimator -------------------------------------------------------

    #[test]
    fn first_sample_doubles() {
        let mut est = RttEstimator::new(INITIAL_RTO);
        assert_eq!(est.rto(), INITIAL_RTO);
        est.sample(Duration::from_millis(100));
        assert_eq!(est.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(est.rto(), Duration::from_millis(200));
    }

    #[test]
    fn subsequent_samples_follow_jacobson() {
        let mut est = RttEstimator::new(INITIAL_RTO);
        est.sample(Duration::from_millis(100));
        est.sample(Duration::from_millis(200));
        // srtt = 7/8·100 + 1/8·200 = 112.5ms, sdev = 1/4·|200−100| = 25ms,
        // rto  = 112.5 + 4·25 = 212.5ms
        assert_eq!(est.srtt(), Some(Duration::from_micros(112_500)));
        assert_eq!(est.rto(), Duration::from_micros(212_500));
    }

    #[test]
    fn steady_samples_converge() {
        let mut est = RttEstimator::new(INITIAL_RTO);
        for _ in 0..50 {
            est.sample(Duration::from_millis(40));
        }
        let srtt = est.srtt().unwrap();
        assert!(srtt >= Duration::from_millis(39) && srtt <= Duration::from_millis(41));
        // Deviation decays toward zero, so RTO approaches SRTT (≥ the clamp).
        assert!(est.rto() < Duration::from_millis(60));
    }

    #[test]
    fn rto_is_clamped() {
        let mut est = RttEstimator::new(INITIAL_RTO);
        est.sample(Duration::from_nanos(500));
        assert_eq!(est.rto(), MIN_RTO);
        est.sample(Duration::from_secs(120));
        assert_eq!(est.rto(), MAX_RTO);
    }

    // -- RetransmitQueue ----------------------------------------------------

    #[test]
    fn window_gate_blocks_at_capacity() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(2);
        assert!(q.can_send());
        q.register(data_segment(0, 5), now, RTO);
        q.register(data_segment(5, 5), now, RTO);
        assert!(!q.can_send());
        assert_eq!(q.in_flight(), 2);

        q.acknowledge(5);
        assert!(q.can_send());
        assert_eq!(q.in_flight(), 1);
    }

    #[test]
    fn cumulative_ack_releases_all_covered() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        for i in 0..3 {
            q.register(data_segment(i * 10, 10), now, RTO);
        }
        assert_eq!(q.acknowledge(30), 3);
        assert!(!q.has_unacked());
    }

    #[test]
    fn partial_ack_keeps_uncovered_segments() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        for i in 0..3 {
            q.register(data_segment(i * 10, 10), now, RTO);
        }
        assert_eq!(q.acknowledge(20), 2);
        assert_eq!(q.in_flight(), 1);
        // A duplicate of the same ack releases nothing further.
        assert_eq!(q.acknowledge(20), 0);
    }

    #[test]
    fn ack_covers_fin_end_offset() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(fin_segment(100), now, RTO);
        assert_eq!(q.acknowledge(100), 0, "FIN consumes one offset");
        assert_eq!(q.acknowledge(101), 1);
    }

    #[test]
    fn next_deadline_is_the_earliest() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(data_segment(0, 5), now, Duration::from_millis(300));
        q.register(data_segment(5, 5), now, Duration::from_millis(100));
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(100)));
    }

    #[test]
    fn expiry_retransmits_and_reschedules() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(data_segment(0, 5), now, RTO);

        // Not yet due.
        assert!(q.expire(now + Duration::from_millis(50), RTO).is_none());

        let later = now + Duration::from_millis(150);
        match q.expire(later, RTO) {
            Some(Expiry::Retransmit(seg)) => assert_eq!(seg.seq, 0),
            other => panic!("expected retransmit, got {other:?}"),
        }
        // Rescheduled one RTO out from the expiry instant.
        assert_eq!(q.next_deadline(), Some(later + RTO));
    }

    #[test]
    fn cancellation_is_idempotent() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(data_segment(0, 5), now, RTO);
        q.acknowledge(5);

        // The deadline token is stale; firing it is a no-op.
        assert!(q.expire(now + Duration::from_secs(10), RTO).is_none());
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn one_live_token_per_segment() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(data_segment(0, 5), now, RTO);

        // Expire twice; each expiry supersedes the previous token, so the
        // second call a moment later sees only the rescheduled deadline.
        let t1 = now + Duration::from_millis(150);
        assert!(matches!(q.expire(t1, RTO), Some(Expiry::Retransmit(_))));
        assert!(q.expire(t1 + Duration::from_millis(1), RTO).is_none());
    }

    #[test]
    fn sixteenth_retry_aborts() {
        let mut now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(data_segment(0, 5), now, RTO);

        for _ in 0..MAX_RETRIES - 1 {
            now += RTO + Duration::from_millis(1);
            assert!(matches!(q.expire(now, RTO), Some(Expiry::Retransmit(_))));
        }
        now += RTO + Duration::from_millis(1);
        assert!(matches!(q.expire(now, RTO), Some(Expiry::RetryLimit)));
    }

    #[test]
    fn fast_retransmit_targets_the_oldest() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(data_segment(0, 512), now, RTO);
        q.register(data_segment(512, 512), now, RTO);

        match q.fast_retransmit(0, now, RTO) {
            Some(Expiry::Retransmit(seg)) => assert_eq!(seg.seq, 0),
            other => panic!("expected retransmit, got {other:?}"),
        }
        // Retry count untouched; a later genuine timeout still counts from 0.
        assert_eq!(q.in_flight.front().unwrap().retries, 0);
        // Unknown seq is a no-op.
        assert!(q.fast_retransmit(9999, now, RTO).is_none());
    }

    #[test]
    fn clear_cancels_everything() {
        let now = Instant::now();
        let mut q = RetransmitQueue::new(4);
        q.register(data_segment(0, 5), now, RTO);
        q.register(data_segment(5, 5), now, RTO);
        q.clear();
        assert!(!q.has_unacked());
        assert_eq!(q.next_deadline(), None);
    }
}
