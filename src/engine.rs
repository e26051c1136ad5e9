//! Per-connection protocol engine.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session and is its **single writer**:
//! - handshake (`connect` for the active opener, `accept` for the passive),
//! - the event loop dispatching inbound segments, outbound data, retransmit
//!   deadlines, and the close linger,
//! - teardown, graceful or by retry-limit abort, always yielding the final
//!   [`TransferStats`].
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │  outbound chunks              Session
//!      │  (pacer → bounded mpsc)   ┌───────────────────┐
//!      │                           │ outbound  (mpsc)  │
//!      ▼                           │ delivered (mpsc)  │
//!  Connection (event-loop task)    └─────────┬─────────┘
//!    ├── RetransmitQueue (window + deadlines)│
//!    ├── RttEstimator    (adaptive RTO)      │
//!    ├── DataHandler     (role seam)         │
//!    └── Arc<Socket>     (shared UDP)────────┘
//! ```
//!
//! Everything that mutates connection state runs on the event-loop task;
//! the pacer and the application only talk to it through channels.  The
//! flow-control gate is the guard on the outbound branch: data is pulled
//! from the channel only while the retransmit window has room, so a full
//! window blocks the pacer through channel backpressure.
//!
//! # Roles
//!
//! The engine itself is role-agnostic.  Payload handling is the one seam
//! that differs, expressed by [`DataHandler`]: the sending side installs the
//! no-op [`NullHandler`], the receiving side installs
//! [`crate::reorder::ReorderHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::packet::{flags, seq_le, seq_lt, CodecError, Segment, HEADER_LEN};
use crate::reorder::ReorderHandler;
use crate::retransmit::{Expiry, RetransmitQueue, RttEstimator, INITIAL_RTO, MAX_RETRIES};
use crate::socket::{Socket, SocketError};
use crate::state::ConnectionState;
use crate::stats::TransferStats;

/// Duplicate-ack count that triggers a fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// Linger in TimeWait for this many RTOs before releasing resources.
const LINGER_RTOS: u32 = 4;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables supplied by the application boundary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum datagram size, header included.
    pub mtu: usize,
    /// Maximum number of simultaneously unacknowledged segments.
    pub window: usize,
    /// Initial sequence number for the local send direction.
    pub initial_seq: u32,
    /// RTO before the first round-trip sample arrives.
    pub initial_rto: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1500,
            window: 8,
            initial_seq: 0,
            initial_rto: INITIAL_RTO,
        }
    }
}

impl Config {
    /// Largest payload that fits a datagram alongside the header.
    pub fn max_payload(&self) -> usize {
        self.mtu.saturating_sub(HEADER_LEN)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by connection operations.
#[derive(Debug)]
pub enum ConnError {
    /// Underlying transport failure.
    Socket(SocketError),
    /// The three-way handshake did not complete within the retry budget.
    HandshakeFailed,
    /// A segment went unacknowledged through 16 retransmissions — the only
    /// fatal in-protocol condition.
    MaxRetriesExceeded,
    /// The engine task is gone; the connection no longer exists.
    Closed,
}

impl std::fmt::Display for ConnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "transport error: {e}"),
            Self::HandshakeFailed => write!(f, "handshake failed after maximum retries"),
            Self::MaxRetriesExceeded => write!(f, "segment unacknowledged after maximum retries"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnError {}

impl From<SocketError> for ConnError {
    fn from(e: SocketError) -> Self {
        Self::Socket(e)
    }
}

// ---------------------------------------------------------------------------
// Role seam
// ---------------------------------------------------------------------------

/// What a role did with an inbound data segment.
#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// Bytes delivered in order to the sink (includes drained buffers).
    Delivered { bytes: usize },
    /// Stored ahead of the expected offset.
    Buffered,
    /// Already delivered or already buffered; dropped.
    Duplicate,
    /// This role does not consume payload.
    Ignored,
}

/// Role-specific payload handling: the only behavioural difference between
/// the transmitting and receiving endpoint.
pub trait DataHandler: Send {
    /// Process the payload of an inbound data segment.  `rcv_nxt` is the
    /// connection's expected-receive offset; implementations advance it
    /// past everything they deliver.
    fn on_data_segment(&mut self, rcv_nxt: &mut u32, seq: u32, payload: &[u8]) -> DataOutcome;
}

/// Sender-role variant: inbound payload is unexpected and ignored.
pub struct NullHandler;

impl DataHandler for NullHandler {
    fn on_data_segment(&mut self, _rcv_nxt: &mut u32, _seq: u32, _payload: &[u8]) -> DataOutcome {
        DataOutcome::Ignored
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One endpoint of a reliable connection over UDP.
pub struct Connection {
    /// Current FSM state.
    pub state: ConnectionState,
    /// Next sequence number for the local send direction (`SND.NXT`).
    pub snd_nxt: u32,
    /// Next expected sequence number from the peer (`RCV.NXT`), which is
    /// also the cumulative ack value we advertise.
    pub rcv_nxt: u32,
    /// Counters for the final report.
    pub stats: TransferStats,

    socket: Arc<Socket>,
    peer: SocketAddr,
    config: Config,
    rtt: RttEstimator,
    pending: RetransmitQueue,
    handler: Box<dyn DataHandler>,
    delivered_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,

    /// Highest cumulative ack received from the peer.
    highest_ack: u32,
    /// Consecutive inbound ACKs repeating `highest_ack`.
    dup_acks: u32,
    /// Local clock origin for wire timestamps.
    epoch: Instant,

    initiated_close: bool,
    fin_sent: bool,
    fin_received: bool,
    at_eof: bool,
    linger_until: Option<Instant>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(
        socket: Arc<Socket>,
        peer: SocketAddr,
        config: Config,
        handler: Box<dyn DataHandler>,
    ) -> Self {
        let rtt = RttEstimator::new(config.initial_rto);
        let pending = RetransmitQueue::new(config.window);
        Self {
            state: ConnectionState::Closed,
            snd_nxt: config.initial_seq,
            rcv_nxt: 0,
            stats: TransferStats::default(),
            socket,
            peer,
            config,
            rtt,
            pending,
            handler,
            delivered_rx: None,
            highest_ack: 0,
            dup_acks: 0,
            epoch: Instant::now(),
            initiated_close: false,
            fin_sent: false,
            fin_received: false,
            at_eof: false,
            linger_until: None,
        }
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Active open (the transmitting endpoint).
    ///
    /// Sends SYN and waits for a matching SYN+ACK, resending every RTO; a
    /// silent peer fails the handshake after [`MAX_RETRIES`] attempts.
    pub async fn connect(
        socket: Socket,
        peer: SocketAddr,
        config: Config,
    ) -> Result<Self, ConnError> {
        let mut conn = Self::new(Arc::new(socket), peer, config, Box::new(NullHandler));
        conn.state = ConnectionState::SynSent;
        let isn = conn.config.initial_seq;

        for attempt in 0..MAX_RETRIES {
            let syn = Segment {
                seq: isn,
                ack: 0,
                timestamp: conn.now_ts(),
                flags: flags::SYN,
                payload: vec![],
            };
            if attempt > 0 {
                conn.stats.retransmissions += 1;
            }
            conn.transmit(&syn).await;

            match timeout(conn.rtt.rto(), conn.socket.recv_from()).await {
                Ok(Ok((seg, addr))) if addr == peer => {
                    conn.stats.segments_received += 1;
                    conn.trace("rcv", &seg);
                    if seg.is_syn() && seg.is_ack() && seg.ack == isn.wrapping_add(1) {
                        conn.rcv_nxt = seg.seq.wrapping_add(1);
                        conn.snd_nxt = isn.wrapping_add(1);
                        conn.highest_ack = seg.ack;
                        conn.rtt.sample(conn.elapsed_since(seg.timestamp));
                        let ack = conn.pure_ack(seg.timestamp);
                        conn.transmit(&ack).await;
                        conn.state = ConnectionState::Established;
                        log::debug!(
                            "[conn] established (active) snd_nxt={} rcv_nxt={} rto={:?}",
                            conn.snd_nxt,
                            conn.rcv_nxt,
                            conn.rtt.rto()
                        );
                        return Ok(conn);
                    }
                }
                Ok(Ok(_)) => {} // stranger; keep waiting via the next attempt
                Ok(Err(SocketError::Codec(e))) => {
                    conn.stats.segments_received += 1;
                    if e == CodecError::ChecksumMismatch {
                        conn.stats.checksum_failures += 1;
                    }
                }
                Ok(Err(SocketError::Io(e))) => return Err(SocketError::Io(e).into()),
                Err(_elapsed) => {}
            }
        }
        Err(ConnError::HandshakeFailed)
    }

    /// Passive open (the receiving endpoint).
    ///
    /// Waits indefinitely for the opening SYN, then answers SYN+ACK —
    /// resent on timeout and whenever a duplicate SYN shows a lost reply —
    /// until the peer's ACK arrives.
    pub async fn accept(socket: Socket, config: Config) -> Result<Self, ConnError> {
        let socket = Arc::new(socket);

        let (peer, syn) = loop {
            match socket.recv_from().await {
                Ok((seg, addr)) if seg.is_syn() && !seg.is_ack() => break (addr, seg),
                Ok(_) => continue,
                Err(SocketError::Codec(_)) => continue,
                Err(SocketError::Io(e)) => return Err(SocketError::Io(e).into()),
            }
        };

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let mut conn = Self::new(
            Arc::clone(&socket),
            peer,
            config,
            Box::new(ReorderHandler::new(delivery_tx)),
        );
        conn.delivered_rx = Some(delivery_rx);
        conn.state = ConnectionState::SynReceived;
        conn.stats.segments_received += 1;
        conn.rcv_nxt = syn.seq.wrapping_add(1);
        let isn = conn.config.initial_seq;
        let mut echo_ts = syn.timestamp;

        for attempt in 0..MAX_RETRIES {
            let syn_ack = Segment {
                seq: isn,
                ack: conn.rcv_nxt,
                timestamp: echo_ts,
                flags: flags::SYN | flags::ACK,
                payload: vec![],
            };
            if attempt > 0 {
                conn.stats.retransmissions += 1;
            }
            conn.transmit(&syn_ack).await;

            match timeout(conn.rtt.rto(), conn.socket.recv_from()).await {
                Ok(Ok((seg, addr))) if addr == peer => {
                    conn.stats.segments_received += 1;
                    conn.trace("rcv", &seg);
                    if seg.is_syn() && !seg.is_ack() {
                        // Our SYN+ACK was lost; re-acknowledge the setup.
                        echo_ts = seg.timestamp;
                        continue;
                    }
                    // Anything carrying an ack that covers our SYN+ACK
                    // proves the handshake completed on the peer's side —
                    // including data racing ahead of a lost final ACK.  A
                    // data segment consumed here is recovered by the
                    // peer's retransmit timer.
                    if !seg.is_syn() && seq_le(isn.wrapping_add(1), seg.ack) {
                        conn.snd_nxt = isn.wrapping_add(1);
                        conn.highest_ack = isn.wrapping_add(1);
                        if seg.is_ack() {
                            conn.rtt.sample(conn.elapsed_since(seg.timestamp));
                        }
                        conn.state = ConnectionState::Established;
                        log::debug!(
                            "[conn] established (passive) snd_nxt={} rcv_nxt={}",
                            conn.snd_nxt,
                            conn.rcv_nxt
                        );
                        return Ok(conn);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(SocketError::Codec(e))) => {
                    conn.stats.segments_received += 1;
                    if e == CodecError::ChecksumMismatch {
                        conn.stats.checksum_failures += 1;
                    }
                }
                Ok(Err(SocketError::Io(e))) => return Err(SocketError::Io(e).into()),
                Err(_elapsed) => {}
            }
        }
        Err(ConnError::HandshakeFailed)
    }

    /// Spawn the event loop and return the application-facing [`Session`].
    pub fn start(mut self) -> Session {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.window.max(1));
        let delivered = self.delivered_rx.take().unwrap_or_else(|| {
            // Sender role: no delivery stream; hand back a closed channel.
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        });
        let handle = tokio::spawn(event_loop(self, outbound_rx));
        Session {
            outbound: outbound_tx,
            delivered,
            handle,
        }
    }

    // -----------------------------------------------------------------------
    // Segment construction and transmission
    // -----------------------------------------------------------------------

    /// Build a pure ACK echoing `echo_ts` for the peer's RTT measurement.
    fn pure_ack(&self, echo_ts: u64) -> Segment {
        Segment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            timestamp: echo_ts,
            flags: flags::ACK,
            payload: vec![],
        }
    }

    /// Encode and send one segment.  Send failures are logged and
    /// non-fatal — the retransmission machinery covers the gap.
    async fn transmit(&mut self, seg: &Segment) {
        self.trace("snd", seg);
        match self.socket.send_segment(seg, self.peer).await {
            Ok(()) => self.stats.segments_sent += 1,
            Err(e) => log::warn!("[conn] send failed (will rely on retransmit): {e}"),
        }
    }

    async fn send_data(&mut self, payload: Vec<u8>) {
        let seg = Segment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            timestamp: self.now_ts(),
            flags: 0,
            payload,
        };
        self.snd_nxt = self.snd_nxt.wrapping_add(seg.payload.len() as u32);
        self.stats.bytes_transferred += seg.payload.len() as u64;
        self.transmit(&seg).await;
        self.pending.register(seg, Instant::now(), self.rtt.rto());
        log::debug!(
            "[conn] → DATA snd_nxt={} in_flight={}",
            self.snd_nxt,
            self.pending.in_flight()
        );
    }

    async fn send_fin(&mut self) {
        let seg = Segment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            timestamp: self.now_ts(),
            flags: flags::FIN,
            payload: vec![],
        };
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.fin_sent = true;
        self.initiated_close = true;
        self.state = ConnectionState::FinWait;
        self.transmit(&seg).await;
        self.pending.register(seg, Instant::now(), self.rtt.rto());
        log::debug!("[conn] → FIN seq={} (source drained)", self.snd_nxt.wrapping_sub(1));
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Process one verified inbound segment.  Runs on the event-loop task,
    /// the sole writer of connection state.
    async fn dispatch(&mut self, seg: Segment) -> Flow {
        self.trace("rcv", &seg);

        if seg.is_ack() {
            // Passive closer: an ACK without FIN completes teardown.
            if self.state == ConnectionState::LastAck && !seg.is_fin() {
                return Flow::Finished;
            }

            if seq_lt(self.highest_ack, seg.ack) {
                self.highest_ack = seg.ack;
                self.dup_acks = 0;
                self.rtt.sample(self.elapsed_since(seg.timestamp));
                let released = self.pending.acknowledge(seg.ack);
                if released > 0 {
                    log::debug!(
                        "[conn] ← ACK ack={} released={} in_flight={} rto={:?}",
                        seg.ack,
                        released,
                        self.pending.in_flight(),
                        self.rtt.rto()
                    );
                }
            } else if seg.ack == self.highest_ack {
                self.dup_acks += 1;
                self.stats.duplicate_acks += 1;
                if self.dup_acks == DUP_ACK_THRESHOLD {
                    log::debug!("[conn] third duplicate ack={}; fast retransmit", seg.ack);
                    match self
                        .pending
                        .fast_retransmit(seg.ack, Instant::now(), self.rtt.rto())
                    {
                        Some(Expiry::Retransmit(mut copy)) => {
                            copy.timestamp = self.now_ts();
                            copy.ack = self.rcv_nxt;
                            self.stats.retransmissions += 1;
                            self.transmit(&copy).await;
                        }
                        Some(Expiry::RetryLimit) => {
                            return Flow::Abort(ConnError::MaxRetriesExceeded)
                        }
                        None => {}
                    }
                }
            }
        }

        if seg.is_syn() {
            // The peer never saw our handshake ACK; re-acknowledge it.
            let ack = self.pure_ack(seg.timestamp);
            self.transmit(&ack).await;
        } else if seg.is_fin() {
            self.on_fin(&seg).await;
        } else if !seg.payload.is_empty() {
            // Data segments carry the peer's cumulative ack even without
            // the ACK flag; release whatever it covers.
            self.pending.acknowledge(seg.ack);

            let outcome = self
                .handler
                .on_data_segment(&mut self.rcv_nxt, seg.seq, &seg.payload);
            match outcome {
                DataOutcome::Delivered { bytes } => {
                    self.stats.bytes_transferred += bytes as u64;
                }
                DataOutcome::Buffered => self.stats.out_of_order += 1,
                DataOutcome::Duplicate | DataOutcome::Ignored => {}
            }

            // Acknowledge segments at or below the expected offset; one
            // buffered ahead of a gap earns no ack, so the sender's timer
            // recovers the gap.
            if seq_le(seg.seq, self.rcv_nxt) {
                let ack = self.pure_ack(seg.timestamp);
                self.transmit(&ack).await;
            }
        }

        Flow::Continue
    }

    /// FIN handling for both closing paths.
    async fn on_fin(&mut self, seg: &Segment) {
        // A retransmitted FIN must not advance the offset twice.
        if seg.seq == self.rcv_nxt && !self.fin_received {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.fin_received = true;
        }

        if self.initiated_close {
            // Active closer: ack the peer's FIN, then linger to absorb late
            // retransmissions before releasing resources.
            let ack = self.pure_ack(seg.timestamp);
            self.transmit(&ack).await;
            if self.linger_until.is_none() {
                let linger = LINGER_RTOS * self.rtt.rto();
                self.linger_until = Some(Instant::now() + linger);
                self.state = ConnectionState::TimeWait;
                log::debug!("[conn] ← FIN; entering TimeWait for {linger:?}");
            }
        } else if !self.fin_sent {
            // Passive closer: answer with FIN+ACK and wait for the final ack.
            self.state = ConnectionState::CloseWait;
            let fin_ack = Segment {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                timestamp: self.now_ts(),
                flags: flags::FIN | flags::ACK,
                payload: vec![],
            };
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            self.transmit(&fin_ack).await;
            self.pending.register(fin_ack, Instant::now(), self.rtt.rto());
            self.state = ConnectionState::LastAck;
            log::debug!("[conn] ← FIN; → FIN+ACK, awaiting final ack");
        }
    }

    /// A retransmit deadline fired (or raced with an acknowledgment).
    async fn on_rto_fired(&mut self) -> Flow {
        match self.pending.expire(Instant::now(), self.rtt.rto()) {
            Some(Expiry::Retransmit(mut seg)) => {
                seg.timestamp = self.now_ts();
                seg.ack = self.rcv_nxt;
                self.stats.retransmissions += 1;
                log::debug!("[conn] RTO expired; retransmitting seq={}", seg.seq);
                self.transmit(&seg).await;
                Flow::Continue
            }
            Some(Expiry::RetryLimit) => Flow::Abort(ConnError::MaxRetriesExceeded),
            None => Flow::Continue, // deadline cancelled by a racing ack
        }
    }

    fn may_accept_data(&self) -> bool {
        !self.at_eof && self.state == ConnectionState::Established && self.pending.can_send()
    }

    // -----------------------------------------------------------------------
    // Clock helpers
    // -----------------------------------------------------------------------

    /// Nanoseconds since this connection's clock origin.
    fn now_ts(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Round-trip sample from an echoed timestamp (saturating: a foreign or
    /// garbled echo collapses to zero and is absorbed by the RTO clamp).
    fn elapsed_since(&self, ts: u64) -> Duration {
        Duration::from_nanos(self.now_ts().saturating_sub(ts))
    }

    fn trace(&self, dir: &str, seg: &Segment) {
        log::trace!(
            "[conn] {dir} {:9.3} {}{}{}{} seq={} len={} ack={}",
            self.epoch.elapsed().as_secs_f64(),
            if seg.is_syn() { 'S' } else { '-' },
            if seg.is_ack() { 'A' } else { '-' },
            if seg.is_fin() { 'F' } else { '-' },
            if seg.payload.is_empty() { '-' } else { 'D' },
            seg.seq,
            seg.payload.len(),
            seg.ack
        );
    }
}

/// Control-flow result of one dispatch step.
enum Flow {
    Continue,
    Finished,
    Abort(ConnError),
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn event_loop(
    mut conn: Connection,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
) -> (TransferStats, Result<(), ConnError>) {
    let socket = Arc::clone(&conn.socket);

    let outcome = loop {
        // End-of-data: once the in-flight window drains, emit FIN.
        if conn.at_eof
            && !conn.fin_sent
            && !conn.pending.has_unacked()
            && conn.state == ConnectionState::Established
        {
            conn.send_fin().await;
        }

        let rto_deadline = conn.pending.next_deadline();
        let linger_deadline = conn.linger_until;

        tokio::select! {
            // ── Outbound data, gated on window capacity ──────────────────
            maybe = data_rx.recv(), if conn.may_accept_data() => {
                match maybe {
                    Some(payload) => conn.send_data(payload).await,
                    None => {
                        conn.at_eof = true;
                        log::debug!(
                            "[conn] outbound stream ended; draining {} in flight",
                            conn.pending.in_flight()
                        );
                    }
                }
            }

            // ── Inbound datagram ─────────────────────────────────────────
            result = socket.recv_from() => {
                match result {
                    Ok((seg, addr)) => {
                        if addr != conn.peer {
                            continue;
                        }
                        conn.stats.segments_received += 1;
                        match conn.dispatch(seg).await {
                            Flow::Continue => {}
                            Flow::Finished => break Ok(()),
                            Flow::Abort(e) => break Err(e),
                        }
                    }
                    // A corrupt datagram is dropped and counted; the
                    // receive loop keeps going.
                    Err(SocketError::Codec(e)) => {
                        conn.stats.segments_received += 1;
                        if e == CodecError::ChecksumMismatch {
                            conn.stats.checksum_failures += 1;
                        }
                        log::debug!("[conn] dropped undecodable datagram: {e}");
                    }
                    Err(SocketError::Io(e)) => break Err(SocketError::Io(e).into()),
                }
            }

            // ── Retransmit deadline ──────────────────────────────────────
            _ = sleep_until_opt(rto_deadline), if rto_deadline.is_some() => {
                match conn.on_rto_fired().await {
                    Flow::Continue => {}
                    Flow::Finished => break Ok(()),
                    Flow::Abort(e) => break Err(e),
                }
            }

            // ── TimeWait linger; a no-op once torn down by other means ───
            _ = sleep_until_opt(linger_deadline), if linger_deadline.is_some() => {
                log::debug!("[conn] linger elapsed; releasing resources");
                break Ok(());
            }
        }
    };

    conn.pending.clear();
    conn.state = ConnectionState::Closed;
    match &outcome {
        Ok(()) => log::debug!("[conn] teardown complete"),
        Err(e) => log::warn!("[conn] connection aborted: {e}"),
    }
    (conn.stats, outcome)
}

/// Sleep until `deadline`, or forever when there is none.  Branch guards
/// keep the forever case unpolled.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Session — application handle
// ---------------------------------------------------------------------------

/// Handle returned by [`Connection::start`].
///
/// Dropping (or closing) `outbound` is the end-of-data signal: the engine
/// drains in-flight segments, sends FIN, and completes teardown.  `finish`
/// always yields the final statistics, abort included.
pub struct Session {
    /// Outbound payload chunks (fed by [`crate::pacer::pace`]).
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Ordered inbound bytes (receiving role; closed immediately for the
    /// sending role).
    pub delivered: mpsc::UnboundedReceiver<Vec<u8>>,
    handle: JoinHandle<(TransferStats, Result<(), ConnError>)>,
}

impl Session {
    /// Queue one payload chunk for transmission.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), ConnError> {
        self.outbound.send(data).await.map_err(|_| ConnError::Closed)
    }

    /// Next in-order chunk delivered by the peer; `None` once the stream
    /// has ended and the connection closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.delivered.recv().await
    }

    /// Signal end-of-data and wait for teardown.
    pub async fn finish(self) -> (TransferStats, Result<(), ConnError>) {
        let Session {
            outbound,
            delivered,
            handle,
        } = self;
        drop(outbound);
        let result = handle.await;
        drop(delivered);
        result.unwrap_or_else(|e| {
            log::error!("[conn] engine task failed: {e}");
            (TransferStats::default(), Err(ConnError::Closed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_payload_subtracts_header() {
        let config = Config {
            mtu: 1500,
            ..Config::default()
        };
        assert_eq!(config.max_payload(), 1500 - HEADER_LEN);

        let tiny = Config {
            mtu: 10,
            ..Config::default()
        };
        assert_eq!(tiny.max_payload(), 0, "saturates instead of underflowing");
    }

    #[test]
    fn null_handler_ignores_payload() {
        let mut rcv_nxt = 42;
        let outcome = NullHandler.on_data_segment(&mut rcv_nxt, 42, b"unexpected");
        assert_eq!(outcome, DataOutcome::Ignored);
        assert_eq!(rcv_nxt, 42);
    }
}
