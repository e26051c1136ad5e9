//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::engine::Connection`] can
//! occupy, mirroring the TCP state diagram (RFC 793 §3.2) trimmed to the
//! transitions this protocol actually takes.  State transitions live in
//! [`crate::engine`]; the engine's event loop is the only writer.
//!
//! ```text
//!  CLOSED ──send SYN──▶ SYN_SENT ────SYN+ACK rcvd────▶ ESTABLISHED
//!  CLOSED ──SYN rcvd──▶ SYN_RECEIVED ───ACK rcvd─────▶ ESTABLISHED
//!
//!  active closer:   ESTABLISHED ─send FIN─▶ FIN_WAIT ─peer FIN─▶ TIME_WAIT ─4×RTO─▶ CLOSED
//!  passive closer:  ESTABLISHED ─FIN rcvd─▶ CLOSE_WAIT ─send FIN+ACK─▶ LAST_ACK ─ACK─▶ CLOSED
//! ```

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and final state.
    #[default]
    Closed,
    /// SYN has been sent; waiting for SYN+ACK (active opener).
    SynSent,
    /// SYN received and SYN+ACK sent; waiting for ACK (passive opener).
    SynReceived,
    /// Handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for the peer's FIN (active closer).
    FinWait,
    /// Peer's FIN received; local FIN+ACK about to go out (passive closer).
    CloseWait,
    /// FIN+ACK sent; waiting for the final ACK (passive closer).
    LastAck,
    /// Both FINs exchanged; lingering 4×RTO to absorb late retransmissions
    /// before releasing resources (active closer).
    TimeWait,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
