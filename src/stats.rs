//! Per-connection transfer statistics.
//!
//! Both endpoints keep one [`TransferStats`] for the lifetime of a
//! connection.  The engine updates it as segments move; on teardown —
//! graceful close or abort — the final snapshot is handed back to the
//! application for the report below.

/// Counters accumulated over one connection's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Application payload bytes sent (sender) or delivered in order
    /// (receiver).  Retransmissions are not counted twice.
    pub bytes_transferred: u64,
    /// Datagrams handed to the socket successfully.
    pub segments_sent: u64,
    /// Datagrams received from the peer, including ones later discarded.
    pub segments_received: u64,
    /// Data segments that arrived ahead of the expected offset.
    pub out_of_order: u64,
    /// Datagrams discarded because the checksum did not verify.
    pub checksum_failures: u64,
    /// Segments retransmitted (RTO expiry or fast retransmit).
    pub retransmissions: u64,
    /// Inbound ACKs repeating the current highest-acked offset.
    pub duplicate_acks: u64,
}

impl std::fmt::Display for TransferStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "-------------------------------------------")?;
        writeln!(f, "Amount of data transferred: {}", self.bytes_transferred)?;
        writeln!(
            f,
            "Number of segments sent/received: {}/{}",
            self.segments_sent, self.segments_received
        )?;
        writeln!(f, "Number of out-of-sequence segments: {}", self.out_of_order)?;
        writeln!(
            f,
            "Number of segments discarded due to incorrect checksum: {}",
            self.checksum_failures
        )?;
        writeln!(f, "Number of segments retransmitted: {}", self.retransmissions)?;
        writeln!(f, "Number of duplicate ACKs: {}", self.duplicate_acks)?;
        write!(f, "-------------------------------------------")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_includes_every_counter() {
        let stats = TransferStats {
            bytes_transferred: 1024,
            segments_sent: 10,
            segments_received: 12,
            out_of_order: 3,
            checksum_failures: 1,
            retransmissions: 2,
            duplicate_acks: 4,
        };
        let report = stats.to_string();
        for needle in ["1024", "10/12", "3", "1", "2", "4"] {
            assert!(report.contains(needle), "missing {needle} in:\n{report}");
        }
    }
}
