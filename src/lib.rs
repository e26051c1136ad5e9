//! A miniature reliable transport over UDP, built for file transfer.
//!
//! The protocol provides TCP-like guarantees on top of unreliable datagrams:
//! a three-way handshake, byte-offset sequence numbers with cumulative
//! acknowledgments, a sliding window with adaptive retransmission timeouts,
//! fast retransmit on triple duplicate acks, and a four-way close with a
//! TimeWait linger.  Every segment is protected by a one's-complement
//! checksum; corrupt datagrams are counted and dropped, never delivered.
//!
//! # Layout
//!
//! ```text
//!  main      CLI: send / receive a file
//!    │
//!  engine    Connection, handshake, event loop, Session
//!    ├── packet      wire format: 24-byte header, checksum, seq arithmetic
//!    ├── state       connection FSM states
//!    ├── retransmit  RTT estimation, in-flight window, deadlines
//!    ├── reorder     receive-side ordering buffer
//!    ├── pacer       file → payload chunks, window backpressure
//!    ├── socket      segment-oriented async UDP
//!    └── stats       transfer counters and the final report
//!  simulator  seeded fault-injecting UDP relay (testing)
//! ```

pub mod engine;
pub mod pacer;
pub mod packet;
pub mod reorder;
pub mod retransmit;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
