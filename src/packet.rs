//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for malformed or corrupted input.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                           Timestamp                           +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Payload Length                         |S|F|A|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          All Zeros            |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 24 bytes.
//! seq(4) + ack(4) + timestamp(8) + length/flags(4) + zeros(2) + checksum(2)
//!
//! The payload length and the three control flags share one 32-bit field:
//! the length occupies the upper bits and `SYN`/`FIN`/`ACK` the low three.

/// Bit-flag constants for the low three bits of the length/flags field.
pub mod flags {
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b100;
    /// Finish — sender has no more data to send.
    pub const FIN: u8 = 0b010;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b001;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 24;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_TIMESTAMP: usize = 8;
const OFF_LEN_FLAGS: usize = 16;
const OFF_CHECKSUM: usize = 22;

/// Number of low bits of the length/flags field holding control flags.
const FLAG_BITS: u32 = 3;
const FLAG_MASK: u32 = 0b111;

/// A complete protocol datagram: header fields + payload bytes.
///
/// Fields are in host byte order; [`Segment::encode`] converts to big-endian
/// on the wire and [`Segment::decode`] converts back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number of the first payload byte in this segment
    /// (byte-offset semantics; SYN and FIN each consume one offset).
    pub seq: u32,
    /// Cumulative acknowledgement number (next expected byte from the peer).
    pub ack: u32,
    /// Nanosecond timestamp: the sender's clock for ack-eliciting segments,
    /// or an echo of the triggering segment's value in acknowledgements.
    pub timestamp: u64,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Application bytes, at most MTU − [`HEADER_LEN`].
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    /// First sequence number *after* this segment.
    ///
    /// Data advances by payload length; SYN and FIN consume one offset each.
    pub fn end_offset(&self) -> u32 {
        let consumed = if self.is_syn() || self.is_fin() {
            1
        } else {
            self.payload.len() as u32
        };
        self.seq.wrapping_add(consumed)
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// The length/flags field and the checksum are computed here; `encode` is
    /// pure and deterministic for a given segment.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.len();
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 8].copy_from_slice(&self.timestamp.to_be_bytes());

        let len_flags = (payload_len as u32) << FLAG_BITS | (u32::from(self.flags) & FLAG_MASK);
        buf[OFF_LEN_FLAGS..OFF_LEN_FLAGS + 4].copy_from_slice(&len_flags.to_be_bytes());

        // Reserved bytes and the checksum field stay zero while summing.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = ones_complement_sum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a [`Segment`] from a raw datagram.
    ///
    /// Returns [`CodecError::Malformed`] if the buffer is shorter than
    /// [`HEADER_LEN`] or the declared payload length exceeds the bytes that
    /// follow the header, and [`CodecError::ChecksumMismatch`] when the
    /// stored checksum does not verify.  Bytes beyond the declared extent
    /// are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Malformed);
        }

        let seq = u32::from_be_bytes(buf[OFF_SEQ..OFF_SEQ + 4].try_into().unwrap());
        let ack = u32::from_be_bytes(buf[OFF_ACK..OFF_ACK + 4].try_into().unwrap());
        let timestamp =
            u64::from_be_bytes(buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 8].try_into().unwrap());
        let len_flags =
            u32::from_be_bytes(buf[OFF_LEN_FLAGS..OFF_LEN_FLAGS + 4].try_into().unwrap());

        let payload_len = (len_flags >> FLAG_BITS) as usize;
        let seg_flags = (len_flags & FLAG_MASK) as u8;

        if payload_len > buf.len() - HEADER_LEN {
            return Err(CodecError::Malformed);
        }

        let extent = HEADER_LEN + payload_len;
        if !verify(&buf[..extent]) {
            return Err(CodecError::ChecksumMismatch);
        }

        Ok(Segment {
            seq,
            ack,
            timestamp,
            flags: seg_flags,
            payload: buf[HEADER_LEN..extent].to_vec(),
        })
    }
}

/// Recompute the checksum of an encoded segment and compare with the stored
/// field.
///
/// Any single-bit corruption in header or payload is caught; some multi-bit
/// patterns cancel out, an inherent weakness of one's-complement checksums.
pub fn verify(buf: &[u8]) -> bool {
    if buf.len() < HEADER_LEN {
        return false;
    }
    let stored = u16::from_be_bytes([buf[OFF_CHECKSUM], buf[OFF_CHECKSUM + 1]]);
    let mut scratch = buf.to_vec();
    scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&0u16.to_be_bytes());
    ones_complement_sum(&scratch) == stored
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer shorter than the header, or the declared payload length
    /// exceeds the bytes available after the header.
    Malformed,
    /// Stored checksum did not match the recomputed value.
    ChecksumMismatch,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Malformed => write!(f, "declared payload length inconsistent with buffer"),
            CodecError::ChecksumMismatch => write!(f, "checksum verification failed"),
        }
    }
}

impl std::error::Error for CodecError {}

/// One's-complement 16-bit checksum (RFC 1071 style).
///
/// Sum consecutive 16-bit big-endian words, fold the carry back in, return
/// the bitwise complement.  The caller must zero the checksum field within
/// `data` before calling.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        sum += u32::from(u16::from_be_bytes([data[i], data[i + 1]]));
        i += 2;
    }
    // Odd trailing byte — pad with a zero byte on the right.
    if i < data.len() {
        sum += u32::from(data[i]) << 8;
    }

    // Fold 32-bit sum into 16 bits (end-around carry).
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

// ---------------------------------------------------------------------------
// Wrap-aware sequence comparison
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
///
/// The comparison works correctly as long as the two values are less than
/// `u32::MAX / 2` apart, which is always the case for a reasonable window.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Returns `true` when sequence number `a` is strictly before `b`.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
