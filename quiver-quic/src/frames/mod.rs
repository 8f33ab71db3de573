//! QUIC frame types (RFC 9000 Section 19).
//!
//! Frames are owned: payload-bearing variants hold reference-counted
//! [`Bytes`], so a sent packet can retain its frame list for loss recovery
//! without copying the data.

mod encode;
mod parse;

pub use encode::encoded_len;
pub use encode::put_frame;
pub use parse::parse_frames;

use crate::types::{ConnectionId, ResetToken, StreamDir, StreamId, StreamOffset};
use bytes::Bytes;
use tinyvec::TinyVec;

pub const FRAME_PADDING: u64 = 0x00;
pub const FRAME_PING: u64 = 0x01;
pub const FRAME_ACK: u64 = 0x02;
pub const FRAME_ACK_ECN: u64 = 0x03;
pub const FRAME_RESET_STREAM: u64 = 0x04;
pub const FRAME_STOP_SENDING: u64 = 0x05;
pub const FRAME_CRYPTO: u64 = 0x06;
pub const FRAME_NEW_TOKEN: u64 = 0x07;
pub const FRAME_STREAM_BASE: u64 = 0x08; // 0x08..=0x0f
pub const FRAME_MAX_DATA: u64 = 0x10;
pub const FRAME_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const FRAME_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const FRAME_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const FRAME_PATH_CHALLENGE: u64 = 0x1a;
pub const FRAME_PATH_RESPONSE: u64 = 0x1b;
pub const FRAME_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_HANDSHAKE_DONE: u64 = 0x1e;

// STREAM type bits (RFC 9000 Section 19.8).
pub const STREAM_BIT_FIN: u64 = 0x01;
pub const STREAM_BIT_LEN: u64 = 0x02;
pub const STREAM_BIT_OFF: u64 = 0x04;

/// A gap/length pair in an ACK frame, both encoded minus one on the wire
/// (RFC 9000 Section 19.3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckRange {
    pub gap: u64,
    pub length: u64,
}

/// ECN counters reported in ACK_ECN frames (RFC 9000 Section 19.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// ACK frame in wire shape: a largest acknowledged packet number, the
/// length of the first (highest) range, and further gap/length pairs
/// descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest: u64,
    /// Raw ack-delay varint; scale by the peer's `ack_delay_exponent`.
    pub delay: u64,
    pub first_range: u64,
    pub ranges: TinyVec<[AckRange; 8]>,
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Builds an ACK from inclusive `(lo, hi)` ranges sorted ascending,
    /// as produced by the packet-number space.
    pub fn from_ranges(ranges: &[(u64, u64)], delay: u64) -> Option<Self> {
        let (&(lo, hi), rest) = ranges.split_last()?;
        let mut frame = AckFrame {
            largest: hi,
            delay,
            first_range: hi - lo,
            ranges: TinyVec::new(),
            ecn: None,
        };
        let mut prev_lo = lo;
        for &(lo, hi) in rest.iter().rev() {
            // gap is the number of missing packets between the ranges,
            // encoded minus one; same for the range length.
            frame.ranges.push(AckRange { gap: prev_lo - hi - 2, length: hi - lo });
            prev_lo = lo;
        }
        Some(frame)
    }

    /// Iterates the acknowledged ranges as inclusive `(lo, hi)` pairs,
    /// highest first. Returns `None` on arithmetic underflow (malformed
    /// frame claiming more packets than exist below `largest`).
    pub fn to_ranges(&self) -> Option<Vec<(u64, u64)>> {
        let mut out = Vec::with_capacity(1 + self.ranges.len());
        let mut hi = self.largest;
        let mut lo = hi.checked_sub(self.first_range)?;
        out.push((lo, hi));
        for r in &self.ranges {
            hi = lo.checked_sub(r.gap + 2)?;
            lo = hi.checked_sub(r.length)?;
            out.push((lo, hi));
        }
        Some(out)
    }
}

/// A single QUIC frame (RFC 9000 Section 19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A run of PADDING bytes.
    Padding(usize),
    Ping,
    Ack(AckFrame),
    ResetStream {
        stream_id: StreamId,
        error_code: u64,
        final_size: StreamOffset,
    },
    StopSending {
        stream_id: StreamId,
        error_code: u64,
    },
    Crypto {
        offset: StreamOffset,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream {
        stream_id: StreamId,
        offset: StreamOffset,
        data: Bytes,
        fin: bool,
    },
    MaxData(u64),
    MaxStreamData {
        stream_id: StreamId,
        max: u64,
    },
    MaxStreams {
        dir: StreamDir,
        max: u64,
    },
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: StreamId,
        limit: u64,
    },
    StreamsBlocked {
        dir: StreamDir,
        limit: u64,
    },
    NewConnectionId {
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: ResetToken,
    },
    RetireConnectionId {
        seq: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose {
        code: u64,
        /// `Some(ft)` for the transport variant (0x1c), `None` for the
        /// application variant (0x1d).
        frame_type: Option<u64>,
        reason: Bytes,
    },
    HandshakeDone,
}

impl Frame {
    /// Whether receiving this frame obliges the peer to acknowledge the
    /// packet (RFC 9000 Section 13.2).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose { .. }
        )
    }

    /// Whether this frame is re-queued when the packet carrying it is
    /// declared lost. ACKs and padding regenerate; CONNECTION_CLOSE is
    /// handled by the closing state.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose { .. }
        )
    }

    /// Frames permitted in Initial and Handshake packets
    /// (RFC 9000 Section 12.4, Table 3).
    pub fn allowed_pre_1rtt(&self) -> bool {
        matches!(
            self,
            Frame::Padding(_)
                | Frame::Ping
                | Frame::Ack(_)
                | Frame::Crypto { .. }
                | Frame::ConnectionClose { frame_type: Some(_), .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_range_conversion() {
        // Received 0..=2, 5..=6, 9.
        let frame = AckFrame::from_ranges(&[(0, 2), (5, 6), (9, 9)], 0).unwrap();
        assert_eq!(frame.largest, 9);
        assert_eq!(frame.first_range, 0);
        assert_eq!(frame.ranges.len(), 2);
        // 9 -> gap to 6 skips 7,8: encoded 1.
        assert_eq!(frame.ranges[0], AckRange { gap: 1, length: 1 });
        assert_eq!(frame.ranges[1], AckRange { gap: 1, length: 2 });

        let back = frame.to_ranges().unwrap();
        assert_eq!(back, vec![(9, 9), (5, 6), (0, 2)]);
    }

    #[test]
    fn ack_single_range() {
        let frame = AckFrame::from_ranges(&[(3, 7)], 42).unwrap();
        assert_eq!(frame.largest, 7);
        assert_eq!(frame.first_range, 4);
        assert!(frame.ranges.is_empty());
        assert_eq!(frame.to_ranges().unwrap(), vec![(3, 7)]);
    }

    #[test]
    fn ack_underflow_rejected() {
        let frame = AckFrame {
            largest: 1,
            delay: 0,
            first_range: 5,
            ranges: TinyVec::new(),
            ecn: None,
        };
        assert!(frame.to_ranges().is_none());
    }

    #[test]
    fn classification() {
        assert!(!Frame::Padding(3).is_ack_eliciting());
        assert!(!Frame::ConnectionClose { code: 0, frame_type: Some(0), reason: Bytes::new() }
            .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::MaxData(10).is_retransmittable());
        assert!(Frame::Ping.allowed_pre_1rtt());
        assert!(!Frame::MaxData(10).allowed_pre_1rtt());
    }
}
