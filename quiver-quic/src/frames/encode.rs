//! Frame serialization (RFC 9000 Section 19).
//!
//! STREAM and CRYPTO frames are always emitted with explicit offset and
//! length fields so packets can carry trailing padding.

use super::*;
use crate::types::{put_varint, varint_len, StreamDir};
use bytes::BufMut;

/// Serializes one frame into `buf`.
pub fn put_frame<B: BufMut>(buf: &mut B, frame: &Frame) {
    match frame {
        Frame::Padding(n) => {
            buf.put_bytes(0, *n);
        }

        Frame::Ping => put_varint(buf, FRAME_PING),

        Frame::Ack(ack) => {
            put_varint(
                buf,
                if ack.ecn.is_some() { FRAME_ACK_ECN } else { FRAME_ACK },
            );
            put_varint(buf, ack.largest);
            put_varint(buf, ack.delay);
            put_varint(buf, ack.ranges.len() as u64);
            put_varint(buf, ack.first_range);
            for r in &ack.ranges {
                put_varint(buf, r.gap);
                put_varint(buf, r.length);
            }
            if let Some(ecn) = &ack.ecn {
                put_varint(buf, ecn.ect0);
                put_varint(buf, ecn.ect1);
                put_varint(buf, ecn.ce);
            }
        }

        Frame::ResetStream { stream_id, error_code, final_size } => {
            put_varint(buf, FRAME_RESET_STREAM);
            put_varint(buf, stream_id.0);
            put_varint(buf, *error_code);
            put_varint(buf, *final_size);
        }

        Frame::StopSending { stream_id, error_code } => {
            put_varint(buf, FRAME_STOP_SENDING);
            put_varint(buf, stream_id.0);
            put_varint(buf, *error_code);
        }

        Frame::Crypto { offset, data } => {
            put_varint(buf, FRAME_CRYPTO);
            put_varint(buf, *offset);
            put_varint(buf, data.len() as u64);
            buf.put_slice(data);
        }

        Frame::NewToken { token } => {
            put_varint(buf, FRAME_NEW_TOKEN);
            put_varint(buf, token.len() as u64);
            buf.put_slice(token);
        }

        Frame::Stream { stream_id, offset, data, fin } => {
            let mut ty = FRAME_STREAM_BASE | STREAM_BIT_LEN | STREAM_BIT_OFF;
            if *fin {
                ty |= STREAM_BIT_FIN;
            }
            put_varint(buf, ty);
            put_varint(buf, stream_id.0);
            put_varint(buf, *offset);
            put_varint(buf, data.len() as u64);
            buf.put_slice(data);
        }

        Frame::MaxData(max) => {
            put_varint(buf, FRAME_MAX_DATA);
            put_varint(buf, *max);
        }

        Frame::MaxStreamData { stream_id, max } => {
            put_varint(buf, FRAME_MAX_STREAM_DATA);
            put_varint(buf, stream_id.0);
            put_varint(buf, *max);
        }

        Frame::MaxStreams { dir, max } => {
            put_varint(
                buf,
                match dir {
                    StreamDir::Bidi => FRAME_MAX_STREAMS_BIDI,
                    StreamDir::Uni => FRAME_MAX_STREAMS_UNI,
                },
            );
            put_varint(buf, *max);
        }

        Frame::DataBlocked(limit) => {
            put_varint(buf, FRAME_DATA_BLOCKED);
            put_varint(buf, *limit);
        }

        Frame::StreamDataBlocked { stream_id, limit } => {
            put_varint(buf, FRAME_STREAM_DATA_BLOCKED);
            put_varint(buf, stream_id.0);
            put_varint(buf, *limit);
        }

        Frame::StreamsBlocked { dir, limit } => {
            put_varint(
                buf,
                match dir {
                    StreamDir::Bidi => FRAME_STREAMS_BLOCKED_BIDI,
                    StreamDir::Uni => FRAME_STREAMS_BLOCKED_UNI,
                },
            );
            put_varint(buf, *limit);
        }

        Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token } => {
            put_varint(buf, FRAME_NEW_CONNECTION_ID);
            put_varint(buf, *seq);
            put_varint(buf, *retire_prior_to);
            buf.put_u8(cid.len() as u8);
            buf.put_slice(cid.as_bytes());
            buf.put_slice(reset_token);
        }

        Frame::RetireConnectionId { seq } => {
            put_varint(buf, FRAME_RETIRE_CONNECTION_ID);
            put_varint(buf, *seq);
        }

        Frame::PathChallenge(data) => {
            put_varint(buf, FRAME_PATH_CHALLENGE);
            buf.put_slice(data);
        }

        Frame::PathResponse(data) => {
            put_varint(buf, FRAME_PATH_RESPONSE);
            buf.put_slice(data);
        }

        Frame::ConnectionClose { code, frame_type, reason } => {
            match frame_type {
                Some(ft) => {
                    put_varint(buf, FRAME_CONNECTION_CLOSE);
                    put_varint(buf, *code);
                    put_varint(buf, *ft);
                }
                None => {
                    put_varint(buf, FRAME_CONNECTION_CLOSE_APP);
                    put_varint(buf, *code);
                }
            }
            put_varint(buf, reason.len() as u64);
            buf.put_slice(reason);
        }

        Frame::HandshakeDone => put_varint(buf, FRAME_HANDSHAKE_DONE),
    }
}

/// Exact serialized size of `frame`, used when fitting frames to the
/// datagram and congestion budgets.
pub fn encoded_len(frame: &Frame) -> usize {
    match frame {
        Frame::Padding(n) => *n,

        Frame::Ping | Frame::HandshakeDone => 1,

        Frame::Ack(ack) => {
            let mut len = 1
                + varint_len(ack.largest)
                + varint_len(ack.delay)
                + varint_len(ack.ranges.len() as u64)
                + varint_len(ack.first_range);
            for r in &ack.ranges {
                len += varint_len(r.gap) + varint_len(r.length);
            }
            if let Some(ecn) = &ack.ecn {
                len += varint_len(ecn.ect0) + varint_len(ecn.ect1) + varint_len(ecn.ce);
            }
            len
        }

        Frame::ResetStream { stream_id, error_code, final_size } => {
            1 + varint_len(stream_id.0) + varint_len(*error_code) + varint_len(*final_size)
        }

        Frame::StopSending { stream_id, error_code } => {
            1 + varint_len(stream_id.0) + varint_len(*error_code)
        }

        Frame::Crypto { offset, data } => {
            1 + varint_len(*offset) + varint_len(data.len() as u64) + data.len()
        }

        Frame::NewToken { token } => 1 + varint_len(token.len() as u64) + token.len(),

        Frame::Stream { stream_id, offset, data, .. } => {
            1 + varint_len(stream_id.0)
                + varint_len(*offset)
                + varint_len(data.len() as u64)
                + data.len()
        }

        Frame::MaxData(max) => 1 + varint_len(*max),

        Frame::MaxStreamData { stream_id, max } => {
            1 + varint_len(stream_id.0) + varint_len(*max)
        }

        Frame::MaxStreams { max, .. } => 1 + varint_len(*max),

        Frame::DataBlocked(limit) => 1 + varint_len(*limit),

        Frame::StreamDataBlocked { stream_id, limit } => {
            1 + varint_len(stream_id.0) + varint_len(*limit)
        }

        Frame::StreamsBlocked { limit, .. } => 1 + varint_len(*limit),

        Frame::NewConnectionId { seq, retire_prior_to, cid, .. } => {
            1 + varint_len(*seq) + varint_len(*retire_prior_to) + 1 + cid.len() + 16
        }

        Frame::RetireConnectionId { seq } => 1 + varint_len(*seq),

        Frame::PathChallenge(_) | Frame::PathResponse(_) => 1 + 8,

        Frame::ConnectionClose { code, frame_type, reason } => {
            1 + varint_len(*code)
                + frame_type.map_or(0, varint_len)
                + varint_len(reason.len() as u64)
                + reason.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn encoded_len_matches_output() {
        let frames = [
            Frame::Padding(7),
            Frame::Ping,
            Frame::Ack(AckFrame::from_ranges(&[(0, 3), (6, 6)], 100).unwrap()),
            Frame::Crypto { offset: 70, data: Bytes::from_static(&[1; 40]) },
            Frame::Stream {
                stream_id: crate::types::StreamId(4),
                offset: 16_400,
                data: Bytes::from_static(&[2; 9]),
                fin: false,
            },
            Frame::NewConnectionId {
                seq: 2,
                retire_prior_to: 1,
                cid: crate::types::ConnectionId::new(&[7; 5]).unwrap(),
                reset_token: [1; 16],
            },
            Frame::ConnectionClose {
                code: 0x07,
                frame_type: Some(0x1f),
                reason: Bytes::from_static(b"nope"),
            },
        ];
        for frame in frames {
            let mut buf = BytesMut::new();
            put_frame(&mut buf, &frame);
            assert_eq!(buf.len(), encoded_len(&frame), "{frame:?}");
        }
    }
}
