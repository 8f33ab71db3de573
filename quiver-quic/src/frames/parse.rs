//! Frame parsing (RFC 9000 Section 12.4, 19).

use super::*;
use crate::error::{Error, Result, TransportErrorCode};
use crate::types::{get_varint, ConnectionId, StreamId};
use bytes::{Buf, Bytes};

fn truncated(frame_type: u64) -> Error {
    Error::Transport {
        code: TransportErrorCode::FrameEncodingError,
        frame_type,
        reason: "truncated frame",
    }
}

/// Parses every frame in a decrypted packet payload.
///
/// An empty payload is a protocol violation (RFC 9000 Section 12.4);
/// unknown frame types close the connection with FRAME_ENCODING_ERROR.
pub fn parse_frames(payload: &mut Bytes) -> Result<Vec<Frame>> {
    if payload.is_empty() {
        return Err(Error::transport(
            TransportErrorCode::ProtocolViolation,
            "packet with empty payload",
        ));
    }

    let mut frames = Vec::new();
    while payload.has_remaining() {
        frames.push(parse_frame(payload)?);
    }
    Ok(frames)
}

fn parse_frame(buf: &mut Bytes) -> Result<Frame> {
    let ty = get_varint(buf).ok_or_else(|| truncated(0))?;

    let frame = match ty {
        FRAME_PADDING => {
            // Collapse the run; padding carries no information besides
            // its length.
            let mut run = 1usize;
            while buf.has_remaining() && buf.chunk()[0] == 0 {
                buf.advance(1);
                run += 1;
            }
            Frame::Padding(run)
        }

        FRAME_PING => Frame::Ping,

        FRAME_ACK | FRAME_ACK_ECN => {
            let largest = get_varint(buf).ok_or_else(|| truncated(ty))?;
            let delay = get_varint(buf).ok_or_else(|| truncated(ty))?;
            let range_count = get_varint(buf).ok_or_else(|| truncated(ty))?;
            let first_range = get_varint(buf).ok_or_else(|| truncated(ty))?;

            let mut ranges = TinyVec::new();
            for _ in 0..range_count {
                let gap = get_varint(buf).ok_or_else(|| truncated(ty))?;
                let length = get_varint(buf).ok_or_else(|| truncated(ty))?;
                ranges.push(AckRange { gap, length });
            }

            let ecn = if ty == FRAME_ACK_ECN {
                Some(EcnCounts {
                    ect0: get_varint(buf).ok_or_else(|| truncated(ty))?,
                    ect1: get_varint(buf).ok_or_else(|| truncated(ty))?,
                    ce: get_varint(buf).ok_or_else(|| truncated(ty))?,
                })
            } else {
                None
            };

            let ack = AckFrame { largest, delay, first_range, ranges, ecn };
            if ack.to_ranges().is_none() {
                return Err(Error::Transport {
                    code: TransportErrorCode::FrameEncodingError,
                    frame_type: ty,
                    reason: "ACK ranges exceed largest acknowledged",
                });
            }
            Frame::Ack(ack)
        }

        FRAME_RESET_STREAM => Frame::ResetStream {
            stream_id: StreamId(get_varint(buf).ok_or_else(|| truncated(ty))?),
            error_code: get_varint(buf).ok_or_else(|| truncated(ty))?,
            final_size: get_varint(buf).ok_or_else(|| truncated(ty))?,
        },

        FRAME_STOP_SENDING => Frame::StopSending {
            stream_id: StreamId(get_varint(buf).ok_or_else(|| truncated(ty))?),
            error_code: get_varint(buf).ok_or_else(|| truncated(ty))?,
        },

        FRAME_CRYPTO => {
            let offset = get_varint(buf).ok_or_else(|| truncated(ty))?;
            let len = get_varint(buf).ok_or_else(|| truncated(ty))? as usize;
            if buf.remaining() < len {
                return Err(truncated(ty));
            }
            Frame::Crypto { offset, data: buf.copy_to_bytes(len) }
        }

        FRAME_NEW_TOKEN => {
            let len = get_varint(buf).ok_or_else(|| truncated(ty))? as usize;
            if len == 0 || buf.remaining() < len {
                return Err(Error::Transport {
                    code: TransportErrorCode::FrameEncodingError,
                    frame_type: ty,
                    reason: "bad NEW_TOKEN length",
                });
            }
            Frame::NewToken { token: buf.copy_to_bytes(len) }
        }

        t if (FRAME_STREAM_BASE..=FRAME_STREAM_BASE + 7).contains(&t) => {
            let stream_id =
                StreamId(get_varint(buf).ok_or_else(|| truncated(ty))?);
            let offset = if t & STREAM_BIT_OFF != 0 {
                get_varint(buf).ok_or_else(|| truncated(ty))?
            } else {
                0
            };
            let len = if t & STREAM_BIT_LEN != 0 {
                get_varint(buf).ok_or_else(|| truncated(ty))? as usize
            } else {
                buf.remaining()
            };
            if buf.remaining() < len {
                return Err(truncated(ty));
            }
            Frame::Stream {
                stream_id,
                offset,
                data: buf.copy_to_bytes(len),
                fin: t & STREAM_BIT_FIN != 0,
            }
        }

        FRAME_MAX_DATA => {
            Frame::MaxData(get_varint(buf).ok_or_else(|| truncated(ty))?)
        }

        FRAME_MAX_STREAM_DATA => Frame::MaxStreamData {
            stream_id: StreamId(get_varint(buf).ok_or_else(|| truncated(ty))?),
            max: get_varint(buf).ok_or_else(|| truncated(ty))?,
        },

        FRAME_MAX_STREAMS_BIDI | FRAME_MAX_STREAMS_UNI => Frame::MaxStreams {
            dir: if ty == FRAME_MAX_STREAMS_BIDI {
                StreamDir::Bidi
            } else {
                StreamDir::Uni
            },
            max: get_varint(buf).ok_or_else(|| truncated(ty))?,
        },

        FRAME_DATA_BLOCKED => {
            Frame::DataBlocked(get_varint(buf).ok_or_else(|| truncated(ty))?)
        }

        FRAME_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
            stream_id: StreamId(get_varint(buf).ok_or_else(|| truncated(ty))?),
            limit: get_varint(buf).ok_or_else(|| truncated(ty))?,
        },

        FRAME_STREAMS_BLOCKED_BIDI | FRAME_STREAMS_BLOCKED_UNI => {
            Frame::StreamsBlocked {
                dir: if ty == FRAME_STREAMS_BLOCKED_BIDI {
                    StreamDir::Bidi
                } else {
                    StreamDir::Uni
                },
                limit: get_varint(buf).ok_or_else(|| truncated(ty))?,
            }
        }

        FRAME_NEW_CONNECTION_ID => {
            let seq = get_varint(buf).ok_or_else(|| truncated(ty))?;
            let retire_prior_to = get_varint(buf).ok_or_else(|| truncated(ty))?;
            if !buf.has_remaining() {
                return Err(truncated(ty));
            }
            let cid_len = buf.get_u8() as usize;
            if cid_len == 0 || buf.remaining() < cid_len + 16 {
                return Err(Error::Transport {
                    code: TransportErrorCode::FrameEncodingError,
                    frame_type: ty,
                    reason: "bad NEW_CONNECTION_ID length",
                });
            }
            let cid = ConnectionId::new(&buf.chunk()[..cid_len])
                .ok_or(Error::Transport {
                    code: TransportErrorCode::FrameEncodingError,
                    frame_type: ty,
                    reason: "connection ID too long",
                })?;
            buf.advance(cid_len);
            let mut reset_token = [0u8; 16];
            buf.copy_to_slice(&mut reset_token);
            Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token }
        }

        FRAME_RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
            seq: get_varint(buf).ok_or_else(|| truncated(ty))?,
        },

        FRAME_PATH_CHALLENGE | FRAME_PATH_RESPONSE => {
            if buf.remaining() < 8 {
                return Err(truncated(ty));
            }
            let mut data = [0u8; 8];
            buf.copy_to_slice(&mut data);
            if ty == FRAME_PATH_CHALLENGE {
                Frame::PathChallenge(data)
            } else {
                Frame::PathResponse(data)
            }
        }

        FRAME_CONNECTION_CLOSE | FRAME_CONNECTION_CLOSE_APP => {
            let code = get_varint(buf).ok_or_else(|| truncated(ty))?;
            let frame_type = if ty == FRAME_CONNECTION_CLOSE {
                Some(get_varint(buf).ok_or_else(|| truncated(ty))?)
            } else {
                None
            };
            let reason_len = get_varint(buf).ok_or_else(|| truncated(ty))? as usize;
            if buf.remaining() < reason_len {
                return Err(truncated(ty));
            }
            Frame::ConnectionClose {
                code,
                frame_type,
                reason: buf.copy_to_bytes(reason_len),
            }
        }

        FRAME_HANDSHAKE_DONE => Frame::HandshakeDone,

        unknown => {
            return Err(Error::Transport {
                code: TransportErrorCode::FrameEncodingError,
                frame_type: unknown,
                reason: "unknown frame type",
            });
        }
    };

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::put_frame;
    use bytes::BytesMut;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, &frame);
        let mut bytes = buf.freeze();
        let parsed = parse_frames(&mut bytes).unwrap();
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn roundtrip_control_frames() {
        roundtrip(Frame::Ping);
        roundtrip(Frame::MaxData(0x4242));
        roundtrip(Frame::MaxStreamData { stream_id: StreamId(4), max: 99 });
        roundtrip(Frame::MaxStreams { dir: StreamDir::Bidi, max: 7 });
        roundtrip(Frame::MaxStreams { dir: StreamDir::Uni, max: 3 });
        roundtrip(Frame::DataBlocked(1000));
        roundtrip(Frame::StreamDataBlocked { stream_id: StreamId(8), limit: 50 });
        roundtrip(Frame::StreamsBlocked { dir: StreamDir::Uni, limit: 2 });
        roundtrip(Frame::RetireConnectionId { seq: 5 });
        roundtrip(Frame::PathChallenge([1, 2, 3, 4, 5, 6, 7, 8]));
        roundtrip(Frame::PathResponse([8, 7, 6, 5, 4, 3, 2, 1]));
        roundtrip(Frame::HandshakeDone);
    }

    #[test]
    fn roundtrip_data_frames() {
        roundtrip(Frame::Crypto { offset: 1200, data: Bytes::from_static(b"hello") });
        roundtrip(Frame::Stream {
            stream_id: StreamId(0),
            offset: 0,
            data: Bytes::from_static(b"echo"),
            fin: true,
        });
        roundtrip(Frame::NewToken { token: Bytes::from_static(&[9; 32]) });
        roundtrip(Frame::ResetStream {
            stream_id: StreamId(12),
            error_code: 3,
            final_size: 777,
        });
        roundtrip(Frame::StopSending { stream_id: StreamId(12), error_code: 4 });
        roundtrip(Frame::NewConnectionId {
            seq: 1,
            retire_prior_to: 0,
            cid: ConnectionId::new(&[0xab; 8]).unwrap(),
            reset_token: [0xcd; 16],
        });
    }

    #[test]
    fn roundtrip_close_frames() {
        roundtrip(Frame::ConnectionClose {
            code: 0x0a,
            frame_type: Some(0x06),
            reason: Bytes::from_static(b"bad crypto"),
        });
        roundtrip(Frame::ConnectionClose {
            code: 17,
            frame_type: None,
            reason: Bytes::new(),
        });
    }

    #[test]
    fn roundtrip_multi_range_ack() {
        let ack = AckFrame::from_ranges(&[(0, 1), (4, 9), (12, 12)], 31).unwrap();
        roundtrip(Frame::Ack(ack));

        let mut ecn_ack = AckFrame::from_ranges(&[(2, 5)], 8).unwrap();
        ecn_ack.ecn = Some(EcnCounts { ect0: 1, ect1: 0, ce: 2 });
        roundtrip(Frame::Ack(ecn_ack));
    }

    #[test]
    fn padding_runs_collapse() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 0x01, 0, 0]);
        let parsed = parse_frames(&mut bytes).unwrap();
        assert_eq!(parsed, vec![Frame::Padding(3), Frame::Ping, Frame::Padding(2)]);
    }

    #[test]
    fn unknown_type_is_frame_encoding_error() {
        let mut bytes = Bytes::from_static(&[0x21]);
        match parse_frames(&mut bytes) {
            Err(Error::Transport { code, frame_type, .. }) => {
                assert_eq!(code, TransportErrorCode::FrameEncodingError);
                assert_eq!(frame_type, 0x21);
            }
            other => panic!("expected frame encoding error, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_rejected() {
        let mut bytes = Bytes::new();
        assert!(parse_frames(&mut bytes).is_err());
    }

    #[test]
    fn truncated_crypto_rejected() {
        // CRYPTO, offset 0, claimed length 10, only 2 bytes present.
        let mut bytes = Bytes::from_static(&[0x06, 0x00, 0x0a, 0xaa, 0xbb]);
        assert!(parse_frames(&mut bytes).is_err());
    }
}
