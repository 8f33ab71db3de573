//! Transport parameters (RFC 9000 Section 18).
//!
//! Carried opaquely inside the TLS handshake as a list of
//! (varint id, varint length, value) triples.

use crate::error::{Error, Result, TransportErrorCode};
use crate::types::{get_varint, put_varint, ConnectionId, ResetToken};
use bytes::{Buf, BufMut, Bytes};

const ID_ORIGINAL_DCID: u64 = 0x00;
const ID_MAX_IDLE_TIMEOUT: u64 = 0x01;
const ID_STATELESS_RESET_TOKEN: u64 = 0x02;
const ID_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const ID_INITIAL_MAX_DATA: u64 = 0x04;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const ID_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const ID_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const ID_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ID_ACK_DELAY_EXPONENT: u64 = 0x0a;
const ID_MAX_ACK_DELAY: u64 = 0x0b;
const ID_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const ID_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const ID_INITIAL_SOURCE_CID: u64 = 0x0f;
const ID_RETRY_SOURCE_CID: u64 = 0x10;

/// Transport parameters declared by one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub original_destination_connection_id: Option<ConnectionId>,
    /// Milliseconds; 0 disables the idle timeout.
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<ResetToken>,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

fn put_param_bytes<B: BufMut>(buf: &mut B, id: u64, value: &[u8]) {
    put_varint(buf, id);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

fn put_param_varint<B: BufMut>(buf: &mut B, id: u64, value: u64) {
    let mut tmp = Vec::with_capacity(8);
    put_varint(&mut tmp, value);
    put_param_bytes(buf, id, &tmp);
}

impl TransportParams {
    /// Serializes for the TLS extension. Parameters at their protocol
    /// default are elided.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);

        if let Some(cid) = &self.original_destination_connection_id {
            put_param_bytes(&mut buf, ID_ORIGINAL_DCID, cid.as_bytes());
        }
        if self.max_idle_timeout != 0 {
            put_param_varint(&mut buf, ID_MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        }
        if let Some(token) = &self.stateless_reset_token {
            put_param_bytes(&mut buf, ID_STATELESS_RESET_TOKEN, token);
        }
        if self.max_udp_payload_size != 65527 {
            put_param_varint(&mut buf, ID_MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        }
        if self.initial_max_data != 0 {
            put_param_varint(&mut buf, ID_INITIAL_MAX_DATA, self.initial_max_data);
        }
        if self.initial_max_stream_data_bidi_local != 0 {
            put_param_varint(
                &mut buf,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                self.initial_max_stream_data_bidi_local,
            );
        }
        if self.initial_max_stream_data_bidi_remote != 0 {
            put_param_varint(
                &mut buf,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                self.initial_max_stream_data_bidi_remote,
            );
        }
        if self.initial_max_stream_data_uni != 0 {
            put_param_varint(
                &mut buf,
                ID_INITIAL_MAX_STREAM_DATA_UNI,
                self.initial_max_stream_data_uni,
            );
        }
        if self.initial_max_streams_bidi != 0 {
            put_param_varint(&mut buf, ID_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        }
        if self.initial_max_streams_uni != 0 {
            put_param_varint(&mut buf, ID_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        }
        if self.ack_delay_exponent != 3 {
            put_param_varint(&mut buf, ID_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        }
        if self.max_ack_delay != 25 {
            put_param_varint(&mut buf, ID_MAX_ACK_DELAY, self.max_ack_delay);
        }
        if self.disable_active_migration {
            put_param_bytes(&mut buf, ID_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if self.active_connection_id_limit != 2 {
            put_param_varint(
                &mut buf,
                ID_ACTIVE_CONNECTION_ID_LIMIT,
                self.active_connection_id_limit,
            );
        }
        if let Some(cid) = &self.initial_source_connection_id {
            put_param_bytes(&mut buf, ID_INITIAL_SOURCE_CID, cid.as_bytes());
        }
        if let Some(cid) = &self.retry_source_connection_id {
            put_param_bytes(&mut buf, ID_RETRY_SOURCE_CID, cid.as_bytes());
        }

        buf
    }

    pub fn decode(mut buf: Bytes) -> Result<TransportParams> {
        fn bad(reason: &'static str) -> Error {
            Error::transport(TransportErrorCode::TransportParameterError, reason)
        }
        fn as_varint(value: &mut Bytes) -> Result<u64> {
            get_varint(value).ok_or_else(|| bad("bad varint parameter"))
        }
        fn as_cid(value: &Bytes) -> Result<ConnectionId> {
            ConnectionId::new(value).ok_or_else(|| bad("connection ID parameter too long"))
        }

        let mut params = TransportParams::default();
        while buf.has_remaining() {
            let id = get_varint(&mut buf).ok_or_else(|| bad("truncated parameter id"))?;
            let len =
                get_varint(&mut buf).ok_or_else(|| bad("truncated parameter length"))? as usize;
            if buf.remaining() < len {
                return Err(bad("truncated parameter value"));
            }
            let mut value = buf.copy_to_bytes(len);

            match id {
                ID_ORIGINAL_DCID => {
                    params.original_destination_connection_id = Some(as_cid(&value)?);
                }
                ID_MAX_IDLE_TIMEOUT => params.max_idle_timeout = as_varint(&mut value)?,
                ID_STATELESS_RESET_TOKEN => {
                    if value.len() != 16 {
                        return Err(bad("reset token must be 16 bytes"));
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(&value);
                    params.stateless_reset_token = Some(token);
                }
                ID_MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = as_varint(&mut value)?;
                    if params.max_udp_payload_size < 1200 {
                        return Err(bad("max_udp_payload_size below 1200"));
                    }
                }
                ID_INITIAL_MAX_DATA => params.initial_max_data = as_varint(&mut value)?,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = as_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = as_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = as_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = as_varint(&mut value)?
                }
                ID_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = as_varint(&mut value)?
                }
                ID_ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = as_varint(&mut value)?;
                    if params.ack_delay_exponent > 20 {
                        return Err(bad("ack_delay_exponent above 20"));
                    }
                }
                ID_MAX_ACK_DELAY => {
                    params.max_ack_delay = as_varint(&mut value)?;
                    if params.max_ack_delay >= 1 << 14 {
                        return Err(bad("max_ack_delay out of range"));
                    }
                }
                ID_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(bad("disable_active_migration carries no value"));
                    }
                    params.disable_active_migration = true;
                }
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = as_varint(&mut value)?;
                    if params.active_connection_id_limit < 2 {
                        return Err(bad("active_connection_id_limit below 2"));
                    }
                }
                ID_INITIAL_SOURCE_CID => {
                    params.initial_source_connection_id = Some(as_cid(&value)?);
                }
                ID_RETRY_SOURCE_CID => {
                    params.retry_source_connection_id = Some(as_cid(&value)?);
                }
                // Unknown parameters must be ignored (RFC 9000 Section 7.4.2).
                _ => {}
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let params = TransportParams {
            original_destination_connection_id: Some(ConnectionId::new(&[1; 8]).unwrap()),
            max_idle_timeout: 30_000,
            stateless_reset_token: Some([7; 16]),
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 18,
            initial_max_stream_data_bidi_remote: 1 << 18,
            initial_max_stream_data_uni: 1 << 17,
            initial_max_streams_bidi: 16,
            initial_max_streams_uni: 4,
            max_ack_delay: 20,
            disable_active_migration: true,
            active_connection_id_limit: 4,
            initial_source_connection_id: Some(ConnectionId::new(&[2; 8]).unwrap()),
            ..Default::default()
        };
        let encoded = params.encode();
        let decoded = TransportParams::decode(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn defaults_elided() {
        let encoded = TransportParams::default().encode();
        assert!(encoded.is_empty());
    }

    #[test]
    fn unknown_parameters_ignored() {
        // GREASE id 0x1b with a 2-byte value, then max_ack_delay 20.
        let raw = vec![0x1b, 0x02, 0xaa, 0xbb, 0x0b, 0x01, 0x14];
        let params = TransportParams::decode(Bytes::from(raw)).unwrap();
        assert_eq!(params.max_ack_delay, 20);
    }

    #[test]
    fn invalid_values_rejected() {
        // ack_delay_exponent 21.
        let raw = vec![0x0a, 0x01, 0x15];
        assert!(TransportParams::decode(Bytes::from(raw)).is_err());
        // 15-byte reset token.
        let mut raw = vec![0x02, 0x0f];
        raw.extend_from_slice(&[0u8; 15]);
        assert!(TransportParams::decode(Bytes::from(raw)).is_err());
    }
}
