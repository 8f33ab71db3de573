//! Error types: transport error codes (RFC 9000 Section 20) and the
//! endpoint-level error kinds surfaced to the application.

use bytes::Bytes;
use thiserror::Error;

/// Transport error codes per RFC 9000 Section 20.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    /// TLS alert, carried as 0x0100 + alert code.
    Crypto(u8),
}

impl TransportErrorCode {
    pub fn to_wire(self) -> u64 {
        use TransportErrorCode::*;
        match self {
            NoError => 0x00,
            InternalError => 0x01,
            ConnectionRefused => 0x02,
            FlowControlError => 0x03,
            StreamLimitError => 0x04,
            StreamStateError => 0x05,
            FinalSizeError => 0x06,
            FrameEncodingError => 0x07,
            TransportParameterError => 0x08,
            ConnectionIdLimitError => 0x09,
            ProtocolViolation => 0x0a,
            InvalidToken => 0x0b,
            ApplicationError => 0x0c,
            CryptoBufferExceeded => 0x0d,
            KeyUpdateError => 0x0e,
            AeadLimitReached => 0x0f,
            NoViablePath => 0x10,
            Crypto(alert) => 0x0100 + alert as u64,
        }
    }

    pub fn from_wire(code: u64) -> Self {
        use TransportErrorCode::*;
        match code {
            0x00 => NoError,
            0x01 => InternalError,
            0x02 => ConnectionRefused,
            0x03 => FlowControlError,
            0x04 => StreamLimitError,
            0x05 => StreamStateError,
            0x06 => FinalSizeError,
            0x07 => FrameEncodingError,
            0x08 => TransportParameterError,
            0x09 => ConnectionIdLimitError,
            0x0a => ProtocolViolation,
            0x0b => InvalidToken,
            0x0c => ApplicationError,
            0x0d => CryptoBufferExceeded,
            0x0e => KeyUpdateError,
            0x0f => AeadLimitReached,
            0x10 => NoViablePath,
            0x0100..=0x01ff => Crypto((code - 0x0100) as u8),
            _ => InternalError,
        }
    }
}

/// Endpoint errors.
///
/// `Transport` and `Application` travel on the wire as CONNECTION_CLOSE
/// frames; the rest are local control flow.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A locally detected protocol violation, sent to the peer as a
    /// transport-variant CONNECTION_CLOSE (type 0x1c).
    #[error("transport error {code:?} (frame type {frame_type:#x}): {reason}")]
    Transport {
        code: TransportErrorCode,
        /// Type of the frame that triggered the error, 0 if none.
        frame_type: u64,
        reason: &'static str,
    },

    /// An application-requested close, sent as an application-variant
    /// CONNECTION_CLOSE (type 0x1d).
    #[error("application error {code:#x}")]
    Application { code: u64, reason: Bytes },

    /// The TLS stack raised an alert; mapped to transport code
    /// 0x0100 + alert on the wire.
    #[error("handshake failed with TLS alert {0}")]
    HandshakeFailed(u8),

    /// The server offered none of our versions.
    #[error("version negotiation failed")]
    VersionNegotiationFailed,

    /// Client-only control flow: the server answered with a Version
    /// Negotiation packet and `0` is the version to retry with.
    #[error("retry with version {0:#010x}")]
    NextVersion(u32),

    /// Operation attempted on a connection that has already closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Configuration bug: no protocol version was configured.
    #[error("no version specified in configuration")]
    NoVersionSpecified,

    /// Invariant violation that should be unreachable; carries a short
    /// description for the log.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Shorthand for a transport error with no triggering frame.
    pub fn transport(code: TransportErrorCode, reason: &'static str) -> Self {
        Error::Transport { code, frame_type: 0, reason }
    }

    /// The wire error code this error closes the connection with.
    pub fn wire_code(&self) -> u64 {
        match self {
            Error::Transport { code, .. } => code.to_wire(),
            Error::Application { code, .. } => *code,
            Error::HandshakeFailed(alert) =>
                TransportErrorCode::Crypto(*alert).to_wire(),
            _ => TransportErrorCode::InternalError.to_wire(),
        }
    }

    /// Whether this error is sent as the application variant (0x1d).
    pub fn is_application(&self) -> bool {
        matches!(self, Error::Application { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_roundtrip() {
        for code in [
            TransportErrorCode::NoError,
            TransportErrorCode::FlowControlError,
            TransportErrorCode::ProtocolViolation,
            TransportErrorCode::KeyUpdateError,
            TransportErrorCode::Crypto(0x28),
        ] {
            assert_eq!(TransportErrorCode::from_wire(code.to_wire()), code);
        }
    }

    #[test]
    fn handshake_alert_maps_to_crypto_range() {
        let err = Error::HandshakeFailed(0x28);
        assert_eq!(err.wire_code(), 0x0128);
        assert!(!err.is_application());
    }
}
