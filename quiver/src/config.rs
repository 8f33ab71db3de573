//! Endpoint configuration.

use bytes::Bytes;
use quiver_quic::version::SUPPORTED_VERSIONS;
use quiver_quic::TransportParams;

/// Transport parameters with workable defaults for an endpoint that
/// actually wants to move data.
pub fn default_transport_params() -> TransportParams {
    TransportParams {
        max_idle_timeout: 30_000,
        initial_max_data: 1 << 22,
        initial_max_stream_data_bidi_local: 1 << 20,
        initial_max_stream_data_bidi_remote: 1 << 20,
        initial_max_stream_data_uni: 1 << 19,
        initial_max_streams_bidi: 64,
        initial_max_streams_uni: 16,
        active_connection_id_limit: 4,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// ALPN protocols in preference order; the handshake fails without
    /// overlap.
    pub alpn: Vec<Vec<u8>>,
    pub transport: TransportParams,
    /// Versions to offer, first entry tried first.
    pub versions: Vec<u32>,
    /// Validate the server certificate chain. Off by default so
    /// loopback deployments run self-signed.
    pub verify_peer: bool,
    /// Address-validation token from a prior connection's NEW_TOKEN.
    pub token: Option<Bytes>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            alpn: Vec::new(),
            transport: default_transport_params(),
            versions: SUPPORTED_VERSIONS.to_vec(),
            verify_peer: false,
            token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// PEM certificate chain, leaf first. Loading from disk is the
    /// caller's job; the endpoint treats these as opaque bytes.
    pub cert_pem: Bytes,
    /// PEM private key.
    pub key_pem: Bytes,
    pub alpn: Vec<Vec<u8>>,
    pub transport: TransportParams,
    /// Force address validation with Retry before accepting.
    pub use_retry: bool,
}

impl ServerConfig {
    pub fn new(cert_pem: Bytes, key_pem: Bytes) -> Self {
        Self {
            cert_pem,
            key_pem,
            alpn: Vec::new(),
            transport: default_transport_params(),
            use_retry: false,
        }
    }
}
