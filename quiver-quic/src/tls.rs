//! TLS 1.3 collaborator over BoringSSL's QUIC API (RFC 9001 Section 4).
//!
//! The handshake driver owns a [`TlsSession`] and steps it with CRYPTO
//! bytes; each step yields handshake bytes to send per level, new traffic
//! secrets, the peer's transport parameters, and completion or an alert.
//! Key installation and level advancement stay the connection's job.

use crate::crypto::Level;
use crate::error::{Error, Result};
use crate::types::Side;
use boring::pkey::PKey;
use boring::ssl::{Ssl, SslContext, SslMethod, SslVerifyMode, SslVersion};
use boring::x509::X509;
use boring_sys as ffi;
use bytes::Bytes;
use foreign_types::ForeignType;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

/// A new traffic secret surfaced by the TLS stack.
#[derive(Debug, Clone)]
pub enum KeyEvent {
    /// Secret protecting packets we receive at `level`.
    ReadSecret { level: Level, suite: u16, secret: Vec<u8> },
    /// Secret protecting packets we send at `level`.
    WriteSecret { level: Level, suite: u16, secret: Vec<u8> },
}

/// Output of one handshake step.
#[derive(Debug, Default)]
pub struct TlsStep {
    /// CRYPTO bytes to transmit, in emission order.
    pub outgoing: Vec<(Level, Bytes)>,
    pub keys: Vec<KeyEvent>,
    /// Peer transport parameters, once the peer's extension arrives.
    pub peer_params: Option<Bytes>,
    pub handshake_done: bool,
    /// TLS alert to surface as transport error 0x0100 + alert.
    pub alert: Option<u8>,
}

#[derive(Debug)]
enum CallbackEvent {
    Outgoing(Level, Vec<u8>),
    Key(KeyEvent),
    Alert(u8),
}

struct CallbackSink {
    events: VecDeque<CallbackEvent>,
}

fn ex_data_index() -> i32 {
    static INDEX: OnceLock<i32> = OnceLock::new();
    *INDEX.get_or_init(|| unsafe {
        ffi::SSL_get_ex_new_index(0, ptr::null_mut(), ptr::null_mut(), None, None)
    })
}

fn level_from_ssl(level: ffi::ssl_encryption_level_t) -> Level {
    match level {
        ffi::ssl_encryption_level_t::ssl_encryption_initial => Level::Initial,
        ffi::ssl_encryption_level_t::ssl_encryption_early_data => Level::ZeroRtt,
        ffi::ssl_encryption_level_t::ssl_encryption_handshake => Level::Handshake,
        ffi::ssl_encryption_level_t::ssl_encryption_application => Level::OneRtt,
        _ => unreachable!("unknown ssl_encryption_level_t from BoringSSL"),
    }
}

fn level_to_ssl(level: Level) -> ffi::ssl_encryption_level_t {
    match level {
        Level::Initial => ffi::ssl_encryption_level_t::ssl_encryption_initial,
        Level::ZeroRtt => ffi::ssl_encryption_level_t::ssl_encryption_early_data,
        Level::Handshake => ffi::ssl_encryption_level_t::ssl_encryption_handshake,
        Level::OneRtt => ffi::ssl_encryption_level_t::ssl_encryption_application,
    }
}

/// TLS configuration handed in by the endpoint. Certificate and key are
/// opaque PEM bytes; loading them from disk is the caller's concern.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// SNI name (client only).
    pub server_name: Option<String>,
    /// ALPN protocols in preference order.
    pub alpn: Vec<Vec<u8>>,
    /// PEM certificate chain (server only), leaf first.
    pub cert_pem: Option<Bytes>,
    /// PEM private key (server only).
    pub key_pem: Option<Bytes>,
    /// Verify the peer certificate chain (client only). Off by default;
    /// loopback and test deployments run self-signed.
    pub verify_peer: bool,
}

/// One TLS 1.3 state machine bound to a connection.
#[derive(Debug)]
pub struct TlsSession {
    ssl: Ssl,
    side: Side,
    events: VecDeque<CallbackEvent>,
    complete: bool,
    peer_params_taken: bool,
}

// The Ssl handle is only touched from the handshake driver task.
unsafe impl Send for TlsSession {}

impl TlsSession {
    pub fn new(side: Side, config: &TlsConfig, transport_params: &[u8]) -> Result<TlsSession> {
        let mut builder = SslContext::builder(match side {
            Side::Client => SslMethod::tls_client(),
            Side::Server => SslMethod::tls_server(),
        })
        .map_err(|_| Error::Internal("TLS context allocation failed"))?;

        builder
            .set_min_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|_| Error::Internal("TLS 1.3 unavailable"))?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|_| Error::Internal("TLS 1.3 unavailable"))?;

        match side {
            Side::Client => {
                builder.set_verify(if config.verify_peer {
                    SslVerifyMode::PEER
                } else {
                    SslVerifyMode::NONE
                });
                if !config.alpn.is_empty() {
                    let wire = alpn_wire_format(&config.alpn);
                    builder
                        .set_alpn_protos(&wire)
                        .map_err(|_| Error::Internal("bad ALPN list"))?;
                }
            }
            Side::Server => {
                let (cert_pem, key_pem) = match (&config.cert_pem, &config.key_pem) {
                    (Some(c), Some(k)) => (c, k),
                    _ => return Err(Error::Internal("server requires certificate and key")),
                };
                let chain = X509::stack_from_pem(cert_pem)
                    .map_err(|_| Error::Internal("bad certificate PEM"))?;
                let mut chain = chain.into_iter();
                let leaf = chain
                    .next()
                    .ok_or(Error::Internal("empty certificate chain"))?;
                builder
                    .set_certificate(&leaf)
                    .map_err(|_| Error::Internal("rejected certificate"))?;
                for extra in chain {
                    builder
                        .add_extra_chain_cert(extra)
                        .map_err(|_| Error::Internal("rejected chain certificate"))?;
                }
                let key = PKey::private_key_from_pem(key_pem)
                    .map_err(|_| Error::Internal("bad private key PEM"))?;
                builder
                    .set_private_key(&key)
                    .map_err(|_| Error::Internal("rejected private key"))?;

                if !config.alpn.is_empty() {
                    let ours = alpn_wire_format(&config.alpn);
                    builder.set_alpn_select_callback(move |_, client| {
                        select_alpn(&ours, client).ok_or(boring::ssl::AlpnError::ALERT_FATAL)
                    });
                }
            }
        }

        let ctx = builder.build();
        let mut ssl =
            Ssl::new(&ctx).map_err(|_| Error::Internal("TLS session allocation failed"))?;

        if let (Side::Client, Some(name)) = (side, &config.server_name) {
            ssl.set_hostname(name)
                .map_err(|_| Error::Internal("bad server name"))?;
        }

        unsafe {
            match side {
                Side::Client => ffi::SSL_set_connect_state(ssl.as_ptr()),
                Side::Server => ffi::SSL_set_accept_state(ssl.as_ptr()),
            }
            if ffi::SSL_set_quic_method(ssl.as_ptr(), &QUIC_METHOD) != 1 {
                return Err(Error::Internal("SSL_set_quic_method failed"));
            }
            if ffi::SSL_set_quic_transport_params(
                ssl.as_ptr(),
                transport_params.as_ptr(),
                transport_params.len(),
            ) != 1
            {
                return Err(Error::Internal("setting transport parameters failed"));
            }
        }

        Ok(TlsSession {
            ssl,
            side,
            events: VecDeque::new(),
            complete: false,
            peer_params_taken: false,
        })
    }

    /// Kicks off the handshake. For a client this produces the
    /// ClientHello flight; for a server it is a no-op step.
    pub fn start(&mut self) -> Result<TlsStep> {
        match self.side {
            Side::Client => self.advance(),
            Side::Server => Ok(TlsStep::default()),
        }
    }

    /// Feeds reassembled CRYPTO bytes received at `level` and advances
    /// the state machine.
    pub fn drive(&mut self, level: Level, data: &[u8]) -> Result<TlsStep> {
        let rc = self.with_sink(|ssl| unsafe {
            ffi::SSL_provide_quic_data(
                ssl,
                level_to_ssl(level),
                data.as_ptr(),
                data.len(),
            )
        });
        if rc != 1 {
            // Malformed handshake bytes; surface as a generic fatal
            // alert unless the stack produced a specific one.
            let step = self.collect(false);
            let alert = step.alert.unwrap_or(0x0a);
            return Err(Error::HandshakeFailed(alert));
        }
        self.advance()
    }

    fn advance(&mut self) -> Result<TlsStep> {
        let rc = self.with_sink(|ssl| unsafe { ffi::SSL_do_handshake(ssl) });

        if rc == 1 {
            self.complete = true;
            return Ok(self.collect(true));
        }

        let err = unsafe { ffi::SSL_get_error(self.ssl.as_ptr(), rc) };
        if err == ffi::SSL_ERROR_WANT_READ as i32 || err == ffi::SSL_ERROR_WANT_WRITE as i32 {
            return Ok(self.collect(false));
        }
        let step = self.collect(false);
        // 80 = internal_error; used when no alert was emitted.
        Err(Error::HandshakeFailed(step.alert.unwrap_or(80)))
    }

    /// Runs `f` with the callback sink attached to the SSL ex-data slot.
    fn with_sink(&mut self, f: impl FnOnce(*mut ffi::SSL) -> i32) -> i32 {
        let mut sink = CallbackSink { events: VecDeque::new() };
        let rc = unsafe {
            ffi::SSL_set_ex_data(
                self.ssl.as_ptr(),
                ex_data_index(),
                &mut sink as *mut CallbackSink as *mut c_void,
            );
            let rc = f(self.ssl.as_ptr());
            ffi::SSL_set_ex_data(self.ssl.as_ptr(), ex_data_index(), ptr::null_mut());
            rc
        };
        self.events.append(&mut sink.events);
        rc
    }

    /// Drains accumulated callback events into a step result, coalescing
    /// consecutive handshake bytes for the same level.
    fn collect(&mut self, done: bool) -> TlsStep {
        let mut step = TlsStep { handshake_done: done, ..Default::default() };
        while let Some(ev) = self.events.pop_front() {
            match ev {
                CallbackEvent::Outgoing(level, data) => match step.outgoing.last_mut() {
                    Some((last, buf)) if *last == level => {
                        let mut merged = Vec::with_capacity(buf.len() + data.len());
                        merged.extend_from_slice(buf);
                        merged.extend_from_slice(&data);
                        *buf = Bytes::from(merged);
                    }
                    _ => step.outgoing.push((level, Bytes::from(data))),
                },
                CallbackEvent::Key(key) => step.keys.push(key),
                CallbackEvent::Alert(alert) => step.alert = Some(alert),
            }
        }
        if !self.peer_params_taken {
            if let Some(params) = self.peer_quic_transport_params() {
                step.peer_params = Some(params);
                self.peer_params_taken = true;
            }
        }
        step
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// ALPN protocol selected by the handshake.
    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.ssl.selected_alpn_protocol().map(|p| p.to_vec())
    }

    fn peer_quic_transport_params(&self) -> Option<Bytes> {
        unsafe {
            let mut data: *const u8 = ptr::null();
            let mut len: usize = 0;
            ffi::SSL_get_peer_quic_transport_params(self.ssl.as_ptr(), &mut data, &mut len);
            if data.is_null() || len == 0 {
                return None;
            }
            Some(Bytes::copy_from_slice(std::slice::from_raw_parts(data, len)))
        }
    }
}

fn alpn_wire_format(protocols: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = Vec::new();
    for p in protocols {
        wire.push(p.len() as u8);
        wire.extend_from_slice(p);
    }
    wire
}

/// Server-side ALPN selection: first client protocol we also offer.
fn select_alpn<'a>(ours: &[u8], client: &'a [u8]) -> Option<&'a [u8]> {
    let mut i = 0;
    while i < client.len() {
        let len = client[i] as usize;
        i += 1;
        if i + len > client.len() {
            return None;
        }
        let candidate = &client[i..i + len];
        let mut j = 0;
        while j < ours.len() {
            let olen = ours[j] as usize;
            j += 1;
            if j + olen > ours.len() {
                break;
            }
            if &ours[j..j + olen] == candidate {
                return Some(candidate);
            }
            j += olen;
        }
        i += len;
    }
    None
}

// ============================================================================
// BoringSSL QUIC method callbacks
// ============================================================================

static QUIC_METHOD: ffi::SSL_QUIC_METHOD = ffi::SSL_QUIC_METHOD {
    set_read_secret: Some(set_read_secret),
    set_write_secret: Some(set_write_secret),
    add_handshake_data: Some(add_handshake_data),
    flush_flight: Some(flush_flight),
    send_alert: Some(send_alert),
};

unsafe fn sink_of(ssl: *mut ffi::SSL) -> Option<&'static mut CallbackSink> {
    let ptr = ffi::SSL_get_ex_data(ssl, ex_data_index()) as *mut CallbackSink;
    ptr.as_mut()
}

fn suite_of(cipher: *const ffi::SSL_CIPHER) -> u16 {
    if cipher.is_null() {
        return 0x1301;
    }
    // SSL_CIPHER_get_id returns 0x0300_0000 | suite.
    (unsafe { ffi::SSL_CIPHER_get_id(cipher) } & 0xffff) as u16
}

unsafe extern "C" fn set_read_secret(
    ssl: *mut ffi::SSL,
    level: ffi::ssl_encryption_level_t,
    cipher: *const ffi::SSL_CIPHER,
    secret: *const u8,
    secret_len: usize,
) -> i32 {
    let Some(sink) = sink_of(ssl) else { return 0 };
    sink.events.push_back(CallbackEvent::Key(KeyEvent::ReadSecret {
        level: level_from_ssl(level),
        suite: suite_of(cipher),
        secret: std::slice::from_raw_parts(secret, secret_len).to_vec(),
    }));
    1
}

unsafe extern "C" fn set_write_secret(
    ssl: *mut ffi::SSL,
    level: ffi::ssl_encryption_level_t,
    cipher: *const ffi::SSL_CIPHER,
    secret: *const u8,
    secret_len: usize,
) -> i32 {
    let Some(sink) = sink_of(ssl) else { return 0 };
    sink.events.push_back(CallbackEvent::Key(KeyEvent::WriteSecret {
        level: level_from_ssl(level),
        suite: suite_of(cipher),
        secret: std::slice::from_raw_parts(secret, secret_len).to_vec(),
    }));
    1
}

unsafe extern "C" fn add_handshake_data(
    ssl: *mut ffi::SSL,
    level: ffi::ssl_encryption_level_t,
    data: *const u8,
    len: usize,
) -> i32 {
    let Some(sink) = sink_of(ssl) else { return 0 };
    sink.events.push_back(CallbackEvent::Outgoing(
        level_from_ssl(level),
        std::slice::from_raw_parts(data, len).to_vec(),
    ));
    1
}

unsafe extern "C" fn flush_flight(_ssl: *mut ffi::SSL) -> i32 {
    1
}

unsafe extern "C" fn send_alert(
    ssl: *mut ffi::SSL,
    _level: ffi::ssl_encryption_level_t,
    alert: u8,
) -> i32 {
    if let Some(sink) = sink_of(ssl) {
        sink.events.push_back(CallbackEvent::Alert(alert));
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_selection() {
        let ours = alpn_wire_format(&[b"h3".to_vec(), b"echo".to_vec()]);
        let client = alpn_wire_format(&[b"spdy".to_vec(), b"echo".to_vec()]);
        assert_eq!(select_alpn(&ours, &client), Some(&b"echo"[..]));

        let none = alpn_wire_format(&[b"smtp".to_vec()]);
        assert_eq!(select_alpn(&ours, &none), None);
    }

    #[test]
    fn client_start_emits_initial_flight() {
        let config = TlsConfig {
            server_name: Some("example.com".into()),
            alpn: vec![b"echo".to_vec()],
            ..Default::default()
        };
        let mut tls = TlsSession::new(Side::Client, &config, &[0x39, 0x00]).unwrap();
        let step = tls.start().unwrap();
        assert!(!step.handshake_done);
        assert!(!tls.is_complete());
        // The ClientHello goes out at the Initial level.
        assert!(matches!(step.outgoing.first(), Some((Level::Initial, data)) if !data.is_empty()));
    }

    #[test]
    fn server_requires_certificate() {
        let err = TlsSession::new(Side::Server, &TlsConfig::default(), &[]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
