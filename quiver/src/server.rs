//! Server entry point: bind, route datagrams to per-connection queues,
//! accept handshakes.
//!
//! The dispatcher owns the listening socket and a DCID-keyed routing
//! table. Connection machinery past that point is identical to the
//! client's: the same five workers per connection.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::runtime;
use crate::socket::DatagramIo;
use anyhow::Context;
use bytes::{BufMut, Bytes};
use quiver_quic::cid::LOCAL_CID_LEN;
use quiver_quic::connection::Output;
use quiver_quic::crypto::boring::retry_integrity_tag;
use quiver_quic::crypto::Level;
use quiver_quic::frames::Frame;
use quiver_quic::packet::{header, PacketType, WireHeader, MIN_INITIAL_SIZE};
use quiver_quic::tls::{TlsConfig, TlsSession};
use quiver_quic::token::TokenMinter;
use quiver_quic::types::{ConnectionId, Side};
use quiver_quic::version::{is_supported, SUPPORTED_VERSIONS};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// A listening QUIC server.
pub struct Server {
    local_addr: SocketAddr,
    accept_rx: mpsc::UnboundedReceiver<Connection>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Server {
    /// Next incoming connection, already past its Initial packet but
    /// not necessarily established; await [`Connection::established`]
    /// before trusting it.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accept_rx.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Binds `addr` and starts serving.
pub async fn serve(addr: SocketAddr, config: ServerConfig) -> anyhow::Result<Server> {
    let socket = Arc::new(UdpSocket::bind(addr).await.context("binding UDP socket")?);
    let local_addr = socket.local_addr().context("reading local address")?;
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();

    let dispatcher = tokio::spawn(dispatch(socket, config, accept_tx));
    tracing::info!(%local_addr, "server listening");

    Ok(Server { local_addr, accept_rx, dispatcher })
}

async fn dispatch(
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    accept_tx: mpsc::UnboundedSender<Connection>,
) {
    let minter = TokenMinter::new();
    // Inbound routes keyed by the DCIDs a connection answers to.
    let mut routes: HashMap<ConnectionId, mpsc::UnboundedSender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; 2048];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(?err, "server socket receive failed");
                return;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);

        let Ok(wire) = WireHeader::parse(&datagram, LOCAL_CID_LEN) else {
            continue; // malformed: silent drop
        };

        // Existing connection?
        if let Some(tx) = routes.get(&wire.dcid) {
            if tx.send(datagram).is_ok() {
                continue;
            }
            routes.remove(&wire.dcid); // connection is gone
            continue;
        }

        if wire.ty != PacketType::Initial {
            // Unroutable non-Initial: nothing to say (stateless reset
            // is out of scope).
            continue;
        }
        // Small Initials are never answered, to keep the server from
        // amplifying (RFC 9000 Section 14.1).
        if len < MIN_INITIAL_SIZE {
            continue;
        }

        if !is_supported(wire.version) {
            let vn = header::version_negotiation(&wire.scid, &wire.dcid, SUPPORTED_VERSIONS);
            let _ = socket.send_to(&vn, peer).await;
            continue;
        }

        // Address validation (RFC 9000 Section 8.1).
        let mut odcid = wire.dcid;
        let mut retry_scid = None;
        let mut validated = false;
        if wire.token.is_empty() {
            if config.use_retry {
                let _ = socket.send_to(&build_retry(&wire, &minter, &peer), peer).await;
                continue;
            }
        } else {
            match minter.validate(&wire.token, &peer) {
                Ok(Some(original)) => {
                    // Retry token: the DCID the client now uses is the
                    // SCID we invented for the Retry.
                    odcid = original;
                    retry_scid = Some(wire.dcid);
                    validated = true;
                }
                Ok(None) => validated = true, // NEW_TOKEN from earlier
                Err(()) => {
                    tracing::debug!(%peer, "invalid address token, continuing unvalidated");
                }
            }
        }

        match start_connection(
            &socket,
            &config,
            &minter,
            &wire,
            peer,
            odcid,
            retry_scid,
            validated,
        ) {
            Ok((tx, handle, scid)) => {
                // The client addresses us by its original DCID until it
                // learns our SCID, so both route to this connection.
                routes.insert(scid, tx.clone());
                routes.insert(wire.dcid, tx.clone());
                let _ = tx.send(datagram);
                let _ = accept_tx.send(handle);
            }
            Err(err) => {
                tracing::warn!(?err, %peer, "failed to start connection");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn start_connection(
    socket: &Arc<UdpSocket>,
    config: &ServerConfig,
    minter: &TokenMinter,
    wire: &WireHeader,
    peer: SocketAddr,
    odcid: ConnectionId,
    retry_scid: Option<ConnectionId>,
    validated: bool,
) -> anyhow::Result<(mpsc::UnboundedSender<Bytes>, Connection, ConnectionId)> {
    let scid = ConnectionId::random(LOCAL_CID_LEN);

    let mut params = config.transport.clone();
    params.original_destination_connection_id = Some(odcid);
    params.retry_source_connection_id = retry_scid;
    params.initial_source_connection_id = Some(scid);

    let tls = TlsSession::new(
        Side::Server,
        &TlsConfig {
            alpn: config.alpn.clone(),
            cert_pem: Some(config.cert_pem.clone()),
            key_pem: Some(config.key_pem.clone()),
            ..Default::default()
        },
        &params.encode(),
    )?;

    let conn = quiver_quic::Connection::new_server(
        wire.version,
        wire.dcid,
        scid,
        wire.scid,
        params,
        validated,
    )?;

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let io = DatagramIo::Routed {
        socket: socket.clone(),
        peer,
        inbound: tokio::sync::Mutex::new(in_rx),
    };

    tracing::info!(%peer, version = format_args!("{:#x}", wire.version), "accepting connection");
    let (shared, events, workers) = runtime::spawn(conn, io, tls);

    // Once established, hand the client a token for its next connection.
    let new_token = minter.mint_new_token(&peer);
    let shared_for_token = shared.clone();
    tokio::spawn(async move {
        loop {
            let notified = shared_for_token.activity.notified();
            {
                let mut conn = shared_for_token.conn.lock().await;
                match conn.state() {
                    quiver_quic::ConnectionState::Established => {
                        conn.queue_output(Output::Control {
                            level: Level::OneRtt,
                            frames: vec![Frame::NewToken { token: new_token }],
                        });
                        shared_for_token.drain(&mut conn);
                        return;
                    }
                    s if s >= quiver_quic::ConnectionState::Closing => return,
                    _ => {}
                }
            }
            notified.await;
        }
    });

    let handle = Connection::new(shared, events, workers);
    Ok((in_tx, handle, scid))
}

/// Builds a Retry packet: long header, no packet number, token, and the
/// integrity tag over the ODCID-prefixed pseudo-packet
/// (RFC 9000 Section 17.2.5, RFC 9001 Section 5.8).
fn build_retry(wire: &WireHeader, minter: &TokenMinter, peer: &SocketAddr) -> Vec<u8> {
    let retry_scid = ConnectionId::random(LOCAL_CID_LEN);
    let token = minter.mint_retry(&wire.dcid, peer);

    let mut pkt = Vec::with_capacity(64 + token.len());
    pkt.put_u8(0xf0); // long header, type Retry, unused bits zero
    pkt.put_u32(wire.version);
    pkt.put_u8(wire.scid.len() as u8);
    pkt.put_slice(wire.scid.as_bytes());
    pkt.put_u8(retry_scid.len() as u8);
    pkt.put_slice(retry_scid.as_bytes());
    pkt.put_slice(&token);

    if let Some(tag) = retry_integrity_tag(wire.version, &wire.dcid, &pkt) {
        pkt.put_slice(&tag);
    }
    pkt
}
