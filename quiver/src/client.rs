//! Client entry point: dial, handshake, retry across versions.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::runtime;
use crate::socket::DatagramIo;
use anyhow::{bail, Context};
use quiver_quic::cid::LOCAL_CID_LEN;
use quiver_quic::error::Error;
use quiver_quic::tls::{TlsConfig, TlsSession};
use quiver_quic::types::{ConnectionId, Side};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Dials `addr` and completes the handshake.
///
/// If the server answers with Version Negotiation, the dial is retried
/// at the first mutually supported version.
pub async fn connect(
    server_name: &str,
    addr: SocketAddr,
    config: ClientConfig,
) -> anyhow::Result<Connection> {
    if config.versions.is_empty() {
        bail!(Error::NoVersionSpecified);
    }

    let mut version = config.versions[0];
    for _ in 0..3 {
        match connect_once(server_name, addr, &config, version).await {
            Err(err) => match err.downcast_ref::<Error>() {
                Some(&Error::NextVersion(v)) if config.versions.contains(&v) => {
                    tracing::info!(from = format_args!("{version:#x}"),
                                   to = format_args!("{v:#x}"),
                                   "retrying at negotiated version");
                    version = v;
                }
                _ => return Err(err),
            },
            ok => return ok,
        }
    }
    bail!(Error::VersionNegotiationFailed)
}

async fn connect_once(
    server_name: &str,
    addr: SocketAddr,
    config: &ClientConfig,
    version: u32,
) -> anyhow::Result<Connection> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await.context("binding UDP socket")?;
    socket.connect(addr).await.context("connecting UDP socket")?;

    let dcid = ConnectionId::random(LOCAL_CID_LEN);
    let scid = ConnectionId::random(LOCAL_CID_LEN);

    let mut params = config.transport.clone();
    params.initial_source_connection_id = Some(scid);

    let tls = TlsSession::new(
        Side::Client,
        &TlsConfig {
            server_name: Some(server_name.to_string()),
            alpn: config.alpn.clone(),
            verify_peer: config.verify_peer,
            ..Default::default()
        },
        &params.encode(),
    )?;

    let conn = quiver_quic::Connection::new_client(
        version,
        dcid,
        scid,
        params,
        config.token.clone().unwrap_or_default(),
    )?;

    tracing::info!(%addr, version = format_args!("{version:#x}"), "connecting");
    let (shared, events, workers) = runtime::spawn(conn, DatagramIo::Connected(socket), tls);
    let handle = Connection::new(shared, events, workers);

    handle.established().await?;
    Ok(handle)
}
