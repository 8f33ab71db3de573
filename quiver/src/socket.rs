//! The UDP collaborator: best-effort datagram I/O for one connection.
//!
//! Clients own a connected socket. Server connections share the
//! listening socket; the dispatcher routes incoming datagrams to a
//! per-connection queue keyed by destination connection ID.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// Largest datagram we will read; oversize datagrams are truncated by
/// the kernel and dropped by header parsing.
const RECV_BUF_SIZE: usize = 2048;

pub(crate) enum DatagramIo {
    /// Client side: a socket `connect()`ed to the server.
    Connected(UdpSocket),
    /// Server side: the shared socket plus this connection's inbound
    /// queue, fed by the dispatcher.
    Routed {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    },
}

impl DatagramIo {
    /// Sends one datagram; short sends cannot happen for UDP.
    pub async fn send(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            DatagramIo::Connected(socket) => socket.send(buf).await.map(|_| ()),
            DatagramIo::Routed { socket, peer, .. } => {
                socket.send_to(buf, peer).await.map(|_| ())
            }
        }
    }

    /// Receives one datagram. `None` means the transport below is gone
    /// (socket closed or dispatcher dropped) and the receiver should
    /// exit quietly.
    pub async fn recv(&self) -> Option<Bytes> {
        match self {
            DatagramIo::Connected(socket) => {
                let mut buf = vec![0u8; RECV_BUF_SIZE];
                match socket.recv(&mut buf).await {
                    Ok(len) => {
                        buf.truncate(len);
                        Some(Bytes::from(buf))
                    }
                    Err(err) => {
                        tracing::debug!(?err, "socket receive failed");
                        None
                    }
                }
            }
            DatagramIo::Routed { inbound, .. } => inbound.lock().await.recv().await,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            DatagramIo::Connected(socket) => socket.peer_addr().ok(),
            DatagramIo::Routed { peer, .. } => Some(*peer),
        }
    }
}
