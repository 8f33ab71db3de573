//! # quiver: an async QUIC endpoint
//!
//! The runtime half of the `quiver` workspace: per-connection worker
//! tasks, UDP plumbing, and the application-facing API, layered over
//! the [`quiver_quic`] protocol core.
//!
//! Each connection runs five cooperative tokio tasks sharing one state
//! record: a receiver (socket to state machine), a sender (output queue
//! to socket), a retransmit/timer worker, the TLS handshake driver, and
//! a closer that manages the CONNECTION_CLOSE/drain tail. The
//! application talks to a [`Connection`] handle.
//!
//! ```no_run
//! use quiver::{connect, ClientConfig};
//! use bytes::Bytes;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let conn = connect("example.com", "192.0.2.1:4433".parse()?, ClientConfig {
//!     alpn: vec![b"echo".to_vec()],
//!     ..Default::default()
//! })
//! .await?;
//!
//! let stream = conn.open_bi().await?;
//! conn.write(stream, Bytes::from_static(b"hello"), true).await?;
//! while let Some(chunk) = conn.read(stream).await? {
//!     println!("{chunk:?}");
//! }
//! conn.close(0, b"done").await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod runtime;
mod server;
mod socket;

pub use client::connect;
pub use config::{default_transport_params, ClientConfig, ServerConfig};
pub use connection::Connection;
pub use server::{serve, Server};

pub use quiver_quic::connection::Event;
pub use quiver_quic::{ConnStats, ConnectionState, Error, StreamDir, StreamId, TransportParams};
