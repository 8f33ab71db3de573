//! # quiver-quic: QUIC transport protocol core
//!
//! The protocol half of the `quiver` endpoint: everything between raw
//! UDP datagrams and ordered stream bytes, with no sockets or executor
//! of its own.
//!
//! - **RFC 9000**: transport, streams, flow control, connection IDs
//! - **RFC 9001**: packet protection and the TLS 1.3 coupling
//! - **RFC 9002**: loss detection and congestion control
//!
//! ```text
//! quiver-quic/
//! ├── types       - varints, connection IDs, stream IDs
//! ├── error       - transport error codes and endpoint errors
//! ├── version     - pinned versions, salts, Retry keys
//! ├── frames      - frame model, parser, encoder
//! ├── packet      - headers, packet numbers, packet protection
//! ├── crypto      - per-level coders, key schedule, key update (BoringSSL)
//! ├── tls         - TLS 1.3 step function over SSL_QUIC_METHOD
//! ├── recovery    - RTT, loss detection, NewReno
//! ├── stream      - reassembly, send buffering, stream table
//! ├── flow        - send/receive windows
//! ├── transport   - transport parameter codec
//! ├── cid         - local and peer connection-ID tables
//! ├── token       - address-validation tokens
//! └── connection  - the per-connection state machine
//! ```
//!
//! The [`connection::Connection`] struct is the heart: a synchronous
//! state machine the async runtime drives from its worker tasks. Inputs
//! are datagrams and timer expiries; outputs are [`connection::Output`]
//! items for the sender and [`connection::Event`]s for the application.

pub mod cid;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod stream;
pub mod tls;
pub mod token;
pub mod transport;
pub mod types;
pub mod version;

pub use connection::{ConnStats, Connection, ConnectionState, Event, Output};
pub use crypto::Level;
pub use error::{Error, Result, TransportErrorCode};
pub use tls::{KeyEvent, TlsConfig, TlsSession, TlsStep};
pub use transport::TransportParams;
pub use types::{ConnectionId, Side, StreamDir, StreamId};
