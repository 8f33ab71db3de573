//! Events surfaced from the connection to the endpoint runtime and the
//! application, and per-connection statistics.

use crate::crypto::Level;
use crate::error::Error;
use crate::types::StreamId;
use bytes::Bytes;

/// Notifications produced while processing packets and timers. The
/// runtime forwards application-relevant ones to the connection handle.
#[derive(Debug, Clone)]
pub enum Event {
    /// The handshake finished and 1-RTT traffic flows both ways.
    Established,
    /// A peer-initiated stream exists and has activity.
    StreamOpened { id: StreamId },
    /// Ordered bytes became available on a stream.
    StreamReadable { id: StreamId },
    /// Peer reset its sending side of a stream.
    StreamReset { id: StreamId, error_code: u64 },
    /// Peer asked us to stop sending; our side answers with a reset.
    StopSending { id: StreamId, error_code: u64 },
    /// Flow-control credit opened; blocked writers may proceed.
    Writable,
    /// The peer handed us an address-validation token for later use.
    NewToken { token: Bytes },
    /// The connection is gone, locally or by the peer.
    Closed { error: Error },
}

/// Running counters, kept cheap enough to update per packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub sent_initial: u64,
    pub sent_handshake: u64,
    pub sent_1rtt: u64,
    pub recv_initial: u64,
    pub recv_handshake: u64,
    pub recv_1rtt: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_dropped: u64,
    pub packets_lost: u64,
}

impl ConnStats {
    pub fn on_sent(&mut self, level: Level, bytes: usize) {
        self.bytes_sent += bytes as u64;
        match level {
            Level::Initial => self.sent_initial += 1,
            Level::Handshake => self.sent_handshake += 1,
            Level::ZeroRtt | Level::OneRtt => self.sent_1rtt += 1,
        }
    }

    pub fn on_recv(&mut self, level: Level) {
        match level {
            Level::Initial => self.recv_initial += 1,
            Level::Handshake => self.recv_handshake += 1,
            Level::ZeroRtt | Level::OneRtt => self.recv_1rtt += 1,
        }
    }
}
