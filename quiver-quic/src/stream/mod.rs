//! Stream state: per-stream send/receive halves, the stream table, and
//! the per-level crypto streams (RFC 9000 Sections 2-3).

mod recv_buf;
mod send_buf;

pub use recv_buf::RecvBuf;
pub use send_buf::SendBuf;

use crate::error::{Error, Result, TransportErrorCode};
use crate::flow::{RecvWindow, SendWindow};
use crate::transport::TransportParams;
use crate::types::{Side, StreamDir, StreamId, StreamOffset};
use std::collections::BTreeMap;

/// One application stream: reassembler, send queue, per-stream windows,
/// and terminal state flags.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub recv: RecvBuf,
    pub send: SendBuf,
    pub send_window: SendWindow,
    pub recv_window: RecvWindow,
    /// Peer reset its send direction; code surfaces on the next read.
    pub reset_received: Option<u64>,
    /// Peer asked us to stop sending; we answer with RESET_STREAM.
    pub stop_sending_received: Option<u64>,
    /// We reset our send direction.
    pub reset_sent: bool,
}

impl Stream {
    fn new(id: StreamId, send_max: u64, recv_window: u64) -> Self {
        Self {
            id,
            recv: RecvBuf::new(),
            send: SendBuf::new(),
            send_window: SendWindow::new(send_max),
            recv_window: RecvWindow::new(recv_window),
            reset_received: None,
            stop_sending_received: None,
            reset_sent: false,
        }
    }

    /// Send side fully closed: FIN or reset has been emitted and nothing
    /// is queued.
    pub fn send_closed(&self) -> bool {
        self.reset_sent || (self.send.fin_queued() && !self.send.has_pending())
    }

    /// Receive side fully closed: FIN delivered or reset observed.
    pub fn recv_closed(&self) -> bool {
        self.reset_received.is_some() || self.recv.is_finished()
    }
}

/// The stream table plus stream-count accounting for both directions.
#[derive(Debug)]
pub struct StreamMap {
    side: Side,
    streams: BTreeMap<StreamId, Stream>,
    /// Next index we will open per direction.
    next_index: [u64; 2],
    /// Peer's limit on streams we open, per direction.
    peer_max_streams: [u64; 2],
    /// Our limit on streams the peer opens, per direction.
    local_max_streams: [u64; 2],
    /// Highest peer-opened index + 1, per direction.
    peer_opened: [u64; 2],
    /// Initial stream windows from the two transport-parameter sets.
    local_params: StreamLimits,
    peer_params: StreamLimits,
}

#[derive(Debug, Clone, Copy)]
struct StreamLimits {
    bidi_local: u64,
    bidi_remote: u64,
    uni: u64,
}

fn dir_index(dir: StreamDir) -> usize {
    match dir {
        StreamDir::Bidi => 0,
        StreamDir::Uni => 1,
    }
}

impl StreamMap {
    pub fn new(side: Side, local: &TransportParams) -> Self {
        Self {
            side,
            streams: BTreeMap::new(),
            next_index: [0, 0],
            peer_max_streams: [0, 0],
            local_max_streams: [local.initial_max_streams_bidi, local.initial_max_streams_uni],
            peer_opened: [0, 0],
            local_params: StreamLimits {
                bidi_local: local.initial_max_stream_data_bidi_local,
                bidi_remote: local.initial_max_stream_data_bidi_remote,
                uni: local.initial_max_stream_data_uni,
            },
            peer_params: StreamLimits { bidi_local: 0, bidi_remote: 0, uni: 0 },
        }
    }

    /// Applies the peer's transport parameters once the handshake
    /// delivers them.
    pub fn on_peer_params(&mut self, peer: &TransportParams) {
        self.peer_max_streams =
            [peer.initial_max_streams_bidi, peer.initial_max_streams_uni];
        self.peer_params = StreamLimits {
            bidi_local: peer.initial_max_stream_data_bidi_local,
            bidi_remote: peer.initial_max_stream_data_bidi_remote,
            uni: peer.initial_max_stream_data_uni,
        };
    }

    /// Opens a locally initiated stream, subject to the peer's limit.
    pub fn open(&mut self, dir: StreamDir) -> Result<StreamId> {
        let d = dir_index(dir);
        if self.next_index[d] >= self.peer_max_streams[d] {
            return Err(Error::transport(
                TransportErrorCode::StreamLimitError,
                "peer stream limit reached",
            ));
        }
        let id = StreamId::new(self.side, dir, self.next_index[d]);
        self.next_index[d] += 1;

        // Our outgoing data is bounded by what the peer will buffer.
        let send_max = match dir {
            // Peer receives on its "remote" window for our bidi streams.
            StreamDir::Bidi => self.peer_params.bidi_remote,
            StreamDir::Uni => self.peer_params.uni,
        };
        let recv_window = match dir {
            StreamDir::Bidi => self.local_params.bidi_local,
            StreamDir::Uni => 0,
        };
        self.streams.insert(id, Stream::new(id, send_max, recv_window));
        Ok(id)
    }

    /// Looks up a stream named by an incoming frame, creating
    /// peer-initiated streams on first use (RFC 9000 Section 3.2).
    ///
    /// `Ok(None)` means the stream existed but has been collected;
    /// frames for it are stale and ignored.
    pub fn recv_stream(&mut self, id: StreamId) -> Result<Option<&mut Stream>> {
        if id.initiator() == self.side {
            if id.index() >= self.next_index[dir_index(id.dir())] {
                return Err(Error::transport(
                    TransportErrorCode::StreamStateError,
                    "frame for a stream we never opened",
                ));
            }
            return Ok(self.streams.get_mut(&id));
        }

        let d = dir_index(id.dir());
        if id.index() >= self.local_max_streams[d] {
            return Err(Error::transport(
                TransportErrorCode::StreamLimitError,
                "peer exceeded stream limit",
            ));
        }
        if id.index() < self.peer_opened[d] {
            // Already opened; may have been collected since.
            return Ok(self.streams.get_mut(&id));
        }

        // Opening stream N implicitly opens all lower-numbered streams
        // of the same type.
        while self.peer_opened[d] <= id.index() {
            let new_id = StreamId::new(self.side.peer(), id.dir(), self.peer_opened[d]);
            let send_max = match id.dir() {
                StreamDir::Bidi => self.peer_params.bidi_local,
                StreamDir::Uni => 0,
            };
            let recv_window = match id.dir() {
                StreamDir::Bidi => self.local_params.bidi_remote,
                StreamDir::Uni => self.local_params.uni,
            };
            self.streams.insert(new_id, Stream::new(new_id, send_max, recv_window));
            self.peer_opened[d] += 1;
        }
        Ok(self.streams.get_mut(&id))
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn on_max_streams(&mut self, dir: StreamDir, max: u64) {
        let d = dir_index(dir);
        if max > self.peer_max_streams[d] {
            self.peer_max_streams[d] = max;
        }
    }

    /// Drops fully closed streams; returns how many were collected.
    pub fn collect_closed(&mut self) -> usize {
        let before = self.streams.len();
        self.streams.retain(|id, s| {
            let done = match id.dir() {
                StreamDir::Bidi => s.send_closed() && s.recv_closed(),
                StreamDir::Uni => {
                    if id.initiator() == self.side {
                        s.send_closed()
                    } else {
                        s.recv_closed()
                    }
                }
            };
            !done
        });
        before - self.streams.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Per-level crypto stream: the same reassembly model as a stream but no
/// flow control, feeding the handshake driver.
#[derive(Debug, Default)]
pub struct CryptoStream {
    pub recv: RecvBuf,
    /// Next outgoing offset for CRYPTO frames at this level.
    pub tx_offset: StreamOffset,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(bidi: u64, uni: u64) -> TransportParams {
        TransportParams {
            initial_max_streams_bidi: bidi,
            initial_max_streams_uni: uni,
            initial_max_stream_data_bidi_local: 1000,
            initial_max_stream_data_bidi_remote: 2000,
            initial_max_stream_data_uni: 3000,
            ..Default::default()
        }
    }

    fn map_with_peer() -> StreamMap {
        let mut map = StreamMap::new(Side::Client, &params(4, 2));
        map.on_peer_params(&params(3, 1));
        map
    }

    #[test]
    fn open_respects_peer_limit() {
        let mut map = map_with_peer();
        for expected in [0u64, 4, 8] {
            let id = map.open(StreamDir::Bidi).unwrap();
            assert_eq!(id.0, expected);
        }
        assert!(map.open(StreamDir::Bidi).is_err());

        map.on_max_streams(StreamDir::Bidi, 4);
        assert!(map.open(StreamDir::Bidi).is_ok());
    }

    #[test]
    fn peer_stream_implicit_open() {
        let mut map = map_with_peer();
        // Server-initiated bidi stream index 2 (id 9) opens 1 and 5 too.
        let id = StreamId::new(Side::Server, StreamDir::Bidi, 2);
        assert!(map.recv_stream(id).unwrap().is_some());
        assert_eq!(map.len(), 3);
        assert!(map.get(StreamId(1)).is_some());
        assert!(map.get(StreamId(5)).is_some());
    }

    #[test]
    fn peer_stream_limit_enforced() {
        let mut map = map_with_peer();
        let id = StreamId::new(Side::Server, StreamDir::Uni, 2);
        let err = map.recv_stream(id).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport { code: TransportErrorCode::StreamLimitError, .. }
        ));
    }

    #[test]
    fn frame_for_unopened_local_stream_rejected() {
        let mut map = map_with_peer();
        let err = map.recv_stream(StreamId(0)).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport { code: TransportErrorCode::StreamStateError, .. }
        ));
    }

    #[test]
    fn closed_streams_collected() {
        let mut map = map_with_peer();
        let id = map.open(StreamDir::Uni).unwrap();
        let s = map.get_mut(id).unwrap();
        s.send.write(bytes::Bytes::from_static(b"x"), true);
        assert_eq!(map.collect_closed(), 0, "pending data keeps the stream");

        let s = map.get_mut(id).unwrap();
        let _ = s.send.take(16);
        assert_eq!(map.collect_closed(), 1);
    }
}
