//! Per-connection state: the central record every worker task operates
//! on through a shared handle (RFC 9000 Section 5).
//!
//! The struct is a synchronous state machine; the async runtime layers
//! queues and timers on top. Methods deposit outgoing work into an
//! internal output queue and application notifications into an event
//! queue; the runtime drains both after every call.

pub mod event;
mod recv;
#[cfg(test)]
mod tests;

pub use event::{ConnStats, Event};

use crate::cid::{LocalCids, PeerCids, LOCAL_CID_LEN};
use crate::crypto::{Algorithm, CryptoContext, Level, LevelKeys, Opener, Sealer};
use crate::error::{Error, Result, TransportErrorCode};
use crate::flow::{RecvWindow, SendWindow};
use crate::frames::{AckFrame, Frame};
use crate::packet::{
    header::HeaderBuilder, seal_packet, PacketSpace, MAX_DATAGRAM_SIZE, MIN_INITIAL_SIZE,
};
use crate::recovery::{Recovery, SentPacket, TimerVerdict};
use crate::stream::{CryptoStream, StreamMap};
use crate::transport::TransportParams;
use crate::types::{ConnectionId, Side, StreamDir, StreamId};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Observable connection states, Handshaking through Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Handshaking,
    /// 1-RTT keys installed; application data may flow.
    ReadyFor1Rtt,
    /// Handshake confirmed on both sides.
    Established,
    /// We sent CONNECTION_CLOSE and linger to answer stragglers.
    Closing,
    /// Peer sent CONNECTION_CLOSE; we go quiet.
    Draining,
    Closed,
}

/// Items the sender worker drains from the output queue.
#[derive(Debug)]
pub enum Output {
    /// Control frames to emit at a level; an empty list is an ACK flush.
    Control { level: Level, frames: Vec<Frame> },
    /// Handshake bytes per level, in emission order.
    Handshake { flights: Vec<(Level, Bytes)> },
    /// Frames reconstructed from a lost packet.
    Retransmit { level: Level, frames: Vec<Frame> },
    /// Application stream data.
    Stream { id: StreamId, data: Bytes, fin: bool },
}

/// Server-side anti-amplification accounting (RFC 9000 Section 8.1).
#[derive(Debug)]
struct Amplification {
    validated: bool,
    received: u64,
    sent: u64,
}

impl Amplification {
    fn allowance(&self) -> u64 {
        if self.validated {
            u64::MAX
        } else {
            (self.received * 3).saturating_sub(self.sent)
        }
    }
}

/// Local ACK delay target; we acknowledge within this bound or after
/// every second ack-eliciting packet.
const LOCAL_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// Local ack_delay_exponent used when encoding ACK delay.
const LOCAL_ACK_DELAY_EXPONENT: u64 = 3;

/// Floor on the effective idle timeout (RFC 9000 Section 10.1).
const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// Payload budget per CRYPTO or STREAM frame so that one frame plus
/// packet overhead always fits a datagram.
const CRYPTO_CHUNK: usize = 1000;
const STREAM_CHUNK: usize = 1100;

pub struct Connection {
    side: Side,
    version: u32,
    state: ConnectionState,

    pub crypto: CryptoContext,
    /// Packet-number spaces indexed by [`Level::pn_space`].
    spaces: [PacketSpace; 3],
    crypto_streams: [CryptoStream; Level::COUNT],
    /// Undecryptable packets buffered until their level's keys install.
    pending: [Vec<Bytes>; Level::COUNT],

    pub streams: StreamMap,
    send_window: SendWindow,
    recv_window: RecvWindow,

    local_cids: LocalCids,
    peer_cids: PeerCids,

    pub recovery: Recovery,

    local_params: TransportParams,
    peer_params: Option<TransportParams>,

    /// DCID of the client's very first Initial; key material root and
    /// the value the server must echo in its parameters.
    original_dcid: ConnectionId,
    /// SCID of a Retry we honored (client side).
    retry_scid: Option<ConnectionId>,
    /// Address-validation token to put in outgoing Initials.
    token: Bytes,

    /// Highest level the sender may currently use.
    tx_level: Level,

    outputs: VecDeque<Output>,
    events: VecDeque<Event>,
    /// In-order crypto bytes ready for the handshake driver.
    crypto_ready: VecDeque<(Level, Bytes)>,

    ack_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    idle_timeout: Duration,
    drain_deadline: Option<Instant>,

    close_error: Option<Error>,
    closing_last_reply: Option<Instant>,
    /// CONNECTION_CLOSE datagram produced while Closing, for the
    /// runtime to flush to the socket.
    pending_close_datagram: Option<Vec<u8>>,

    amplification: Amplification,

    handshake_done_sent: bool,
    /// Client: the peer CID is provisional until the server's first
    /// Initial (or a Retry) names its real SCID.
    peer_cid_fixed: bool,
    path_challenge_sent: Option<[u8; 8]>,

    pub stats: ConnStats,
    max_datagram_size: usize,
}

impl Connection {
    /// Client-side construction: Initial keys derive from the chosen
    /// destination CID.
    pub fn new_client(
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        local_params: TransportParams,
        token: Bytes,
    ) -> Result<Self> {
        let mut conn = Self::new_common(
            Side::Client,
            version,
            dcid,
            scid,
            dcid,
            local_params,
            true,
        )?;
        conn.token = token;
        Ok(conn)
    }

    /// Server-side construction. `peer_scid` is the client's SCID,
    /// `odcid` the DCID its first Initial arrived under (which seeds the
    /// Initial keys). `validated` is true when the Initial carried a
    /// valid Retry token.
    pub fn new_server(
        version: u32,
        odcid: ConnectionId,
        scid: ConnectionId,
        peer_scid: ConnectionId,
        local_params: TransportParams,
        validated: bool,
    ) -> Result<Self> {
        Self::new_common(
            Side::Server,
            version,
            peer_scid,
            scid,
            odcid,
            local_params,
            validated,
        )
    }

    fn new_common(
        side: Side,
        version: u32,
        peer_cid: ConnectionId,
        local_cid: ConnectionId,
        key_dcid: ConnectionId,
        local_params: TransportParams,
        validated: bool,
    ) -> Result<Self> {
        let mut crypto = CryptoContext::new();
        crypto.install(Level::Initial, LevelKeys::initial(&key_dcid, version, side)?);

        let idle_timeout = Duration::from_millis(local_params.max_idle_timeout);
        Ok(Self {
            side,
            version,
            state: ConnectionState::Handshaking,
            crypto,
            spaces: Default::default(),
            crypto_streams: Default::default(),
            pending: Default::default(),
            streams: StreamMap::new(side, &local_params),
            send_window: SendWindow::new(0),
            recv_window: RecvWindow::new(local_params.initial_max_data),
            local_cids: LocalCids::new(local_cid),
            peer_cids: PeerCids::new(peer_cid),
            recovery: Recovery::new(),
            local_params,
            peer_params: None,
            original_dcid: key_dcid,
            retry_scid: None,
            token: Bytes::new(),
            tx_level: Level::Initial,
            outputs: VecDeque::new(),
            events: VecDeque::new(),
            crypto_ready: VecDeque::new(),
            ack_deadline: None,
            idle_deadline: None,
            idle_timeout,
            drain_deadline: None,
            close_error: None,
            closing_last_reply: None,
            pending_close_datagram: None,
            amplification: Amplification { validated, received: 0, sent: 0 },
            handshake_done_sent: false,
            peer_cid_fixed: side == Side::Server,
            path_challenge_sent: None,
            stats: ConnStats::default(),
            max_datagram_size: MAX_DATAGRAM_SIZE,
        })
    }

    // ------------------------------------------------------------------
    // Accessors and queue plumbing
    // ------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Error the connection died with, once in a terminal state.
    pub fn close_error(&self) -> Option<&Error> {
        self.close_error.as_ref()
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.local_cids.active().cid
    }

    /// CID to address the peer with right now.
    pub fn remote_cid(&self) -> ConnectionId {
        self.peer_cids.active().cid
    }

    pub fn queue_output(&mut self, output: Output) {
        self.outputs.push_back(output);
    }

    pub fn take_outputs(&mut self) -> Vec<Output> {
        self.outputs.drain(..).collect()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// In-order CRYPTO bytes for the handshake driver.
    pub fn take_crypto_ready(&mut self) -> Vec<(Level, Bytes)> {
        self.crypto_ready.drain(..).collect()
    }

    /// CONNECTION_CLOSE datagram produced in response to a packet that
    /// arrived while Closing.
    pub fn take_close_datagram(&mut self) -> Option<Vec<u8>> {
        self.pending_close_datagram.take()
    }

    // ------------------------------------------------------------------
    // Handshake-driver hooks
    // ------------------------------------------------------------------

    /// Installs a send-direction secret from TLS and unblocks the sender
    /// for that level.
    ///
    /// 0-RTT secrets are refused: early data is never enabled on the
    /// TLS session, so none should ever reach this point.
    pub fn on_write_secret(&mut self, level: Level, suite: u16, secret: &[u8]) -> Result<()> {
        if level == Level::ZeroRtt {
            tracing::warn!("ignoring 0-RTT write secret; early data is unsupported");
            return Ok(());
        }
        let alg = Algorithm::from_cipher_suite(suite).ok_or(Error::transport(
            TransportErrorCode::Crypto(80),
            "unsupported cipher suite",
        ))?;
        self.crypto.install_seal(level, Sealer::from_secret(alg, secret)?);
        if level > self.tx_level {
            self.tx_level = level;
        }
        if level == Level::OneRtt {
            self.advance_state(ConnectionState::ReadyFor1Rtt);
        }
        Ok(())
    }

    /// Installs a receive-direction secret. Packets that arrived early
    /// for this level replay through the normal receive path; the caller
    /// holds the connection lock, so the release is atomic with the
    /// level advance.
    pub fn on_read_secret(
        &mut self,
        level: Level,
        suite: u16,
        secret: &[u8],
        now: Instant,
    ) -> Result<()> {
        if level == Level::ZeroRtt {
            tracing::warn!("ignoring 0-RTT read secret; early data is unsupported");
            return Ok(());
        }
        let alg = Algorithm::from_cipher_suite(suite).ok_or(Error::transport(
            TransportErrorCode::Crypto(80),
            "unsupported cipher suite",
        ))?;
        self.crypto.install_open(level, Opener::from_secret(alg, secret)?);

        let buffered = std::mem::take(&mut self.pending[level.index()]);
        if !buffered.is_empty() {
            tracing::debug!(?level, count = buffered.len(), "releasing buffered packets");
        }
        for pkt in buffered {
            // Replays are not fresh datagrams: no amplification credit.
            self.process_packets(pkt, now, false);
        }
        Ok(())
    }

    /// Applies the peer's transport parameters (RFC 9000 Section 7.4).
    pub fn apply_peer_params(&mut self, raw: Bytes) -> Result<()> {
        let params = TransportParams::decode(raw)?;

        if self.side == Side::Client {
            // The server must echo the DCID its keys derive from, and
            // the SCID of any Retry it sent (RFC 9000 Section 7.3).
            if params.original_destination_connection_id != Some(self.original_dcid) {
                return Err(Error::transport(
                    TransportErrorCode::TransportParameterError,
                    "original_destination_connection_id mismatch",
                ));
            }
            if params.retry_source_connection_id != self.retry_scid {
                return Err(Error::transport(
                    TransportErrorCode::TransportParameterError,
                    "retry_source_connection_id mismatch",
                ));
            }
            if let Some(token) = params.stateless_reset_token {
                self.peer_cids.set_initial_reset_token(token);
            }
        }
        if params.initial_source_connection_id != Some(self.remote_cid()) {
            return Err(Error::transport(
                TransportErrorCode::TransportParameterError,
                "initial_source_connection_id mismatch",
            ));
        }

        self.send_window.update_max(params.initial_max_data);
        self.streams.on_peer_params(&params);
        self.recovery
            .set_max_ack_delay(Duration::from_millis(params.max_ack_delay));
        self.peer_cids.set_limit(params.active_connection_id_limit);

        // Effective idle timeout is the min of the two non-zero declared
        // values (RFC 9000 Section 10.1).
        let peer_idle = Duration::from_millis(params.max_idle_timeout);
        self.idle_timeout = match (self.idle_timeout, peer_idle) {
            (z, p) if z.is_zero() => p,
            (l, z) if z.is_zero() => l,
            (l, p) => l.min(p),
        };

        if self.max_datagram_size as u64 > params.max_udp_payload_size {
            self.max_datagram_size = params.max_udp_payload_size as usize;
        }

        tracing::debug!(?params, "peer transport parameters applied");
        self.peer_params = Some(params);
        Ok(())
    }

    pub fn peer_params(&self) -> Option<&TransportParams> {
        self.peer_params.as_ref()
    }

    /// Client reaction to a Retry packet: adopt the server's new CID,
    /// re-derive Initial keys from it, and stash the token for the next
    /// Initial (RFC 9000 Section 17.2.5).
    pub fn on_retry(&mut self, retry_scid: ConnectionId, token: Bytes) -> Result<()> {
        if self.side != Side::Client
            || self.retry_scid.is_some()
            || self.state != ConnectionState::Handshaking
        {
            return Ok(()); // stale or duplicate Retry; ignore
        }
        self.retry_scid = Some(retry_scid);
        self.token = token;
        self.peer_cids.rebind_initial(retry_scid);
        self.crypto.install(
            Level::Initial,
            LevelKeys::initial(&retry_scid, self.version, self.side)?,
        );

        // Everything sent under the old Initial keys goes again under
        // the new ones; packet numbers keep counting up.
        for packet in self.recovery.take_sent(Level::Initial) {
            let frames: Vec<Frame> =
                packet.frames.into_iter().filter(Frame::is_retransmittable).collect();
            if !frames.is_empty() {
                self.queue_output(Output::Retransmit { level: Level::Initial, frames });
            }
        }
        Ok(())
    }

    /// Marks the handshake complete on this side.
    ///
    /// The server additionally owes the peer HANDSHAKE_DONE and drops
    /// its Initial/Handshake state (RFC 9001 Section 4.9.2).
    pub fn on_handshake_complete(&mut self) {
        if self.side == Side::Server {
            self.crypto.confirm_handshake();
            self.recovery.on_handshake_confirmed();
            if !self.handshake_done_sent {
                self.handshake_done_sent = true;
                let mut frames = vec![Frame::HandshakeDone];
                frames.push(self.local_cids.issue());
                self.queue_output(Output::Control { level: Level::OneRtt, frames });
            }
            self.discard_level(Level::Initial);
            self.discard_level(Level::Handshake);
            self.advance_state(ConnectionState::Established);
            self.events.push_back(Event::Established);
        }
        // The client waits for HANDSHAKE_DONE (handled in recv).
    }

    fn discard_level(&mut self, level: Level) {
        self.crypto.discard(level);
        self.recovery.discard_space(level);
        self.pending[level.index()].clear();
    }

    fn advance_state(&mut self, to: ConnectionState) {
        if to > self.state {
            tracing::debug!(from = ?self.state, ?to, "connection state advance");
            self.state = to;
        }
    }

    // ------------------------------------------------------------------
    // Application stream surface
    // ------------------------------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.state >= ConnectionState::Closing {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    pub fn open_stream(&mut self, dir: StreamDir) -> Result<StreamId> {
        self.check_open()?;
        self.streams.open(dir)
    }

    /// Queues stream data for the sender worker.
    pub fn stream_write(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        self.check_open()?;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(Error::transport(TransportErrorCode::StreamStateError, "unknown stream"))?;
        if !id.sendable_by(self.side) || stream.reset_sent {
            return Err(Error::transport(
                TransportErrorCode::StreamStateError,
                "stream not writable",
            ));
        }
        self.queue_output(Output::Stream { id, data, fin });
        Ok(())
    }

    /// Reads delivered bytes. `Ok(None)` means no data yet;
    /// `Ok(Some((data, fin)))` delivers in strict offset order.
    pub fn stream_read(&mut self, id: StreamId, max: usize) -> Result<Option<(Bytes, bool)>> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        if let Some(err) = &self.close_error {
            if self.state >= ConnectionState::Closing {
                return Err(err.clone());
            }
        }
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(Error::transport(TransportErrorCode::StreamStateError, "unknown stream"))?;

        if let Some(code) = stream.reset_received {
            return Err(Error::Application { code, reason: Bytes::new() });
        }

        match stream.recv.read(max) {
            Some(data) => {
                let fin = stream.recv.is_finished();
                let len = data.len() as u64;
                if let Some(new_max) = stream.recv_window.on_consumed(len) {
                    let frame = Frame::MaxStreamData { stream_id: id, max: new_max };
                    self.queue_output(Output::Control {
                        level: Level::OneRtt,
                        frames: vec![frame],
                    });
                }
                if let Some(new_max) = self.recv_window.on_consumed(len) {
                    self.queue_output(Output::Control {
                        level: Level::OneRtt,
                        frames: vec![Frame::MaxData(new_max)],
                    });
                }
                Ok(Some((data, fin)))
            }
            None => Ok(None),
        }
    }

    /// Issues a PATH_CHALLENGE on the current path. The endpoint calls
    /// this when it suspects the peer moved; a matching PATH_RESPONSE
    /// re-validates the address.
    pub fn challenge_path(&mut self) -> Result<()> {
        self.check_open()?;
        let mut data = [0u8; 8];
        rand::Rng::fill(&mut rand::thread_rng(), &mut data[..]);
        self.path_challenge_sent = Some(data);
        self.queue_output(Output::Control {
            level: self.tx_level,
            frames: vec![Frame::PathChallenge(data)],
        });
        Ok(())
    }

    /// Whether a stream's receive side has nothing further to deliver:
    /// FIN consumed, reset observed, or the stream already collected.
    pub fn stream_at_eof(&self, id: StreamId) -> bool {
        match self.streams.get(id) {
            Some(s) => s.recv.is_finished() || s.reset_received.is_some(),
            None => true,
        }
    }

    /// Abruptly terminates our sending side of a stream.
    pub fn stream_reset(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        self.check_open()?;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(Error::transport(TransportErrorCode::StreamStateError, "unknown stream"))?;
        if stream.reset_sent {
            return Ok(());
        }
        stream.reset_sent = true;
        let final_size = stream.send.next_offset();
        stream.send.clear();
        self.queue_output(Output::Control {
            level: Level::OneRtt,
            frames: vec![Frame::ResetStream { stream_id: id, error_code, final_size }],
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close and timers
    // ------------------------------------------------------------------

    /// Initiates a local close; the closer worker emits the CLOSE packet
    /// and runs the drain period.
    pub fn start_close(&mut self, error: Error, now: Instant) {
        if self.state >= ConnectionState::Closing {
            return;
        }
        tracing::info!(?error, "closing connection");
        self.close_error = Some(error);
        self.state = ConnectionState::Closing;
        self.drain_deadline = Some(now + 3 * self.recovery.pto_base());
        self.ack_deadline = None;
        self.idle_deadline = None;
    }

    /// Builds the CONNECTION_CLOSE datagram, rate-limited while Closing.
    pub fn close_datagram(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.state != ConnectionState::Closing {
            return None;
        }
        if let Some(last) = self.closing_last_reply {
            if now < last + Duration::from_millis(100) {
                return None;
            }
        }
        self.closing_last_reply = Some(now);

        let error = self.close_error.clone().unwrap_or(Error::transport(
            TransportErrorCode::NoError,
            "",
        ));
        // Highest level with send keys carries the close.
        let level = [Level::OneRtt, Level::Handshake, Level::Initial]
            .into_iter()
            .find(|l| self.crypto.has_seal_keys(*l))?;

        let frame = match &error {
            Error::Application { code, reason } if level == Level::OneRtt => {
                Frame::ConnectionClose { code: *code, frame_type: None, reason: reason.clone() }
            }
            // Application details must not leak in handshake packets:
            // degrade to the bare APPLICATION_ERROR transport code
            // (RFC 9001 Section 4.9).
            Error::Application { .. } => Frame::ConnectionClose {
                code: TransportErrorCode::ApplicationError.to_wire(),
                frame_type: Some(0),
                reason: Bytes::new(),
            },
            Error::Transport { code, frame_type, reason } => Frame::ConnectionClose {
                code: code.to_wire(),
                frame_type: Some(*frame_type),
                reason: Bytes::copy_from_slice(reason.as_bytes()),
            },
            other => Frame::ConnectionClose {
                code: other.wire_code(),
                frame_type: Some(0),
                reason: Bytes::new(),
            },
        };
        self.seal_one(level, vec![frame], now).ok()
    }

    /// Earliest instant any timer-driven work is due.
    pub fn next_timeout(&self) -> Option<Instant> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        [
            self.drain_deadline,
            self.ack_deadline,
            self.idle_deadline,
            if self.state < ConnectionState::Closing {
                self.recovery.next_timeout()
            } else {
                None
            },
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Runs every timer whose deadline has passed.
    pub fn on_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.drain_deadline {
            if now >= deadline {
                tracing::debug!("drain period over");
                self.state = ConnectionState::Closed;
                self.events.push_back(Event::Closed {
                    error: self.close_error.clone().unwrap_or(Error::ConnectionClosed),
                });
                return;
            }
        }

        if let Some(deadline) = self.idle_deadline {
            if now >= deadline && self.state < ConnectionState::Closing {
                // Idle expiry closes silently, with no frame on the wire
                // (RFC 9000 Section 10.1).
                tracing::info!("idle timeout");
                self.close_error = Some(Error::ConnectionClosed);
                self.state = ConnectionState::Closed;
                self.events.push_back(Event::Closed { error: Error::ConnectionClosed });
                return;
            }
        }

        if self.state >= ConnectionState::Closing {
            return;
        }

        if let Some(deadline) = self.ack_deadline {
            if now >= deadline {
                self.ack_deadline = None;
                for level in [Level::Initial, Level::Handshake, Level::OneRtt] {
                    if self.spaces[level.pn_space()].ack_pending
                        && self.crypto.has_seal_keys(level)
                    {
                        self.queue_output(Output::Control { level, frames: Vec::new() });
                    }
                }
            }
        }

        if self.recovery.next_timeout().map_or(false, |t| now >= t) {
            match self.recovery.on_timeout(now) {
                TimerVerdict::Lost(lost) => self.queue_retransmits(lost),
                TimerVerdict::Probe(level) => {
                    // PTO probe: an ack-eliciting packet at the earliest
                    // level with outstanding data (RFC 9002 Section 6.2.4).
                    let level = if self.crypto.has_seal_keys(level) {
                        level
                    } else {
                        self.tx_level
                    };
                    self.queue_output(Output::Control { level, frames: vec![Frame::Ping] });
                }
                TimerVerdict::None => {}
            }
        }
    }

    fn queue_retransmits(&mut self, lost: Vec<(Level, Vec<Frame>)>) {
        for (level, frames) in lost {
            if frames.is_empty() || !self.crypto.has_seal_keys(level) {
                continue;
            }
            self.stats.packets_lost += 1;
            self.queue_output(Output::Retransmit { level, frames });
        }
    }

    fn bump_idle(&mut self, now: Instant) {
        if !self.idle_timeout.is_zero() && self.state < ConnectionState::Closing {
            let timeout = self.idle_timeout.max(MIN_IDLE_TIMEOUT);
            self.idle_deadline = Some(now + timeout);
        }
    }

    // ------------------------------------------------------------------
    // Sender-side assembly
    // ------------------------------------------------------------------

    /// Turns one output item into wire datagrams: plans frames per
    /// level, piggybacks pending ACKs, coalesces levels high-to-low
    /// into datagrams, and pads client Initial datagrams to 1200.
    pub fn assemble(&mut self, item: Output, now: Instant) -> Vec<Vec<u8>> {
        if self.state >= ConnectionState::Closing {
            return Vec::new(); // invariant: nothing new after Closing
        }

        let mut plans: Vec<(Level, Vec<Frame>)> = Vec::new();
        match item {
            Output::Control { level, frames } => {
                if self.crypto.has_seal_keys(level) {
                    plans.push((level, frames));
                }
            }
            Output::Handshake { flights } => {
                // Large flights (certificate chains) split across
                // packets; each chunk gets its own packet so no packet
                // outgrows the datagram budget.
                for (level, data) in flights {
                    if !self.crypto.has_seal_keys(level) {
                        continue;
                    }
                    let cs = &mut self.crypto_streams[level.index()];
                    let mut data = data;
                    while !data.is_empty() {
                        let chunk = data.split_to(data.len().min(CRYPTO_CHUNK));
                        let offset = cs.tx_offset;
                        cs.tx_offset += chunk.len() as u64;
                        plans.push((level, vec![Frame::Crypto { offset, data: chunk }]));
                    }
                }
            }
            Output::Retransmit { level, frames } => {
                if self.crypto.has_seal_keys(level) {
                    plans.push((level, frames));
                }
            }
            Output::Stream { id, data, fin } => {
                plans.extend(self.plan_stream(id, data, fin));
            }
        }

        // Piggyback an ACK for every level with pending receipts.
        for level in [Level::Initial, Level::Handshake, Level::OneRtt] {
            if !self.spaces[level.pn_space()].ack_pending
                || !self.crypto.has_seal_keys(level)
            {
                continue;
            }
            let Some(ack) = self.take_ack(level, now) else { continue };
            match plans.iter_mut().find(|(l, _)| *l == level) {
                Some((_, frames)) => frames.insert(0, ack),
                None => plans.push((level, vec![ack])),
            }
        }

        if plans.is_empty() {
            return Vec::new();
        }
        plans.sort_by_key(|(level, _)| *level);

        // Seal plans in level order and pack them into datagrams.
        let mut datagrams: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        let mut current_has_initial = false;
        let plan_count = plans.len();

        for (i, (level, frames)) in plans.into_iter().enumerate() {
            let last_plan = i + 1 == plan_count;
            // Clients expand every datagram carrying an Initial to 1200
            // bytes; servers only those with ack-eliciting Initials
            // (RFC 9000 Section 14.1).
            let needs_pad = (current_has_initial || level == Level::Initial)
                && (self.side == Side::Client
                    || frames.iter().any(Frame::is_ack_eliciting));
            let pad_to = if last_plan && needs_pad {
                MIN_INITIAL_SIZE.saturating_sub(current.len())
            } else {
                0
            };

            let Ok(pkt) = self.seal_and_record(level, frames, pad_to, now) else {
                continue;
            };

            if current.len() + pkt.len() > self.max_datagram_size && !current.is_empty() {
                datagrams.push(std::mem::take(&mut current));
                current_has_initial = false;
            }
            current_has_initial |= level == Level::Initial;
            current.extend_from_slice(&pkt);
        }
        if !current.is_empty() {
            datagrams.push(current);
        }

        // Anti-amplification: a pre-validation server sends at most 3x
        // what it heard (RFC 9000 Section 8.1).
        if self.side == Side::Server {
            datagrams.retain(|d| {
                if (d.len() as u64) <= self.amplification.allowance() {
                    self.amplification.sent += d.len() as u64;
                    true
                } else {
                    tracing::debug!("amplification limit defers datagram");
                    false
                }
            });
        }

        datagrams
    }

    /// Splits stream data against stream flow control, connection flow
    /// control, and the congestion window; one packet per chunk.
    /// Whatever does not fit parks in the stream's send buffer until
    /// credit arrives.
    fn plan_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> Vec<(Level, Vec<Frame>)> {
        let level = Level::OneRtt;
        if !self.crypto.has_seal_keys(level) {
            // Handshake still running; park everything.
            if let Some(stream) = self.streams.get_mut(id) {
                stream.send.write(data, fin);
            }
            return Vec::new();
        }

        let cwnd = self.recovery.congestion_available();
        let conn_credit = self.send_window.available();
        let Some(stream) = self.streams.get_mut(id) else {
            return Vec::new();
        };

        // Bytes already parked go first so offsets stay in order.
        stream.send.write(data, fin);

        let budget = stream.send_window.available().min(conn_credit).min(cwnd);
        let mut plans = Vec::new();
        let mut taken = 0u64;
        while taken < budget {
            let room = ((budget - taken) as usize).min(STREAM_CHUNK);
            let Some((offset, chunk, chunk_fin)) = stream.send.take(room) else {
                break;
            };
            taken += chunk.len() as u64;
            plans.push((
                level,
                vec![Frame::Stream { stream_id: id, offset, data: chunk, fin: chunk_fin }],
            ));
        }
        stream.send_window.consume(taken);

        let mut blocked = Vec::new();
        if stream.send.has_pending() {
            if stream.send_window.is_blocked() {
                blocked.push(Frame::StreamDataBlocked {
                    stream_id: id,
                    limit: stream.send_window.max(),
                });
            }
            if conn_credit == taken {
                blocked.push(Frame::DataBlocked(self.send_window.max()));
            }
        }
        self.send_window.consume(taken);
        if !blocked.is_empty() {
            plans.push((level, blocked));
        }
        plans
    }

    /// ACK frame for `level`, consuming the pending-receipt state.
    fn take_ack(&mut self, level: Level, now: Instant) -> Option<Frame> {
        let space = &mut self.spaces[level.pn_space()];
        let delay_micros = space
            .largest_recv_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        let ack = AckFrame::from_ranges(
            space.ack_ranges(),
            delay_micros >> LOCAL_ACK_DELAY_EXPONENT,
        )?;
        space.on_ack_sent();
        self.ack_deadline = None;
        Some(Frame::Ack(ack))
    }

    /// Seals one packet and records it with loss recovery.
    fn seal_and_record(
        &mut self,
        level: Level,
        frames: Vec<Frame>,
        pad_to: usize,
        now: Instant,
    ) -> Result<Vec<u8>> {
        let (pkt, pn) = self.seal_frames(level, &frames, pad_to, now)?;

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        self.recovery.on_packet_sent(SentPacket {
            pn,
            level,
            time_sent: now,
            size: pkt.len(),
            ack_eliciting,
            in_flight: ack_eliciting || pad_to > 0,
            frames,
        });
        self.stats.on_sent(level, pkt.len());
        self.bump_idle(now);
        Ok(pkt)
    }

    /// Low-level packet construction shared by the normal send path and
    /// the close path.
    fn seal_one(&mut self, level: Level, frames: Vec<Frame>, now: Instant) -> Result<Vec<u8>> {
        let (pkt, _) = self.seal_frames(level, &frames, 0, now)?;
        self.stats.on_sent(level, pkt.len());
        Ok(pkt)
    }

    fn seal_frames(
        &mut self,
        level: Level,
        frames: &[Frame],
        pad_to: usize,
        now: Instant,
    ) -> Result<(Vec<u8>, u64)> {
        let pn = self.spaces[level.pn_space()].next_pn();
        let largest_acked = self.recovery.largest_acked(level);

        let hdr = HeaderBuilder {
            ty: level.packet_type(),
            version: self.version,
            dcid: self.remote_cid(),
            scid: self.local_cid(),
            token: if level == Level::Initial && self.side == Side::Client {
                self.token.clone()
            } else {
                Bytes::new()
            },
            key_phase: false,
        };

        let (sealer, key_phase) = self.crypto.sealer(level, now)?;
        let hdr = HeaderBuilder { key_phase, ..hdr };
        let pkt = seal_packet(&hdr, pn, largest_acked, frames, sealer, pad_to)?;
        Ok((pkt, pn))
    }
}
