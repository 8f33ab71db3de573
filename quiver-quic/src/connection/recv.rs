//! Datagram processing and the frame router (RFC 9000 Sections 12-13).
//!
//! Every effect of an incoming packet flows through here: header
//! unprotection, AEAD verification, packet-number accounting, and the
//! dispatch of each frame to the state it mutates. Per the protocol's
//! trust rule, nothing in a packet is acted on before its AEAD tag
//! verifies.

use super::*;
use crate::crypto::boring::retry_integrity_tag;
use crate::crypto::OneRttOpened;
use crate::frames::{self, Frame};
use crate::packet::{seal::SAMPLE_LEN, unprotect_header, PacketType, WireHeader};
use crate::version;

/// Cap on packets buffered per level awaiting keys.
const MAX_PENDING_PER_LEVEL: usize = 16;

impl Connection {
    /// Entry point for a datagram fresh off the socket.
    pub fn process_datagram(&mut self, data: Bytes, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.side == Side::Server {
            self.amplification.received += data.len() as u64;
        }
        self.stats.bytes_recv += data.len() as u64;

        if self.state == ConnectionState::Closing {
            // Answer stragglers with a (rate-limited) CONNECTION_CLOSE;
            // the runtime sends whatever this leaves behind.
            if let Some(close) = self.close_datagram(now) {
                self.pending_close_datagram = Some(close);
            }
            return;
        }
        if self.state == ConnectionState::Draining {
            return; // no further traffic in either direction
        }

        self.process_packets(data, now, true);
    }

    /// Walks the coalesced packets of one datagram. `from_wire` is false
    /// when replaying packets that were buffered awaiting keys.
    pub(super) fn process_packets(&mut self, data: Bytes, now: Instant, from_wire: bool) {
        let mut offset = 0usize;
        while offset < data.len() {
            let rest = data.slice(offset..);
            let Ok(wire) = WireHeader::parse(&rest, LOCAL_CID_LEN) else {
                // Malformed header: drop the rest of the datagram.
                self.stats.packets_dropped += 1;
                return;
            };
            let consumed = wire.payload_end;

            match wire.ty {
                PacketType::VersionNegotiation => {
                    self.on_version_negotiation(&wire);
                }
                PacketType::Retry => {
                    self.on_retry_packet(&wire, &rest);
                }
                _ => self.process_one(&wire, rest.slice(..consumed), now, from_wire),
            }

            if consumed == 0 || wire.ty == PacketType::OneRtt {
                break; // short header consumes the rest
            }
            offset += consumed;
        }
    }

    fn process_one(&mut self, wire: &WireHeader, raw: Bytes, now: Instant, from_wire: bool) {
        let Some(level) = Level::from_packet_type(wire.ty) else {
            return;
        };

        // A packet for a level whose keys are gone (post-handshake
        // Initial, say) is noise.
        if !self.crypto.has_open_keys(level) {
            if self.keys_possible(level) {
                let pending = &mut self.pending[level.index()];
                if from_wire && pending.len() < MAX_PENDING_PER_LEVEL {
                    tracing::trace!(?level, "buffering packet until keys install");
                    pending.push(raw);
                } else {
                    self.stats.packets_dropped += 1;
                }
            } else {
                self.stats.packets_dropped += 1;
            }
            return;
        }

        if wire.pn_offset + 4 + SAMPLE_LEN > raw.len() {
            self.stats.packets_dropped += 1;
            return;
        }

        let mut work = raw.to_vec();
        let space_idx = level.pn_space();
        let largest = self.spaces[space_idx].largest_recv;

        let unprotected = {
            let Ok(opener) = self.crypto.opener(level) else {
                self.stats.packets_dropped += 1;
                return;
            };
            match unprotect_header(&mut work, wire, largest, |s| opener.mask(s)) {
                Ok(u) => u,
                Err(_) => {
                    self.stats.packets_dropped += 1;
                    return;
                }
            }
        };

        let (ad, rest) = work.split_at(unprotected.header_len);
        let ciphertext = &rest[..wire.payload_end - unprotected.header_len];

        let opened = if level == Level::OneRtt {
            let pto = self.recovery.pto_base();
            self.crypto
                .open_1rtt(unprotected.pn, ad, ciphertext, unprotected.key_phase, now, pto)
                .map(|(plain, how)| {
                    if how == OneRttOpened::Updated {
                        tracing::debug!("peer initiated key update");
                    }
                    plain
                })
        } else {
            self.crypto
                .opener(level)
                .and_then(|o| o.open(unprotected.pn, ad, ciphertext))
        };

        let plain = match opened {
            Ok(p) => p,
            Err(_) => {
                // AEAD failure: silent drop, never acknowledged.
                self.stats.packets_dropped += 1;
                return;
            }
        };

        let mut payload = Bytes::from(plain);
        let parsed = match frames::parse_frames(&mut payload) {
            Ok(f) => f,
            Err(err) => {
                self.fatal(err, now);
                return;
            }
        };

        let ack_eliciting = parsed.iter().any(Frame::is_ack_eliciting);
        if !self.spaces[space_idx].record_received(unprotected.pn, ack_eliciting, now) {
            return; // duplicate; already processed and acknowledged
        }

        // Client learns the server's real SCID from its first response.
        if self.side == Side::Client && !self.peer_cid_fixed && wire.ty == PacketType::Initial {
            self.peer_cid_fixed = true;
            self.peer_cids.rebind_initial(wire.scid);
        }

        // A packet that decrypts at Handshake level or above proves the
        // peer owns the address (RFC 9000 Section 8.1).
        if level >= Level::Handshake {
            self.amplification.validated = true;
        }

        self.stats.on_recv(level);
        self.bump_idle(now);

        for frame in parsed {
            if let Err(err) = self.handle_frame(level, frame, now) {
                self.fatal(err, now);
                return;
            }
        }

        self.schedule_ack(level, ack_eliciting, now);
    }

    /// Whether keys for `level` may still arrive (as opposed to having
    /// been installed and later discarded, or never being installable).
    fn keys_possible(&self, level: Level) -> bool {
        match level {
            // Early data is never keyed: no resumption support.
            Level::ZeroRtt => false,
            Level::OneRtt => true,
            Level::Initial | Level::Handshake => {
                self.state < ConnectionState::Established
            }
        }
    }

    /// A frame-level protocol violation: close immediately.
    fn fatal(&mut self, err: Error, now: Instant) {
        tracing::warn!(?err, "protocol violation, closing");
        self.events.push_back(Event::Closed { error: err.clone() });
        self.start_close(err, now);
    }

    fn schedule_ack(&mut self, level: Level, ack_eliciting: bool, now: Instant) {
        if !ack_eliciting {
            return;
        }
        let space = &self.spaces[level.pn_space()];
        // Handshake-level receipts are acknowledged immediately; 1-RTT
        // waits out the delayed-ACK timer unless the threshold hit
        // (RFC 9000 Section 13.2.1).
        if level != Level::OneRtt || space.ack_due_now() {
            self.queue_output(Output::Control { level, frames: Vec::new() });
            self.ack_deadline = None;
        } else {
            let deadline = now + LOCAL_MAX_ACK_DELAY;
            self.ack_deadline =
                Some(self.ack_deadline.map_or(deadline, |d| d.min(deadline)));
        }
    }

    // ------------------------------------------------------------------
    // Special packet types
    // ------------------------------------------------------------------

    fn on_version_negotiation(&mut self, wire: &WireHeader) {
        // Only meaningful before any server packet was processed.
        if self.side != Side::Client
            || self.state != ConnectionState::Handshaking
            || self.peer_cid_fixed
        {
            return;
        }
        // A VN listing the version in use is spurious (RFC 9000 Section 6.2).
        if wire.versions.contains(&self.version) {
            return;
        }
        let error = match wire
            .versions
            .iter()
            .find(|v| version::is_supported(**v) && !version::is_reserved(**v))
        {
            Some(&v) => Error::NextVersion(v),
            None => Error::VersionNegotiationFailed,
        };
        tracing::info!(?error, "version negotiation");
        self.close_error = Some(error.clone());
        self.state = ConnectionState::Closed;
        self.events.push_back(Event::Closed { error });
    }

    fn on_retry_packet(&mut self, wire: &WireHeader, raw: &Bytes) {
        if self.side != Side::Client || wire.token.is_empty() {
            return;
        }
        // Verify the integrity tag over the pseudo-packet before
        // believing anything (RFC 9001 Section 5.8).
        let body_len = raw.len() - 16;
        let Some(expected) = retry_integrity_tag(self.version, &self.original_dcid, &raw[..body_len])
        else {
            return;
        };
        if expected != wire.retry_tag {
            tracing::debug!("retry integrity tag mismatch, dropping");
            self.stats.packets_dropped += 1;
            return;
        }
        if let Err(err) = self.on_retry(wire.scid, wire.token.clone()) {
            tracing::warn!(?err, "retry handling failed");
        }
    }

    // ------------------------------------------------------------------
    // Frame router
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, level: Level, frame: Frame, now: Instant) -> Result<()> {
        // Initial and Handshake packets carry only handshake-adjacent
        // frames (RFC 9000 Section 12.4).
        if matches!(level, Level::Initial | Level::Handshake) && !frame.allowed_pre_1rtt() {
            return Err(Error::transport(
                TransportErrorCode::ProtocolViolation,
                "frame not allowed at this encryption level",
            ));
        }

        match frame {
            Frame::Padding(_) | Frame::Ping => {}

            Frame::Ack(ack) => self.on_ack(level, ack, now)?,

            Frame::Crypto { offset, data } => {
                let cs = &mut self.crypto_streams[level.index()];
                cs.recv.insert(offset, data, false).map_err(|_| {
                    Error::transport(
                        TransportErrorCode::CryptoBufferExceeded,
                        "crypto stream reassembly failed",
                    )
                })?;
                while let Some(chunk) = cs.recv.read(usize::MAX) {
                    self.crypto_ready.push_back((level, chunk));
                }
            }

            Frame::Stream { stream_id, offset, data, fin } => {
                self.on_stream_frame(stream_id, offset, data, fin)?;
            }

            Frame::ResetStream { stream_id, error_code, final_size } => {
                if !stream_id.readable_by(self.side) {
                    return Err(Error::transport(
                        TransportErrorCode::StreamStateError,
                        "RESET_STREAM on our send-only stream",
                    ));
                }
                if let Some(stream) = self.streams.recv_stream(stream_id)? {
                    let prior = stream.recv.max_seen();
                    if final_size < prior {
                        return Err(Error::transport(
                            TransportErrorCode::FinalSizeError,
                            "reset below received data",
                        ));
                    }
                    stream.reset_received = Some(error_code);
                    if !self.recv_window.on_received(
                        self.recv_window.received() + (final_size - prior),
                    ) {
                        return Err(Error::transport(
                            TransportErrorCode::FlowControlError,
                            "reset final size exceeds connection window",
                        ));
                    }
                    self.events.push_back(Event::StreamReset {
                        id: stream_id,
                        error_code,
                    });
                }
            }

            Frame::StopSending { stream_id, error_code } => {
                if !stream_id.sendable_by(self.side) {
                    return Err(Error::transport(
                        TransportErrorCode::StreamStateError,
                        "STOP_SENDING on our receive-only stream",
                    ));
                }
                self.events.push_back(Event::StopSending { id: stream_id, error_code });
                // Answer with a reset carrying the same code.
                let _ = self.stream_reset(stream_id, error_code);
            }

            Frame::MaxData(max) => {
                if self.send_window.update_max(max) {
                    self.events.push_back(Event::Writable);
                    self.wake_blocked_streams();
                }
            }

            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.recv_stream(stream_id)? {
                    if stream.send_window.update_max(max) && stream.send.has_pending() {
                        self.queue_output(Output::Stream {
                            id: stream_id,
                            data: Bytes::new(),
                            fin: false,
                        });
                        self.events.push_back(Event::Writable);
                    }
                }
            }

            Frame::MaxStreams { dir, max } => {
                self.streams.on_max_streams(dir, max);
                self.events.push_back(Event::Writable);
            }

            // We extend windows proactively; the peer telling us it is
            // blocked is just worth recording.
            Frame::DataBlocked(limit) => {
                tracing::debug!(limit, "peer connection-blocked");
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                tracing::debug!(%stream_id, limit, "peer stream-blocked");
            }
            Frame::StreamsBlocked { dir, limit } => {
                tracing::debug!(?dir, limit, "peer streams-blocked");
            }

            Frame::NewToken { token } => {
                if self.side == Side::Server {
                    return Err(Error::transport(
                        TransportErrorCode::ProtocolViolation,
                        "NEW_TOKEN from client",
                    ));
                }
                self.events.push_back(Event::NewToken { token });
            }

            Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token } => {
                let retired =
                    self.peer_cids.on_new_cid(seq, retire_prior_to, cid, reset_token)?;
                if !retired.is_empty() {
                    self.queue_output(Output::Control {
                        level: Level::OneRtt,
                        frames: retired,
                    });
                }
            }

            Frame::RetireConnectionId { seq } => {
                self.local_cids.retire(seq)?;
            }

            Frame::PathChallenge(data) => {
                // Echo on the same path, even while handshaking.
                self.queue_output(Output::Control {
                    level,
                    frames: vec![Frame::PathResponse(data)],
                });
            }

            Frame::PathResponse(data) => {
                if self.path_challenge_sent == Some(data) {
                    self.path_challenge_sent = None;
                    self.amplification.validated = true;
                }
            }

            Frame::ConnectionClose { code, frame_type, reason } => {
                let error = match frame_type {
                    Some(_) => Error::Transport {
                        code: TransportErrorCode::from_wire(code),
                        frame_type: frame_type.unwrap_or(0),
                        reason: "peer closed connection",
                    },
                    None => Error::Application { code, reason },
                };
                tracing::info!(?error, "peer closed; draining");
                self.close_error = Some(error.clone());
                self.state = ConnectionState::Draining;
                self.drain_deadline = Some(now + 3 * self.recovery.pto_base());
                self.ack_deadline = None;
                self.idle_deadline = None;
                self.events.push_back(Event::Closed { error });
            }

            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(Error::transport(
                        TransportErrorCode::ProtocolViolation,
                        "HANDSHAKE_DONE from client",
                    ));
                }
                // Client confirmation: drop handshake material and run
                // at 1-RTT only (RFC 9001 Section 4.9.2).
                self.crypto.confirm_handshake();
                self.recovery.on_handshake_confirmed();
                self.discard_level(Level::Initial);
                self.discard_level(Level::Handshake);
                self.advance_state(ConnectionState::Established);
                self.events.push_back(Event::Established);
            }
        }
        Ok(())
    }

    fn on_ack(&mut self, level: Level, ack: frames::AckFrame, now: Instant) -> Result<()> {
        let mut ranges = ack.to_ranges().ok_or(Error::transport(
            TransportErrorCode::FrameEncodingError,
            "ACK ranges underflow",
        ))?;
        ranges.reverse(); // ascending for the recovery ledger

        let exponent = self
            .peer_params
            .as_ref()
            .map_or(3, |p| p.ack_delay_exponent);
        let delay = Duration::from_micros(ack.delay.saturating_mul(1 << exponent));

        let outcome = self.recovery.on_ack_received(level, &ranges, delay, now);
        if !outcome.newly_acked.is_empty() {
            tracing::trace!(?level, acked = ?outcome.newly_acked, "ack processed");
        }
        self.queue_retransmits(outcome.lost);
        Ok(())
    }

    fn on_stream_frame(
        &mut self,
        id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Result<()> {
        if !id.readable_by(self.side) {
            return Err(Error::transport(
                TransportErrorCode::StreamStateError,
                "STREAM frame on our send-only stream",
            ));
        }

        let existed = self.streams.get(id).is_some();
        let conn_received = self.recv_window.received();
        let Some(stream) = self.streams.recv_stream(id)? else {
            return Ok(()); // stale frame for a collected stream
        };

        let prior_high = stream.recv.max_seen();
        let end = offset + data.len() as u64;

        if !stream.recv_window.on_received(end) {
            return Err(Error::transport(
                TransportErrorCode::FlowControlError,
                "stream flow-control window exceeded",
            ));
        }
        let grows = end.saturating_sub(prior_high);

        stream.recv.insert(offset, data, fin)?;
        let readable = stream.recv.has_readable() || stream.recv.is_finished();

        if !self.recv_window.on_received(conn_received + grows) {
            return Err(Error::transport(
                TransportErrorCode::FlowControlError,
                "connection flow-control window exceeded",
            ));
        }

        if !existed {
            self.events.push_back(Event::StreamOpened { id });
        }
        if readable {
            self.events.push_back(Event::StreamReadable { id });
        }
        Ok(())
    }

    /// Doorbell for every stream with parked data after new credit.
    fn wake_blocked_streams(&mut self) {
        let ids: Vec<StreamId> = self
            .streams
            .iter_mut()
            .filter(|s| s.send.has_pending())
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.queue_output(Output::Stream { id, data: Bytes::new(), fin: false });
        }
    }
}
