//! Loss detection and congestion control (RFC 9002).
//!
//! Owns the sent-packet ledger for the three packet-number spaces and
//! decides when packets are lost, when probes fire, and how much data may
//! be in flight.

pub mod congestion;
pub mod rtt;

pub use congestion::NewReno;
pub use rtt::RttEstimator;
pub use rtt::K_GRANULARITY;

use crate::crypto::Level;
use crate::frames::Frame;
use crate::types::PacketNumber;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Packet reordering threshold (RFC 9002 Section 6.1.1).
pub const K_PACKET_THRESHOLD: u64 = 3;

/// Consecutive PTO periods that constitute persistent congestion
/// (RFC 9002 Section 7.6.1).
pub const K_PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// Packet-number spaces tracked by recovery: Initial, Handshake, and the
/// shared application-data space.
pub const SPACE_COUNT: usize = 3;

/// Everything retained about an unacknowledged packet
/// (RFC 9002 Appendix A.1.1).
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub pn: PacketNumber,
    pub level: Level,
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    /// Retained payload frames for retransmission reconstruction.
    pub frames: Vec<Frame>,
}

#[derive(Debug, Default)]
struct SpaceLedger {
    sent: BTreeMap<PacketNumber, SentPacket>,
    largest_acked: Option<PacketNumber>,
    /// Earliest time an unacked packet becomes lost by time threshold.
    loss_time: Option<Instant>,
    time_of_last_ack_eliciting: Option<Instant>,
}

impl SpaceLedger {
    fn has_ack_eliciting_in_flight(&self) -> bool {
        self.sent.values().any(|p| p.ack_eliciting && p.in_flight)
    }
}

/// Result of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Retransmittable frames of packets declared lost, per level, in
    /// send order.
    pub lost: Vec<(Level, Vec<Frame>)>,
    /// Whether any ack-eliciting packet was newly acknowledged.
    pub acked_ack_eliciting: bool,
    /// Newly acknowledged packet numbers (for log and stats).
    pub newly_acked: Vec<PacketNumber>,
}

/// What to do when the loss-detection timer fires.
#[derive(Debug)]
pub enum TimerVerdict {
    /// Re-run loss detection; carries frames now considered lost.
    Lost(Vec<(Level, Vec<Frame>)>),
    /// Send a probe at the given level.
    Probe(Level),
    None,
}

pub struct Recovery {
    spaces: [SpaceLedger; SPACE_COUNT],
    pub rtt: RttEstimator,
    pub cc: NewReno,
    pto_count: u32,
    /// Peer's max_ack_delay, applied to application-space PTOs once the
    /// handshake is confirmed.
    max_ack_delay: Duration,
    handshake_confirmed: bool,
    /// Packets lost in a row carrying ack-eliciting data; drives the
    /// persistent-congestion declaration.
    pub packets_lost: u64,
    pub packets_acked: u64,
}

impl Recovery {
    pub fn new() -> Self {
        Self {
            spaces: Default::default(),
            rtt: RttEstimator::new(),
            cc: NewReno::new(),
            pto_count: 0,
            max_ack_delay: Duration::from_millis(25),
            handshake_confirmed: false,
            packets_lost: 0,
            packets_acked: 0,
        }
    }

    pub fn set_max_ack_delay(&mut self, delay: Duration) {
        self.max_ack_delay = delay;
    }

    pub fn on_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
    }

    /// Current probe timeout with backoff applied.
    pub fn pto(&self) -> Duration {
        self.pto_base() * (1u32 << self.pto_count.min(10))
    }

    /// PTO without backoff; the draining period is 3x this. The peer's
    /// max_ack_delay only counts once it is trusted, after confirmation
    /// (RFC 9002 Section 6.2.1).
    pub fn pto_base(&self) -> Duration {
        self.rtt.pto(if self.handshake_confirmed {
            self.max_ack_delay
        } else {
            Duration::ZERO
        })
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.cc.bytes_in_flight()
    }

    /// Bytes the congestion controller still allows in flight.
    pub fn congestion_available(&self) -> u64 {
        self.cc.available()
    }

    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        let space = &mut self.spaces[packet.level.pn_space()];
        if packet.ack_eliciting {
            space.time_of_last_ack_eliciting = Some(packet.time_sent);
        }
        if packet.in_flight {
            self.cc.on_packet_sent(packet.size as u64);
        }
        space.sent.insert(packet.pn, packet);
    }

    /// Applies an ACK received at `level` covering `ranges`
    /// (inclusive, ascending). `ack_delay` is already decoded and scaled.
    pub fn on_ack_received(
        &mut self,
        level: Level,
        ranges: &[(PacketNumber, PacketNumber)],
        ack_delay: Duration,
        now: Instant,
    ) -> AckOutcome {
        let space_idx = level.pn_space();
        let mut outcome = AckOutcome::default();

        let Some(&(_, largest_acked)) = ranges.last() else {
            return outcome;
        };

        let mut newly_acked: Vec<SentPacket> = Vec::new();
        {
            let space = &mut self.spaces[space_idx];
            for &(lo, hi) in ranges {
                let in_range: Vec<PacketNumber> =
                    space.sent.range(lo..=hi).map(|(pn, _)| *pn).collect();
                for pn in in_range {
                    if let Some(p) = space.sent.remove(&pn) {
                        newly_acked.push(p);
                    }
                }
            }
            if newly_acked.is_empty() {
                return outcome;
            }
            space.largest_acked = Some(
                space.largest_acked.map_or(largest_acked, |l| l.max(largest_acked)),
            );
        }

        // RTT from the newest acked ack-eliciting packet, when the ACK
        // advanced the largest acknowledged number (RFC 9002 Section 5.1).
        if let Some(newest) = newly_acked.iter().rev().find(|p| p.ack_eliciting) {
            if newest.pn == largest_acked {
                let sample = now.saturating_duration_since(newest.time_sent);
                let clamped = if self.handshake_confirmed {
                    ack_delay.min(self.max_ack_delay)
                } else {
                    ack_delay
                };
                self.rtt.update(sample, clamped);
            }
        }

        for p in &newly_acked {
            outcome.newly_acked.push(p.pn);
            if p.ack_eliciting {
                outcome.acked_ack_eliciting = true;
            }
            if p.in_flight {
                self.cc.on_packet_acked(p.size as u64, p.time_sent);
            }
        }
        self.packets_acked += newly_acked.len() as u64;

        outcome.lost = self.detect_lost(space_idx, now);

        // An ACK that removes in-flight data resets PTO backoff
        // (RFC 9002 Section 6.2.1).
        if outcome.acked_ack_eliciting {
            self.pto_count = 0;
        }

        outcome
    }

    /// Time and packet-threshold loss detection
    /// (RFC 9002 Section 6.1).
    fn detect_lost(&mut self, space_idx: usize, now: Instant) -> Vec<(Level, Vec<Frame>)> {
        let loss_delay = self.rtt.loss_delay();
        let space = &mut self.spaces[space_idx];
        let Some(largest_acked) = space.largest_acked else {
            return Vec::new();
        };

        space.loss_time = None;
        let mut lost_packets: Vec<SentPacket> = Vec::new();
        let mut next_loss_time: Option<Instant> = None;

        let candidates: Vec<PacketNumber> = space
            .sent
            .range(..=largest_acked)
            .map(|(pn, _)| *pn)
            .collect();

        for pn in candidates {
            let p = &space.sent[&pn];
            let lost_by_reorder = largest_acked >= pn + K_PACKET_THRESHOLD;
            let lost_by_time = now >= p.time_sent + loss_delay;
            if lost_by_reorder || lost_by_time {
                let p = space.sent.remove(&pn).unwrap();
                lost_packets.push(p);
            } else {
                let when = p.time_sent + loss_delay;
                next_loss_time = Some(next_loss_time.map_or(when, |t: Instant| t.min(when)));
            }
        }
        space.loss_time = next_loss_time;

        if lost_packets.is_empty() {
            return Vec::new();
        }

        self.packets_lost += lost_packets.len() as u64;
        tracing::debug!(
            count = lost_packets.len(),
            space = space_idx,
            "packets declared lost"
        );

        // Congestion response keys off the newest lost packet; a run of
        // losses spanning the persistent-congestion window collapses the
        // window entirely.
        let lost_bytes: u64 =
            lost_packets.iter().filter(|p| p.in_flight).map(|p| p.size as u64).sum();
        let newest = lost_packets.iter().map(|p| p.time_sent).max().unwrap();
        let oldest = lost_packets.iter().map(|p| p.time_sent).min().unwrap();
        self.cc.on_congestion_event(now, newest, lost_bytes);

        let persistent_window =
            self.pto_base() * K_PERSISTENT_CONGESTION_THRESHOLD;
        if self.rtt.has_sample()
            && lost_packets.iter().filter(|p| p.ack_eliciting).count() >= 2
            && newest.saturating_duration_since(oldest) > persistent_window
        {
            self.cc.on_persistent_congestion();
        }

        lost_packets
            .into_iter()
            .map(|p| {
                let frames =
                    p.frames.into_iter().filter(Frame::is_retransmittable).collect();
                (p.level, frames)
            })
            .collect()
    }

    /// Earliest deadline at which [`Self::on_timeout`] must run.
    pub fn next_timeout(&self) -> Option<Instant> {
        let loss = self.spaces.iter().filter_map(|s| s.loss_time).min();
        if loss.is_some() {
            return loss;
        }

        // PTO only arms while ack-eliciting data is in flight.
        let pto = self.pto();
        self.spaces
            .iter()
            .filter(|s| s.has_ack_eliciting_in_flight())
            .filter_map(|s| s.time_of_last_ack_eliciting)
            .min()
            .map(|t| t + pto)
    }

    /// Handles the loss-detection timer expiring.
    pub fn on_timeout(&mut self, now: Instant) -> TimerVerdict {
        // Loss timer takes precedence over PTO.
        if let Some((idx, _)) = self
            .spaces
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.loss_time.map(|t| (i, t)))
            .min_by_key(|&(_, t)| t)
        {
            if self.spaces[idx].loss_time.map_or(false, |t| now >= t) {
                let lost = self.detect_lost(idx, now);
                return TimerVerdict::Lost(lost);
            }
        }

        if self
            .spaces
            .iter()
            .any(|s| s.has_ack_eliciting_in_flight())
        {
            self.pto_count += 1;
            let level = self.probe_level();
            tracing::debug!(?level, pto_count = self.pto_count, "probe timeout");
            return TimerVerdict::Probe(level);
        }

        TimerVerdict::None
    }

    /// Probes go to the earliest level with outstanding crypto data,
    /// else to the application level (RFC 9002 Section 6.2.4).
    fn probe_level(&self) -> Level {
        if self.spaces[0].has_ack_eliciting_in_flight() {
            Level::Initial
        } else if self.spaces[1].has_ack_eliciting_in_flight() {
            Level::Handshake
        } else {
            Level::OneRtt
        }
    }

    /// Removes every tracked packet in a space and hands them back, for
    /// re-sending after a Retry rebinds the Initial keys.
    pub fn take_sent(&mut self, level: Level) -> Vec<SentPacket> {
        let space = &mut self.spaces[level.pn_space()];
        let packets: Vec<SentPacket> =
            std::mem::take(&mut space.sent).into_values().collect();
        for p in &packets {
            if p.in_flight {
                self.cc.on_packet_discarded(p.size as u64);
            }
        }
        space.loss_time = None;
        space.time_of_last_ack_eliciting = None;
        packets
    }

    /// Drops all state for a level's space when its keys are discarded
    /// (RFC 9002 Section 6.4).
    pub fn discard_space(&mut self, level: Level) {
        let space = &mut self.spaces[level.pn_space()];
        for (_, p) in std::mem::take(&mut space.sent) {
            if p.in_flight {
                self.cc.on_packet_discarded(p.size as u64);
            }
        }
        space.loss_time = None;
        space.time_of_last_ack_eliciting = None;
        self.pto_count = 0;
    }

    /// Whether any ack-eliciting packet is outstanding anywhere.
    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.spaces.iter().any(|s| s.has_ack_eliciting_in_flight())
    }

    pub fn largest_acked(&self, level: Level) -> Option<PacketNumber> {
        self.spaces[level.pn_space()].largest_acked
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sent(pn: u64, level: Level, t: Instant, frames: Vec<Frame>) -> SentPacket {
        SentPacket {
            pn,
            level,
            time_sent: t,
            size: 1200,
            ack_eliciting: true,
            in_flight: true,
            frames,
        }
    }

    #[test]
    fn ack_removes_and_updates_rtt() {
        let mut rec = Recovery::new();
        let t0 = Instant::now();
        rec.on_packet_sent(sent(0, Level::OneRtt, t0, vec![Frame::Ping]));
        rec.on_packet_sent(sent(1, Level::OneRtt, t0, vec![Frame::Ping]));

        let now = t0 + Duration::from_millis(30);
        let outcome = rec.on_ack_received(Level::OneRtt, &[(0, 1)], Duration::ZERO, now);
        assert_eq!(outcome.newly_acked, vec![0, 1]);
        assert!(outcome.acked_ack_eliciting);
        assert!(outcome.lost.is_empty());
        assert_eq!(rec.rtt.latest(), Duration::from_millis(30));
        assert_eq!(rec.bytes_in_flight(), 0);
    }

    #[test]
    fn packet_threshold_loss() {
        let mut rec = Recovery::new();
        let t0 = Instant::now();
        let stream_frame = Frame::Stream {
            stream_id: crate::types::StreamId(0),
            offset: 0,
            data: Bytes::from_static(b"lost"),
            fin: false,
        };
        rec.on_packet_sent(sent(0, Level::OneRtt, t0, vec![stream_frame.clone()]));
        for pn in 1..=3 {
            rec.on_packet_sent(sent(pn, Level::OneRtt, t0, vec![Frame::Ping]));
        }

        // Ack 1..=3; packet 0 trails by K_PACKET_THRESHOLD and is lost.
        let outcome = rec.on_ack_received(
            Level::OneRtt,
            &[(1, 3)],
            Duration::ZERO,
            t0 + Duration::from_millis(10),
        );
        assert_eq!(outcome.lost.len(), 1);
        let (level, frames) = &outcome.lost[0];
        assert_eq!(*level, Level::OneRtt);
        assert_eq!(frames, &vec![stream_frame]);
    }

    #[test]
    fn time_threshold_loss_arms_timer() {
        let mut rec = Recovery::new();
        let t0 = Instant::now();
        rec.rtt.update(Duration::from_millis(20), Duration::ZERO);
        rec.on_packet_sent(sent(0, Level::OneRtt, t0, vec![Frame::Ping]));
        rec.on_packet_sent(sent(1, Level::OneRtt, t0 + Duration::from_millis(1), vec![Frame::Ping]));

        // Ack only pn 1 immediately: pn 0 is one behind, not yet lost.
        let outcome = rec.on_ack_received(
            Level::OneRtt,
            &[(1, 1)],
            Duration::ZERO,
            t0 + Duration::from_millis(2),
        );
        assert!(outcome.lost.is_empty());
        let deadline = rec.next_timeout().expect("loss timer armed");

        // After the loss delay passes, the timer declares it lost.
        match rec.on_timeout(deadline) {
            TimerVerdict::Lost(lost) => assert_eq!(lost.len(), 1),
            other => panic!("expected loss verdict, got {other:?}"),
        }
    }

    #[test]
    fn pto_fires_and_backs_off() {
        let mut rec = Recovery::new();
        let t0 = Instant::now();
        rec.on_packet_sent(sent(0, Level::Handshake, t0, vec![Frame::Ping]));

        let first_pto = rec.pto();
        let deadline = rec.next_timeout().expect("PTO armed");
        assert_eq!(deadline, t0 + first_pto);

        match rec.on_timeout(deadline) {
            TimerVerdict::Probe(level) => assert_eq!(level, Level::Handshake),
            other => panic!("expected probe, got {other:?}"),
        }
        // Backoff doubles the next PTO.
        assert_eq!(rec.pto(), first_pto * 2);
    }

    #[test]
    fn ack_resets_pto_backoff() {
        let mut rec = Recovery::new();
        let t0 = Instant::now();
        rec.on_packet_sent(sent(0, Level::OneRtt, t0, vec![Frame::Ping]));
        let deadline = rec.next_timeout().unwrap();
        rec.on_timeout(deadline);
        assert!(rec.pto() > rec.pto_base());

        rec.on_ack_received(
            Level::OneRtt,
            &[(0, 0)],
            Duration::ZERO,
            t0 + Duration::from_millis(5),
        );
        assert_eq!(rec.pto(), rec.pto_base() * 1);
    }

    #[test]
    fn discard_space_clears_in_flight() {
        let mut rec = Recovery::new();
        let t0 = Instant::now();
        rec.on_packet_sent(sent(0, Level::Initial, t0, vec![Frame::Ping]));
        rec.on_packet_sent(sent(0, Level::OneRtt, t0, vec![Frame::Ping]));
        assert_eq!(rec.bytes_in_flight(), 2400);
        rec.discard_space(Level::Initial);
        assert_eq!(rec.bytes_in_flight(), 1200);
        assert!(rec.next_timeout().is_some(), "app-space PTO still armed");
    }

    #[test]
    fn ack_only_packets_do_not_elicit() {
        let mut rec = Recovery::new();
        let t0 = Instant::now();
        rec.on_packet_sent(SentPacket {
            pn: 0,
            level: Level::OneRtt,
            time_sent: t0,
            size: 40,
            ack_eliciting: false,
            in_flight: false,
            frames: Vec::new(),
        });
        assert!(!rec.has_ack_eliciting_in_flight());
        assert!(rec.next_timeout().is_none());
    }
}
