//! NewReno congestion control (RFC 9002 Section 7, Appendix B).

use std::time::Instant;

/// Sender maximum segment size used for window arithmetic.
pub const MAX_SEGMENT_SIZE: u64 = 1200;

/// Initial window: min(10 * MSS, max(14720, 2 * MSS))
/// (RFC 9002 Section 7.2).
pub const INITIAL_WINDOW: u64 = 12_000;

/// Floor for the window after loss.
pub const MINIMUM_WINDOW: u64 = 2 * MAX_SEGMENT_SIZE;

/// NewReno state machine: slow start, congestion avoidance, and loss
/// recovery episodes keyed on the recovery start time.
#[derive(Debug, Clone)]
pub struct NewReno {
    cwnd: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    recovery_start: Option<Instant>,
}

impl NewReno {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
        }
    }

    pub fn window(&self) -> u64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Bytes the sender may still put in flight.
    pub fn available(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    pub fn on_packet_sent(&mut self, bytes: u64) {
        self.bytes_in_flight += bytes;
    }

    /// Removes bytes from flight without growing the window; used when a
    /// packet-number space is discarded.
    pub fn on_packet_discarded(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    pub fn on_packet_acked(&mut self, bytes: u64, time_sent: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        // Packets sent before recovery started do not grow the window.
        if let Some(start) = self.recovery_start {
            if time_sent <= start {
                return;
            }
            self.recovery_start = None;
        }

        if self.in_slow_start() {
            self.cwnd += bytes;
        } else {
            self.cwnd += MAX_SEGMENT_SIZE * bytes / self.cwnd;
        }
    }

    /// Enters recovery once per episode (RFC 9002 Section 7.3.2).
    pub fn on_congestion_event(&mut self, now: Instant, time_sent: Instant, lost_bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        if self.recovery_start.map_or(false, |start| time_sent <= start) {
            return;
        }
        self.recovery_start = Some(now);
        self.cwnd = (self.cwnd / 2).max(MINIMUM_WINDOW);
        self.ssthresh = self.cwnd;
        tracing::debug!(cwnd = self.cwnd, "congestion event, window halved");
    }

    /// Collapses the window after persistent congestion
    /// (RFC 9002 Section 7.6.2).
    pub fn on_persistent_congestion(&mut self) {
        self.cwnd = MINIMUM_WINDOW;
        self.recovery_start = None;
        tracing::warn!("persistent congestion, window collapsed");
    }
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = NewReno::new();
        let t = Instant::now();
        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, t);
        assert_eq!(cc.window(), INITIAL_WINDOW + 1200);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn loss_halves_window_once_per_episode() {
        let mut cc = NewReno::new();
        let t0 = Instant::now();
        cc.on_packet_sent(2400);
        cc.on_congestion_event(t0 + Duration::from_millis(10), t0, 1200);
        let after_first = cc.window();
        assert_eq!(after_first, INITIAL_WINDOW / 2);
        assert_eq!(cc.ssthresh(), after_first);

        // A second loss from before recovery started changes nothing.
        cc.on_congestion_event(t0 + Duration::from_millis(11), t0, 1200);
        assert_eq!(cc.window(), after_first);
    }

    #[test]
    fn congestion_avoidance_is_linear() {
        let mut cc = NewReno::new();
        let t0 = Instant::now();
        cc.on_packet_sent(1200);
        cc.on_congestion_event(t0 + Duration::from_millis(1), t0, 1200);
        assert!(!cc.in_slow_start());

        // Ack a packet sent after recovery began.
        let cwnd = cc.window();
        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, t0 + Duration::from_millis(5));
        assert_eq!(cc.window(), cwnd + MAX_SEGMENT_SIZE * 1200 / cwnd);
    }

    #[test]
    fn window_floor_after_collapse() {
        let mut cc = NewReno::new();
        cc.on_persistent_congestion();
        assert_eq!(cc.window(), MINIMUM_WINDOW);
    }
}
