//! Flow-control windows (RFC 9000 Section 4).
//!
//! The same two window types serve connection level and stream level.
//! Send windows track peer-granted credit; receive windows track what we
//! advertise and decide when to extend it.

/// Credit granted by the peer for data we send.
#[derive(Debug, Clone, Copy)]
pub struct SendWindow {
    max: u64,
    used: u64,
}

impl SendWindow {
    pub fn new(initial_max: u64) -> Self {
        Self { max: initial_max, used: 0 }
    }

    pub fn available(&self) -> u64 {
        self.max.saturating_sub(self.used)
    }

    /// Consumes credit for bytes handed to the packetizer.
    pub fn consume(&mut self, bytes: u64) {
        debug_assert!(bytes <= self.available());
        self.used += bytes;
    }

    /// MAX_DATA / MAX_STREAM_DATA from the peer; limits never regress.
    pub fn update_max(&mut self, max: u64) -> bool {
        if max > self.max {
            self.max = max;
            true
        } else {
            false
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn is_blocked(&self) -> bool {
        self.available() == 0
    }

    /// Current limit, reported in DATA_BLOCKED frames.
    pub fn max(&self) -> u64 {
        self.max
    }
}

/// Credit we grant the peer for data we receive.
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    max: u64,
    /// Highest offset (or offset sum) the peer has used.
    received: u64,
    /// Bytes the application has consumed; the window slides from here.
    consumed: u64,
    window: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self { max: window, received: 0, consumed: 0, window }
    }

    /// Accounts peer data up to a new high-water mark. `false` means the
    /// peer overran our advertised limit (FLOW_CONTROL_ERROR).
    pub fn on_received(&mut self, new_total: u64) -> bool {
        if new_total > self.max {
            return false;
        }
        if new_total > self.received {
            self.received = new_total;
        }
        true
    }

    /// Records delivery to the application and returns a new limit to
    /// advertise once half the window is consumed.
    pub fn on_consumed(&mut self, bytes: u64) -> Option<u64> {
        self.consumed += bytes;
        let next = self.consumed + self.window;
        if next >= self.max + self.window / 2 {
            self.max = next;
            Some(next)
        } else {
            None
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_window_credit() {
        let mut w = SendWindow::new(100);
        assert_eq!(w.available(), 100);
        w.consume(60);
        assert_eq!(w.available(), 40);
        assert!(!w.is_blocked());

        assert!(w.update_max(160));
        assert_eq!(w.available(), 100);
        // Regressing updates are ignored.
        assert!(!w.update_max(50));
        assert_eq!(w.available(), 100);
    }

    #[test]
    fn recv_window_overrun() {
        let mut w = RecvWindow::new(100);
        assert!(w.on_received(100));
        assert!(!w.on_received(101));
    }

    #[test]
    fn recv_window_extends_after_half_consumed() {
        let mut w = RecvWindow::new(100);
        assert!(w.on_received(80));
        assert_eq!(w.on_consumed(40), None);
        // Crossing half the window slides the limit forward.
        let new_max = w.on_consumed(20).expect("window should extend");
        assert_eq!(new_max, 160);
        assert_eq!(w.max(), 160);
    }
}
