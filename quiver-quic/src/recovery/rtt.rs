//! RTT estimation (RFC 9002 Section 5).

use std::time::Duration;

/// Timer granularity, the floor for loss and probe timeouts.
pub const K_GRANULARITY: Duration = Duration::from_millis(1);

/// Initial RTT before any sample (RFC 9002 Section 6.2.2).
pub const K_INITIAL_RTT: Duration = Duration::from_millis(333);

/// Smoothed RTT state, updated per RFC 9002 Section 5.3.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
    min: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            latest: K_INITIAL_RTT,
            smoothed: K_INITIAL_RTT,
            var: K_INITIAL_RTT / 2,
            min: K_INITIAL_RTT,
            has_sample: false,
        }
    }

    /// Feeds a sample taken from a newly acknowledged ack-eliciting
    /// packet. `ack_delay` is the peer's decoded, clamped ack delay and
    /// only discounts the sample when that leaves it above the minimum.
    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = sample;

        if !self.has_sample {
            self.has_sample = true;
            self.min = sample;
            self.smoothed = sample;
            self.var = sample / 2;
            return;
        }

        if sample < self.min {
            self.min = sample;
        }

        let adjusted = if sample >= self.min + ack_delay {
            sample - ack_delay
        } else {
            sample
        };

        let var_sample = if self.smoothed > adjusted {
            self.smoothed - adjusted
        } else {
            adjusted - self.smoothed
        };
        self.var = (self.var * 3 + var_sample) / 4;
        self.smoothed = (self.smoothed * 7 + adjusted) / 8;
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    pub fn var(&self) -> Duration {
        self.var
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// Base probe timeout, before exponential backoff
    /// (RFC 9002 Section 6.2.1).
    pub fn pto(&self, max_ack_delay: Duration) -> Duration {
        self.smoothed + (4 * self.var).max(K_GRANULARITY) + max_ack_delay
    }

    /// Loss delay for time-threshold detection: 9/8 of the larger of
    /// smoothed and latest RTT (RFC 9002 Section 6.1.2).
    pub fn loss_delay(&self) -> Duration {
        (self.smoothed.max(self.latest) * 9 / 8).max(K_GRANULARITY)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_resets_estimate() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(50), Duration::ZERO);
        assert_eq!(rtt.smoothed(), Duration::from_millis(50));
        assert_eq!(rtt.var(), Duration::from_millis(25));
        assert_eq!(rtt.min(), Duration::from_millis(50));
    }

    #[test]
    fn smoothing_converges() {
        let mut rtt = RttEstimator::new();
        for _ in 0..50 {
            rtt.update(Duration::from_millis(40), Duration::ZERO);
        }
        let srtt = rtt.smoothed();
        assert!(srtt >= Duration::from_millis(39) && srtt <= Duration::from_millis(41));
    }

    #[test]
    fn ack_delay_not_applied_below_min() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(40), Duration::ZERO);
        // A 35ms delay would push the sample below min_rtt; it must be
        // ignored rather than produce a 5ms sample.
        rtt.update(Duration::from_millis(40), Duration::from_millis(35));
        assert_eq!(rtt.smoothed(), Duration::from_millis(40));
    }

    #[test]
    fn pto_has_granularity_floor() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_micros(100), Duration::ZERO);
        rtt.update(Duration::from_micros(100), Duration::ZERO);
        assert!(rtt.pto(Duration::ZERO) >= K_GRANULARITY);
    }
}
