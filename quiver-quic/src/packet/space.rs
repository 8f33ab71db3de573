//! Per-level packet-number spaces (RFC 9000 Section 12.3).

use crate::types::PacketNumber;
use std::time::Instant;

/// Packets acknowledged per delayed-ACK window before an ACK is forced
/// (RFC 9000 Section 13.2.2 recommends every other ack-eliciting packet).
pub const ACK_ELICITING_THRESHOLD: u32 = 2;

/// Received ranges retained for ACK generation. Older ranges age out once
/// acknowledgments for them have been sent repeatedly.
const MAX_ACK_RANGES: usize = 32;

/// State of one packet-number space: the send-side counter and the
/// receive-side record used for ACK generation.
///
/// Numbers are never reused; every retransmission is a fresh number
/// from `next_pn`.
#[derive(Debug, Default)]
pub struct PacketSpace {
    next_pn: PacketNumber,

    /// Largest packet number this endpoint has had acknowledged; bounds
    /// the truncation width of outgoing numbers.
    pub largest_acked: Option<PacketNumber>,

    /// Largest packet number received and authenticated.
    pub largest_recv: Option<PacketNumber>,

    /// Arrival time of `largest_recv`, for the ACK delay field.
    pub largest_recv_time: Option<Instant>,

    /// Received packet numbers as inclusive ranges, ascending.
    recv_ranges: Vec<(PacketNumber, PacketNumber)>,

    /// Ack-eliciting packets received since the last ACK was sent.
    pub ack_eliciting_pending: u32,

    /// Whether any ACK-worthy receipt is pending at all.
    pub ack_pending: bool,
}

impl PacketSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next outgoing packet number.
    pub fn next_pn(&mut self) -> PacketNumber {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    /// Highest packet number handed out so far, if any.
    pub fn sent_any(&self) -> bool {
        self.next_pn > 0
    }

    /// Records an authenticated incoming packet number.
    ///
    /// Returns `false` if the number was already present (a duplicate
    /// that must not be processed again).
    pub fn record_received(
        &mut self,
        pn: PacketNumber,
        ack_eliciting: bool,
        now: Instant,
    ) -> bool {
        if self.contains(pn) {
            return false;
        }

        if self.largest_recv.map_or(true, |l| pn > l) {
            self.largest_recv = Some(pn);
            self.largest_recv_time = Some(now);
        }

        self.insert(pn);
        if ack_eliciting {
            self.ack_eliciting_pending += 1;
            self.ack_pending = true;
        }
        true
    }

    fn contains(&self, pn: PacketNumber) -> bool {
        self.recv_ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&pn))
    }

    fn insert(&mut self, pn: PacketNumber) {
        let idx = self.recv_ranges.partition_point(|&(lo, _)| lo < pn);

        // Try to extend an adjacent range before creating a new one.
        if idx > 0 {
            let (_, hi) = &mut self.recv_ranges[idx - 1];
            if *hi + 1 == pn {
                *hi = pn;
                self.merge_at(idx - 1);
                return;
            }
        }
        if idx < self.recv_ranges.len() {
            let (lo, _) = &mut self.recv_ranges[idx];
            if pn + 1 == *lo {
                *lo = pn;
                self.merge_at(idx.saturating_sub(1));
                return;
            }
        }
        self.recv_ranges.insert(idx, (pn, pn));
        if self.recv_ranges.len() > MAX_ACK_RANGES {
            self.recv_ranges.remove(0);
        }
    }

    fn merge_at(&mut self, idx: usize) {
        while idx + 1 < self.recv_ranges.len() {
            let (_, hi) = self.recv_ranges[idx];
            let (next_lo, next_hi) = self.recv_ranges[idx + 1];
            if hi + 1 >= next_lo {
                self.recv_ranges[idx].1 = hi.max(next_hi);
                self.recv_ranges.remove(idx + 1);
            } else {
                break;
            }
        }
    }

    /// Received ranges for ACK generation, ascending inclusive.
    pub fn ack_ranges(&self) -> &[(PacketNumber, PacketNumber)] {
        &self.recv_ranges
    }

    /// Marks the pending receipts as acknowledged.
    pub fn on_ack_sent(&mut self) {
        self.ack_pending = false;
        self.ack_eliciting_pending = 0;
    }

    /// Whether enough ack-eliciting packets are waiting that the ACK
    /// should not be delayed further.
    pub fn ack_due_now(&self) -> bool {
        self.ack_eliciting_pending >= ACK_ELICITING_THRESHOLD
    }
}
