//! Stream send buffering.
//!
//! Holds application bytes queued for first transmission. Once sent, the
//! frames themselves live in the recovery ledger until acknowledged, so
//! retransmission never comes back through here.

use crate::types::StreamOffset;
use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct SendBuf {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    /// Offset of the first unsent byte.
    next_offset: StreamOffset,
    fin_queued: bool,
    fin_sent: bool,
}

impl SendBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues data for transmission; `fin` closes the send direction
    /// after it.
    pub fn write(&mut self, data: Bytes, fin: bool) {
        debug_assert!(!self.fin_queued, "write after fin");
        self.queued_bytes += data.len();
        if !data.is_empty() {
            self.queue.push_back(data);
        }
        if fin {
            self.fin_queued = true;
        }
    }

    /// Takes up to `max_bytes` for one STREAM frame.
    ///
    /// Returns `(offset, data, fin)`; `fin` is set on the chunk that
    /// exhausts the queue after a queued FIN, including the empty one.
    pub fn take(&mut self, max_bytes: usize) -> Option<(StreamOffset, Bytes, bool)> {
        if self.queue.is_empty() {
            if self.fin_queued && !self.fin_sent {
                self.fin_sent = true;
                return Some((self.next_offset, Bytes::new(), true));
            }
            return None;
        }
        if max_bytes == 0 {
            return None;
        }

        let offset = self.next_offset;
        let front = self.queue.front_mut().unwrap();
        let data = if front.len() <= max_bytes {
            self.queue.pop_front().unwrap()
        } else {
            let head = front.slice(..max_bytes);
            *front = front.slice(max_bytes..);
            head
        };
        self.queued_bytes -= data.len();
        self.next_offset += data.len() as u64;

        let fin = self.queue.is_empty() && self.fin_queued;
        if fin {
            self.fin_sent = true;
        }
        Some((offset, data, fin))
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty() || (self.fin_queued && !self.fin_sent)
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn next_offset(&self) -> StreamOffset {
        self.next_offset
    }

    pub fn fin_queued(&self) -> bool {
        self.fin_queued
    }

    /// Abandons queued data when the stream is reset.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_take() {
        let mut buf = SendBuf::new();
        buf.write(Bytes::from_static(b"abcdef"), true);

        let (off, data, fin) = buf.take(4).unwrap();
        assert_eq!((off, data.as_ref(), fin), (0, &b"abcd"[..], false));

        let (off, data, fin) = buf.take(4).unwrap();
        assert_eq!((off, data.as_ref(), fin), (4, &b"ef"[..], true));

        assert!(buf.take(4).is_none());
        assert!(!buf.has_pending());
    }

    #[test]
    fn bare_fin() {
        let mut buf = SendBuf::new();
        buf.write(Bytes::new(), true);
        let (off, data, fin) = buf.take(100).unwrap();
        assert_eq!((off, data.len(), fin), (0, 0, true));
        assert!(buf.take(100).is_none());
    }

    #[test]
    fn offsets_advance_across_writes() {
        let mut buf = SendBuf::new();
        buf.write(Bytes::from_static(b"ab"), false);
        let _ = buf.take(16).unwrap();
        buf.write(Bytes::from_static(b"cd"), false);
        let (off, data, _) = buf.take(16).unwrap();
        assert_eq!(off, 2);
        assert_eq!(data.as_ref(), b"cd");
        assert_eq!(buf.next_offset(), 4);
    }
}
