//! Out-of-order receive reassembly (RFC 9000 Section 2.2).

use crate::error::{Error, Result, TransportErrorCode};
use crate::types::StreamOffset;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Reassembles stream data into a contiguous prefix.
///
/// Chunks are held in an offset-keyed map; reads deliver bytes strictly
/// in order and gaps block until filled. Used for both application
/// streams and the per-level crypto streams.
#[derive(Debug, Default)]
pub struct RecvBuf {
    chunks: BTreeMap<StreamOffset, Bytes>,
    /// Everything below this offset has been delivered.
    read_offset: StreamOffset,
    /// Highest offset seen, delivered or not.
    max_seen: StreamOffset,
    final_size: Option<StreamOffset>,
    buffered: usize,
}

impl RecvBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a received chunk, trimming overlap with already-delivered
    /// or already-buffered data. `fin` marks `offset + len` as the final
    /// size; inconsistent final sizes are a FINAL_SIZE_ERROR.
    pub fn insert(&mut self, offset: StreamOffset, mut data: Bytes, fin: bool) -> Result<()> {
        let end = offset + data.len() as u64;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(Error::transport(
                    TransportErrorCode::FinalSizeError,
                    "stream data past final size",
                ));
            }
        } else if fin {
            if end < self.max_seen {
                return Err(Error::transport(
                    TransportErrorCode::FinalSizeError,
                    "final size below received data",
                ));
            }
            self.final_size = Some(end);
        }

        if end > self.max_seen {
            self.max_seen = end;
        }

        // Drop the part already delivered.
        let mut offset = offset;
        if offset < self.read_offset {
            let skip = (self.read_offset - offset) as usize;
            if skip >= data.len() {
                return Ok(());
            }
            data = data.slice(skip..);
            offset = self.read_offset;
        }

        // Trim against the preceding buffered chunk.
        if let Some((&prev_off, prev)) = self.chunks.range(..=offset).next_back() {
            let prev_end = prev_off + prev.len() as u64;
            if prev_end > offset {
                let skip = (prev_end - offset) as usize;
                if skip >= data.len() {
                    return Ok(());
                }
                data = data.slice(skip..);
                offset = prev_end;
            }
        }

        // Trim against following chunks, splitting around full overlaps.
        while !data.is_empty() {
            let end = offset + data.len() as u64;
            let next_entry = self.chunks.range(offset..end).next().map(|(&off, next)| (off, next.len()));
            match next_entry {
                Some((next_off, next_len)) => {
                    let head_len = (next_off - offset) as usize;
                    if head_len > 0 {
                        let head = data.slice(..head_len);
                        self.buffered += head.len();
                        self.chunks.insert(offset, head);
                    }
                    let next_end = next_off + next_len as u64;
                    if next_end >= end {
                        return Ok(());
                    }
                    let skip = (next_end - offset) as usize;
                    data = data.slice(skip..);
                    offset = next_end;
                }
                None => {
                    self.buffered += data.len();
                    self.chunks.insert(offset, data);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Reads up to `max_len` contiguous bytes from the delivered prefix.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let (&off, _) = self.chunks.first_key_value()?;
        if off != self.read_offset {
            return None;
        }
        let chunk = self.chunks.remove(&off).unwrap();
        self.buffered -= chunk.len();
        if chunk.len() <= max_len {
            self.read_offset += chunk.len() as u64;
            Some(chunk)
        } else {
            let out = chunk.slice(..max_len);
            self.buffered += chunk.len() - max_len;
            self.chunks.insert(off + max_len as u64, chunk.slice(max_len..));
            self.read_offset += max_len as u64;
            Some(out)
        }
    }

    /// Whether ordered bytes are ready to read.
    pub fn has_readable(&self) -> bool {
        self.chunks
            .first_key_value()
            .map_or(false, |(&off, _)| off == self.read_offset)
    }

    /// All received data up to the final size has been delivered.
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    pub fn read_offset(&self) -> StreamOffset {
        self.read_offset
    }

    /// Highest offset received; the basis for flow-control accounting.
    pub fn max_seen(&self) -> StreamOffset {
        self.max_seen
    }

    pub fn final_size(&self) -> Option<StreamOffset> {
        self.final_size
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut buf = RecvBuf::new();
        buf.insert(0, Bytes::from_static(b"hello "), false).unwrap();
        buf.insert(6, Bytes::from_static(b"world"), true).unwrap();
        assert_eq!(buf.read(64).unwrap().as_ref(), b"hello ");
        assert_eq!(buf.read(64).unwrap().as_ref(), b"world");
        assert!(buf.is_finished());
    }

    #[test]
    fn gap_blocks_until_filled() {
        let mut buf = RecvBuf::new();
        buf.insert(6, Bytes::from_static(b"world"), false).unwrap();
        assert!(buf.read(64).is_none());
        assert!(!buf.has_readable());
        buf.insert(0, Bytes::from_static(b"hello "), false).unwrap();
        assert_eq!(buf.read(64).unwrap().as_ref(), b"hello ");
        assert_eq!(buf.read(64).unwrap().as_ref(), b"world");
    }

    #[test]
    fn duplicate_and_overlap_ignored() {
        let mut buf = RecvBuf::new();
        buf.insert(0, Bytes::from_static(b"abcd"), false).unwrap();
        buf.insert(0, Bytes::from_static(b"abcd"), false).unwrap();
        buf.insert(2, Bytes::from_static(b"cdef"), false).unwrap();
        assert_eq!(buf.read(64).unwrap().as_ref(), b"abcd");
        assert_eq!(buf.read(64).unwrap().as_ref(), b"ef");
        assert!(buf.read(64).is_none());
    }

    #[test]
    fn partial_read_splits_chunk() {
        let mut buf = RecvBuf::new();
        buf.insert(0, Bytes::from_static(b"abcdef"), false).unwrap();
        assert_eq!(buf.read(4).unwrap().as_ref(), b"abcd");
        assert_eq!(buf.read(4).unwrap().as_ref(), b"ef");
    }

    #[test]
    fn old_data_dropped() {
        let mut buf = RecvBuf::new();
        buf.insert(0, Bytes::from_static(b"abcd"), false).unwrap();
        buf.read(64).unwrap();
        // Retransmission of delivered bytes disappears silently.
        buf.insert(0, Bytes::from_static(b"abcd"), false).unwrap();
        assert!(buf.read(64).is_none());
        assert_eq!(buf.buffered_bytes(), 0);
    }

    #[test]
    fn final_size_violations() {
        let mut buf = RecvBuf::new();
        buf.insert(0, Bytes::from_static(b"abcd"), true).unwrap();
        assert!(buf.insert(4, Bytes::from_static(b"x"), false).is_err());
        assert!(buf.insert(0, Bytes::from_static(b"abc"), true).is_err());

        let mut buf = RecvBuf::new();
        buf.insert(4, Bytes::from_static(b"efgh"), false).unwrap();
        // FIN claiming a final size below data already seen.
        assert!(buf.insert(0, Bytes::from_static(b"ab"), true).is_err());
    }

    #[test]
    fn chunk_straddling_existing_chunk() {
        let mut buf = RecvBuf::new();
        buf.insert(2, Bytes::from_static(b"cd"), false).unwrap();
        buf.insert(0, Bytes::from_static(b"abcdef"), false).unwrap();
        assert_eq!(buf.read(64).unwrap().as_ref(), b"ab");
        assert_eq!(buf.read(64).unwrap().as_ref(), b"cd");
        assert_eq!(buf.read(64).unwrap().as_ref(), b"ef");
    }
}
