//! Core wire-level types: variable-length integers, connection IDs,
//! stream identifiers (RFC 9000 Sections 2.1, 5.1, 16).

use bytes::{Buf, BufMut, Bytes};
use std::fmt;

/// Full 62-bit packet number.
pub type PacketNumber = u64;

/// Byte offset within a stream or crypto stream.
pub type StreamOffset = u64;

/// Maximum value encodable as a variable-length integer (2^62 - 1).
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    pub fn is_client(self) -> bool {
        self == Side::Client
    }
}

// ============================================================================
// Variable-Length Integer (RFC 9000 Section 16)
// ============================================================================

/// Decode a variable-length integer from `buf`, advancing it.
///
/// The two high bits of the first byte select a 1/2/4/8 byte encoding.
/// Returns `None` if the buffer is too short.
pub fn get_varint<B: Buf>(buf: &mut B) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return None;
    }
    let v = match len {
        1 => buf.get_u8() as u64,
        2 => (buf.get_u16() & 0x3fff) as u64,
        4 => (buf.get_u32() & 0x3fff_ffff) as u64,
        8 => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
        _ => unreachable!(),
    };
    Some(v)
}

/// Encode `v` with the minimum-width variable-length encoding.
///
/// Values above [`VARINT_MAX`] cannot be represented; callers validate
/// before encoding, so this saturates the prefix rather than panicking.
pub fn put_varint<B: BufMut>(buf: &mut B, v: u64) {
    if v < 1 << 6 {
        buf.put_u8(v as u8);
    } else if v < 1 << 14 {
        buf.put_u16(v as u16 | 0x4000);
    } else if v < 1 << 30 {
        buf.put_u32(v as u32 | 0x8000_0000);
    } else {
        buf.put_u64(v | 0xc000_0000_0000_0000);
    }
}

/// Number of bytes [`put_varint`] will use for `v`.
pub const fn varint_len(v: u64) -> usize {
    if v < 1 << 6 {
        1
    } else if v < 1 << 14 {
        2
    } else if v < 1 << 30 {
        4
    } else {
        8
    }
}

// ============================================================================
// Connection ID (RFC 9000 Section 5.1)
// ============================================================================

/// Maximum connection ID length for the pinned versions (RFC 9000
/// Section 17.2).
pub const MAX_CID_LEN: usize = 20;

/// An opaque connection identifier, 0..=20 bytes.
///
/// Stored inline; connection IDs are compared and hashed constantly on the
/// receive path, so they stay out of the allocator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    /// Builds a connection ID from a slice. Returns `None` when the slice
    /// exceeds [`MAX_CID_LEN`].
    pub fn new(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Some(Self { len: slice.len() as u8, bytes })
    }

    /// A zero-length connection ID.
    pub const fn empty() -> Self {
        Self { len: 0, bytes: [0u8; MAX_CID_LEN] }
    }

    /// Generates a random connection ID of the given length.
    pub fn random(len: usize) -> Self {
        debug_assert!(len <= MAX_CID_LEN);
        let mut bytes = [0u8; MAX_CID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..len]);
        Self { len: len as u8, bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// 16-byte stateless reset token carried on NEW_CONNECTION_ID frames and
/// the `stateless_reset_token` transport parameter.
pub type ResetToken = [u8; 16];

// ============================================================================
// Stream Identifier (RFC 9000 Section 2.1)
// ============================================================================

/// Direction of a stream relative to its initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDir {
    Bidi,
    Uni,
}

/// A stream identifier. The two low bits encode initiator and
/// directionality: bit 0 set = server-initiated, bit 1 set = unidirectional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, dir: StreamDir, index: u64) -> Self {
        let mut id = index << 2;
        if initiator == Side::Server {
            id |= 0x1;
        }
        if dir == StreamDir::Uni {
            id |= 0x2;
        }
        StreamId(id)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn dir(self) -> StreamDir {
        if self.0 & 0x2 == 0 {
            StreamDir::Bidi
        } else {
            StreamDir::Uni
        }
    }

    /// Ordinal of this stream among streams of the same type.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// Whether `side` is allowed to send on this stream.
    pub fn sendable_by(self, side: Side) -> bool {
        self.dir() == StreamDir::Bidi || self.initiator() == side
    }

    /// Whether `side` is allowed to receive on this stream.
    pub fn readable_by(self, side: Side) -> bool {
        self.dir() == StreamDir::Bidi || self.initiator() != side
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous chunk of stream or crypto data.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub offset: StreamOffset,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_widths() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 37);
        assert_eq!(buf, [0x25]);

        buf.clear();
        put_varint(&mut buf, 15293);
        assert_eq!(buf, [0x7b, 0xbd]);

        buf.clear();
        put_varint(&mut buf, 494_878_333);
        assert_eq!(buf, [0x9d, 0x7f, 0x3e, 0x7d]);

        buf.clear();
        put_varint(&mut buf, 151_288_809_941_952_652);
        assert_eq!(buf, [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]);
    }

    #[test]
    fn varint_roundtrip() {
        for v in [
            0,
            1,
            63,
            64,
            16_383,
            16_384,
            1_073_741_823,
            1_073_741_824,
            VARINT_MAX,
        ] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            assert_eq!(varint_len(v), buf.len());
            let mut slice = &buf[..];
            assert_eq!(get_varint(&mut slice), Some(v), "value {v}");
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn varint_short_buffer() {
        let mut slice = &[0x7b][..];
        assert_eq!(get_varint(&mut slice), None);
    }

    #[test]
    fn cid_bounds() {
        assert!(ConnectionId::new(&[0u8; 21]).is_none());
        let cid = ConnectionId::new(&[1, 2, 3]).unwrap();
        assert_eq!(cid.as_bytes(), &[1, 2, 3]);
        assert_eq!(ConnectionId::empty().len(), 0);
    }

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Client, StreamDir::Bidi, 0);
        assert_eq!(id.0, 0);
        let id = StreamId::new(Side::Server, StreamDir::Uni, 3);
        assert_eq!(id.0, 0xf);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), StreamDir::Uni);
        assert_eq!(id.index(), 3);
        assert!(!id.readable_by(Side::Client) || id.initiator() == Side::Server);
        assert!(!id.sendable_by(Side::Client));
    }
}
