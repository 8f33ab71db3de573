//! Packet formats, packet-number coding, and packet protection
//! (RFC 9000 Sections 12, 17; RFC 9001 Section 5).

pub mod header;
pub mod number;
pub mod seal;
pub mod space;

pub use header::{HeaderBuilder, PacketType, WireHeader};
pub use number::{decode_pn, encode_pn};
pub use seal::{seal_packet, unprotect_header, Unprotected};
pub use space::PacketSpace;

/// Smallest UDP payload every QUIC endpoint must accept, and the floor
/// for client Initial datagrams (RFC 9000 Section 14).
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Default outgoing datagram budget; conservative to avoid fragmentation.
pub const MAX_DATAGRAM_SIZE: usize = 1350;
