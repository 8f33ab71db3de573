//! Packet protection pipeline: header protection plus AEAD
//! (RFC 9001 Sections 5.3-5.4).

use super::header::{HeaderBuilder, PacketType, WireHeader, KEY_PHASE_BIT};
use super::number::{decode_pn, encode_pn};
use crate::crypto::Sealer;
use crate::error::{Error, Result, TransportErrorCode};
use crate::frames::{self, Frame};
use crate::types::PacketNumber;

/// Bytes of ciphertext sampled for the header-protection mask.
pub const SAMPLE_LEN: usize = 16;

/// Result of removing header protection from a packet.
#[derive(Debug, Clone, Copy)]
pub struct Unprotected {
    pub pn: PacketNumber,
    pub pn_len: usize,
    pub key_phase: bool,
    /// Offset one past the packet number: where the ciphertext begins
    /// and the AEAD associated data ends.
    pub header_len: usize,
}

/// Removes header protection in place (RFC 9001 Section 5.4.1).
///
/// `mask_of` computes the 5-byte mask from the ciphertext sample; it is a
/// closure because the 1-RTT level owns several AEAD generations behind a
/// single header-protection key.
pub fn unprotect_header(
    pkt: &mut [u8],
    wire: &WireHeader,
    largest_recv: Option<PacketNumber>,
    mask_of: impl FnOnce(&[u8; SAMPLE_LEN]) -> Result<[u8; 5]>,
) -> Result<Unprotected> {
    let pn_offset = wire.pn_offset;
    if pn_offset + 4 + SAMPLE_LEN > wire.payload_end || wire.payload_end > pkt.len() {
        return Err(Error::transport(
            TransportErrorCode::ProtocolViolation,
            "packet too short to sample",
        ));
    }

    let mut sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(&pkt[pn_offset + 4..pn_offset + 4 + SAMPLE_LEN]);
    let mask = mask_of(&sample)?;

    // Low 4 bits of the flag byte are protected in long headers, low 5
    // in short headers.
    if wire.ty.is_long() {
        pkt[0] ^= mask[0] & 0x0f;
    } else {
        pkt[0] ^= mask[0] & 0x1f;
    }

    let pn_len = (pkt[0] & 0x03) as usize + 1;
    let mut truncated: u64 = 0;
    for i in 0..pn_len {
        pkt[pn_offset + i] ^= mask[1 + i];
        truncated = truncated << 8 | pkt[pn_offset + i] as u64;
    }

    Ok(Unprotected {
        pn: decode_pn(largest_recv, truncated, pn_len),
        pn_len,
        key_phase: wire.ty == PacketType::OneRtt && pkt[0] & KEY_PHASE_BIT != 0,
        header_len: pn_offset + pn_len,
    })
}

/// Builds one protected packet: header, frames, AEAD seal, header
/// protection. `pad_to` grows the packet (with PADDING in the plaintext)
/// to at least that total size; the sender uses it to fill out client
/// Initial datagrams.
pub fn seal_packet(
    hdr: &HeaderBuilder,
    pn: PacketNumber,
    largest_acked: Option<PacketNumber>,
    frames_list: &[Frame],
    sealer: &Sealer,
    pad_to: usize,
) -> Result<Vec<u8>> {
    let (pn_bytes, pn_len) = encode_pn(pn, largest_acked);
    let pn_bytes = &pn_bytes[..pn_len];

    let mut plaintext = Vec::new();
    for frame in frames_list {
        frames::put_frame(&mut plaintext, frame);
    }

    // The sample starts 4 bytes past the packet-number offset, so the
    // payload must cover pn_len + plaintext + tag >= 4 + SAMPLE_LEN.
    let min_plaintext = (4 + SAMPLE_LEN)
        .saturating_sub(pn_len + sealer.tag_len());
    if plaintext.len() < min_plaintext {
        plaintext.resize(min_plaintext, 0);
    }

    if pad_to > 0 {
        let base = hdr.len(pn_len, plaintext.len() + sealer.tag_len());
        if base < pad_to {
            plaintext.resize(plaintext.len() + (pad_to - base), 0);
        }
    }

    let payload_len = plaintext.len() + sealer.tag_len();
    let mut pkt = Vec::with_capacity(hdr.len(pn_len, payload_len));
    let pn_offset = hdr.write(&mut pkt, 0, pn_bytes, payload_len);
    debug_assert_eq!(pkt.len(), pn_offset + pn_len);

    let ciphertext = sealer.seal(pn, &pkt, &plaintext)?;
    pkt.extend_from_slice(&ciphertext);

    // Apply header protection.
    let mut sample = [0u8; SAMPLE_LEN];
    sample.copy_from_slice(&pkt[pn_offset + 4..pn_offset + 4 + SAMPLE_LEN]);
    let mask = sealer.mask(&sample)?;
    if hdr.ty.is_long() {
        pkt[0] ^= mask[0] & 0x0f;
    } else {
        pkt[0] ^= mask[0] & 0x1f;
    }
    for i in 0..pn_len {
        pkt[pn_offset + i] ^= mask[1 + i];
    }

    Ok(pkt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{LevelKeys, Sealer};
    use crate::types::{ConnectionId, Side};
    use crate::version::VERSION_1;
    use bytes::Bytes;

    fn initial_pair() -> (LevelKeys, LevelKeys) {
        let dcid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]).unwrap();
        let client = LevelKeys::initial(&dcid, VERSION_1, Side::Client).unwrap();
        let server = LevelKeys::initial(&dcid, VERSION_1, Side::Server).unwrap();
        (client, server)
    }

    fn sealed_initial(seal: &Sealer, frames_list: &[Frame], pad_to: usize) -> Vec<u8> {
        let hdr = HeaderBuilder {
            ty: PacketType::Initial,
            version: VERSION_1,
            dcid: ConnectionId::new(&[1; 8]).unwrap(),
            scid: ConnectionId::new(&[2; 8]).unwrap(),
            token: Bytes::new(),
            key_phase: false,
        };
        seal_packet(&hdr, 0, None, frames_list, seal, pad_to).unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let (client, server) = initial_pair();
        let frames_list = vec![Frame::Crypto {
            offset: 0,
            data: Bytes::from_static(b"client hello bytes"),
        }];
        let pkt = sealed_initial(&client.seal, &frames_list, 0);

        let wire = WireHeader::parse(&pkt, 0).unwrap();
        assert_eq!(wire.ty, PacketType::Initial);

        let mut work = pkt.clone();
        let un = unprotect_header(&mut work, &wire, None, |s| server.open.mask(s)).unwrap();
        assert_eq!(un.pn, 0);

        let (ad, rest) = work.split_at(un.header_len);
        let plain = server
            .open
            .open(un.pn, ad, &rest[..wire.payload_end - un.header_len])
            .unwrap();

        let mut payload = Bytes::copy_from_slice(&plain);
        let parsed = frames::parse_frames(&mut payload).unwrap();
        assert_eq!(parsed[0], frames_list[0]);
    }

    #[test]
    fn padding_reaches_target() {
        let (client, _) = initial_pair();
        let pkt = sealed_initial(
            &client.seal,
            &[Frame::Crypto { offset: 0, data: Bytes::from_static(b"x") }],
            1200,
        );
        assert_eq!(pkt.len(), 1200);
    }

    #[test]
    fn tampered_packet_fails_open() {
        let (client, server) = initial_pair();
        let pkt = sealed_initial(&client.seal, &[Frame::Ping], 0);
        let wire = WireHeader::parse(&pkt, 0).unwrap();

        let mut work = pkt.clone();
        let last = work.len() - 1;
        work[last] ^= 0xff;
        let un = unprotect_header(&mut work, &wire, None, |s| server.open.mask(s)).unwrap();
        let (ad, rest) = work.split_at(un.header_len);
        assert!(server
            .open
            .open(un.pn, ad, &rest[..wire.payload_end - un.header_len])
            .is_err());
    }

    #[test]
    fn wrong_keys_fail_open() {
        let (client, _) = initial_pair();
        let other_dcid = ConnectionId::new(&[9; 8]).unwrap();
        let other = LevelKeys::initial(&other_dcid, VERSION_1, Side::Server).unwrap();

        let pkt = sealed_initial(&client.seal, &[Frame::Ping], 0);
        let wire = WireHeader::parse(&pkt, 0).unwrap();
        let mut work = pkt.clone();
        // The mask comes from the wrong HP key, so the decoded packet
        // number and AEAD both go wrong; the open must fail.
        let un = unprotect_header(&mut work, &wire, None, |s| other.open.mask(s)).unwrap();
        let (ad, rest) = work.split_at(un.header_len);
        assert!(other
            .open
            .open(un.pn, ad, &rest[..wire.payload_end - un.header_len])
            .is_err());
    }
}
