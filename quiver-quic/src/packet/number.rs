//! Truncated packet-number coding (RFC 9000 Section 17.1, Appendix A).

use crate::types::PacketNumber;

/// Picks the shortest encoding that unambiguously identifies `pn` given
/// the largest acknowledged number in its space (RFC 9000 Appendix A.2).
/// Returns the truncated bytes, big-endian.
pub fn encode_pn(pn: PacketNumber, largest_acked: Option<PacketNumber>) -> ([u8; 4], usize) {
    let num_unacked = match largest_acked {
        Some(largest) => pn.saturating_sub(largest),
        None => pn + 1,
    };

    let len = if num_unacked < 1 << 7 {
        1
    } else if num_unacked < 1 << 15 {
        2
    } else if num_unacked < 1 << 23 {
        3
    } else {
        4
    };

    let be = (pn as u32).to_be_bytes();
    let mut out = [0u8; 4];
    out[..len].copy_from_slice(&be[4 - len..]);
    (out, len)
}

/// Reconstructs a full packet number from its truncation
/// (RFC 9000 Appendix A.3).
pub fn decode_pn(
    largest: Option<PacketNumber>,
    truncated: u64,
    pn_len: usize,
) -> PacketNumber {
    let expected = largest.map_or(0, |l| l + 1);
    let pn_nbits = pn_len * 8;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;
    if candidate + pn_hwin <= expected && candidate < (1u64 << 62) - pn_win {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_width_chosen() {
        assert_eq!(encode_pn(0, None).1, 1);
        assert_eq!(encode_pn(200, Some(190)).1, 1);
        assert_eq!(encode_pn(200, Some(10)).1, 2);
        assert_eq!(encode_pn(50_000, Some(5)).1, 3);
        assert_eq!(encode_pn(10_000_000, Some(5)).1, 4);
    }

    #[test]
    fn rfc_appendix_a_example() {
        // RFC 9000 A.3: largest 0xa82f30ea, truncated 0x9b32 over 16 bits.
        assert_eq!(decode_pn(Some(0xa82f30ea), 0x9b32, 2), 0xa82f9b32);
    }

    #[test]
    fn wraparound() {
        assert_eq!(decode_pn(Some(255), 0, 1), 256);
        assert_eq!(decode_pn(Some(65535), 0, 2), 65536);
    }

    #[test]
    fn roundtrip_against_largest_acked() {
        for (largest_acked, pn) in [
            (None, 0),
            (None, 3),
            (Some(0), 1),
            (Some(90), 100),
            (Some(0xa82f30ea), 0xa82f9b32),
            (Some(999_950), 1_000_000),
            (Some(0), 10_000_000),
        ] {
            let (bytes, len) = encode_pn(pn, largest_acked);
            let mut truncated = 0u64;
            for b in &bytes[..len] {
                truncated = truncated << 8 | *b as u64;
            }
            // The receiver decodes against its largest received, which in
            // the worst case equals the sender's largest acked.
            assert_eq!(decode_pn(largest_acked, truncated, len), pn, "pn {pn}");
        }
    }
}
