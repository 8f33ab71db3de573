//! Address-validation tokens (RFC 9000 Section 8.1).
//!
//! Tokens are minted by the server, opaque to the client, and
//! self-authenticating: a keyed digest over the token body lets the
//! server validate them statelessly. Retry tokens bind the client's
//! original DCID so the server can recover it; NEW_TOKEN tokens only
//! prove a prior connection from the same address.

use crate::crypto::boring::{hkdf_expand_label, hkdf_extract};
use crate::crypto::Algorithm;
use crate::types::ConnectionId;
use bytes::{Buf, BufMut, Bytes};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const KIND_RETRY: u8 = 1;
const KIND_NEW_TOKEN: u8 = 2;
const TAG_LEN: usize = 16;

/// How long a Retry token stays valid. Retry round-trips immediately,
/// so this can be tight.
pub const RETRY_TOKEN_LIFETIME: Duration = Duration::from_secs(30);

/// NEW_TOKEN tokens are meant for future connections.
pub const NEW_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 3600);

/// Per-server token minting key.
pub struct TokenMinter {
    key: Vec<u8>,
}

impl TokenMinter {
    /// A fresh random key; tokens do not survive server restarts.
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed[..]);
        // Run the seed through the extractor so the working key is
        // uniform even if the RNG is biased.
        let key = hkdf_extract(Algorithm::Aes128Gcm, b"quiver address token", &seed)
            .expect("HKDF extract");
        Self { key }
    }

    fn tag(&self, body: &[u8], addr: &SocketAddr) -> [u8; 16] {
        let mut input = body.to_vec();
        match addr.ip() {
            std::net::IpAddr::V4(ip) => input.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => input.extend_from_slice(&ip.octets()),
        }
        let prk = hkdf_extract(Algorithm::Aes128Gcm, &self.key, &input).expect("HKDF extract");
        let tag = hkdf_expand_label(Algorithm::Aes128Gcm, &prk, "token tag", TAG_LEN)
            .expect("HKDF expand");
        let mut out = [0u8; 16];
        out.copy_from_slice(&tag);
        out
    }

    fn mint(&self, kind: u8, odcid: Option<&ConnectionId>, addr: &SocketAddr) -> Bytes {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let mut body = Vec::with_capacity(32);
        body.push(kind);
        body.put_u64(now);
        match odcid {
            Some(cid) => {
                body.push(cid.len() as u8);
                body.extend_from_slice(cid.as_bytes());
            }
            None => body.push(0),
        }
        let tag = self.tag(&body, addr);
        body.extend_from_slice(&tag);
        Bytes::from(body)
    }

    /// Token carried in a Retry packet; binds the original DCID.
    pub fn mint_retry(&self, odcid: &ConnectionId, addr: &SocketAddr) -> Bytes {
        self.mint(KIND_RETRY, Some(odcid), addr)
    }

    /// Token for a NEW_TOKEN frame, usable on a future connection.
    pub fn mint_new_token(&self, addr: &SocketAddr) -> Bytes {
        self.mint(KIND_NEW_TOKEN, None, addr)
    }

    /// Validates a token from an Initial packet.
    ///
    /// On success returns the original DCID for Retry tokens, `None` for
    /// NEW_TOKEN tokens. `Err(())` means the token is garbage, expired,
    /// or minted for another address.
    pub fn validate(
        &self,
        token: &[u8],
        addr: &SocketAddr,
    ) -> std::result::Result<Option<ConnectionId>, ()> {
        if token.len() < 1 + 8 + 1 + TAG_LEN {
            return Err(());
        }
        let (body, tag) = token.split_at(token.len() - TAG_LEN);
        if self.tag(body, addr) != tag {
            return Err(());
        }

        let mut cur = body;
        let kind = cur.get_u8();
        let minted = cur.get_u64();
        let odcid_len = cur.get_u8() as usize;
        if cur.remaining() != odcid_len {
            return Err(());
        }

        let lifetime = match kind {
            KIND_RETRY => RETRY_TOKEN_LIFETIME,
            KIND_NEW_TOKEN => NEW_TOKEN_LIFETIME,
            _ => return Err(()),
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        if now < minted || now - minted > lifetime.as_secs() {
            return Err(());
        }

        if kind == KIND_RETRY {
            let odcid = ConnectionId::new(&cur.chunk()[..odcid_len]).ok_or(())?;
            Ok(Some(odcid))
        } else {
            Ok(None)
        }
    }
}

impl Default for TokenMinter {
    fn default() -> Self {
        Self::new()
    }
}
