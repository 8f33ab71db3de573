//! Packet-protection keys across encryption levels (RFC 9001).
//!
//! Each installed level gets a pair of "coders": a [`Sealer`] for the
//! send direction and an [`Opener`] for the receive direction, each
//! bundling the AEAD context, IV, and header-protection key derived from
//! that direction's traffic secret. The 1-RTT level keeps a second
//! generation of coders live to implement key update.

pub mod boring;

use crate::error::{Error, Result, TransportErrorCode};
use crate::packet::header::PacketType;
use crate::types::{ConnectionId, PacketNumber, Side};
use std::time::{Duration, Instant};

/// Encryption levels in handshake order (RFC 9001 Section 2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Initial,
    /// Recognized on the wire for level ordering and packet typing;
    /// this endpoint never installs keys for it (no resumption).
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl Level {
    pub const COUNT: usize = 4;

    pub const ALL: [Level; 4] =
        [Level::Initial, Level::ZeroRtt, Level::Handshake, Level::OneRtt];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The level a packet type's payload is protected at.
    pub fn from_packet_type(ty: PacketType) -> Option<Level> {
        match ty {
            PacketType::Initial => Some(Level::Initial),
            PacketType::ZeroRtt => Some(Level::ZeroRtt),
            PacketType::Handshake => Some(Level::Handshake),
            PacketType::OneRtt => Some(Level::OneRtt),
            PacketType::Retry | PacketType::VersionNegotiation => None,
        }
    }

    /// The packet type that carries this level.
    pub fn packet_type(self) -> PacketType {
        match self {
            Level::Initial => PacketType::Initial,
            Level::ZeroRtt => PacketType::ZeroRtt,
            Level::Handshake => PacketType::Handshake,
            Level::OneRtt => PacketType::OneRtt,
        }
    }

    /// Loss recovery shares one packet-number space between 0-RTT and
    /// 1-RTT (RFC 9002 Section 4; both are "application data").
    pub fn pn_space(self) -> usize {
        match self {
            Level::Initial => 0,
            Level::Handshake => 1,
            Level::ZeroRtt | Level::OneRtt => 2,
        }
    }
}

/// AEAD algorithm negotiated by the TLS cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Algorithm {
    /// Maps a TLS 1.3 cipher-suite id (RFC 8446 Appendix B.4).
    pub fn from_cipher_suite(suite: u16) -> Option<Algorithm> {
        match suite {
            0x1301 => Some(Algorithm::Aes128Gcm),
            0x1302 => Some(Algorithm::Aes256Gcm),
            0x1303 => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub const fn key_len(self) -> usize {
        match self {
            Algorithm::Aes128Gcm => 16,
            Algorithm::Aes256Gcm => 32,
            Algorithm::ChaCha20Poly1305 => 32,
        }
    }

    pub const fn iv_len(self) -> usize {
        12
    }

    pub const fn tag_len(self) -> usize {
        16
    }
}

/// Send-direction coder: encrypt + protect.
pub struct Sealer {
    alg: Algorithm,
    secret: Vec<u8>,
    aead: boring::Aead,
    iv: Vec<u8>,
    hp: boring::HeaderKey,
}

impl Sealer {
    pub fn from_secret(alg: Algorithm, secret: &[u8]) -> Result<Self> {
        let (aead, iv, hp) = derive_keys(alg, secret)?;
        Ok(Self { alg, secret: secret.to_vec(), aead, iv, hp })
    }

    pub fn seal(&self, pn: PacketNumber, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.aead.seal(&self.iv, pn, ad, plaintext)
    }

    pub fn mask(&self, sample: &[u8; 16]) -> Result<[u8; 5]> {
        self.hp.mask(sample)
    }

    pub fn tag_len(&self) -> usize {
        self.alg.tag_len()
    }

    /// Next key-update generation. The header-protection key does not
    /// rotate (RFC 9001 Section 6).
    fn next_generation(&self) -> Result<Sealer> {
        let next = boring::hkdf_expand_label(self.alg, &self.secret, "quic ku", self.secret.len())?;
        let (aead, iv, _) = derive_keys(self.alg, &next)?;
        let hp = rebuild_hp(self.alg, &self.secret)?;
        Ok(Sealer { alg: self.alg, secret: next, aead, iv, hp })
    }
}

/// Receive-direction coder: unprotect + decrypt.
pub struct Opener {
    alg: Algorithm,
    secret: Vec<u8>,
    aead: boring::Aead,
    iv: Vec<u8>,
    hp: boring::HeaderKey,
}

impl Opener {
    pub fn from_secret(alg: Algorithm, secret: &[u8]) -> Result<Self> {
        let (aead, iv, hp) = derive_keys(alg, secret)?;
        Ok(Self { alg, secret: secret.to_vec(), aead, iv, hp })
    }

    pub fn open(&self, pn: PacketNumber, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.aead.open(&self.iv, pn, ad, ciphertext)
    }

    pub fn mask(&self, sample: &[u8; 16]) -> Result<[u8; 5]> {
        self.hp.mask(sample)
    }

    pub fn tag_len(&self) -> usize {
        self.alg.tag_len()
    }

    fn next_generation(&self) -> Result<Opener> {
        let next = boring::hkdf_expand_label(self.alg, &self.secret, "quic ku", self.secret.len())?;
        let (aead, iv, _) = derive_keys(self.alg, &next)?;
        let hp = rebuild_hp(self.alg, &self.secret)?;
        Ok(Opener { alg: self.alg, secret: next, aead, iv, hp })
    }
}

fn derive_keys(alg: Algorithm, secret: &[u8]) -> Result<(boring::Aead, Vec<u8>, boring::HeaderKey)> {
    let key = boring::hkdf_expand_label(alg, secret, "quic key", alg.key_len())?;
    let iv = boring::hkdf_expand_label(alg, secret, "quic iv", alg.iv_len())?;
    let hp_key = boring::hkdf_expand_label(alg, secret, "quic hp", alg.key_len())?;
    Ok((boring::Aead::new(alg, &key)?, iv, boring::HeaderKey::new(alg, hp_key)?))
}

fn rebuild_hp(alg: Algorithm, secret: &[u8]) -> Result<boring::HeaderKey> {
    let hp_key = boring::hkdf_expand_label(alg, secret, "quic hp", alg.key_len())?;
    boring::HeaderKey::new(alg, hp_key)
}

/// Both directions of one level.
pub struct LevelKeys {
    pub seal: Sealer,
    pub open: Opener,
}

impl LevelKeys {
    pub fn from_secrets(alg: Algorithm, tx_secret: &[u8], rx_secret: &[u8]) -> Result<Self> {
        Ok(Self {
            seal: Sealer::from_secret(alg, tx_secret)?,
            open: Opener::from_secret(alg, rx_secret)?,
        })
    }

    /// Initial keys for a fresh or retried connection.
    pub fn initial(dcid: &ConnectionId, version: u32, side: Side) -> Result<Self> {
        let (tx, rx) = boring::initial_secrets(dcid, version, side)?;
        Self::from_secrets(Algorithm::Aes128Gcm, &tx, &rx)
    }
}

/// Outcome of opening a 1-RTT payload, reported so the connection can
/// schedule the key-update commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneRttOpened {
    Current,
    /// Verified under the next-generation keys: the peer updated.
    Updated,
}

/// One level's coders. Directions install independently because the TLS
/// stack yields read and write secrets separately.
#[derive(Default)]
struct DirectionalKeys {
    seal: Option<Sealer>,
    open: Option<Opener>,
}

/// Key state for one connection across all levels.
pub struct CryptoContext {
    keys: [DirectionalKeys; Level::COUNT],

    /// Current 1-RTT key phase bit.
    key_phase: bool,

    /// Pre-derived next-generation 1-RTT coders.
    next_open: Option<Opener>,
    next_seal: Option<Sealer>,

    /// Previous-generation opener, kept for reordered packets until the
    /// update settles.
    prev_open: Option<Opener>,

    /// When the in-progress update commits for the send direction: the
    /// first packet sealed at or after this instant flips the phase.
    tx_switch_at: Option<Instant>,

    /// When the last completed update happened; refuses another update
    /// inside one PTO of it.
    last_update: Option<Instant>,

    handshake_confirmed: bool,
}

impl CryptoContext {
    pub fn new() -> Self {
        Self {
            keys: Default::default(),
            key_phase: false,
            next_open: None,
            next_seal: None,
            prev_open: None,
            tx_switch_at: None,
            last_update: None,
            handshake_confirmed: false,
        }
    }

    /// Installs both directions at once; used for Initial keys.
    pub fn install(&mut self, level: Level, keys: LevelKeys) {
        self.install_seal(level, keys.seal);
        self.install_open(level, keys.open);
    }

    pub fn install_seal(&mut self, level: Level, seal: Sealer) {
        tracing::debug!(?level, "installing send keys");
        if level == Level::OneRtt {
            // Derive the next generation eagerly so a peer-initiated
            // update can be verified without stalling the receive path.
            self.next_seal = seal.next_generation().ok();
        }
        self.keys[level.index()].seal = Some(seal);
    }

    pub fn install_open(&mut self, level: Level, open: Opener) {
        tracing::debug!(?level, "installing receive keys");
        if level == Level::OneRtt {
            self.next_open = open.next_generation().ok();
        }
        self.keys[level.index()].open = Some(open);
    }

    pub fn discard(&mut self, level: Level) {
        tracing::debug!(?level, "discarding packet protection keys");
        self.keys[level.index()] = DirectionalKeys::default();
    }

    /// Whether incoming packets at `level` can be decrypted yet.
    pub fn has_open_keys(&self, level: Level) -> bool {
        self.keys[level.index()].open.is_some()
    }

    /// Whether outgoing packets at `level` can be sealed yet.
    pub fn has_seal_keys(&self, level: Level) -> bool {
        self.keys[level.index()].seal.is_some()
    }

    pub fn confirm_handshake(&mut self) {
        self.handshake_confirmed = true;
    }

    pub fn is_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    /// The sealer for an outgoing packet, with the key phase to put in
    /// the short header. Commits a pending update once `now` passes the
    /// scheduled switch point.
    pub fn sealer(&mut self, level: Level, now: Instant) -> Result<(&Sealer, bool)> {
        if level == Level::OneRtt {
            if let Some(at) = self.tx_switch_at {
                if now >= at {
                    self.commit_update(now)?;
                }
            }
        }
        let seal = self.keys[level.index()]
            .seal
            .as_ref()
            .ok_or(Error::Internal("sealing without keys installed"))?;
        Ok((seal, self.key_phase))
    }

    pub fn opener(&self, level: Level) -> Result<&Opener> {
        self.keys[level.index()]
            .open
            .as_ref()
            .ok_or(Error::Internal("opening without keys installed"))
    }

    /// Opens a 1-RTT payload honoring the key-phase bit (RFC 9001
    /// Section 6.3). `pto` schedules the send-direction commit when the
    /// peer initiated an update.
    pub fn open_1rtt(
        &mut self,
        pn: PacketNumber,
        ad: &[u8],
        ciphertext: &[u8],
        key_phase: bool,
        now: Instant,
        pto: Duration,
    ) -> Result<(Vec<u8>, OneRttOpened)> {
        if key_phase == self.key_phase {
            // Phase matches: current keys, or a straggler from before the
            // last update.
            let current = self.opener(Level::OneRtt)?;
            match current.open(pn, ad, ciphertext) {
                Ok(plain) => return Ok((plain, OneRttOpened::Current)),
                Err(e) => {
                    if let Some(prev) = &self.prev_open {
                        if let Ok(plain) = prev.open(pn, ad, ciphertext) {
                            return Ok((plain, OneRttOpened::Current));
                        }
                    }
                    return Err(e);
                }
            }
        }

        // Flipped phase: either a straggler from the generation before
        // the last commit, or the peer moving to the next generation.
        if let Some(prev) = &self.prev_open {
            if let Ok(plain) = prev.open(pn, ad, ciphertext) {
                return Ok((plain, OneRttOpened::Current));
            }
        }
        if !self.handshake_confirmed {
            return Err(Error::transport(
                TransportErrorCode::KeyUpdateError,
                "key update before handshake confirmation",
            ));
        }
        let next = self
            .next_open
            .as_ref()
            .ok_or(Error::Internal("next-generation keys missing"))?;
        let plain = next.open(pn, ad, ciphertext)?;

        if self.tx_switch_at.is_none() {
            // Peer-initiated update verified; commit our send direction
            // after a PTO so in-flight packets are not orphaned.
            self.tx_switch_at = Some(now + pto);
        }
        Ok((plain, OneRttOpened::Updated))
    }

    /// Locally initiates a key update (RFC 9001 Section 6.1).
    pub fn initiate_key_update(&mut self, now: Instant, pto: Duration) -> Result<()> {
        if !self.handshake_confirmed {
            return Err(Error::transport(
                TransportErrorCode::KeyUpdateError,
                "key update before handshake confirmation",
            ));
        }
        if let Some(last) = self.last_update {
            if now < last + pto {
                return Err(Error::transport(
                    TransportErrorCode::KeyUpdateError,
                    "key update within PTO of previous update",
                ));
            }
        }
        if self.tx_switch_at.is_some() {
            return Err(Error::transport(
                TransportErrorCode::KeyUpdateError,
                "key update already in progress",
            ));
        }
        self.tx_switch_at = Some(now);
        Ok(())
    }

    fn commit_update(&mut self, now: Instant) -> Result<()> {
        let next_open = self
            .next_open
            .take()
            .ok_or(Error::Internal("committing update without next keys"))?;
        let next_seal = self
            .next_seal
            .take()
            .ok_or(Error::Internal("committing update without next keys"))?;

        let slot = &mut self.keys[Level::OneRtt.index()];
        self.prev_open = slot.open.take();
        self.next_open = next_open.next_generation().ok();
        self.next_seal = next_seal.next_generation().ok();
        slot.seal = Some(next_seal);
        slot.open = Some(next_open);

        self.key_phase = !self.key_phase;
        self.tx_switch_at = None;
        self.last_update = Some(now);
        tracing::debug!(key_phase = self.key_phase, "1-RTT key update committed");
        Ok(())
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair() -> (CryptoContext, CryptoContext) {
        // Symmetric fake secrets: what one seals with, the other opens.
        let a_tx = vec![0x11u8; 32];
        let b_tx = vec![0x22u8; 32];
        let alg = Algorithm::Aes128Gcm;

        let mut a = CryptoContext::new();
        let mut b = CryptoContext::new();
        a.install(Level::OneRtt, LevelKeys::from_secrets(alg, &a_tx, &b_tx).unwrap());
        b.install(Level::OneRtt, LevelKeys::from_secrets(alg, &b_tx, &a_tx).unwrap());
        a.confirm_handshake();
        b.confirm_handshake();
        (a, b)
    }

    #[test]
    fn level_ordering() {
        assert!(Level::Initial < Level::ZeroRtt);
        assert!(Level::ZeroRtt < Level::Handshake);
        assert!(Level::Handshake < Level::OneRtt);
        assert_eq!(Level::ZeroRtt.pn_space(), Level::OneRtt.pn_space());
    }

    #[test]
    fn seal_open_between_peers() {
        let (mut a, mut b) = handshake_pair();
        let now = Instant::now();
        let (sealer, phase) = a.sealer(Level::OneRtt, now).unwrap();
        assert!(!phase);
        let sealed = sealer.seal(9, b"hdr", b"data").unwrap();
        let (plain, how) = b
            .open_1rtt(9, b"hdr", &sealed, phase, now, Duration::from_millis(100))
            .unwrap();
        assert_eq!(plain, b"data");
        assert_eq!(how, OneRttOpened::Current);
    }

    #[test]
    fn key_update_roundtrip() {
        let (mut a, mut b) = handshake_pair();
        let t0 = Instant::now();
        let pto = Duration::from_millis(50);

        // A initiates an update: its next outgoing packet flips phase.
        a.initiate_key_update(t0, pto).unwrap();
        let sealed = {
            let (sealer, phase) = a.sealer(Level::OneRtt, t0).unwrap();
            assert!(phase, "phase flips after commit");
            sealer.seal(1, b"h", b"updated").unwrap()
        };

        // B sees the flipped bit and decrypts under next keys.
        let (plain, how) = b.open_1rtt(1, b"h", &sealed, true, t0, pto).unwrap();
        assert_eq!(plain, b"updated");
        assert_eq!(how, OneRttOpened::Updated);

        // B's send direction commits after its PTO passes.
        let t1 = t0 + pto + Duration::from_millis(1);
        let reply = {
            let (sealer, phase) = b.sealer(Level::OneRtt, t1).unwrap();
            assert!(phase);
            sealer.seal(2, b"h", b"reply").unwrap()
        };
        let (plain, how) = a.open_1rtt(2, b"h", &reply, true, t1, pto).unwrap();
        assert_eq!(plain, b"reply");
        assert_eq!(how, OneRttOpened::Current);
    }

    #[test]
    fn update_rejected_before_confirmation() {
        let alg = Algorithm::Aes128Gcm;
        let mut ctx = CryptoContext::new();
        ctx.install(
            Level::OneRtt,
            LevelKeys::from_secrets(alg, &[1u8; 32], &[2u8; 32]).unwrap(),
        );
        let err = ctx
            .initiate_key_update(Instant::now(), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport { code: TransportErrorCode::KeyUpdateError, .. }
        ));
    }

    #[test]
    fn rekey_within_pto_rejected() {
        let (mut a, _) = handshake_pair();
        let t0 = Instant::now();
        let pto = Duration::from_secs(1);
        a.initiate_key_update(t0, pto).unwrap();
        // Commit happens on the next seal.
        let _ = a.sealer(Level::OneRtt, t0).unwrap();
        assert!(a.initiate_key_update(t0 + Duration::from_millis(1), pto).is_err());
        assert!(a.initiate_key_update(t0 + pto + Duration::from_millis(1), pto).is_ok());
    }
}
