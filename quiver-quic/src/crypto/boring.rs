//! Cryptographic primitives over BoringSSL: AEAD sealing/opening, header
//! protection masks, and the HKDF key schedule (RFC 9001 Section 5).

use super::Algorithm;
use crate::error::{Error, Result, TransportErrorCode};
use crate::types::{ConnectionId, PacketNumber, Side};
use crate::version;
use boring_sys as ffi;
use std::ptr;

fn crypto_fail(reason: &'static str) -> Error {
    Error::transport(TransportErrorCode::InternalError, reason)
}

impl Algorithm {
    fn evp_aead(self) -> *const ffi::EVP_AEAD {
        unsafe {
            match self {
                Algorithm::Aes128Gcm => ffi::EVP_aead_aes_128_gcm(),
                Algorithm::Aes256Gcm => ffi::EVP_aead_aes_256_gcm(),
                Algorithm::ChaCha20Poly1305 => ffi::EVP_aead_chacha20_poly1305(),
            }
        }
    }

    fn evp_digest(self) -> *const ffi::EVP_MD {
        unsafe {
            match self {
                // The hash matches the TLS cipher suite's.
                Algorithm::Aes128Gcm | Algorithm::ChaCha20Poly1305 => ffi::EVP_sha256(),
                Algorithm::Aes256Gcm => ffi::EVP_sha384(),
            }
        }
    }
}

// ============================================================================
// AEAD (RFC 9001 Section 5.3)
// ============================================================================

/// An initialized AEAD context bound to one traffic key.
pub struct Aead {
    ctx: ffi::EVP_AEAD_CTX,
    alg: Algorithm,
}

// The context is only read after initialization.
unsafe impl Send for Aead {}
unsafe impl Sync for Aead {}

impl Aead {
    pub fn new(alg: Algorithm, key: &[u8]) -> Result<Self> {
        debug_assert_eq!(key.len(), alg.key_len());
        unsafe {
            let mut ctx: ffi::EVP_AEAD_CTX = std::mem::zeroed();
            if ffi::EVP_AEAD_CTX_init(
                &mut ctx,
                alg.evp_aead(),
                key.as_ptr(),
                key.len(),
                ffi::EVP_AEAD_DEFAULT_TAG_LENGTH as usize,
                ptr::null_mut(),
            ) != 1
            {
                return Err(crypto_fail("AEAD init failed"));
            }
            Ok(Self { ctx, alg })
        }
    }

    /// Encrypts `plaintext` for packet number `pn`; the tag is appended.
    pub fn seal(&self, iv: &[u8], pn: PacketNumber, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = make_nonce(iv, pn);
        let mut out = vec![0u8; plaintext.len() + self.alg.tag_len()];
        let mut out_len = 0usize;
        let rc = unsafe {
            ffi::EVP_AEAD_CTX_seal(
                &self.ctx as *const _ as *mut _,
                out.as_mut_ptr(),
                &mut out_len,
                out.len(),
                nonce.as_ptr(),
                nonce.len(),
                plaintext.as_ptr(),
                plaintext.len(),
                ad.as_ptr(),
                ad.len(),
            )
        };
        if rc != 1 {
            return Err(crypto_fail("AEAD seal failed"));
        }
        out.truncate(out_len);
        Ok(out)
    }

    /// Decrypts and authenticates `ciphertext` (tag included) for packet
    /// number `pn`. Failure means the packet is dropped by the caller.
    pub fn open(&self, iv: &[u8], pn: PacketNumber, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < self.alg.tag_len() {
            return Err(crypto_fail("ciphertext shorter than tag"));
        }
        let nonce = make_nonce(iv, pn);
        let mut out = vec![0u8; ciphertext.len() - self.alg.tag_len()];
        let mut out_len = 0usize;
        let rc = unsafe {
            ffi::EVP_AEAD_CTX_open(
                &self.ctx as *const _ as *mut _,
                out.as_mut_ptr(),
                &mut out_len,
                out.len(),
                nonce.as_ptr(),
                nonce.len(),
                ciphertext.as_ptr(),
                ciphertext.len(),
                ad.as_ptr(),
                ad.len(),
            )
        };
        if rc != 1 {
            return Err(crypto_fail("AEAD open failed"));
        }
        out.truncate(out_len);
        Ok(out)
    }
}

impl Drop for Aead {
    fn drop(&mut self) {
        unsafe { ffi::EVP_AEAD_CTX_cleanup(&mut self.ctx) };
    }
}

/// Nonce = IV XOR the packet number left-padded to IV length
/// (RFC 9001 Section 5.3).
fn make_nonce(iv: &[u8], pn: PacketNumber) -> [u8; 12] {
    debug_assert_eq!(iv.len(), 12);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(iv);
    for (n, b) in nonce[4..].iter_mut().zip(pn.to_be_bytes()) {
        *n ^= b;
    }
    nonce
}

// ============================================================================
// Header protection (RFC 9001 Section 5.4)
// ============================================================================

/// Header-protection key. AES suites run the sample through AES-ECB;
/// ChaCha20 suites use the raw ChaCha20 block function with the counter
/// and nonce taken from the sample.
pub enum HeaderKey {
    Aes { key: Vec<u8>, cipher: *const ffi::EVP_CIPHER },
    ChaCha { key: Vec<u8> },
}

unsafe impl Send for HeaderKey {}
unsafe impl Sync for HeaderKey {}

impl HeaderKey {
    pub fn new(alg: Algorithm, hp_key: Vec<u8>) -> Result<Self> {
        debug_assert_eq!(hp_key.len(), alg.key_len());
        match alg {
            Algorithm::Aes128Gcm => Ok(Self::Aes {
                key: hp_key,
                cipher: unsafe { ffi::EVP_aes_128_ecb() },
            }),
            Algorithm::Aes256Gcm => Ok(Self::Aes {
                key: hp_key,
                cipher: unsafe { ffi::EVP_aes_256_ecb() },
            }),
            Algorithm::ChaCha20Poly1305 => Ok(Self::ChaCha { key: hp_key }),
        }
    }

    /// Computes the 5-byte mask from a 16-byte ciphertext sample.
    pub fn mask(&self, sample: &[u8; 16]) -> Result<[u8; 5]> {
        match self {
            Self::Aes { key, cipher } => unsafe {
                let ctx = ffi::EVP_CIPHER_CTX_new();
                if ctx.is_null() {
                    return Err(crypto_fail("cipher ctx alloc failed"));
                }
                struct CtxGuard(*mut ffi::EVP_CIPHER_CTX);
                impl Drop for CtxGuard {
                    fn drop(&mut self) {
                        unsafe { ffi::EVP_CIPHER_CTX_free(self.0) };
                    }
                }
                let guard = CtxGuard(ctx);

                if ffi::EVP_EncryptInit_ex(
                    guard.0,
                    *cipher,
                    ptr::null_mut(),
                    key.as_ptr(),
                    ptr::null(),
                ) != 1
                {
                    return Err(crypto_fail("hp cipher init failed"));
                }
                let mut block = [0u8; 32];
                let mut out_len = 0;
                if ffi::EVP_EncryptUpdate(
                    guard.0,
                    block.as_mut_ptr(),
                    &mut out_len,
                    sample.as_ptr(),
                    sample.len() as i32,
                ) != 1
                {
                    return Err(crypto_fail("hp encrypt failed"));
                }
                let mut mask = [0u8; 5];
                mask.copy_from_slice(&block[..5]);
                Ok(mask)
            },

            Self::ChaCha { key } => {
                let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let mut mask = [0u8; 5];
                unsafe {
                    ffi::CRYPTO_chacha_20(
                        mask.as_mut_ptr(),
                        [0u8; 5].as_ptr(),
                        5,
                        key.as_ptr(),
                        sample[4..].as_ptr(),
                        counter,
                    );
                }
                Ok(mask)
            }
        }
    }
}

// ============================================================================
// HKDF key schedule (RFC 9001 Section 5.1-5.2)
// ============================================================================

pub fn hkdf_extract(alg: Algorithm, salt: &[u8], ikm: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; ffi::EVP_MAX_MD_SIZE as usize];
    let mut out_len = 0usize;
    let rc = unsafe {
        ffi::HKDF_extract(
            out.as_mut_ptr(),
            &mut out_len,
            alg.evp_digest(),
            ikm.as_ptr(),
            ikm.len(),
            salt.as_ptr(),
            salt.len(),
        )
    };
    if rc != 1 {
        return Err(crypto_fail("HKDF-Extract failed"));
    }
    out.truncate(out_len);
    Ok(out)
}

fn hkdf_expand(alg: Algorithm, prk: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    let rc = unsafe {
        ffi::HKDF_expand(
            out.as_mut_ptr(),
            len,
            alg.evp_digest(),
            prk.as_ptr(),
            prk.len(),
            info.as_ptr(),
            info.len(),
        )
    };
    if rc != 1 {
        return Err(crypto_fail("HKDF-Expand failed"));
    }
    Ok(out)
}

/// HKDF-Expand-Label from TLS 1.3 (RFC 8446 Section 7.1) with the
/// implicit "tls13 " prefix.
pub fn hkdf_expand_label(
    alg: Algorithm,
    secret: &[u8],
    label: &str,
    len: usize,
) -> Result<Vec<u8>> {
    let mut info = Vec::with_capacity(10 + label.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label.as_bytes());
    info.push(0); // empty context
    hkdf_expand(alg, secret, &info, len)
}

/// Derives the per-side Initial secrets from the client's first DCID
/// (RFC 9001 Section 5.2). Initial packets always use AES-128-GCM/SHA-256.
pub fn initial_secrets(dcid: &ConnectionId, ver: u32, side: Side) -> Result<(Vec<u8>, Vec<u8>)> {
    let alg = Algorithm::Aes128Gcm;
    let initial = hkdf_extract(alg, version::initial_salt(ver), dcid.as_bytes())?;
    let client = hkdf_expand_label(alg, &initial, "client in", 32)?;
    let server = hkdf_expand_label(alg, &initial, "server in", 32)?;
    Ok(match side {
        Side::Client => (client, server),
        Side::Server => (server, client),
    })
}

// ============================================================================
// Retry integrity (RFC 9001 Section 5.8)
// ============================================================================

/// Computes the Retry integrity tag over the pseudo-packet formed from
/// the client's original DCID and the Retry packet minus its tag.
///
/// `None` if the negotiated version has no pinned Retry constants.
pub fn retry_integrity_tag(
    ver: u32,
    odcid: &ConnectionId,
    retry_without_tag: &[u8],
) -> Option<[u8; 16]> {
    let (key, nonce) = version::retry_integrity_keys(ver)?;

    let mut pseudo = Vec::with_capacity(1 + odcid.len() + retry_without_tag.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid.as_bytes());
    pseudo.extend_from_slice(retry_without_tag);

    let aead = Aead::new(Algorithm::Aes128Gcm, key).ok()?;
    // Fixed nonce, empty plaintext: the tag is the entire output.
    let mut iv = [0u8; 12];
    iv.copy_from_slice(nonce);
    let sealed = aead.seal(&iv, 0, &pseudo, &[]).ok()?;
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&sealed);
    Some(tag)
}
