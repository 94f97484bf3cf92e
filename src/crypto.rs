//! Crypto primitives: X25519, HKDF-SHA256, ChaCha20-Poly1305, CSPRNG.
//!
//! Thin wrappers over the audited RustCrypto / dalek implementations so the
//! session engine deals only in byte arrays and [`NadeError`] kinds.

use crate::error::{NadeError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Long-term X25519 identity: clamped private scalar plus derived public key.
/// Created once per install from a caller-supplied seed; the scalar is wiped
/// from memory on drop.
#[derive(Clone)]
pub struct NadeIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl NadeIdentity {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(clamp_scalar(seed));
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// DH between our static scalar and a peer public key.
    pub(crate) fn diffie_hellman(&self, peer: &[u8; 32]) -> Result<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(NadeError::KeyExchangeFailed);
        }
        Ok(*shared.as_bytes())
    }
}

impl std::fmt::Debug for NadeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NadeIdentity").field("public", &self.public).finish_non_exhaustive()
    }
}

/// RFC 7748 clamping of a raw X25519 scalar.
pub fn clamp_scalar(mut scalar: [u8; 32]) -> [u8; 32] {
    scalar[0] &= 0xF8;
    scalar[31] = (scalar[31] & 0x7F) | 0x40;
    scalar
}

/// Base-point multiplication; `private` must be pre-clamped.
pub fn derive_public(private: &[u8; 32]) -> [u8; 32] {
    *PublicKey::from(&StaticSecret::from(*private)).as_bytes()
}

/// X25519 scalar multiplication; rejects the all-zero shared secret
/// produced by low-order peer points.
pub fn x25519(private: &[u8; 32], peer_public: &[u8; 32]) -> Result<[u8; 32]> {
    let shared = StaticSecret::from(*private).diffie_hellman(&PublicKey::from(*peer_public));
    if !shared.was_contributory() {
        return Err(NadeError::KeyExchangeFailed);
    }
    Ok(*shared.as_bytes())
}

/// RFC 5869 HKDF-SHA256; `len` is bounded at 255 * 32 bytes.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm).map_err(|_| NadeError::KeyExchangeFailed)?;
    Ok(okm)
}

/// ChaCha20-Poly1305 (IETF, 96-bit nonce) seal: returns `ciphertext || tag`.
pub fn aead_seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: ad })
        .map_err(|_| NadeError::BadArgument("plaintext too large"))
}

/// ChaCha20-Poly1305 open; any mismatch in key, nonce, tag or associated
/// data yields `AuthFail`.
pub fn aead_open(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < TAG_LEN {
        return Err(NadeError::AuthFail);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad: ad })
        .map_err(|_| NadeError::AuthFail)
}

/// Fill `out` from the OS CSPRNG.
pub fn random_bytes(out: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(out).map_err(|_| NadeError::EntropyFailure)
}

/// Per-frame nonce: the 64-bit counter is XORed little-endian into the last
/// eight bytes of the 12-byte base.
pub fn compose_nonce(base: &[u8; NONCE_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (i, byte) in counter.to_le_bytes().iter().enumerate() {
        nonce[4 + i] ^= byte;
    }
    nonce
}

/// First 16 bytes of SHA-256, used as the handshake key fingerprint.
pub fn sha256_prefix16(data: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn aead_roundtrip_including_empty() {
        let key = [7u8; 32];
        let nonce = [9u8; 12];
        for plaintext in [&b""[..], b"hello", &[0u8; 300]] {
            let sealed = aead_seal(&key, &nonce, b"ad", plaintext).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);
            let opened = aead_open(&key, &nonce, b"ad", &sealed).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn aead_rejects_any_single_byte_flip() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let sealed = aead_seal(&key, &nonce, &[], b"payload").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert_eq!(aead_open(&key, &nonce, &[], &tampered), Err(NadeError::AuthFail));
        }
        assert_eq!(aead_open(&key, &nonce, &[], &sealed[..8]), Err(NadeError::AuthFail));
    }

    #[test]
    fn aead_binds_nonce_and_ad() {
        let key = [3u8; 32];
        let sealed = aead_seal(&key, &[4u8; 12], b"ad", b"x").unwrap();
        assert!(aead_open(&key, &[5u8; 12], b"ad", &sealed).is_err());
        assert!(aead_open(&key, &[4u8; 12], b"other", &sealed).is_err());
    }

    #[test]
    fn hkdf_is_deterministic_and_sized() {
        let a = hkdf_sha256(b"ikm", b"salt", b"info", 96).unwrap();
        let b = hkdf_sha256(b"ikm", b"salt", b"info", 96).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 96);
        assert_ne!(hkdf_sha256(b"ikm", b"salt", b"other", 96).unwrap(), a);
        assert_eq!(hkdf_sha256(b"x", b"", b"", 8160).unwrap().len(), 8160);
        assert!(hkdf_sha256(b"x", b"", b"", 8161).is_err());
    }

    #[test]
    fn dh_commutes() {
        let a = NadeIdentity::from_seed([0x02; 32]);
        let b = NadeIdentity::from_seed([0x03; 32]);
        let ab = a.diffie_hellman(&b.public_key()).unwrap();
        let ba = b.diffie_hellman(&a.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn low_order_peer_is_rejected() {
        let a = NadeIdentity::from_seed([0x02; 32]);
        assert_eq!(a.diffie_hellman(&[0u8; 32]), Err(NadeError::KeyExchangeFailed));
    }

    #[test]
    fn identity_matches_raw_derivation() {
        let seed = [0x01u8; 32];
        let identity = NadeIdentity::from_seed(seed);
        assert_eq!(identity.public_key(), derive_public(&clamp_scalar(seed)));
    }

    #[test]
    fn clamping_pins_the_required_bits() {
        let clamped = clamp_scalar([0xFF; 32]);
        assert_eq!(clamped[0] & 0x07, 0);
        assert_eq!(clamped[31] & 0x80, 0);
        assert_eq!(clamped[31] & 0x40, 0x40);
    }

    #[test]
    fn nonce_composition_xors_low_eight_bytes() {
        let base = [0xAAu8; 12];
        let nonce = compose_nonce(&base, 1);
        assert_eq!(&nonce[..4], &base[..4]);
        assert_eq!(nonce[4], 0xAA ^ 0x01);
        assert_eq!(&nonce[5..], &base[5..]);
        assert_eq!(compose_nonce(&base, 0), base);
    }
}
