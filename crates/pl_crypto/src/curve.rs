//! X25519 key pairs and DH agreement.
//!
//! Points travel with a leading curve-type byte so the wire format can grow
//! additional curves without re-framing: `serialize_point` emits
//! `[curve tag (1)] [raw scalar (32)]` and `decode_point` rejects tags it
//! does not recognise.
//!
//! Private scalars are clamped per RFC 7748 §5 at generation time and again
//! when reloaded from storage. Clamping is idempotent, so re-running the
//! generator over an already-clamped key is a no-op.

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Tag byte identifying Curve25519 in encoded points.
pub const CURVE_TYPE_25519: u8 = 1;

pub const KEY_LENGTH: usize = 32;
/// Curve-tag byte plus raw scalar.
pub const ENCODED_KEY_LENGTH: usize = KEY_LENGTH + 1;

// ── Public key ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    curve_type: u8,
    raw: [u8; KEY_LENGTH],
}

impl PublicKey {
    pub fn new(raw: [u8; KEY_LENGTH]) -> Self {
        Self { curve_type: CURVE_TYPE_25519, raw }
    }

    pub fn curve_type(&self) -> u8 {
        self.curve_type
    }

    pub fn raw(&self) -> &[u8; KEY_LENGTH] {
        &self.raw
    }

    /// Curve-tag byte followed by the raw scalar (33 bytes).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODED_KEY_LENGTH);
        out.push(self.curve_type);
        out.extend_from_slice(&self.raw);
        out
    }
}

/// Parse an encoded point. The first byte selects the curve; only
/// Curve25519 is recognised.
pub fn decode_point(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    if bytes.len() < ENCODED_KEY_LENGTH {
        return Err(CryptoError::RecvDataLength);
    }
    if bytes[0] != CURVE_TYPE_25519 {
        return Err(CryptoError::NoSuchCurve);
    }
    let mut raw = [0u8; KEY_LENGTH];
    raw.copy_from_slice(&bytes[1..ENCODED_KEY_LENGTH]);
    Ok(PublicKey { curve_type: bytes[0], raw })
}

// ── Private key ──────────────────────────────────────────────────────────────

#[derive(Clone, ZeroizeOnDrop)]
pub struct PrivateKey {
    #[zeroize(skip)]
    curve_type: u8,
    raw: [u8; KEY_LENGTH],
}

impl PrivateKey {
    /// Wrap raw scalar bytes, clamping them per RFC 7748.
    pub fn new(raw: [u8; KEY_LENGTH]) -> Self {
        Self { curve_type: CURVE_TYPE_25519, raw: clamp(raw) }
    }

    pub fn curve_type(&self) -> u8 {
        self.curve_type
    }

    pub fn raw(&self) -> &[u8; KEY_LENGTH] {
        &self.raw
    }
}

/// Re-clamp and wrap a private scalar loaded from storage.
pub fn decode_private_point(bytes: &[u8]) -> Result<PrivateKey, CryptoError> {
    if bytes.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidKey(format!(
            "private key must be {KEY_LENGTH} bytes, got {}",
            bytes.len()
        )));
    }
    let mut raw = [0u8; KEY_LENGTH];
    raw.copy_from_slice(bytes);
    Ok(PrivateKey::new(raw))
}

// ── Key pair ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    private: PrivateKey,
}

impl KeyPair {
    pub fn new(public: PublicKey, private: PrivateKey) -> Self {
        Self { public, private }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn private(&self) -> &PrivateKey {
        &self.private
    }
}

/// Clamp a scalar per RFC 7748 §5: clear the low 3 bits, clear the top bit,
/// set bit 254.
fn clamp(mut bytes: [u8; KEY_LENGTH]) -> [u8; KEY_LENGTH] {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    bytes
}

/// Generate a fresh X25519 key pair: 32 random bytes, clamped, public half
/// via base-point multiplication.
pub fn generate_key_pair() -> KeyPair {
    let mut raw = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut raw);
    let private = PrivateKey::new(raw);
    raw.zeroize();

    let secret = StaticSecret::from(*private.raw());
    let public = PublicKey::new(*X25519Public::from(&secret).as_bytes());
    KeyPair { public, private }
}

/// X25519 scalar multiplication. Fails when the two keys carry different
/// curve tags.
pub fn agreement(public: &PublicKey, private: &PrivateKey) -> Result<[u8; KEY_LENGTH], CryptoError> {
    if public.curve_type() != private.curve_type() {
        return Err(CryptoError::KeyTypeMismatch);
    }
    let secret = StaticSecret::from(*private.raw());
    let shared = secret.diffie_hellman(&X25519Public::from(*public.raw()));
    Ok(*shared.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamping_is_idempotent() {
        let raw = [0xffu8; KEY_LENGTH];
        let once = clamp(raw);
        assert_eq!(once, clamp(once));
        assert_eq!(once[0] & 7, 0);
        assert_eq!(once[31] & 0x80, 0);
        assert_eq!(once[31] & 0x40, 0x40);
    }

    #[test]
    fn generated_private_keys_are_clamped() {
        let pair = generate_key_pair();
        let raw = pair.private().raw();
        assert_eq!(raw[0] & 7, 0);
        assert_eq!(raw[31] & 0x80, 0);
        assert_eq!(raw[31] & 0x40, 0x40);
    }

    #[test]
    fn point_roundtrip() {
        let pair = generate_key_pair();
        let encoded = pair.public().serialize();
        assert_eq!(encoded.len(), ENCODED_KEY_LENGTH);
        assert_eq!(encoded[0], CURVE_TYPE_25519);

        let decoded = decode_point(&encoded).unwrap();
        assert_eq!(&decoded, pair.public());
    }

    #[test]
    fn decode_rejects_unknown_curve() {
        let mut encoded = generate_key_pair().public().serialize();
        encoded[0] = 9;
        assert!(matches!(decode_point(&encoded), Err(CryptoError::NoSuchCurve)));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(
            decode_point(&[CURVE_TYPE_25519; 16]),
            Err(CryptoError::RecvDataLength)
        ));
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = generate_key_pair();
        let b = generate_key_pair();
        let ab = agreement(b.public(), a.private()).unwrap();
        let ba = agreement(a.public(), b.private()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn agreement_rejects_mismatched_curves() {
        let a = generate_key_pair();
        let mut encoded = generate_key_pair().public().serialize();
        encoded[0] = CURVE_TYPE_25519;
        let mut pk = decode_point(&encoded).unwrap();
        pk.curve_type = 7;
        assert!(matches!(
            agreement(&pk, a.private()),
            Err(CryptoError::KeyTypeMismatch)
        ));
    }

    #[test]
    fn reloaded_private_key_agrees() {
        let pair = generate_key_pair();
        let reloaded = decode_private_point(pair.private().raw()).unwrap();
        let peer = generate_key_pair();
        assert_eq!(
            agreement(peer.public(), pair.private()).unwrap(),
            agreement(peer.public(), &reloaded).unwrap()
        );
    }
}
