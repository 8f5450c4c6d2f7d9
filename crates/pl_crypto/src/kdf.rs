//! HKDF-SHA256 derivations (RFC 5869 extract-then-expand).
//!
//! Three derivation contexts, distinguished by their info strings:
//!   - initial root/chain split from a master secret or exported key,
//!   - per-DH-step root/chain derivation with the previous root key mixed
//!     into the info,
//!   - per-message secrets (cipher key, MAC key, IV) from a chain key.
//!
//! The chain key itself advances with a single HMAC step, not HKDF.
//!
//! The salt is always 32 zero bytes; domain separation comes entirely from
//! the info strings, which are part of the wire contract and must not
//! change.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Info string for the initial root/chain derivation (pre-key master secret
/// and exported-key initiation).
pub const INITIAL_DERIVE_INFO: &[u8] = b"SilentCircleMessage";
/// Info prefix for the per-DH-step root/chain derivation; the current root
/// key is appended before expansion.
pub const RATCHET_DERIVE_INFO: &[u8] = b"SilentCircleRKCKDerive";
/// Info string for per-message secret derivation from a chain key.
pub const MESSAGE_DERIVE_INFO: &[u8] = b"SilentCircleMessageKeyDerive";

pub const SYMMETRIC_KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 16;
/// cipher key ‖ mac key ‖ IV
pub const MESSAGE_SECRETS_LENGTH: usize = 2 * SYMMETRIC_KEY_LENGTH + IV_LENGTH;

/// Per-message secrets derived from one chain-key position. Used exactly
/// once, wiped on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MessageSecrets {
    pub cipher_key: [u8; SYMMETRIC_KEY_LENGTH],
    pub mac_key: [u8; SYMMETRIC_KEY_LENGTH],
    pub iv: [u8; IV_LENGTH],
}

impl MessageSecrets {
    /// Flatten to the 80-byte staging format: cipher key ‖ mac key ‖ IV.
    /// This blob is the content address of a staged message key.
    pub fn to_staged(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_SECRETS_LENGTH);
        out.extend_from_slice(&self.cipher_key);
        out.extend_from_slice(&self.mac_key);
        out.extend_from_slice(&self.iv);
        out
    }

    pub fn from_staged(blob: &[u8]) -> Result<Self, CryptoError> {
        if blob.len() != MESSAGE_SECRETS_LENGTH {
            return Err(CryptoError::RecvDataLength);
        }
        let mut secrets = MessageSecrets {
            cipher_key: [0u8; SYMMETRIC_KEY_LENGTH],
            mac_key: [0u8; SYMMETRIC_KEY_LENGTH],
            iv: [0u8; IV_LENGTH],
        };
        secrets.cipher_key.copy_from_slice(&blob[..32]);
        secrets.mac_key.copy_from_slice(&blob[32..64]);
        secrets.iv.copy_from_slice(&blob[64..]);
        Ok(secrets)
    }
}

/// HKDF-SHA256 with an all-zero 32-byte salt.
fn derive(ikm: &[u8], info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Split a master secret (or exported key) into the initial
/// (root key, chain key) pair.
pub fn derive_root_chain(
    master: &[u8],
) -> Result<([u8; SYMMETRIC_KEY_LENGTH], [u8; SYMMETRIC_KEY_LENGTH]), CryptoError> {
    let mut okm = [0u8; 2 * SYMMETRIC_KEY_LENGTH];
    derive(master, INITIAL_DERIVE_INFO, &mut okm)?;

    let mut root = [0u8; SYMMETRIC_KEY_LENGTH];
    let mut chain = [0u8; SYMMETRIC_KEY_LENGTH];
    root.copy_from_slice(&okm[..SYMMETRIC_KEY_LENGTH]);
    chain.copy_from_slice(&okm[SYMMETRIC_KEY_LENGTH..]);
    okm.zeroize();
    Ok((root, chain))
}

/// DH-ratchet step: derive the next (root key, chain key) pair from a fresh
/// DH output, mixing the current root key into the info.
pub fn ratchet_root_chain(
    root_key: &[u8; SYMMETRIC_KEY_LENGTH],
    dh_output: &[u8; 32],
) -> Result<([u8; SYMMETRIC_KEY_LENGTH], [u8; SYMMETRIC_KEY_LENGTH]), CryptoError> {
    let mut info = Vec::with_capacity(RATCHET_DERIVE_INFO.len() + SYMMETRIC_KEY_LENGTH);
    info.extend_from_slice(RATCHET_DERIVE_INFO);
    info.extend_from_slice(root_key);

    let mut okm = [0u8; 2 * SYMMETRIC_KEY_LENGTH];
    let result = derive(dh_output, &info, &mut okm);
    info.zeroize();
    result?;

    let mut root = [0u8; SYMMETRIC_KEY_LENGTH];
    let mut chain = [0u8; SYMMETRIC_KEY_LENGTH];
    root.copy_from_slice(&okm[..SYMMETRIC_KEY_LENGTH]);
    chain.copy_from_slice(&okm[SYMMETRIC_KEY_LENGTH..]);
    okm.zeroize();
    Ok((root, chain))
}

/// Derive the per-message secrets for the current chain-key position.
pub fn message_secrets(chain_key: &[u8; SYMMETRIC_KEY_LENGTH]) -> Result<MessageSecrets, CryptoError> {
    let mut okm = [0u8; MESSAGE_SECRETS_LENGTH];
    derive(chain_key, MESSAGE_DERIVE_INFO, &mut okm)?;
    let secrets = MessageSecrets::from_staged(&okm)?;
    okm.zeroize();
    Ok(secrets)
}

/// Symmetric-ratchet step: `CK' = HMAC-SHA256(CK, 0x01)`.
pub fn advance_chain(
    chain_key: &[u8; SYMMETRIC_KEY_LENGTH],
) -> Result<[u8; SYMMETRIC_KEY_LENGTH], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x01]);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5869 test case 1 (SHA-256), pinning the extract+expand behaviour
    // including the counter-starts-at-1 expand loop.
    #[test]
    fn hkdf_rfc5869_test_case_1() {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00u8..=0x0c).collect();
        let info: Vec<u8> = (0xf0u8..=0xf9).collect();

        let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut okm = [0u8; 42];
        hk.expand(&info, &mut okm).unwrap();

        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn root_chain_split_is_stable() {
        let master = [0x42u8; 96];
        let (root_a, chain_a) = derive_root_chain(&master).unwrap();
        let (root_b, chain_b) = derive_root_chain(&master).unwrap();
        assert_eq!(root_a, root_b);
        assert_eq!(chain_a, chain_b);
        assert_ne!(root_a, chain_a);
    }

    #[test]
    fn ratchet_derivation_depends_on_root_key() {
        let dh = [0x11u8; 32];
        let (r1, c1) = ratchet_root_chain(&[0xaau8; 32], &dh).unwrap();
        let (r2, c2) = ratchet_root_chain(&[0xabu8; 32], &dh).unwrap();
        assert_ne!(r1, r2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn message_secrets_staged_roundtrip() {
        let ck = [0x5au8; 32];
        let secrets = message_secrets(&ck).unwrap();
        let blob = secrets.to_staged();
        assert_eq!(blob.len(), MESSAGE_SECRETS_LENGTH);

        let reloaded = MessageSecrets::from_staged(&blob).unwrap();
        assert_eq!(reloaded.cipher_key, secrets.cipher_key);
        assert_eq!(reloaded.mac_key, secrets.mac_key);
        assert_eq!(reloaded.iv, secrets.iv);
    }

    #[test]
    fn chain_advance_differs_from_message_secrets() {
        let ck = [0x77u8; 32];
        let next = advance_chain(&ck).unwrap();
        let secrets = message_secrets(&ck).unwrap();
        assert_ne!(next, ck);
        assert_ne!(next, secrets.cipher_key);
    }
}
