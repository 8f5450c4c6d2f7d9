//! SHA-256 utilities: duplicate-suppression hashes over received wire
//! frames, and the 4-byte identity id-hashes carried in message envelopes.

use sha2::{Digest, Sha256};

pub const HASH_LENGTH: usize = 32;
pub const ID_HASH_LENGTH: usize = 4;

pub fn sha256(data: &[u8]) -> [u8; HASH_LENGTH] {
    Sha256::digest(data).into()
}

/// First 4 bytes of SHA-256 over a serialized identity public key. Enough
/// to route "wrong id key" diagnostics, useless to an attacker.
pub fn id_hash(serialized_public: &[u8]) -> [u8; ID_HASH_LENGTH] {
    let full = sha256(serialized_public);
    let mut out = [0u8; ID_HASH_LENGTH];
    out.copy_from_slice(&full[..ID_HASH_LENGTH]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn id_hash_is_prefix_of_full_hash() {
        let data = b"identity-key";
        assert_eq!(id_hash(data), sha256(data)[..4]);
    }
}
