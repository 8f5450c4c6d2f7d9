//! One-shot X25519 pre-key records.
//!
//! Pre-keys are published in advance so a peer can initiate a session
//! without a round trip. Ids are random 31-bit positive values (zero is
//! reserved for "no pre-key"); the store re-draws on collision. The durable
//! payload is a small JSON object holding both key halves, base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::curve::{decode_point, decode_private_point, generate_key_pair, KeyPair};
use crate::error::CryptoError;

/// Batch size for initial provisioning and refills.
pub const NUM_PRE_KEYS: usize = 100;
/// Refill once the store drops below this many unused pre-keys.
pub const MIN_NUM_PRE_KEYS: usize = 30;

pub struct PreKey {
    pub id: u32,
    pub pair: KeyPair,
}

#[derive(Serialize, Deserialize)]
struct PreKeyRepr {
    private: String,
    public: String,
}

impl PreKey {
    /// Generate a pre-key under the given id. Drawing the id is the store's
    /// job, since only it can check for collisions.
    pub fn generate(id: u32) -> Self {
        Self { id, pair: generate_key_pair() }
    }

    /// Durable JSON form: `{"private": b64, "public": b64}`.
    pub fn to_json(&self) -> Result<String, CryptoError> {
        let repr = PreKeyRepr {
            private: STANDARD.encode(self.pair.private().raw()),
            public: STANDARD.encode(self.pair.public().serialize()),
        };
        Ok(serde_json::to_string(&repr)?)
    }

    pub fn from_json(id: u32, data: &str) -> Result<Self, CryptoError> {
        let repr: PreKeyRepr = serde_json::from_str(data)?;
        let public = decode_point(&STANDARD.decode(repr.public)?)?;
        let private = decode_private_point(&STANDARD.decode(repr.private)?)?;
        Ok(Self { id, pair: KeyPair::new(public, private) })
    }
}

/// Draw a random 31-bit pre-key id, rejecting zero. `exists` lets the
/// caller screen out ids already present in its store.
pub fn random_prekey_id(exists: impl Fn(u32) -> bool) -> u32 {
    loop {
        let id = OsRng.next_u32() & 0x7fff_ffff;
        if id != 0 && !exists(id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_positive_31_bit() {
        for _ in 0..32 {
            let id = random_prekey_id(|_| false);
            assert!(id > 0);
            assert_eq!(id & 0x8000_0000, 0);
        }
    }

    #[test]
    fn id_collisions_are_redrawn() {
        let taken = random_prekey_id(|_| false);
        let id = random_prekey_id(|candidate| candidate == taken);
        assert_ne!(id, taken);
    }

    #[test]
    fn json_roundtrip_preserves_both_halves() {
        let prekey = PreKey::generate(4711);
        let json = prekey.to_json().unwrap();
        let restored = PreKey::from_json(4711, &json).unwrap();

        assert_eq!(restored.id, 4711);
        assert_eq!(restored.pair.public(), prekey.pair.public());
        assert_eq!(restored.pair.private().raw(), prekey.pair.private().raw());
    }

    #[test]
    fn rejects_garbage_payload() {
        assert!(PreKey::from_json(1, "not json").is_err());
        assert!(PreKey::from_json(1, r#"{"private": "AA", "public": "AA"}"#).is_err());
    }
}
