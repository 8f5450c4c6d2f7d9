//! Per-(local user, peer, peer device) ratchet conversation state.
//!
//! A distinguished "local" conversation — peer equals the local user and the
//! device id is empty — holds the long-term identity key pair. All other
//! conversations hold the live ratchet variables for one peer device.
//!
//! The state serializes to a JSON blob for the persistent store. Secret
//! fields are wiped before drop, and any previous value is wiped before a
//! secret slot is overwritten.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::curve::{KeyPair, PublicKey};
use crate::error::CryptoError;
use crate::hash::{id_hash, ID_HASH_LENGTH};
use crate::kdf::SYMMETRIC_KEY_LENGTH;

type Secret = [u8; SYMMETRIC_KEY_LENGTH];

/// Session state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No root key; the conversation exists as an identity record only.
    Fresh,
    /// Initiator right after pre-key setup: receive chain only, first send
    /// pending a DH ratchet.
    AliceInit,
    /// Responder right after pre-key consumption: send chain only.
    BobInit,
    /// Both chains active.
    Established,
}

#[derive(Serialize, Deserialize)]
pub struct Conversation {
    local_user: String,
    partner: String,
    device_id: String,
    #[serde(default)]
    partner_alias: String,

    /// Local long-term identity key pair.
    #[serde(with = "key_serde::option_pair")]
    identity_pair: Option<KeyPair>,
    /// Peer long-term identity public key.
    #[serde(with = "key_serde::option_public")]
    peer_identity: Option<PublicKey>,
    /// Local ratchet key pair (current send chain).
    #[serde(with = "key_serde::option_pair")]
    ratchet_pair: Option<KeyPair>,
    /// Peer ratchet public key (current receive chain).
    #[serde(with = "key_serde::option_public")]
    peer_ratchet_key: Option<PublicKey>,
    /// Pending pre-key (initiator role only, cleared after the first send).
    #[serde(with = "key_serde::option_pair")]
    pending_prekey: Option<KeyPair>,

    #[serde(with = "key_serde::option_secret")]
    root_key: Option<Secret>,
    #[serde(with = "key_serde::option_secret")]
    send_chain: Option<Secret>,
    #[serde(with = "key_serde::option_secret")]
    recv_chain: Option<Secret>,

    /// Next send index in the current sending chain.
    send_n: u32,
    /// Next expected receive index in the current receiving chain.
    recv_n: u32,
    /// Length of the previous sending chain, emitted in every header.
    prev_send_n: u32,

    /// The next send must first perform a DH ratchet step.
    ratchet_flag: bool,
    /// Peer pre-key id used at initiation (initiator role, kept for retry).
    prekey_id: u32,
    /// Upper 16 bits random per setup, lower 16 bits count re-initiations.
    context_id: u32,

    /// Peer identity differs from the previously seen one.
    identity_key_changed: bool,
    /// Out-of-band (voice channel) verification state.
    verify_state: i32,

    #[serde(skip)]
    error_code: i32,
    #[serde(skip)]
    sql_error_code: i32,
}

impl Conversation {
    pub fn new(local_user: &str, partner: &str, device_id: &str) -> Self {
        Self {
            local_user: local_user.to_string(),
            partner: partner.to_string(),
            device_id: device_id.to_string(),
            partner_alias: String::new(),
            identity_pair: None,
            peer_identity: None,
            ratchet_pair: None,
            peer_ratchet_key: None,
            pending_prekey: None,
            root_key: None,
            send_chain: None,
            recv_chain: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            ratchet_flag: false,
            prekey_id: 0,
            context_id: 0,
            identity_key_changed: false,
            verify_state: 0,
            error_code: 0,
            sql_error_code: 0,
        }
    }

    /// The distinguished conversation that carries the local identity pair.
    pub fn local(local_user: &str) -> Self {
        Self::new(local_user, local_user, "")
    }

    pub fn is_local(&self) -> bool {
        self.partner == self.local_user && self.device_id.is_empty()
    }

    // ── Identity ─────────────────────────────────────────────────────────

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn partner(&self) -> &str {
        &self.partner
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn partner_alias(&self) -> &str {
        &self.partner_alias
    }

    pub fn set_partner_alias(&mut self, alias: &str) {
        self.partner_alias = alias.to_string();
    }

    // ── Key material ─────────────────────────────────────────────────────

    pub fn identity_pair(&self) -> Option<&KeyPair> {
        self.identity_pair.as_ref()
    }

    pub fn set_identity_pair(&mut self, pair: Option<KeyPair>) {
        self.identity_pair = pair;
    }

    pub fn peer_identity(&self) -> Option<&PublicKey> {
        self.peer_identity.as_ref()
    }

    pub fn set_peer_identity(&mut self, key: Option<PublicKey>) {
        self.peer_identity = key;
    }

    pub fn ratchet_pair(&self) -> Option<&KeyPair> {
        self.ratchet_pair.as_ref()
    }

    pub fn set_ratchet_pair(&mut self, pair: Option<KeyPair>) {
        self.ratchet_pair = pair;
    }

    pub fn peer_ratchet_key(&self) -> Option<&PublicKey> {
        self.peer_ratchet_key.as_ref()
    }

    pub fn set_peer_ratchet_key(&mut self, key: Option<PublicKey>) {
        self.peer_ratchet_key = key;
    }

    pub fn pending_prekey(&self) -> Option<&KeyPair> {
        self.pending_prekey.as_ref()
    }

    pub fn set_pending_prekey(&mut self, pair: Option<KeyPair>) {
        self.pending_prekey = pair;
    }

    pub fn root_key(&self) -> Option<&Secret> {
        self.root_key.as_ref()
    }

    pub fn set_root_key(&mut self, value: Option<Secret>) {
        wipe_slot(&mut self.root_key);
        self.root_key = value;
    }

    pub fn send_chain(&self) -> Option<&Secret> {
        self.send_chain.as_ref()
    }

    pub fn set_send_chain(&mut self, value: Option<Secret>) {
        wipe_slot(&mut self.send_chain);
        self.send_chain = value;
    }

    pub fn recv_chain(&self) -> Option<&Secret> {
        self.recv_chain.as_ref()
    }

    pub fn set_recv_chain(&mut self, value: Option<Secret>) {
        wipe_slot(&mut self.recv_chain);
        self.recv_chain = value;
    }

    // ── Counters and flags ───────────────────────────────────────────────

    pub fn send_n(&self) -> u32 {
        self.send_n
    }

    pub fn set_send_n(&mut self, n: u32) {
        self.send_n = n;
    }

    pub fn recv_n(&self) -> u32 {
        self.recv_n
    }

    pub fn set_recv_n(&mut self, n: u32) {
        self.recv_n = n;
    }

    pub fn prev_send_n(&self) -> u32 {
        self.prev_send_n
    }

    pub fn set_prev_send_n(&mut self, n: u32) {
        self.prev_send_n = n;
    }

    pub fn ratchet_flag(&self) -> bool {
        self.ratchet_flag
    }

    pub fn set_ratchet_flag(&mut self, flag: bool) {
        self.ratchet_flag = flag;
    }

    pub fn prekey_id(&self) -> u32 {
        self.prekey_id
    }

    pub fn set_prekey_id(&mut self, id: u32) {
        self.prekey_id = id;
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn set_context_id(&mut self, id: u32) {
        self.context_id = id;
    }

    pub fn identity_key_changed(&self) -> bool {
        self.identity_key_changed
    }

    pub fn set_identity_key_changed(&mut self, changed: bool) {
        self.identity_key_changed = changed;
    }

    pub fn verify_state(&self) -> i32 {
        self.verify_state
    }

    pub fn set_verify_state(&mut self, state: i32) {
        self.verify_state = state;
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn set_error_code(&mut self, code: i32) {
        self.error_code = code;
    }

    pub fn sql_error_code(&self) -> i32 {
        self.sql_error_code
    }

    pub fn set_sql_error_code(&mut self, code: i32) {
        self.sql_error_code = code;
    }

    // ── Derived views ────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        if self.root_key.is_none() {
            return SessionState::Fresh;
        }
        match (self.send_chain.is_some(), self.recv_chain.is_some()) {
            (true, true) => SessionState::Established,
            (false, true) => SessionState::AliceInit,
            (true, false) => SessionState::BobInit,
            (false, false) => SessionState::Fresh,
        }
    }

    /// (receiver id-hash, sender id-hash) for the message envelope: the
    /// first 4 bytes of SHA-256 over each serialized identity public key.
    pub fn id_hashes(&self) -> Option<([u8; ID_HASH_LENGTH], [u8; ID_HASH_LENGTH])> {
        let peer = self.peer_identity.as_ref()?;
        let own = self.identity_pair.as_ref()?;
        Some((
            id_hash(&peer.serialize()),
            id_hash(&own.public().serialize()),
        ))
    }

    /// Wipe all key material and chain state. The conversation row itself —
    /// identity triple, context id, verification flags — survives; the
    /// initiation code re-installs keys afterwards.
    pub fn reset(&mut self) {
        self.identity_pair = None;
        self.peer_identity = None;
        self.ratchet_pair = None;
        self.peer_ratchet_key = None;
        self.pending_prekey = None;
        self.set_root_key(None);
        self.set_send_chain(None);
        self.set_recv_chain(None);
        self.send_n = 0;
        self.recv_n = 0;
        self.prev_send_n = 0;
        self.ratchet_flag = false;
        self.prekey_id = 0;
    }

    // ── Durable form ─────────────────────────────────────────────────────

    pub fn serialize(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(data: &str) -> Result<Self, CryptoError> {
        Ok(serde_json::from_str(data)?)
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        wipe_slot(&mut self.root_key);
        wipe_slot(&mut self.send_chain);
        wipe_slot(&mut self.recv_chain);
        // Key pairs wipe their private halves on drop.
    }
}

fn wipe_slot(slot: &mut Option<Secret>) {
    if let Some(mut value) = slot.take() {
        value.zeroize();
    }
}

// ── Serde helpers for key material ───────────────────────────────────────────

mod key_serde {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::curve::{decode_point, decode_private_point, KeyPair, PublicKey};

    pub mod option_public {
        use super::*;

        pub fn serialize<S>(key: &Option<PublicKey>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            key.as_ref()
                .map(|k| STANDARD.encode(k.serialize()))
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PublicKey>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt: Option<String> = Option::deserialize(deserializer)?;
            opt.map(|s| {
                let bytes = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
                decode_point(&bytes).map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }

    pub mod option_secret {
        use super::*;

        pub fn serialize<S>(key: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            key.as_ref().map(|k| STANDARD.encode(k)).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt: Option<String> = Option::deserialize(deserializer)?;
            opt.map(|s| {
                let bytes = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
            })
            .transpose()
        }
    }

    pub mod option_pair {
        use super::*;

        #[derive(Serialize, Deserialize)]
        struct PairRepr {
            public: String,
            private: String,
        }

        pub fn serialize<S>(pair: &Option<KeyPair>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            pair.as_ref()
                .map(|p| PairRepr {
                    public: STANDARD.encode(p.public().serialize()),
                    private: STANDARD.encode(p.private().raw()),
                })
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<KeyPair>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt: Option<PairRepr> = Option::deserialize(deserializer)?;
            opt.map(|repr| {
                let public_bytes =
                    STANDARD.decode(repr.public).map_err(serde::de::Error::custom)?;
                let private_bytes =
                    STANDARD.decode(repr.private).map_err(serde::de::Error::custom)?;
                let public = decode_point(&public_bytes).map_err(serde::de::Error::custom)?;
                let private =
                    decode_private_point(&private_bytes).map_err(serde::de::Error::custom)?;
                Ok(KeyPair::new(public, private))
            })
            .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::generate_key_pair;

    fn sample() -> Conversation {
        let mut conv = Conversation::new("alice", "bob", "dev-1");
        conv.set_identity_pair(Some(generate_key_pair()));
        conv.set_peer_identity(Some(generate_key_pair().public().clone()));
        conv.set_ratchet_pair(Some(generate_key_pair()));
        conv.set_peer_ratchet_key(Some(generate_key_pair().public().clone()));
        conv.set_root_key(Some([0x01; 32]));
        conv.set_send_chain(Some([0x02; 32]));
        conv.set_recv_chain(Some([0x03; 32]));
        conv.set_send_n(7);
        conv.set_recv_n(4);
        conv.set_prev_send_n(3);
        conv.set_ratchet_flag(true);
        conv.set_prekey_id(0x1234_5678 & 0x7fff_ffff);
        conv.set_context_id(0xbeef_0001);
        conv
    }

    #[test]
    fn json_blob_roundtrip() {
        let conv = sample();
        let blob = conv.serialize().unwrap();
        let restored = Conversation::deserialize(&blob).unwrap();

        assert_eq!(restored.local_user(), "alice");
        assert_eq!(restored.partner(), "bob");
        assert_eq!(restored.device_id(), "dev-1");
        assert_eq!(restored.root_key(), conv.root_key());
        assert_eq!(restored.send_chain(), conv.send_chain());
        assert_eq!(restored.recv_chain(), conv.recv_chain());
        assert_eq!(restored.send_n(), 7);
        assert_eq!(restored.recv_n(), 4);
        assert_eq!(restored.prev_send_n(), 3);
        assert!(restored.ratchet_flag());
        assert_eq!(restored.context_id(), 0xbeef_0001);
        assert_eq!(
            restored.ratchet_pair().unwrap().public(),
            conv.ratchet_pair().unwrap().public()
        );
        assert_eq!(
            restored.ratchet_pair().unwrap().private().raw(),
            conv.ratchet_pair().unwrap().private().raw()
        );
        assert_eq!(restored.peer_ratchet_key(), conv.peer_ratchet_key());
    }

    #[test]
    fn reset_wipes_key_material() {
        let mut conv = sample();
        conv.reset();

        assert!(conv.root_key().is_none());
        assert!(conv.send_chain().is_none());
        assert!(conv.recv_chain().is_none());
        assert!(conv.identity_pair().is_none());
        assert!(conv.peer_identity().is_none());
        assert!(conv.ratchet_pair().is_none());
        assert!(conv.peer_ratchet_key().is_none());
        assert!(conv.pending_prekey().is_none());
        assert_eq!(conv.send_n(), 0);
        assert_eq!(conv.recv_n(), 0);
        assert_eq!(conv.state(), SessionState::Fresh);
    }

    #[test]
    fn state_machine_positions() {
        let mut conv = Conversation::new("alice", "bob", "dev-1");
        assert_eq!(conv.state(), SessionState::Fresh);

        conv.set_root_key(Some([9; 32]));
        conv.set_recv_chain(Some([8; 32]));
        assert_eq!(conv.state(), SessionState::AliceInit);

        conv.set_recv_chain(None);
        conv.set_send_chain(Some([7; 32]));
        assert_eq!(conv.state(), SessionState::BobInit);

        conv.set_recv_chain(Some([6; 32]));
        assert_eq!(conv.state(), SessionState::Established);
    }

    #[test]
    fn local_conversation_identity() {
        let conv = Conversation::local("alice");
        assert!(conv.is_local());
        assert!(!Conversation::new("alice", "bob", "d").is_local());
    }

    #[test]
    fn id_hashes_need_both_identities() {
        let mut conv = Conversation::new("alice", "bob", "dev-1");
        assert!(conv.id_hashes().is_none());
        conv.set_identity_pair(Some(generate_key_pair()));
        conv.set_peer_identity(Some(generate_key_pair().public().clone()));
        let (recv, sender) = conv.id_hashes().unwrap();
        assert_ne!(recv, sender);
    }
}
