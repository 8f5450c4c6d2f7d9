//! Session initiation.
//!
//! Two independent paths produce the same steady-state ratchet variables:
//!
//! - **Pre-key** (asynchronous): the initiator fetches the peer's identity
//!   key and a one-shot pre-key, derives a 96-byte master secret from three
//!   DH agreements, and starts with a receive chain plus a pending ratchet
//!   step. The responder mirrors the derivation when the first message
//!   arrives and starts with a send chain.
//! - **Externally keyed**: an out-of-band channel (e.g. a voice key
//!   agreement) supplies a shared 32-byte exported key. Each side stages its
//!   own identity and a fresh ratchet key pair until the peer's publics have
//!   arrived over that channel; the initiator/responder roles fall out of a
//!   byte-wise comparison of the two identity keys.
//!
//! Both paths wipe the master secret material before returning.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroize;

use crate::conversation::Conversation;
use crate::curve::{
    agreement, decode_point, generate_key_pair, KeyPair, PublicKey, KEY_LENGTH,
};
use crate::error::CryptoError;
use crate::kdf::derive_root_chain;

// ── Shared helpers ───────────────────────────────────────────────────────────

/// Record an identity-key change: flag the conversation and drop the
/// out-of-band verification state back to unverified.
fn note_identity_change(conv: &mut Conversation, new_identity: &PublicKey) {
    match conv.peer_identity() {
        Some(existing) if existing == new_identity => {}
        _ => {
            conv.set_identity_key_changed(true);
            conv.set_verify_state(0);
        }
    }
}

/// Fresh context id: random upper 16 bits, previous low 16 bits + 1.
fn next_context_id(previous: u32) -> u32 {
    let mut random = [0u8; 4];
    OsRng.fill_bytes(&mut random);
    let upper = u32::from_be_bytes(random) & 0xffff_0000;
    let sequence = previous.wrapping_add(1) & 0xffff;
    upper | sequence
}

// ── Pre-key initiation ───────────────────────────────────────────────────────

/// Initiator-side pre-key setup.
///
/// `master = DH(B0, A) ‖ DH(B, A0) ‖ DH(B0, A0)` where A is the local
/// identity, A0 a fresh pre-key pair, B the peer identity and B0 the peer's
/// one-shot pre-key. Leaves the conversation with a receive chain only and
/// the ratchet flag set, so the first send turns the ratchet.
pub fn setup_alice(
    conv: &mut Conversation,
    local_identity: &KeyPair,
    peer_identity: PublicKey,
    peer_prekey: PublicKey,
    peer_prekey_id: u32,
) -> Result<(), CryptoError> {
    if conv.root_key().is_some() {
        return Err(CryptoError::ConversationExists);
    }
    debug!(
        partner = conv.partner(),
        device = conv.device_id(),
        prekey_id = peer_prekey_id,
        "initiating pre-key session"
    );

    note_identity_change(conv, &peer_identity);
    conv.reset();
    conv.set_context_id(next_context_id(conv.context_id()));

    let pending = generate_key_pair();

    let mut master = [0u8; KEY_LENGTH * 3];
    let mut dh1 = agreement(&peer_prekey, local_identity.private())?;
    let mut dh2 = agreement(&peer_identity, pending.private())?;
    let mut dh3 = agreement(&peer_prekey, pending.private())?;
    master[..KEY_LENGTH].copy_from_slice(&dh1);
    master[KEY_LENGTH..2 * KEY_LENGTH].copy_from_slice(&dh2);
    master[2 * KEY_LENGTH..].copy_from_slice(&dh3);
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();

    let derived = derive_root_chain(&master);
    master.zeroize();
    let (root, chain) = derived?;

    conv.set_identity_pair(Some(local_identity.clone()));
    conv.set_peer_identity(Some(peer_identity));
    conv.set_peer_ratchet_key(Some(peer_prekey));
    conv.set_pending_prekey(Some(pending));
    conv.set_root_key(Some(root));
    conv.set_recv_chain(Some(chain));
    conv.set_prekey_id(peer_prekey_id);
    conv.set_ratchet_flag(true);
    Ok(())
}

/// Responder-side pre-key setup, run when a received message carries a
/// pre-key id. `own_prekey` is the one-shot pre-key pair the initiator
/// consumed; looking it up and removing it atomically is the caller's job.
///
/// The derivation mirrors [`setup_alice`] term by term, so both sides end
/// up with the same root key. The consumed pre-key is promoted to the first
/// ratchet pair.
pub fn setup_bob(
    conv: &mut Conversation,
    local_identity: &KeyPair,
    peer_identity: PublicKey,
    peer_prekey: PublicKey,
    own_prekey: KeyPair,
) -> Result<(), CryptoError> {
    debug!(
        partner = conv.partner(),
        device = conv.device_id(),
        "responding to pre-key session"
    );

    note_identity_change(conv, &peer_identity);
    conv.reset();

    let mut master = [0u8; KEY_LENGTH * 3];
    let mut dh1 = agreement(&peer_identity, own_prekey.private())?;
    let mut dh2 = agreement(&peer_prekey, local_identity.private())?;
    let mut dh3 = agreement(&peer_prekey, own_prekey.private())?;
    master[..KEY_LENGTH].copy_from_slice(&dh1);
    master[KEY_LENGTH..2 * KEY_LENGTH].copy_from_slice(&dh2);
    master[2 * KEY_LENGTH..].copy_from_slice(&dh3);
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();

    let derived = derive_root_chain(&master);
    master.zeroize();
    let (root, chain) = derived?;

    conv.set_identity_pair(Some(local_identity.clone()));
    conv.set_peer_identity(Some(peer_identity));
    conv.set_ratchet_pair(Some(own_prekey));
    conv.set_root_key(Some(root));
    conv.set_send_chain(Some(chain));
    conv.set_ratchet_flag(false);
    Ok(())
}

// ── Externally-keyed initiation ──────────────────────────────────────────────

struct StagedInit {
    partner: String,
    device_id: String,
    identity: KeyPair,
    ratchet: KeyPair,
    remote_identity: Option<PublicKey>,
    remote_ratchet: Option<PublicKey>,
}

/// Per-local-user staging for externally-keyed setup. Holds the pending
/// state until all three pieces have arrived: own keys, the peer's publics,
/// and the exported key itself.
#[derive(Default)]
pub struct ExternalStaging {
    pending: Mutex<HashMap<String, StagedInit>>,
}

impl ExternalStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin staging for `(local_user, partner, device)`. Generates a fresh
    /// ratchet pair and returns the blob to hand to the out-of-band channel:
    /// length-prefixed serialized identity public and ratchet public.
    pub fn public_key_data(
        &self,
        local_user: &str,
        partner: &str,
        device_id: &str,
        identity: &KeyPair,
    ) -> Vec<u8> {
        let ratchet = generate_key_pair();

        let identity_enc = identity.public().serialize();
        let ratchet_enc = ratchet.public().serialize();
        let mut combined = Vec::with_capacity(2 + identity_enc.len() + ratchet_enc.len());
        combined.push(identity_enc.len() as u8);
        combined.extend_from_slice(&identity_enc);
        combined.push(ratchet_enc.len() as u8);
        combined.extend_from_slice(&ratchet_enc);

        self.pending.lock().insert(
            local_user.to_string(),
            StagedInit {
                partner: partner.to_string(),
                device_id: device_id.to_string(),
                identity: identity.clone(),
                ratchet,
                remote_identity: None,
                remote_ratchet: None,
            },
        );
        combined
    }

    /// Record the peer's public-key blob received over the out-of-band
    /// channel (same format as [`Self::public_key_data`] produces).
    pub fn set_public_key_data(&self, local_user: &str, data: &[u8]) -> Result<(), CryptoError> {
        let (remote_identity, rest) = read_key(data)?;
        let (remote_ratchet, _) = read_key(rest)?;

        let mut pending = self.pending.lock();
        let staged = pending
            .get_mut(local_user)
            .ok_or_else(|| CryptoError::CorruptData("no staged key agreement".into()))?;
        staged.remote_identity = Some(remote_identity);
        staged.remote_ratchet = Some(remote_ratchet);
        Ok(())
    }

    /// The partner/device the staged agreement is for, so the caller can
    /// load the right conversation before committing.
    pub fn staged_target(&self, local_user: &str) -> Option<(String, String)> {
        self.pending
            .lock()
            .get(local_user)
            .map(|s| (s.partner.clone(), s.device_id.clone()))
    }

    /// Commit the exported 32-byte key into the conversation and clear the
    /// staging slot. The side with the lexicographically smaller identity
    /// public takes the initiator role (receive chain + pending ratchet);
    /// the other side takes the responder role (send chain).
    pub fn set_exported_key(
        &self,
        local_user: &str,
        exported_key: &[u8; 32],
        conv: &mut Conversation,
    ) -> Result<(), CryptoError> {
        let staged = self
            .pending
            .lock()
            .remove(local_user)
            .ok_or_else(|| CryptoError::CorruptData("no staged key agreement".into()))?;
        let remote_identity = staged
            .remote_identity
            .ok_or_else(|| CryptoError::CorruptData("peer identity key not staged".into()))?;
        let remote_ratchet = staged
            .remote_ratchet
            .ok_or_else(|| CryptoError::CorruptData("peer ratchet key not staged".into()))?;

        note_identity_change(conv, &remote_identity);
        conv.reset();
        conv.set_context_id(next_context_id(conv.context_id()));

        let (root, chain) = derive_root_chain(exported_key)?;

        conv.set_identity_pair(Some(staged.identity.clone()));
        conv.set_peer_identity(Some(remote_identity.clone()));

        let local_is_initiator =
            staged.identity.public().raw().as_slice() < remote_identity.raw().as_slice();
        if local_is_initiator {
            conv.set_peer_ratchet_key(Some(remote_ratchet));
            conv.set_root_key(Some(root));
            conv.set_recv_chain(Some(chain));
            conv.set_ratchet_flag(true);
        } else {
            conv.set_ratchet_pair(Some(staged.ratchet));
            conv.set_root_key(Some(root));
            conv.set_send_chain(Some(chain));
            conv.set_ratchet_flag(false);
        }
        Ok(())
    }
}

fn read_key(data: &[u8]) -> Result<(PublicKey, &[u8]), CryptoError> {
    let (&len, rest) = data
        .split_first()
        .ok_or_else(|| CryptoError::CorruptData("truncated key data".into()))?;
    let len = len as usize;
    if rest.len() < len {
        return Err(CryptoError::CorruptData("truncated key data".into()));
    }
    Ok((decode_point(&rest[..len])?, &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::SessionState;
    use crate::prekey::PreKey;
    use crate::ratchet;

    fn prekey_pair() -> (Conversation, Conversation) {
        let alice_identity = generate_key_pair();
        let bob_identity = generate_key_pair();
        let bob_prekey = PreKey::generate(777);

        let mut alice = Conversation::new("alice", "bob", "bobdev");
        setup_alice(
            &mut alice,
            &alice_identity,
            bob_identity.public().clone(),
            bob_prekey.pair.public().clone(),
            bob_prekey.id,
        )
        .unwrap();

        let mut bob = Conversation::new("bob", "alice", "alicedev");
        setup_bob(
            &mut bob,
            &bob_identity,
            alice_identity.public().clone(),
            alice.pending_prekey().unwrap().public().clone(),
            bob_prekey.pair,
        )
        .unwrap();

        (alice, bob)
    }

    #[test]
    fn both_sides_derive_the_same_root() {
        let (alice, bob) = prekey_pair();
        assert_eq!(alice.root_key(), bob.root_key());
        assert_eq!(alice.recv_chain(), bob.send_chain());
        assert_eq!(alice.state(), SessionState::AliceInit);
        assert_eq!(bob.state(), SessionState::BobInit);
        assert!(alice.ratchet_flag());
        assert!(!bob.ratchet_flag());
        assert_eq!(alice.prekey_id(), 777);
    }

    #[test]
    fn existing_session_is_not_overwritten() {
        let (mut alice, _) = prekey_pair();
        let identity = generate_key_pair();
        let err = setup_alice(
            &mut alice,
            &identity,
            generate_key_pair().public().clone(),
            generate_key_pair().public().clone(),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::ConversationExists));
    }

    #[test]
    fn context_id_sequence_increments() {
        let alice_identity = generate_key_pair();
        let bob_identity = generate_key_pair();

        let mut conv = Conversation::new("alice", "bob", "bobdev");
        let prekey = PreKey::generate(1);
        setup_alice(
            &mut conv,
            &alice_identity,
            bob_identity.public().clone(),
            prekey.pair.public().clone(),
            prekey.id,
        )
        .unwrap();
        let first = conv.context_id();
        assert_eq!(first & 0xffff, 1);

        // Simulate a re-initiation after a reset.
        conv.set_root_key(None);
        let prekey2 = PreKey::generate(2);
        setup_alice(
            &mut conv,
            &alice_identity,
            bob_identity.public().clone(),
            prekey2.pair.public().clone(),
            prekey2.id,
        )
        .unwrap();
        assert_eq!(conv.context_id() & 0xffff, 2);
    }

    #[test]
    fn identity_change_is_flagged_and_verification_dropped() {
        let alice_identity = generate_key_pair();
        let bob_identity_1 = generate_key_pair();
        let bob_identity_2 = generate_key_pair();

        let mut conv = Conversation::new("alice", "bob", "bobdev");
        let prekey = PreKey::generate(10);
        setup_alice(
            &mut conv,
            &alice_identity,
            bob_identity_1.public().clone(),
            prekey.pair.public().clone(),
            prekey.id,
        )
        .unwrap();

        conv.set_identity_key_changed(false);
        conv.set_verify_state(2);
        conv.set_root_key(None);

        let prekey2 = PreKey::generate(11);
        setup_alice(
            &mut conv,
            &alice_identity,
            bob_identity_2.public().clone(),
            prekey2.pair.public().clone(),
            prekey2.id,
        )
        .unwrap();
        assert!(conv.identity_key_changed());
        assert_eq!(conv.verify_state(), 0);
    }

    #[test]
    fn unchanged_identity_keeps_verification() {
        let alice_identity = generate_key_pair();
        let bob_identity = generate_key_pair();

        let mut conv = Conversation::new("alice", "bob", "bobdev");
        let prekey = PreKey::generate(20);
        setup_alice(
            &mut conv,
            &alice_identity,
            bob_identity.public().clone(),
            prekey.pair.public().clone(),
            prekey.id,
        )
        .unwrap();

        conv.set_identity_key_changed(false);
        conv.set_verify_state(2);
        conv.set_root_key(None);

        let prekey2 = PreKey::generate(21);
        setup_alice(
            &mut conv,
            &alice_identity,
            bob_identity.public().clone(),
            prekey2.pair.public().clone(),
            prekey2.id,
        )
        .unwrap();
        assert!(!conv.identity_key_changed());
        assert_eq!(conv.verify_state(), 2);
    }

    #[test]
    fn externally_keyed_roles_and_traffic() {
        let alice_identity = generate_key_pair();
        let bob_identity = generate_key_pair();
        let exported = [0x5cu8; 32];

        let alice_staging = ExternalStaging::new();
        let bob_staging = ExternalStaging::new();

        let alice_blob = alice_staging.public_key_data("alice", "bob", "bobdev", &alice_identity);
        let bob_blob = bob_staging.public_key_data("bob", "alice", "alicedev", &bob_identity);

        alice_staging.set_public_key_data("alice", &bob_blob).unwrap();
        bob_staging.set_public_key_data("bob", &alice_blob).unwrap();

        assert_eq!(
            alice_staging.staged_target("alice"),
            Some(("bob".to_string(), "bobdev".to_string()))
        );

        let mut alice = Conversation::new("alice", "bob", "bobdev");
        let mut bob = Conversation::new("bob", "alice", "alicedev");
        alice_staging.set_exported_key("alice", &exported, &mut alice).unwrap();
        bob_staging.set_exported_key("bob", &exported, &mut bob).unwrap();

        assert_eq!(alice.root_key(), bob.root_key());
        // Exactly one side takes each role.
        let states = (alice.state(), bob.state());
        assert!(
            states == (SessionState::AliceInit, SessionState::BobInit)
                || states == (SessionState::BobInit, SessionState::AliceInit),
            "unexpected role split: {states:?}"
        );

        // Traffic flows in both directions regardless of who won which role.
        let (mut initiator, mut responder) = if alice.state() == SessionState::AliceInit {
            (alice, bob)
        } else {
            (bob, alice)
        };

        let enc = ratchet::encrypt(&mut initiator, b"over the wire", b"").unwrap();
        let out = ratchet::decrypt(&mut responder, &enc.wire, None, &[]).unwrap();
        assert_eq!(out.plaintext, b"over the wire");

        let back = ratchet::encrypt(&mut responder, b"and back", b"").unwrap();
        let out = ratchet::decrypt(&mut initiator, &back.wire, None, &[]).unwrap();
        assert_eq!(out.plaintext, b"and back");
    }

    #[test]
    fn exported_key_requires_staged_peer_keys() {
        let staging = ExternalStaging::new();
        let identity = generate_key_pair();
        staging.public_key_data("alice", "bob", "bobdev", &identity);

        let mut conv = Conversation::new("alice", "bob", "bobdev");
        let err = staging
            .set_exported_key("alice", &[0u8; 32], &mut conv)
            .unwrap_err();
        assert!(matches!(err, CryptoError::CorruptData(_)));
    }
}
