//! Double-ratchet message engine.
//!
//! Encrypt and decrypt operate on a [`Conversation`] loaded by the caller.
//! All mutation stays in memory: the caller persists the conversation —
//! together with the staged message keys reported in [`Decrypted`] — in one
//! transaction after success, and simply discards the in-memory state on
//! failure. The engine itself never touches storage.
//!
//! Wire layout of one encrypted message:
//!
//! ```text
//! [curve tag (1)] [ratchet public (32)] [PN (4, BE)] [N (4, BE)]
//! [AES-CBC body (..)] [truncated HMAC (8)]
//! ```
//!
//! The HMAC covers header ‖ body. An optional "supplement" blob travels
//! next to the body, encrypted under the same message key and IV; it has no
//! MAC of its own and is authenticated by being delivered alongside an
//! authenticated message.

use zeroize::Zeroize;

use crate::cbc::{
    aes_cbc_decrypt, aes_cbc_decrypt_supplement, aes_cbc_encrypt, hmac_trunc8,
    hmac_trunc8_verify, SHORT_MAC_LENGTH,
};
use crate::conversation::Conversation;
use crate::curve::{agreement, decode_point, generate_key_pair, PublicKey, ENCODED_KEY_LENGTH};
use crate::error::CryptoError;
use crate::kdf::{advance_chain, message_secrets, ratchet_root_chain, MessageSecrets};

/// Upper bound on skipped message keys per staging pass. Larger jumps are
/// rejected instead of looping.
pub const MAX_SKIP: u32 = 2000;

/// Curve tag + ratchet public + PN + N.
const WIRE_HEADER_LENGTH: usize = ENCODED_KEY_LENGTH + 8;
const MIN_WIRE_LENGTH: usize = WIRE_HEADER_LENGTH + 16 + SHORT_MAC_LENGTH;

pub struct Encrypted {
    /// header ‖ ciphertext ‖ mac, ready for the envelope.
    pub wire: Vec<u8>,
    /// Supplement ciphertext, if a supplement was given.
    pub supplement: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub supplement: Option<Vec<u8>>,
    /// Newly derived skipped-message keys (80-byte blobs) the caller must
    /// persist together with the conversation.
    pub staged: Vec<Vec<u8>>,
    /// The staged blob that decrypted this message, to be removed from the
    /// durable staging store.
    pub consumed_staged: Option<Vec<u8>>,
}

// ── Encrypt ──────────────────────────────────────────────────────────────────

/// Encrypt one message (and optional supplement) and advance the sending
/// chain. Performs the pending DH ratchet step first when the conversation
/// is flagged for one.
pub fn encrypt(
    conv: &mut Conversation,
    plaintext: &[u8],
    supplement: &[u8],
) -> Result<Encrypted, CryptoError> {
    if conv.root_key().is_none() {
        return Err(CryptoError::SessionNotInitialized);
    }

    if conv.ratchet_flag() {
        ratchet_send_chain(conv)?;
    }

    let chain_key = *conv.send_chain().ok_or(CryptoError::SessionNotInitialized)?;
    let secrets = message_secrets(&chain_key)?;

    let ratchet_public = conv
        .ratchet_pair()
        .ok_or(CryptoError::SessionNotInitialized)?
        .public()
        .clone();
    let header = build_header(&ratchet_public, conv.prev_send_n(), conv.send_n());

    let body = aes_cbc_encrypt(&secrets.cipher_key, &secrets.iv, plaintext)?;
    let mac = hmac_trunc8(&secrets.mac_key, &[&header, &body])?;

    let supplement_cipher = if supplement.is_empty() {
        None
    } else {
        Some(aes_cbc_encrypt(&secrets.cipher_key, &secrets.iv, supplement)?)
    };

    // Symmetric ratchet step after the message key is fixed.
    let next = advance_chain(&chain_key)?;
    conv.set_send_chain(Some(next));
    conv.set_send_n(conv.send_n() + 1);

    let mut wire = Vec::with_capacity(header.len() + body.len() + SHORT_MAC_LENGTH);
    wire.extend_from_slice(&header);
    wire.extend_from_slice(&body);
    wire.extend_from_slice(&mac);

    Ok(Encrypted { wire, supplement: supplement_cipher })
}

/// DH ratchet on the sending side: fresh ratchet pair, new root and sending
/// chain, counters reset.
fn ratchet_send_chain(conv: &mut Conversation) -> Result<(), CryptoError> {
    let peer_ratchet = conv
        .peer_ratchet_key()
        .ok_or(CryptoError::SessionNotInitialized)?
        .clone();
    let fresh = generate_key_pair();

    let mut dh = agreement(&peer_ratchet, fresh.private())?;
    let root_key = *conv.root_key().ok_or(CryptoError::SessionNotInitialized)?;
    let derived = ratchet_root_chain(&root_key, &dh);
    dh.zeroize();
    let (new_root, new_chain) = derived?;

    conv.set_prev_send_n(conv.send_n());
    conv.set_send_n(0);
    conv.set_ratchet_pair(Some(fresh));
    conv.set_root_key(Some(new_root));
    conv.set_send_chain(Some(new_chain));
    conv.set_ratchet_flag(false);
    Ok(())
}

// ── Decrypt ──────────────────────────────────────────────────────────────────

/// Decrypt one wire message.
///
/// `staged_candidates` are the durable skipped-message keys for this
/// conversation; they are tried first (by trial MAC), which also covers
/// messages from a chain the ratchet has already moved past. On failure the
/// conversation must be discarded, not persisted.
pub fn decrypt(
    conv: &mut Conversation,
    wire: &[u8],
    supplement_cipher: Option<&[u8]>,
    staged_candidates: &[Vec<u8>],
) -> Result<Decrypted, CryptoError> {
    let parsed = parse_wire(wire)?;

    // Staged keys first: handles out-of-order within a chain after the
    // chain advanced, and messages from a previous chain after a DH step.
    for blob in staged_candidates {
        let Ok(secrets) = MessageSecrets::from_staged(blob) else {
            continue;
        };
        if hmac_trunc8_verify(&secrets.mac_key, &[parsed.header, parsed.body], parsed.mac).is_ok() {
            let plaintext = aes_cbc_decrypt(&secrets.cipher_key, &secrets.iv, parsed.body)?;
            let supplement = decrypt_supplement(&secrets, supplement_cipher)?;
            return Ok(Decrypted {
                plaintext,
                supplement,
                staged: Vec::new(),
                consumed_staged: Some(blob.clone()),
            });
        }
    }

    if conv.root_key().is_none() {
        return Err(CryptoError::SessionNotInitialized);
    }

    let mut staged = Vec::new();

    let ratchet_needed = match conv.peer_ratchet_key() {
        Some(current) => current != &parsed.ratchet_key,
        None => true,
    };

    if ratchet_needed {
        // Close out the current receiving chain up to the peer's stated
        // previous-chain length, then turn the ratchet.
        if conv.recv_chain().is_some() {
            stage_until(conv, parsed.pn, &mut staged)?;
        }
        ratchet_recv_chain(conv, &parsed.ratchet_key)?;
    }

    if parsed.n < conv.recv_n() {
        // Earlier index in the current chain with no staged key left: either
        // a replay or an attack, never a state change.
        return Err(CryptoError::MacCheckFailed);
    }
    stage_until(conv, parsed.n, &mut staged)?;

    let chain_key = *conv.recv_chain().ok_or(CryptoError::SessionNotInitialized)?;
    let secrets = message_secrets(&chain_key)?;

    hmac_trunc8_verify(&secrets.mac_key, &[parsed.header, parsed.body], parsed.mac)?;

    let plaintext = aes_cbc_decrypt(&secrets.cipher_key, &secrets.iv, parsed.body)?;
    let supplement = decrypt_supplement(&secrets, supplement_cipher)?;

    conv.set_recv_chain(Some(advance_chain(&chain_key)?));
    conv.set_recv_n(conv.recv_n() + 1);

    Ok(Decrypted { plaintext, supplement, staged, consumed_staged: None })
}

/// DH ratchet on the receiving side. The old ratchet pair is retired, and
/// so is the pending pre-key: the peer's first message proves the session
/// is established, so initiation material stops travelling.
fn ratchet_recv_chain(conv: &mut Conversation, peer_key: &PublicKey) -> Result<(), CryptoError> {
    let ratchet_pair = conv
        .ratchet_pair()
        .ok_or(CryptoError::SessionNotInitialized)?;

    let mut dh = agreement(peer_key, ratchet_pair.private())?;
    let root_key = *conv.root_key().ok_or(CryptoError::SessionNotInitialized)?;
    let derived = ratchet_root_chain(&root_key, &dh);
    dh.zeroize();
    let (new_root, new_chain) = derived?;

    conv.set_root_key(Some(new_root));
    conv.set_recv_chain(Some(new_chain));
    conv.set_peer_ratchet_key(Some(peer_key.clone()));
    conv.set_ratchet_pair(None);
    conv.set_pending_prekey(None);
    conv.set_recv_n(0);
    conv.set_ratchet_flag(true);
    Ok(())
}

/// Derive and stage message keys for indices `[recv_n, until)` of the
/// current receiving chain.
fn stage_until(
    conv: &mut Conversation,
    until: u32,
    out: &mut Vec<Vec<u8>>,
) -> Result<(), CryptoError> {
    if until <= conv.recv_n() {
        return Ok(());
    }
    let skip = until - conv.recv_n();
    if skip > MAX_SKIP {
        return Err(CryptoError::FutureMessage(skip));
    }
    while conv.recv_n() < until {
        let chain_key = *conv.recv_chain().ok_or(CryptoError::SessionNotInitialized)?;
        let secrets = message_secrets(&chain_key)?;
        out.push(secrets.to_staged());
        conv.set_recv_chain(Some(advance_chain(&chain_key)?));
        conv.set_recv_n(conv.recv_n() + 1);
    }
    Ok(())
}

fn decrypt_supplement(
    secrets: &MessageSecrets,
    supplement_cipher: Option<&[u8]>,
) -> Result<Option<Vec<u8>>, CryptoError> {
    match supplement_cipher {
        Some(data) if !data.is_empty() => Ok(Some(aes_cbc_decrypt_supplement(
            &secrets.cipher_key,
            &secrets.iv,
            data,
        )?)),
        _ => Ok(None),
    }
}

// ── Wire framing ─────────────────────────────────────────────────────────────

fn build_header(ratchet_public: &PublicKey, pn: u32, n: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(WIRE_HEADER_LENGTH);
    header.extend_from_slice(&ratchet_public.serialize());
    header.extend_from_slice(&pn.to_be_bytes());
    header.extend_from_slice(&n.to_be_bytes());
    header
}

struct ParsedWire<'a> {
    ratchet_key: PublicKey,
    pn: u32,
    n: u32,
    /// The raw header bytes, needed for MAC verification.
    header: &'a [u8],
    body: &'a [u8],
    mac: &'a [u8],
}

fn parse_wire(wire: &[u8]) -> Result<ParsedWire<'_>, CryptoError> {
    if wire.len() < MIN_WIRE_LENGTH {
        return Err(CryptoError::RecvDataLength);
    }
    let ratchet_key = decode_point(&wire[..ENCODED_KEY_LENGTH])?;
    let pn = u32::from_be_bytes(
        wire[ENCODED_KEY_LENGTH..ENCODED_KEY_LENGTH + 4]
            .try_into()
            .expect("slice length fixed"),
    );
    let n = u32::from_be_bytes(
        wire[ENCODED_KEY_LENGTH + 4..WIRE_HEADER_LENGTH]
            .try_into()
            .expect("slice length fixed"),
    );
    let mac_start = wire.len() - SHORT_MAC_LENGTH;
    Ok(ParsedWire {
        ratchet_key,
        pn,
        n,
        header: &wire[..WIRE_HEADER_LENGTH],
        body: &wire[WIRE_HEADER_LENGTH..mac_start],
        mac: &wire[mac_start..],
    })
}
