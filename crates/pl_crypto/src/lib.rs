//! pl_crypto — Parley Secure Messaging ratchet core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop, and before a secret slot is
//!   overwritten with a successor value.
//! - The ratchet engine never touches storage: it reports the staged
//!   message keys it produced and consumed, and the caller commits them
//!   together with the conversation in one transaction.
//!
//! # Module layout
//! - `curve`        — X25519 key pairs, DH agreement, tagged point encoding
//! - `kdf`          — HKDF-SHA256 derivations (root/chain keys, message secrets)
//! - `cbc`          — AES-CBC + truncated HMAC-SHA256 message envelope
//! - `hash`         — SHA-256 utilities (duplicate hashes, identity id-hashes)
//! - `conversation` — per-(local user, peer, device) ratchet state + JSON blob
//! - `prekey`       — one-shot X25519 pre-key records with random 31-bit ids
//! - `initiate`     — pre-key (X3DH-lite) and externally-keyed session setup
//! - `ratchet`      — message encrypt/decrypt, DH rekey, skipped-key staging
//! - `error`        — unified error type + the numeric code inventory

pub mod cbc;
pub mod conversation;
pub mod curve;
pub mod error;
pub mod hash;
pub mod initiate;
pub mod kdf;
pub mod prekey;
pub mod ratchet;

pub use conversation::{Conversation, SessionState};
pub use error::CryptoError;
