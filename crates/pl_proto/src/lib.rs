//! pl_proto — wire types and serialisation for Parley Secure Messaging
//!
//! The on-wire envelope is a protobuf-compatible tagged binary record:
//! every field carries a tag, unknown fields are skipped, so the format can
//! grow without breaking old readers. The serialized record is
//! base64-encoded before it is handed to the transport.
//!
//! # Modules
//! - `codec`    — varint and tagged-field primitives
//! - `envelope` — the message envelope (what the transport sees)

pub mod codec;
pub mod envelope;

pub use codec::CodecError;
pub use envelope::MessageEnvelope;
