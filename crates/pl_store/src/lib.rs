//! pl_store — persistent storage for Parley Secure Messaging
//!
//! SQLite (WAL journal, foreign keys on) behind a synchronous, transactional
//! API. The store never interprets key material beyond parsing; conversation
//! state travels as an opaque JSON blob produced by `pl_crypto`.
//!
//! The two paths that must be atomic are modelled as single transactions:
//! the receive commit (message hash + staged keys + conversation + optional
//! plaintext temp record + raw-queue delete + optional pre-key removal) and
//! pre-key batch generation.

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::{RawRecord, ReceiveCommit, Store, TempInsert, TempRecord};
