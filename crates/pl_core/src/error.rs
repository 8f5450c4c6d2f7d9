use thiserror::Error;

use pl_crypto::error::codes;
use pl_crypto::CryptoError;
use pl_proto::CodecError;
use pl_store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Envelope codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Missing a required JSON field: {0}")]
    FieldMissing(&'static str),

    #[error("No registered devices found for user {0}")]
    NoDevices(String),

    #[error("Found no own identity")]
    NoOwnIdentity,

    #[error("Offered pre-key not found: {0}")]
    NoPreKeyFound(u32),

    #[error("No session for user {0}")]
    NoSession(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Message intended for a different device")]
    WrongRecvDevice,

    #[error("Message too old to process")]
    OldMessage,

    #[error("Receiver identity key hash mismatch")]
    ReceiveIdWrong,

    #[error("Sender identity key hash mismatch")]
    SenderIdWrong,
}

impl CoreError {
    pub fn code(&self) -> i32 {
        match self {
            CoreError::Crypto(e) => e.code(),
            CoreError::Store(e) => e.code(),
            CoreError::Codec(e) => match e {
                CodecError::FieldMissing(_) => codes::JS_FIELD_MISSING,
                _ => codes::CORRUPT_DATA,
            },
            CoreError::FieldMissing(_) => codes::JS_FIELD_MISSING,
            CoreError::NoDevices(_) => codes::NO_DEVS_FOUND,
            CoreError::NoOwnIdentity => codes::NO_OWN_ID,
            CoreError::NoPreKeyFound(_) => codes::NO_PRE_KEY_FOUND,
            CoreError::NoSession(_) => codes::NO_SESSION_USER,
            CoreError::Network(_) => codes::NETWORK_ERROR,
            CoreError::WrongRecvDevice => codes::WRONG_RECV_DEV_ID,
            CoreError::OldMessage => codes::OLD_MESSAGE,
            CoreError::ReceiveIdWrong => codes::RECEIVE_ID_WRONG,
            CoreError::SenderIdWrong => codes::SENDER_ID_WRONG,
        }
    }

    /// SQLite diagnostic code, when the failure came out of the store.
    pub fn sql_code(&self) -> i32 {
        match self {
            CoreError::Store(e) => e.sql_code(),
            _ => 0,
        }
    }
}
