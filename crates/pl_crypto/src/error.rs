use thiserror::Error;

/// Numeric result codes shared with the application layer and, for some of
/// them, with the remote side via error commands. The enums below are the
/// Rust surface; these values are the contract.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const OK: i32 = 1;

    // Message processing, -10 .. -99
    pub const GENERIC_ERROR: i32 = -10;
    pub const VERSION_NO_SUPPORTED: i32 = -11;
    pub const BUFFER_TOO_SMALL: i32 = -12;
    pub const NOT_DECRYPTABLE: i32 = -13;
    pub const NO_OWN_ID: i32 = -14;
    pub const JS_FIELD_MISSING: i32 = -15;
    pub const NO_DEVS_FOUND: i32 = -16;
    pub const NO_PRE_KEY_FOUND: i32 = -17;
    pub const NO_SESSION_USER: i32 = -18;
    pub const SESSION_NOT_INITED: i32 = -19;
    pub const OLD_MESSAGE: i32 = -20;
    pub const CORRUPT_DATA: i32 = -21;
    pub const AXO_CONV_EXISTS: i32 = -22;
    pub const MAC_CHECK_FAILED: i32 = -23;
    pub const MSG_PADDING_FAILED: i32 = -24;
    pub const SUP_PADDING_FAILED: i32 = -25;
    pub const NO_STAGED_KEYS: i32 = -26;
    pub const RECEIVE_ID_WRONG: i32 = -27;
    pub const SENDER_ID_WRONG: i32 = -28;
    pub const RECV_DATA_LENGTH: i32 = -29;
    pub const WRONG_RECV_DEV_ID: i32 = -30;
    pub const NETWORK_ERROR: i32 = -31;
    pub const FUTURE_MESSAGE: i32 = -32;

    // Public key modules, -100 .. -199
    pub const NO_SUCH_CURVE: i32 = -100;
    pub const KEY_TYPE_MISMATCH: i32 = -101;

    // Ratcheting session
    pub const IDENTITY_KEY_TYPE_MISMATCH: i32 = -200;

    // Symmetric encryption / HMAC
    pub const WRONG_BLK_SIZE: i32 = -300;
    pub const UNSUPPORTED_KEY_SIZE: i32 = -301;

    pub const DATABASE_ERROR: i32 = -400;
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Curve not supported")]
    NoSuchCurve,

    #[error("Private and public key use different curves")]
    KeyTypeMismatch,

    #[error("Their identity key and our identity key use different curve types")]
    IdentityKeyTypeMismatch,

    #[error("IV or data length does not match the cipher block size")]
    WrongBlockSize,

    #[error("Key size not supported for this cipher")]
    UnsupportedKeySize,

    #[error("HMAC check of encrypted message failed")]
    MacCheckFailed,

    #[error("Incorrect padding of decrypted message")]
    MsgPaddingFailed,

    #[error("Incorrect padding of decrypted supplementary data")]
    SupPaddingFailed,

    #[error("Conversation already exists while trying to set up a new one")]
    ConversationExists,

    #[error("Session not initialized")]
    SessionNotInitialized,

    #[error("Message index too far in the future ({0} skipped keys)")]
    FutureMessage(u32),

    #[error("No staged message keys available")]
    NoStagedKeys,

    #[error("Expected length of data does not match received length")]
    RecvDataLength,

    #[error("Incoming data corrupt: {0}")]
    CorruptData(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

impl CryptoError {
    /// Numeric code for the application layer and wire-level error reports.
    pub fn code(&self) -> i32 {
        match self {
            CryptoError::NoSuchCurve => codes::NO_SUCH_CURVE,
            CryptoError::KeyTypeMismatch => codes::KEY_TYPE_MISMATCH,
            CryptoError::IdentityKeyTypeMismatch => codes::IDENTITY_KEY_TYPE_MISMATCH,
            CryptoError::WrongBlockSize => codes::WRONG_BLK_SIZE,
            CryptoError::UnsupportedKeySize => codes::UNSUPPORTED_KEY_SIZE,
            CryptoError::MacCheckFailed => codes::MAC_CHECK_FAILED,
            CryptoError::MsgPaddingFailed => codes::MSG_PADDING_FAILED,
            CryptoError::SupPaddingFailed => codes::SUP_PADDING_FAILED,
            CryptoError::ConversationExists => codes::AXO_CONV_EXISTS,
            CryptoError::SessionNotInitialized => codes::SESSION_NOT_INITED,
            CryptoError::FutureMessage(_) => codes::FUTURE_MESSAGE,
            CryptoError::NoStagedKeys => codes::NO_STAGED_KEYS,
            CryptoError::RecvDataLength => codes::RECV_DATA_LENGTH,
            CryptoError::CorruptData(_) => codes::CORRUPT_DATA,
            CryptoError::KeyDerivation(_) => codes::GENERIC_ERROR,
            CryptoError::InvalidKey(_) => codes::CORRUPT_DATA,
            CryptoError::Serialisation(_) => codes::CORRUPT_DATA,
            CryptoError::Base64Decode(_) => codes::CORRUPT_DATA,
        }
    }
}
