use thiserror::Error;

use pl_crypto::error::codes;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] pl_crypto::CryptoError),

    #[error("Record not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn code(&self) -> i32 {
        match self {
            StoreError::Database(_) => codes::DATABASE_ERROR,
            StoreError::Crypto(e) => e.code(),
            StoreError::NotFound(_) => codes::GENERIC_ERROR,
        }
    }

    /// The underlying SQLite extended error code, for the per-conversation
    /// `sql_error_code` diagnostic.
    pub fn sql_code(&self) -> i32 {
        match self {
            StoreError::Database(rusqlite::Error::SqliteFailure(err, _)) => err.extended_code,
            _ => 0,
        }
    }
}
