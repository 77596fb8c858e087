//! Error type for `lineup-store`.

use lineup_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt sample {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("database connection lock poisoned")]
    LockPoisoned,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for StoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => StoreError::Io(io),
            Error::Corrupt { key, reason } => StoreError::Corrupt(format!("{key}: {reason}")),
            other => StoreError::Backend(Box::new(other)),
        }
    }
}
