//! Store error type shared by the account and ledger store contracts

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// A persisted value could not be decoded (bad id, negative balance, unknown status)
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A lock was poisoned by a panicking writer
    #[error("Store lock poisoned: {0}")]
    Poisoned(&'static str),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}
