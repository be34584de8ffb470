//! Core types used throughout the ledger
//!
//! Identifier newtypes shared by the stores, the guard and the transfer engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Account ID - opaque, immutable once assigned.
///
/// ULID-backed so IDs are unique without coordination. The derived `Ord` is
/// the fixed lock order: any code touching several accounts at once visits
/// them in ascending `AccountId` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(ulid::Ulid);

impl AccountId {
    /// Generate a new unique AccountId
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Maximum accepted length of a caller-supplied transfer ID (bytes)
pub const MAX_TRANSFER_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferIdError {
    #[error("transfer id must not be empty")]
    Empty,

    #[error("transfer id exceeds {MAX_TRANSFER_ID_LEN} bytes")]
    TooLong,
}

/// Transfer ID - caller- or system-supplied, doubles as the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransferId(String);

impl TransferId {
    /// Wrap a caller-supplied key
    pub fn new(id: impl Into<String>) -> Result<Self, TransferIdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TransferIdError::Empty);
        }
        if id.len() > MAX_TRANSFER_ID_LEN {
            return Err(TransferIdError::TooLong);
        }
        Ok(Self(id))
    }

    /// System-supplied ID for callers that do not bring their own key
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TransferId {
    type Err = TransferIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Version stamp of an account row, bumped by every applied mutation
pub type Version = u64;
