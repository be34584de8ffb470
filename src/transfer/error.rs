//! Transfer Error Types

use thiserror::Error;

use crate::core_types::{AccountId, TransferId};
use crate::storage::StoreError;

/// Transfer error types
///
/// Business-rule rejections (insufficient funds, zero amount) are NOT errors:
/// they come back as a FAILED [`super::TransferOutcome`]. Everything here is
/// either a caller mistake, contention, or infrastructure.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Sender and receiver account cannot be the same: {0}")]
    InvalidTransfer(AccountId),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Balance would exceed the representable maximum")]
    BalanceOverflow,

    // === Idempotency Errors ===
    #[error("Transfer id {0} was already used with different parameters")]
    IdempotencyKeyConflict(TransferId),

    #[error("Transfer {0} is already in progress")]
    AlreadyInProgress(TransferId),

    #[error("Outcome recorded for transfer {0} without a reservation")]
    NotReserved(TransferId),

    // === Contention ===
    #[error("Concurrent update conflict after {attempts} attempts")]
    ConcurrentUpdateConflict { attempts: u32 },

    // === System Errors ===
    #[error("Storage error: {0}")]
    Storage(String),
}

impl TransferError {
    /// Stable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidTransfer(_) => "INVALID_TRANSFER",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            TransferError::BalanceOverflow => "BALANCE_OVERFLOW",
            TransferError::IdempotencyKeyConflict(_) => "IDEMPOTENCY_KEY_CONFLICT",
            TransferError::AlreadyInProgress(_) => "ALREADY_IN_PROGRESS",
            TransferError::NotReserved(_) => "NOT_RESERVED",
            TransferError::ConcurrentUpdateConflict { .. } => "CONCURRENT_UPDATE_CONFLICT",
            TransferError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether resubmitting the same request (same transfer id) may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransferError::ConcurrentUpdateConflict { .. } | TransferError::AlreadyInProgress(_)
        )
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::Storage(e.to_string())
    }
}
