//! Transfer Core Types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TransferStatus;
use crate::balance::GuardError;
use crate::core_types::{AccountId, TransferId};
use crate::money::Amount;

/// Transfer request from the API layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Idempotency key
    pub transfer_id: TransferId,
    pub sender: AccountId,
    pub receiver: AccountId,
    /// Minor units
    pub amount: Amount,
}

impl TransferRequest {
    pub fn new(
        transfer_id: TransferId,
        sender: AccountId,
        receiver: AccountId,
        amount: impl Into<Amount>,
    ) -> Self {
        Self {
            transfer_id,
            sender,
            receiver,
            amount: amount.into(),
        }
    }

    pub fn fingerprint(&self) -> TransferFingerprint {
        TransferFingerprint {
            sender: self.sender,
            receiver: self.receiver,
            amount: self.amount,
        }
    }
}

/// Parameters that must match for a retry to count as "the same request"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferFingerprint {
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Amount,
}

/// Why a transfer ended FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    InsufficientFunds,
    InvalidAmount,
    AccountNotFound,
    BalanceOverflow,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InsufficientFunds => "INSUFFICIENT_FUNDS",
            FailureReason::InvalidAmount => "INVALID_AMOUNT",
            FailureReason::AccountNotFound => "ACCOUNT_NOT_FOUND",
            FailureReason::BalanceOverflow => "BALANCE_OVERFLOW",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSUFFICIENT_FUNDS" => Ok(FailureReason::InsufficientFunds),
            "INVALID_AMOUNT" => Ok(FailureReason::InvalidAmount),
            "ACCOUNT_NOT_FOUND" => Ok(FailureReason::AccountNotFound),
            "BALANCE_OVERFLOW" => Ok(FailureReason::BalanceOverflow),
            other => Err(format!("unknown failure reason: {}", other)),
        }
    }
}

impl From<GuardError> for FailureReason {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::InsufficientFunds { .. } => FailureReason::InsufficientFunds,
            GuardError::InvalidAmount | GuardError::PrecisionOverflow { .. } => {
                FailureReason::InvalidAmount
            }
            GuardError::BalanceOverflow => FailureReason::BalanceOverflow,
        }
    }
}

/// Transfer record stored by the Ledger Entry Store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: TransferId,
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Amount,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    /// Set on both terminal states
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only when FAILED
    pub failure_reason: Option<FailureReason>,
}

impl TransferRecord {
    /// New record in PENDING state
    pub fn pending(req: &TransferRequest) -> Self {
        Self {
            transfer_id: req.transfer_id.clone(),
            sender: req.sender,
            receiver: req.receiver,
            amount: req.amount,
            status: TransferStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn fingerprint(&self) -> TransferFingerprint {
        TransferFingerprint {
            sender: self.sender,
            receiver: self.receiver,
            amount: self.amount,
        }
    }

    /// Outcome as reported to callers; `None` while PENDING
    pub fn outcome(&self) -> Option<TransferOutcome> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(TransferOutcome {
            transfer_id: self.transfer_id.clone(),
            status: self.status,
            completed_at: self.completed_at,
            failure_reason: self.failure_reason,
        })
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] {} -> {} amount={} status={}",
            self.transfer_id, self.sender, self.receiver, self.amount, self.status
        )
    }
}

/// Terminal result returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl TransferOutcome {
    pub fn completed(transfer_id: TransferId, completed_at: DateTime<Utc>) -> Self {
        Self {
            transfer_id,
            status: TransferStatus::Completed,
            completed_at: Some(completed_at),
            failure_reason: None,
        }
    }

    pub fn failed(
        transfer_id: TransferId,
        completed_at: DateTime<Utc>,
        reason: FailureReason,
    ) -> Self {
        Self {
            transfer_id,
            status: TransferStatus::Failed,
            completed_at: Some(completed_at),
            failure_reason: Some(reason),
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.status == TransferStatus::Completed
    }
}
