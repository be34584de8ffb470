//! Account rows and the compare-and-swap batch the stores apply

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, TransferId, Version};
use crate::money::Amount;

/// Balance record of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub balance: Amount,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account: balance 0, version 0
    pub fn new(account_id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            balance: Amount::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Mutation ID - key of the applied-mutation journal
///
/// Transfers use their transfer ID verbatim, so recovery can ask the account
/// store "was this transfer applied?" with nothing but the ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(String);

impl MutationId {
    /// Fresh ID for a deposit/withdrawal
    pub fn adjustment() -> Self {
        Self(format!("adj-{}", ulid::Ulid::new()))
    }

    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&TransferId> for MutationId {
    fn from(id: &TransferId) -> Self {
        Self(id.as_str().to_string())
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a journaled mutation was
///
/// IDs are designed for PostgreSQL storage as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum MutationKind {
    /// Internal two-account move; postings net to zero
    Transfer = 1,
    /// External credit injected into the ledger
    Deposit = 2,
    /// External debit removed from the ledger
    Withdrawal = 3,
    /// Fence written by recovery; no postings, blocks any later swap under the same ID
    Void = 4,
}

impl MutationKind {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(MutationKind::Transfer),
            2 => Some(MutationKind::Deposit),
            3 => Some(MutationKind::Withdrawal),
            4 => Some(MutationKind::Void),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Transfer => "TRANSFER",
            MutationKind::Deposit => "DEPOSIT",
            MutationKind::Withdrawal => "WITHDRAWAL",
            MutationKind::Void => "VOID",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conditional row write inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUpdate {
    pub account_id: AccountId,
    /// Version observed when the balance was read
    pub expected_version: Version,
    /// Balance computed by the guard from the observed balance
    pub new_balance: Amount,
    /// Signed change, kept for the journal
    pub delta: i128,
}

impl AccountUpdate {
    /// Build an update from the row that was read and the guard's result
    pub fn from_read(read: &Account, new_balance: Amount) -> Self {
        Self {
            account_id: read.account_id,
            expected_version: read.version,
            new_balance,
            delta: i128::from(*new_balance) - i128::from(*read.balance),
        }
    }
}

/// A set of row updates that must apply all-or-nothing
///
/// Updates are kept sorted by ascending `AccountId`; stores take row locks in
/// that order.
#[derive(Debug, Clone)]
pub struct MutationBatch {
    mutation_id: MutationId,
    kind: MutationKind,
    updates: Vec<AccountUpdate>,
}

impl MutationBatch {
    pub fn new(mutation_id: MutationId, kind: MutationKind, mut updates: Vec<AccountUpdate>) -> Self {
        updates.sort_by_key(|u| u.account_id);
        Self {
            mutation_id,
            kind,
            updates,
        }
    }

    pub fn mutation_id(&self) -> &MutationId {
        &self.mutation_id
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    /// Updates in lock order
    pub fn updates(&self) -> &[AccountUpdate] {
        &self.updates
    }

    pub fn postings(&self) -> Vec<Posting> {
        self.updates
            .iter()
            .map(|u| Posting {
                account_id: u.account_id,
                delta: u.delta,
            })
            .collect()
    }
}

/// Signed balance change of one account within a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account_id: AccountId,
    pub delta: i128,
}

/// Journal entry written atomically with the rows of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMutation {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    pub postings: Vec<Posting>,
    pub applied_at: DateTime<Utc>,
}

impl AppliedMutation {
    /// Fence entry for `mutation_id`
    pub fn void(mutation_id: MutationId) -> Self {
        Self {
            mutation_id,
            kind: MutationKind::Void,
            postings: Vec::new(),
            applied_at: Utc::now(),
        }
    }

    pub fn is_void(&self) -> bool {
        self.kind == MutationKind::Void
    }

    /// Sum of all postings; zero for every transfer
    pub fn net(&self) -> i128 {
        self.postings.iter().map(|p| p.delta).sum()
    }
}

/// Result of a compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// All rows matched their expected versions and were written
    Applied(AppliedMutation),
    /// The mutation ID is already journaled; nothing was written this time
    AlreadyApplied(AppliedMutation),
    /// At least one row moved on since it was read; nothing was written
    VersionMismatch,
    /// The mutation ID was voided by recovery; nothing was written
    Voided,
}

/// Result of voiding a mutation ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoidOutcome {
    /// Fence written; no swap can apply under this ID until it is cleared
    Voided,
    /// A fence was already in place
    AlreadyVoided,
    /// The swap won the race; money moved
    Applied(AppliedMutation),
}
