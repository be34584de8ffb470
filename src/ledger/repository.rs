use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core_types::{AccountId, TransferId};
use crate::storage::StoreResult;
use crate::transfer::{FailureReason, TransferRecord, TransferStatus};

/// Result of the conditional PENDING insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with this transfer ID already exists; it is returned untouched
    Exists(TransferRecord),
}

/// Transfer record storage
///
/// # Contract
/// - `insert_pending` is a conditional insert: at most one record per transfer ID
/// - `finalize` only moves PENDING to a terminal state; it returns `false`
///   when the record is missing or already terminal
/// - `discard_pending` only removes PENDING records
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &'static str;

    async fn insert_pending(&self, record: &TransferRecord) -> StoreResult<InsertOutcome>;

    async fn finalize(
        &self,
        transfer_id: &TransferId,
        status: TransferStatus,
        completed_at: DateTime<Utc>,
        failure_reason: Option<FailureReason>,
    ) -> StoreResult<bool>;

    async fn discard_pending(&self, transfer_id: &TransferId) -> StoreResult<bool>;

    async fn get(&self, transfer_id: &TransferId) -> StoreResult<Option<TransferRecord>>;

    /// PENDING records created at or before `older_than`, oldest first
    async fn find_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransferRecord>>;

    /// Records where the account is sender or receiver, newest first
    async fn list_for_account(&self, account_id: AccountId) -> StoreResult<Vec<TransferRecord>>;

    /// Every record, for audit
    async fn list_all(&self) -> StoreResult<Vec<TransferRecord>>;
}
