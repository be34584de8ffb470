//! In-memory Ledger Entry Store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::repository::{InsertOutcome, LedgerStore};
use crate::core_types::{AccountId, TransferId};
use crate::storage::StoreResult;
use crate::transfer::{FailureReason, TransferRecord, TransferStatus};

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    records: DashMap<TransferId, TransferRecord>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert_pending(&self, record: &TransferRecord) -> StoreResult<InsertOutcome> {
        match self.records.entry(record.transfer_id.clone()) {
            Entry::Occupied(existing) => Ok(InsertOutcome::Exists(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn finalize(
        &self,
        transfer_id: &TransferId,
        status: TransferStatus,
        completed_at: DateTime<Utc>,
        failure_reason: Option<FailureReason>,
    ) -> StoreResult<bool> {
        let Some(mut record) = self.records.get_mut(transfer_id) else {
            return Ok(false);
        };
        if !record.status.can_transition_to(status) {
            return Ok(false);
        }
        record.status = status;
        record.completed_at = Some(completed_at);
        record.failure_reason = failure_reason;
        Ok(true)
    }

    async fn discard_pending(&self, transfer_id: &TransferId) -> StoreResult<bool> {
        Ok(self
            .records
            .remove_if(transfer_id, |_, r| r.status == TransferStatus::Pending)
            .is_some())
    }

    async fn get(&self, transfer_id: &TransferId) -> StoreResult<Option<TransferRecord>> {
        Ok(self.records.get(transfer_id).map(|r| r.value().clone()))
    }

    async fn find_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransferRecord>> {
        let mut stale: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|r| r.status == TransferStatus::Pending && r.created_at <= older_than)
            .map(|r| r.value().clone())
            .collect();
        stale.sort_by_key(|r| r.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn list_for_account(&self, account_id: AccountId) -> StoreResult<Vec<TransferRecord>> {
        let mut records: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|r| r.sender == account_id || r.receiver == account_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn list_all(&self) -> StoreResult<Vec<TransferRecord>> {
        let mut records: Vec<TransferRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
