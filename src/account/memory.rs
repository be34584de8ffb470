//! In-memory Account Store
//!
//! One mutex per row; a batch locks its rows in ascending `AccountId` order,
//! so batches over disjoint accounts never contend and overlapping batches
//! cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::models::{
    Account, AppliedMutation, CasOutcome, MutationBatch, MutationId, VoidOutcome,
};
use super::repository::AccountStore;
use crate::core_types::AccountId;
use crate::storage::{StoreError, StoreResult};

type Row = Arc<Mutex<Account>>;

#[derive(Default)]
pub struct MemoryAccountStore {
    rows: RwLock<HashMap<AccountId, Row>>,
    journal: DashMap<MutationId, AppliedMutation>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, account_id: AccountId) -> StoreResult<Option<Row>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| StoreError::Poisoned("account rows"))?;
        Ok(rows.get(&account_id).cloned())
    }

    /// Synchronous body of `compare_and_swap`; no guard outlives this call
    fn apply_batch(&self, batch: &MutationBatch) -> StoreResult<CasOutcome> {
        // Resolve row handles first, then lock in batch (ascending) order
        let mut handles = Vec::with_capacity(batch.updates().len());
        for update in batch.updates() {
            match self.row(update.account_id)? {
                Some(row) => handles.push(row),
                None => {
                    return Err(StoreError::Corrupt(format!(
                        "account {} vanished",
                        update.account_id
                    )));
                }
            }
        }

        let mut guards: Vec<MutexGuard<'_, Account>> = Vec::with_capacity(handles.len());
        for handle in &handles {
            guards.push(
                handle
                    .lock()
                    .map_err(|_| StoreError::Poisoned("account row"))?,
            );
        }

        let slot = match self.journal.entry(batch.mutation_id().clone()) {
            Entry::Occupied(existing) if existing.get().is_void() => {
                debug!(mutation_id = %batch.mutation_id(), "Mutation voided");
                return Ok(CasOutcome::Voided);
            }
            Entry::Occupied(existing) => {
                debug!(mutation_id = %batch.mutation_id(), "Mutation already applied");
                return Ok(CasOutcome::AlreadyApplied(existing.get().clone()));
            }
            Entry::Vacant(slot) => slot,
        };

        let stale = batch
            .updates()
            .iter()
            .zip(guards.iter())
            .any(|(update, row)| row.version != update.expected_version);
        if stale {
            return Ok(CasOutcome::VersionMismatch);
        }

        let now = Utc::now();
        for (update, row) in batch.updates().iter().zip(guards.iter_mut()) {
            row.balance = update.new_balance;
            row.version += 1;
            row.updated_at = now;
        }

        let applied = AppliedMutation {
            mutation_id: batch.mutation_id().clone(),
            kind: batch.kind(),
            postings: batch.postings(),
            applied_at: now,
        };
        slot.insert(applied.clone());

        Ok(CasOutcome::Applied(applied))
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self) -> StoreResult<Account> {
        let account = Account::new(AccountId::generate());
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StoreError::Poisoned("account rows"))?;
        rows.insert(account.account_id, Arc::new(Mutex::new(account.clone())));
        Ok(account)
    }

    async fn get(&self, account_id: AccountId) -> StoreResult<Option<Account>> {
        match self.row(account_id)? {
            Some(row) => {
                let account = row
                    .lock()
                    .map_err(|_| StoreError::Poisoned("account row"))?
                    .clone();
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    async fn compare_and_swap(&self, batch: &MutationBatch) -> StoreResult<CasOutcome> {
        self.apply_batch(batch)
    }

    async fn applied_mutation(
        &self,
        mutation_id: &MutationId,
    ) -> StoreResult<Option<AppliedMutation>> {
        Ok(self
            .journal
            .get(mutation_id)
            .filter(|m| !m.is_void())
            .map(|m| m.value().clone()))
    }

    async fn void_mutation(&self, mutation_id: &MutationId) -> StoreResult<VoidOutcome> {
        // Same journal slot a swap takes while its rows are locked
        Ok(match self.journal.entry(mutation_id.clone()) {
            Entry::Occupied(existing) if existing.get().is_void() => VoidOutcome::AlreadyVoided,
            Entry::Occupied(existing) => VoidOutcome::Applied(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(AppliedMutation::void(mutation_id.clone()));
                VoidOutcome::Voided
            }
        })
    }

    async fn clear_void(&self, mutation_id: &MutationId) -> StoreResult<bool> {
        Ok(self
            .journal
            .remove_if(mutation_id, |_, m| m.is_void())
            .is_some())
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let handles: Vec<Row> = {
            let rows = self
                .rows
                .read()
                .map_err(|_| StoreError::Poisoned("account rows"))?;
            rows.values().cloned().collect()
        };

        let mut accounts = Vec::with_capacity(handles.len());
        for handle in handles {
            accounts.push(
                handle
                    .lock()
                    .map_err(|_| StoreError::Poisoned("account row"))?
                    .clone(),
            );
        }
        accounts.sort_by_key(|a| a.account_id);
        Ok(accounts)
    }

    async fn list_mutations(&self) -> StoreResult<Vec<AppliedMutation>> {
        let mut mutations: Vec<AppliedMutation> = self
            .journal
            .iter()
            .filter(|m| !m.is_void())
            .map(|m| m.value().clone())
            .collect();
        mutations.sort_by(|a, b| a.applied_at.cmp(&b.applied_at));
        Ok(mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::models::{AccountUpdate, MutationKind};
    use crate::money::Amount;

    async fn funded(store: &MemoryAccountStore, balance: u64) -> Account {
        let account = store.create().await.unwrap();
        let batch = MutationBatch::new(
            MutationId::adjustment(),
            MutationKind::Deposit,
            vec![AccountUpdate::from_read(&account, Amount::new(balance))],
        );
        store.compare_and_swap(&batch).await.unwrap();
        store.get(account.account_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryAccountStore::new();
        let account = store.create().await.unwrap();
        let fetched = store.get(account.account_id).await.unwrap().unwrap();
        assert_eq!(fetched.balance, Amount::ZERO);
        assert_eq!(fetched.version, 0);

        assert!(store.get(AccountId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_applies_both_rows_and_bumps_versions() {
        let store = MemoryAccountStore::new();
        let a = funded(&store, 100).await;
        let b = store.create().await.unwrap();

        let batch = MutationBatch::new(
            MutationId::from_raw("t1"),
            MutationKind::Transfer,
            vec![
                AccountUpdate::from_read(&a, Amount::new(70)),
                AccountUpdate::from_read(&b, Amount::new(30)),
            ],
        );
        let outcome = store.compare_and_swap(&batch).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Applied(ref m) if m.net() == 0));

        let a2 = store.get(a.account_id).await.unwrap().unwrap();
        let b2 = store.get(b.account_id).await.unwrap().unwrap();
        assert_eq!((a2.balance, a2.version), (Amount::new(70), a.version + 1));
        assert_eq!((b2.balance, b2.version), (Amount::new(30), b.version + 1));
    }

    #[tokio::test]
    async fn test_cas_stale_version_writes_nothing() {
        let store = MemoryAccountStore::new();
        let a = funded(&store, 100).await;
        let b = store.create().await.unwrap();

        // b moves on after being read
        let bump = MutationBatch::new(
            MutationId::adjustment(),
            MutationKind::Deposit,
            vec![AccountUpdate::from_read(&b, Amount::new(5))],
        );
        store.compare_and_swap(&bump).await.unwrap();

        let batch = MutationBatch::new(
            MutationId::from_raw("t1"),
            MutationKind::Transfer,
            vec![
                AccountUpdate::from_read(&a, Amount::new(70)),
                AccountUpdate::from_read(&b, Amount::new(30)),
            ],
        );
        assert_eq!(
            store.compare_and_swap(&batch).await.unwrap(),
            CasOutcome::VersionMismatch
        );

        // a untouched even though its own version matched
        let a2 = store.get(a.account_id).await.unwrap().unwrap();
        assert_eq!(a2, a);
        assert!(
            store
                .applied_mutation(&MutationId::from_raw("t1"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_cas_replay_is_idempotent() {
        let store = MemoryAccountStore::new();
        let a = funded(&store, 100).await;
        let b = store.create().await.unwrap();

        let batch = MutationBatch::new(
            MutationId::from_raw("t1"),
            MutationKind::Transfer,
            vec![
                AccountUpdate::from_read(&a, Amount::new(70)),
                AccountUpdate::from_read(&b, Amount::new(30)),
            ],
        );
        store.compare_and_swap(&batch).await.unwrap();
        let replay = store.compare_and_swap(&batch).await.unwrap();
        assert!(matches!(replay, CasOutcome::AlreadyApplied(_)));

        let a2 = store.get(a.account_id).await.unwrap().unwrap();
        assert_eq!(a2.balance, Amount::new(70));
        assert_eq!(store.list_mutations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_void_blocks_later_swap() {
        let store = MemoryAccountStore::new();
        let a = funded(&store, 100).await;
        let b = store.create().await.unwrap();
        let id = MutationId::from_raw("t1");

        assert_eq!(store.void_mutation(&id).await.unwrap(), VoidOutcome::Voided);
        assert_eq!(
            store.void_mutation(&id).await.unwrap(),
            VoidOutcome::AlreadyVoided
        );

        let batch = MutationBatch::new(
            id.clone(),
            MutationKind::Transfer,
            vec![
                AccountUpdate::from_read(&a, Amount::new(70)),
                AccountUpdate::from_read(&b, Amount::new(30)),
            ],
        );
        assert_eq!(
            store.compare_and_swap(&batch).await.unwrap(),
            CasOutcome::Voided
        );
        assert_eq!(store.get(a.account_id).await.unwrap().unwrap(), a);
        assert!(store.applied_mutation(&id).await.unwrap().is_none());
        assert_eq!(store.list_mutations().await.unwrap().len(), 1);

        // Cleared fence lets the same ID apply
        assert!(store.clear_void(&id).await.unwrap());
        assert!(matches!(
            store.compare_and_swap(&batch).await.unwrap(),
            CasOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn test_void_after_swap_reports_applied() {
        let store = MemoryAccountStore::new();
        let a = funded(&store, 100).await;
        let b = store.create().await.unwrap();
        let id = MutationId::from_raw("t1");

        let batch = MutationBatch::new(
            id.clone(),
            MutationKind::Transfer,
            vec![
                AccountUpdate::from_read(&a, Amount::new(70)),
                AccountUpdate::from_read(&b, Amount::new(30)),
            ],
        );
        store.compare_and_swap(&batch).await.unwrap();

        assert!(matches!(
            store.void_mutation(&id).await.unwrap(),
            VoidOutcome::Applied(m) if m.net() == 0
        ));
        assert!(!store.clear_void(&id).await.unwrap());
        assert!(store.applied_mutation(&id).await.unwrap().is_some());
    }
}
