//! Integration Tests for the Transfer Engine
//!
//! Drive the engine against in-memory stores wrapped with fault injection:
//! forced version conflicts, failed writes, acknowledgements lost after the
//! write landed, slow writes, writes that outlive their caller, and a ledger
//! record that vanishes mid-flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::account::{
    Account, AccountStore, AppliedMutation, CasOutcome, MemoryAccountStore, MutationBatch,
    MutationId, VoidOutcome,
};
use crate::core_types::{AccountId, TransferId};
use crate::ledger::{InsertOutcome, LedgerStore, MemoryLedgerStore};
use crate::money::Amount;
use crate::storage::{StoreError, StoreResult};
use crate::transfer::{
    FailureReason, RetryPolicy, TransferEngine, TransferError, TransferRecord, TransferRequest,
    TransferStatus,
};

// ============================================================================
// Fault-injecting stores
// ============================================================================

#[derive(Default)]
struct FaultyAccountStore {
    inner: Arc<MemoryAccountStore>,
    cas_count: AtomicUsize,
    /// Next N compare-and-swaps report a version mismatch without writing
    forced_conflicts: AtomicUsize,
    /// Compare-and-swap fails before writing
    fail_cas: AtomicBool,
    /// Compare-and-swap writes, then reports failure
    lose_ack: AtomicBool,
    /// Journal lookups fail
    fail_journal: AtomicBool,
    /// Compare-and-swap sleeps before writing
    slow_cas: AtomicBool,
    /// Compare-and-swap hands the write to a spawned task that lands after
    /// 50ms even if the caller is gone, and acknowledges after 300ms
    detached_write: AtomicBool,
}

impl FaultyAccountStore {
    fn new() -> Self {
        Self::default()
    }

    fn force_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn set_fail_cas(&self, fail: bool) {
        self.fail_cas.store(fail, Ordering::SeqCst);
    }

    fn set_lose_ack(&self, lose: bool) {
        self.lose_ack.store(lose, Ordering::SeqCst);
    }

    fn set_fail_journal(&self, fail: bool) {
        self.fail_journal.store(fail, Ordering::SeqCst);
    }

    fn set_slow_cas(&self, slow: bool) {
        self.slow_cas.store(slow, Ordering::SeqCst);
    }

    fn set_detached_write(&self, detached: bool) {
        self.detached_write.store(detached, Ordering::SeqCst);
    }

    fn cas_count(&self) -> usize {
        self.cas_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for FaultyAccountStore {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn create(&self) -> StoreResult<Account> {
        self.inner.create().await
    }

    async fn get(&self, account_id: AccountId) -> StoreResult<Option<Account>> {
        self.inner.get(account_id).await
    }

    async fn compare_and_swap(&self, batch: &MutationBatch) -> StoreResult<CasOutcome> {
        self.cas_count.fetch_add(1, Ordering::SeqCst);

        if self.slow_cas.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(CasOutcome::VersionMismatch);
        }
        if self.fail_cas.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        if self.detached_write.load(Ordering::SeqCst) {
            let inner = self.inner.clone();
            let batch = batch.clone();
            let write = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                inner.compare_and_swap(&batch).await
            });
            tokio::time::sleep(Duration::from_millis(300)).await;
            return write
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        let outcome = self.inner.compare_and_swap(batch).await?;
        if self.lose_ack.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected lost ack".into()));
        }
        Ok(outcome)
    }

    async fn applied_mutation(
        &self,
        mutation_id: &MutationId,
    ) -> StoreResult<Option<AppliedMutation>> {
        if self.fail_journal.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected journal failure".into()));
        }
        self.inner.applied_mutation(mutation_id).await
    }

    async fn void_mutation(&self, mutation_id: &MutationId) -> StoreResult<VoidOutcome> {
        if self.fail_journal.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected journal failure".into()));
        }
        self.inner.void_mutation(mutation_id).await
    }

    async fn clear_void(&self, mutation_id: &MutationId) -> StoreResult<bool> {
        self.inner.clear_void(mutation_id).await
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        self.inner.list_accounts().await
    }

    async fn list_mutations(&self) -> StoreResult<Vec<AppliedMutation>> {
        self.inner.list_mutations().await
    }
}

/// Ledger whose PENDING record disappears right before the next finalize,
/// as if a recovery scan had discarded it concurrently
#[derive(Default)]
struct VanishingLedger {
    inner: MemoryLedgerStore,
    vanish_next_finalize: AtomicBool,
}

#[async_trait]
impl LedgerStore for VanishingLedger {
    fn name(&self) -> &'static str {
        "vanishing"
    }

    async fn insert_pending(&self, record: &TransferRecord) -> StoreResult<InsertOutcome> {
        self.inner.insert_pending(record).await
    }

    async fn finalize(
        &self,
        transfer_id: &TransferId,
        status: TransferStatus,
        completed_at: DateTime<Utc>,
        failure_reason: Option<FailureReason>,
    ) -> StoreResult<bool> {
        if self.vanish_next_finalize.swap(false, Ordering::SeqCst) {
            self.inner.discard_pending(transfer_id).await?;
        }
        self.inner
            .finalize(transfer_id, status, completed_at, failure_reason)
            .await
    }

    async fn discard_pending(&self, transfer_id: &TransferId) -> StoreResult<bool> {
        self.inner.discard_pending(transfer_id).await
    }

    async fn get(&self, transfer_id: &TransferId) -> StoreResult<Option<TransferRecord>> {
        self.inner.get(transfer_id).await
    }

    async fn find_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransferRecord>> {
        self.inner.find_pending(older_than, limit).await
    }

    async fn list_for_account(&self, account_id: AccountId) -> StoreResult<Vec<TransferRecord>> {
        self.inner.list_for_account(account_id).await
    }

    async fn list_all(&self) -> StoreResult<Vec<TransferRecord>> {
        self.inner.list_all().await
    }
}

// ============================================================================
// Harness
// ============================================================================

struct TestHarness {
    engine: TransferEngine,
    accounts: Arc<FaultyAccountStore>,
    ledger: Arc<MemoryLedgerStore>,
}

impl TestHarness {
    fn new() -> Self {
        let accounts = Arc::new(FaultyAccountStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let engine = TransferEngine::new(accounts.clone(), ledger.clone())
            .with_retry(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO));
        Self {
            engine,
            accounts,
            ledger,
        }
    }

    async fn funded_pair(&self, balance: u64) -> (AccountId, AccountId) {
        let a = self.engine.create_account().await.unwrap();
        let b = self.engine.create_account().await.unwrap();
        self.engine.deposit(a, Amount::new(balance)).await.unwrap();
        (a, b)
    }

    async fn balance(&self, id: AccountId) -> u64 {
        self.engine.get_balance(id).await.unwrap().minor_units()
    }

    async fn record(&self, id: &str) -> Option<TransferRecord> {
        self.ledger.get(&TransferId::new(id).unwrap()).await.unwrap()
    }
}

fn request(id: &str, sender: AccountId, receiver: AccountId, amount: u64) -> TransferRequest {
    TransferRequest::new(TransferId::new(id).unwrap(), sender, receiver, amount)
}

// ============================================================================
// Version conflicts
// ============================================================================

/// Test: two lost races, third attempt wins
#[tokio::test]
async fn test_conflicts_then_success() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;
    let writes_before = h.accounts.cas_count();

    h.accounts.force_conflicts(2);
    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(h.accounts.cas_count() - writes_before, 3);
    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));
}

/// Test: retries exhausted → retriable error, no record, nothing moved
#[tokio::test]
async fn test_conflicts_exhaust_retries() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.force_conflicts(10);
    let err = h.engine.transfer(request("t1", a, b, 30)).await.unwrap_err();

    assert!(matches!(
        err,
        TransferError::ConcurrentUpdateConflict { attempts: 3 }
    ));
    assert!(err.is_retriable());
    assert!(h.record("t1").await.is_none());
    assert_eq!((h.balance(a).await, h.balance(b).await), (100, 0));

    // Same key restarts cleanly once contention clears
    h.accounts.force_conflicts(0);
    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));
}

// ============================================================================
// Storage failures
// ============================================================================

/// Test: write rejected before landing → storage error, record discarded
#[tokio::test]
async fn test_write_failure_discards_pending() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_fail_cas(true);
    let err = h.engine.transfer(request("t1", a, b, 30)).await.unwrap_err();
    assert!(matches!(err, TransferError::Storage(_)));
    assert!(!err.is_retriable());
    assert!(h.record("t1").await.is_none());
    assert_eq!(h.balance(a).await, 100);

    h.accounts.set_fail_cas(false);
    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(outcome.is_completed());
}

/// Test: write landed but the ack was lost → journal says applied → COMPLETED
#[tokio::test]
async fn test_lost_ack_resolved_from_journal() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_lose_ack(true);
    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    h.accounts.set_lose_ack(false);

    assert!(outcome.is_completed());
    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));

    let journal = h
        .accounts
        .applied_mutation(&MutationId::from_raw("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.completed_at, Some(journal.applied_at));

    // Replay does not move money again
    let replay = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert_eq!(replay, outcome);
    assert_eq!(h.balance(a).await, 70);
}

// ============================================================================
// Recovery
// ============================================================================

/// Test: write failed and journal unreachable → PENDING until recovery discards it
#[tokio::test]
async fn test_unknown_write_left_pending_then_discarded() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_fail_cas(true);
    h.accounts.set_fail_journal(true);
    let err = h.engine.transfer(request("t1", a, b, 30)).await.unwrap_err();
    assert!(matches!(err, TransferError::Storage(_)));
    assert_eq!(
        h.record("t1").await.map(|r| r.status),
        Some(TransferStatus::Pending)
    );

    h.accounts.set_fail_cas(false);
    h.accounts.set_fail_journal(false);

    // Durable PENDING blocks the key
    let err = h.engine.transfer(request("t1", a, b, 30)).await.unwrap_err();
    assert!(matches!(err, TransferError::AlreadyInProgress(_)));

    let report = h
        .engine
        .recover_pending(Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!((report.scanned, report.discarded), (1, 1));
    assert!(h.record("t1").await.is_none());

    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));
}

/// Test: write landed, ack lost, journal unreachable → recovery completes it
#[tokio::test]
async fn test_applied_write_recovered_as_completed() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_lose_ack(true);
    h.accounts.set_fail_journal(true);
    assert!(h.engine.transfer(request("t1", a, b, 30)).await.is_err());
    h.accounts.set_lose_ack(false);
    h.accounts.set_fail_journal(false);

    // Money moved, record still PENDING; the audit sees it as in-flight
    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));
    let audit = h.engine.audit().await.unwrap();
    assert!(audit.is_conserved(), "{:?}", audit.violations);
    assert_eq!(audit.awaiting_recovery, 1);

    let report = h
        .engine
        .recover_pending(Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!((report.completed, report.discarded), (1, 0));

    let record = h.record("t1").await.unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    let journal = h
        .accounts
        .applied_mutation(&MutationId::from_raw("t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.completed_at, Some(journal.applied_at));

    // Replay returns the recovered outcome without a second debit
    let replay = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(replay.is_completed());
    assert_eq!(h.balance(a).await, 70);
    assert!(h.engine.audit().await.unwrap().is_conserved());
}

/// Test: caller drops the future mid-write → key released, record recoverable
#[tokio::test]
async fn test_cancelled_transfer_recoverable() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_slow_cas(true);
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        h.engine.transfer(request("t1", a, b, 30)),
    )
    .await;
    assert!(cancelled.is_err());
    h.accounts.set_slow_cas(false);

    assert_eq!(
        h.record("t1").await.map(|r| r.status),
        Some(TransferStatus::Pending)
    );
    assert_eq!(h.balance(a).await, 100);

    let report = h
        .engine
        .recover_pending(Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(report.discarded, 1);

    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.balance(a).await, 70);
}

/// Test: recovery runs while an abandoned write is still in flight → the
/// void fences the write out, so discarding the record loses nothing
#[tokio::test]
async fn test_recovery_fences_in_flight_write() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_detached_write(true);
    let (abandoned, report) = tokio::join!(
        tokio::time::timeout(
            Duration::from_millis(200),
            h.engine.transfer(request("t1", a, b, 30)),
        ),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.engine.recover_pending(Duration::ZERO, 10).await.unwrap()
        }
    );
    assert!(abandoned.is_err());
    assert_eq!((report.scanned, report.discarded), (1, 1));

    // Let the detached write reach the store
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.accounts.set_detached_write(false);

    assert_eq!((h.balance(a).await, h.balance(b).await), (100, 0));
    assert!(h.record("t1").await.is_none());
    let audit = h.engine.audit().await.unwrap();
    assert!(audit.is_conserved(), "{:?}", audit.violations);

    // Resubmission lifts the void and moves the money once
    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));
    assert!(h.engine.audit().await.unwrap().is_conserved());
}

/// Test: recovery runs after an abandoned write landed → record COMPLETED
#[tokio::test]
async fn test_recovery_completes_landed_write() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_detached_write(true);
    let (abandoned, report) = tokio::join!(
        tokio::time::timeout(
            Duration::from_millis(200),
            h.engine.transfer(request("t1", a, b, 30)),
        ),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.engine.recover_pending(Duration::ZERO, 10).await.unwrap()
        }
    );
    h.accounts.set_detached_write(false);
    assert!(abandoned.is_err());
    assert_eq!((report.scanned, report.completed), (1, 1));

    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));
    assert_eq!(
        h.record("t1").await.map(|r| r.status),
        Some(TransferStatus::Completed)
    );
    let audit = h.engine.audit().await.unwrap();
    assert!(audit.is_conserved(), "{:?}", audit.violations);
}

/// Test: a caller still waiting when recovery voids its write gets a
/// retriable error and no record is left behind
#[tokio::test]
async fn test_voided_caller_sees_retriable_conflict() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    h.accounts.set_detached_write(true);
    let (result, _) = tokio::join!(h.engine.transfer(request("t1", a, b, 30)), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.engine.recover_pending(Duration::ZERO, 10).await.unwrap()
    });
    h.accounts.set_detached_write(false);

    let err = result.unwrap_err();
    assert!(err.is_retriable(), "{:?}", err);
    assert!(h.record("t1").await.is_none());
    assert_eq!(h.balance(a).await, 100);

    let outcome = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(outcome.is_completed());
}

/// Test: record discarded by a concurrent scan after the write → re-inserted
#[tokio::test]
async fn test_record_reinserted_after_concurrent_discard() {
    let accounts = Arc::new(MemoryAccountStore::new());
    let ledger = Arc::new(VanishingLedger::default());
    let engine = TransferEngine::new(accounts.clone(), ledger.clone());

    let a = engine.create_account().await.unwrap();
    let b = engine.create_account().await.unwrap();
    engine.deposit(a, Amount::new(100)).await.unwrap();

    ledger.vanish_next_finalize.store(true, Ordering::SeqCst);
    let outcome = engine.transfer(request("t1", a, b, 30)).await.unwrap();
    assert!(outcome.is_completed());

    let record = ledger
        .get(&TransferId::new("t1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    assert!(engine.audit().await.unwrap().is_conserved());
}

// ============================================================================
// Reference scenarios
// ============================================================================

/// Test: balance 50, transfer 60 → FAILED, nothing moved
#[tokio::test]
async fn test_insufficient_funds_scenario() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(50).await;

    let outcome = h.engine.transfer(request("t1", a, b, 60)).await.unwrap();
    assert_eq!(outcome.status, TransferStatus::Failed);
    assert_eq!(outcome.failure_reason, Some(FailureReason::InsufficientFunds));
    assert_eq!((h.balance(a).await, h.balance(b).await), (50, 0));

    let record = h.record("t1").await.unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert!(record.completed_at.is_some());
}

/// Test: t1 moves 30 of 100; resubmitting t1 is a no-op
#[tokio::test]
async fn test_idempotent_resubmission_scenario() {
    let h = TestHarness::new();
    let (a, b) = h.funded_pair(100).await;

    let first = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();
    let writes = h.accounts.cas_count();
    let second = h.engine.transfer(request("t1", a, b, 30)).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.accounts.cas_count(), writes);
    assert_eq!((h.balance(a).await, h.balance(b).await), (70, 30));
}
