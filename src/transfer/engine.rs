//! Transfer Engine
//!
//! Drives one transfer from request to terminal outcome:
//!
//! ```text
//! validate ─▶ reserve key ─▶ insert PENDING ─▶ read rows ─▶ guard ─▶ CAS
//!                                                 ▲                   │
//!                                                 └── version race ◀──┘
//! ```
//!
//! The engine never holds a lock across an await; contention is resolved by
//! the store's compare-and-swap and the bounded retry loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::idempotency::{IdempotencyIndex, Reservation};
use super::retry::RetryPolicy;
use super::state::TransferStatus;
use super::types::{FailureReason, TransferOutcome, TransferRecord, TransferRequest};
use crate::account::{
    Account, AccountStore, AccountUpdate, CasOutcome, MutationBatch, MutationId, MutationKind,
    VoidOutcome,
};
use crate::audit::{self, ConservationReport};
use crate::balance::{BalanceGuard, GuardError};
use crate::core_types::{AccountId, TransferId};
use crate::ledger::{InsertOutcome, LedgerStore};
use crate::money::Amount;
use crate::storage::StoreError;

/// Outcome of one read-guard-CAS round
enum Attempt {
    Applied(DateTime<Utc>),
    Rejected(FailureReason),
    Conflict,
    /// Recovery fenced the mutation ID; the record is being discarded
    Voided,
}

/// Direction of an external balance adjustment
#[derive(Debug, Clone, Copy)]
enum Adjustment {
    Deposit,
    Withdrawal,
}

impl Adjustment {
    fn kind(self) -> MutationKind {
        match self {
            Adjustment::Deposit => MutationKind::Deposit,
            Adjustment::Withdrawal => MutationKind::Withdrawal,
        }
    }

    fn apply(self, current: Amount, amount: Amount) -> Result<Amount, GuardError> {
        match self {
            Adjustment::Deposit => BalanceGuard::compute_credit(current, amount),
            Adjustment::Withdrawal => BalanceGuard::compute_debit(current, amount),
        }
    }
}

/// Result of a recovery scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    /// Mutation was journaled; record finalized COMPLETED
    pub completed: usize,
    /// Mutation never applied; PENDING record removed
    pub discarded: usize,
    pub errors: usize,
}

impl RecoveryReport {
    pub fn resolved(&self) -> usize {
        self.completed + self.discarded
    }
}

pub struct TransferEngine {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn LedgerStore>,
    index: IdempotencyIndex,
    retry: RetryPolicy,
    currency_decimals: u32,
}

impl TransferEngine {
    pub fn new(accounts: Arc<dyn AccountStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            accounts,
            ledger,
            index: IdempotencyIndex::new(),
            retry: RetryPolicy::default(),
            currency_decimals: 2,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cap on terminal outcomes cached for replays
    pub fn with_idempotency_capacity(mut self, capacity: usize) -> Self {
        self.index = IdempotencyIndex::with_capacity(capacity);
        self
    }

    pub fn with_currency_decimals(mut self, decimals: u32) -> Self {
        self.currency_decimals = decimals;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn currency_decimals(&self) -> u32 {
        self.currency_decimals
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub async fn create_account(&self) -> Result<AccountId, TransferError> {
        let account = self.accounts.create().await?;
        info!(account_id = %account.account_id, store = self.accounts.name(), "Account created");
        Ok(account.account_id)
    }

    /// Latest committed balance; may be stale, never torn
    pub async fn get_balance(&self, account_id: AccountId) -> Result<Amount, TransferError> {
        self.accounts
            .get(account_id)
            .await?
            .map(|a| a.balance)
            .ok_or(TransferError::AccountNotFound(account_id))
    }

    /// External credit. Returns the new balance.
    pub async fn deposit(
        &self,
        account_id: AccountId,
        amount: Amount,
    ) -> Result<Amount, TransferError> {
        self.adjust(account_id, amount, Adjustment::Deposit).await
    }

    /// External debit. Returns the new balance.
    pub async fn withdraw(
        &self,
        account_id: AccountId,
        amount: Amount,
    ) -> Result<Amount, TransferError> {
        self.adjust(account_id, amount, Adjustment::Withdrawal)
            .await
    }

    /// Deposit a decimal amount in major units, e.g. `12.34`
    pub async fn deposit_decimal(
        &self,
        account_id: AccountId,
        amount: rust_decimal::Decimal,
    ) -> Result<Amount, TransferError> {
        let minor = BalanceGuard::validate_decimal(amount, self.currency_decimals)
            .map_err(|_| TransferError::InvalidAmount)?;
        self.deposit(account_id, minor).await
    }

    async fn adjust(
        &self,
        account_id: AccountId,
        amount: Amount,
        direction: Adjustment,
    ) -> Result<Amount, TransferError> {
        BalanceGuard::validate_amount(amount).map_err(|_| TransferError::InvalidAmount)?;

        let kind = direction.kind();
        let mutation_id = MutationId::adjustment();
        let mut attempt = 0;
        loop {
            attempt += 1;

            let account = match self.accounts.get(account_id).await {
                Ok(Some(account)) => account,
                Ok(None) => return Err(TransferError::AccountNotFound(account_id)),
                Err(e) => return Err(e.into()),
            };
            let new_balance = direction
                .apply(account.balance, amount)
                .map_err(guard_error)?;

            let batch = MutationBatch::new(
                mutation_id.clone(),
                kind,
                vec![AccountUpdate::from_read(&account, new_balance)],
            );
            match self.accounts.compare_and_swap(&batch).await {
                Ok(CasOutcome::Applied(_)) | Ok(CasOutcome::AlreadyApplied(_)) => {
                    info!(
                        account_id = %account_id,
                        kind = %kind,
                        amount = %amount,
                        balance = %new_balance,
                        "Balance adjusted"
                    );
                    return Ok(new_balance);
                }
                // Adjustment IDs are fresh; nothing ever voids them
                Ok(CasOutcome::Voided) => {
                    return Err(TransferError::Storage(format!(
                        "adjustment {} unexpectedly voided",
                        mutation_id
                    )));
                }
                Ok(CasOutcome::VersionMismatch) => {
                    if attempt >= self.retry.max_attempts {
                        warn!(account_id = %account_id, attempts = attempt, "Adjustment retries exhausted");
                        return Err(TransferError::ConcurrentUpdateConflict { attempts: attempt });
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                }
                Err(e) => {
                    // The write may have landed before the error surfaced
                    return match self.accounts.applied_mutation(&mutation_id).await {
                        Ok(Some(_)) => Ok(new_balance),
                        _ => Err(e.into()),
                    };
                }
            }
        }
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Move `amount` from sender to receiver, exactly once per transfer ID
    ///
    /// Business-rule rejections come back as `Ok` with a FAILED outcome.
    pub async fn transfer(
        &self,
        request: TransferRequest,
    ) -> Result<TransferOutcome, TransferError> {
        if request.sender == request.receiver {
            return Err(TransferError::InvalidTransfer(request.sender));
        }
        // No store can persist an amount above the balance ceiling, so it is
        // rejected before anything is written. Zero is recorded FAILED below.
        if let Err(GuardError::BalanceOverflow) = BalanceGuard::validate_amount(request.amount) {
            return Err(TransferError::InvalidAmount);
        }

        let guard = match self.index.check_or_reserve(&request)? {
            Reservation::AlreadyCompleted(outcome) => {
                debug!(transfer_id = %request.transfer_id, status = %outcome.status, "Idempotent replay");
                return Ok(outcome);
            }
            Reservation::AlreadyInProgress => {
                return Err(TransferError::AlreadyInProgress(request.transfer_id));
            }
            Reservation::Reserved(guard) => guard,
        };

        // Dropping the guard on any error path releases the key
        let outcome = self.execute(&request).await?;
        guard.commit(outcome.clone())?;
        Ok(outcome)
    }

    /// Convenience wrapper: system-generated transfer ID, decimal amount
    pub async fn transfer_decimal(
        &self,
        sender: AccountId,
        receiver: AccountId,
        amount: rust_decimal::Decimal,
    ) -> Result<TransferOutcome, TransferError> {
        let amount = BalanceGuard::validate_decimal(amount, self.currency_decimals)
            .map_err(|_| TransferError::InvalidAmount)?;
        self.transfer(TransferRequest::new(
            TransferId::generate(),
            sender,
            receiver,
            amount,
        ))
        .await
    }

    async fn execute(&self, request: &TransferRequest) -> Result<TransferOutcome, TransferError> {
        let transfer_id = &request.transfer_id;

        match self
            .ledger
            .insert_pending(&TransferRecord::pending(request))
            .await?
        {
            InsertOutcome::Inserted => {
                debug!(transfer_id = %transfer_id, amount = %request.amount, "Transfer PENDING");
            }
            InsertOutcome::Exists(existing) => return adopt_existing(request, existing),
        }

        // A void left by recovery of an earlier attempt under this ID; the
        // fresh PENDING record now owns the ID
        let mutation_id = MutationId::from(transfer_id);
        match self.accounts.clear_void(&mutation_id).await {
            Ok(true) => debug!(transfer_id = %transfer_id, "Cleared void from earlier attempt"),
            Ok(false) => {}
            Err(e) => {
                self.discard(transfer_id).await;
                return Err(e.into());
            }
        }

        if BalanceGuard::validate_amount(request.amount).is_err() {
            return self
                .finalize(request, TransferStatus::Failed, Utc::now(), Some(FailureReason::InvalidAmount))
                .await;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(request, &mutation_id).await {
                Ok(Attempt::Applied(applied_at)) => {
                    return self
                        .finalize(request, TransferStatus::Completed, applied_at, None)
                        .await;
                }
                Ok(Attempt::Rejected(reason)) => {
                    return self
                        .finalize(request, TransferStatus::Failed, Utc::now(), Some(reason))
                        .await;
                }
                Ok(Attempt::Conflict) => {
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            transfer_id = %transfer_id,
                            attempts = attempt,
                            "Version conflict retries exhausted"
                        );
                        self.discard(transfer_id).await;
                        return Err(TransferError::ConcurrentUpdateConflict { attempts: attempt });
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        transfer_id = %transfer_id,
                        attempt,
                        delay_us = delay.as_micros() as u64,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Attempt::Voided) => {
                    warn!(transfer_id = %transfer_id, attempts = attempt, "Voided by recovery mid-flight");
                    self.discard(transfer_id).await;
                    return Err(TransferError::ConcurrentUpdateConflict { attempts: attempt });
                }
                Err(e) => return self.resolve_store_failure(request, &mutation_id, e).await,
            }
        }
    }

    /// Read both rows in lock order, run the guard, submit one CAS
    async fn attempt(
        &self,
        request: &TransferRequest,
        mutation_id: &MutationId,
    ) -> Result<Attempt, StoreError> {
        let (first, second) = if request.sender < request.receiver {
            (request.sender, request.receiver)
        } else {
            (request.receiver, request.sender)
        };
        let first_row = self.accounts.get(first).await?;
        let second_row = self.accounts.get(second).await?;

        let (Some(first_row), Some(second_row)) = (first_row, second_row) else {
            return Ok(Attempt::Rejected(FailureReason::AccountNotFound));
        };
        let (sender, receiver): (&Account, &Account) = if first_row.account_id == request.sender {
            (&first_row, &second_row)
        } else {
            (&second_row, &first_row)
        };

        let new_sender = match BalanceGuard::compute_debit(sender.balance, request.amount) {
            Ok(v) => v,
            Err(e) => return Ok(Attempt::Rejected(e.into())),
        };
        let new_receiver = match BalanceGuard::compute_credit(receiver.balance, request.amount) {
            Ok(v) => v,
            Err(e) => return Ok(Attempt::Rejected(e.into())),
        };

        let batch = MutationBatch::new(
            mutation_id.clone(),
            MutationKind::Transfer,
            vec![
                AccountUpdate::from_read(sender, new_sender),
                AccountUpdate::from_read(receiver, new_receiver),
            ],
        );
        Ok(match self.accounts.compare_and_swap(&batch).await? {
            CasOutcome::Applied(m) => Attempt::Applied(m.applied_at),
            CasOutcome::AlreadyApplied(m) => {
                debug!(transfer_id = %request.transfer_id, "Mutation already journaled");
                Attempt::Applied(m.applied_at)
            }
            CasOutcome::VersionMismatch => Attempt::Conflict,
            CasOutcome::Voided => Attempt::Voided,
        })
    }

    /// A store call failed mid-transfer; void the mutation ID to learn
    /// whether money moved and to keep a late write from landing
    async fn resolve_store_failure(
        &self,
        request: &TransferRequest,
        mutation_id: &MutationId,
        cause: StoreError,
    ) -> Result<TransferOutcome, TransferError> {
        let transfer_id = &request.transfer_id;
        error!(transfer_id = %transfer_id, error = %cause, "Store failure during transfer");

        match self.accounts.void_mutation(mutation_id).await {
            Ok(VoidOutcome::Applied(applied)) => {
                info!(transfer_id = %transfer_id, "Mutation applied despite store failure");
                self.finalize(request, TransferStatus::Completed, applied.applied_at, None)
                    .await
            }
            Ok(VoidOutcome::Voided | VoidOutcome::AlreadyVoided) => {
                self.discard(transfer_id).await;
                Err(cause.into())
            }
            Err(void_err) => {
                warn!(
                    transfer_id = %transfer_id,
                    error = %void_err,
                    "Cannot tell whether mutation applied, leaving PENDING for recovery"
                );
                Err(cause.into())
            }
        }
    }

    /// Move the record to its terminal state
    ///
    /// If recovery removed the PENDING record while this attempt was in
    /// flight, the record is re-inserted so the outcome stays durable.
    async fn finalize(
        &self,
        request: &TransferRequest,
        status: TransferStatus,
        completed_at: DateTime<Utc>,
        reason: Option<FailureReason>,
    ) -> Result<TransferOutcome, TransferError> {
        let transfer_id = &request.transfer_id;

        if !self
            .ledger
            .finalize(transfer_id, status, completed_at, reason)
            .await?
        {
            warn!(transfer_id = %transfer_id, status = %status, "Record changed underneath, reconciling");
            if let InsertOutcome::Inserted = self
                .ledger
                .insert_pending(&TransferRecord::pending(request))
                .await?
            {
                self.ledger
                    .finalize(transfer_id, status, completed_at, reason)
                    .await?;
            }
            return match self.ledger.get(transfer_id).await?.and_then(|r| r.outcome()) {
                Some(outcome) => Ok(outcome),
                None => Err(TransferError::AlreadyInProgress(transfer_id.clone())),
            };
        }

        match reason {
            None => info!(
                transfer_id = %transfer_id,
                sender = %request.sender,
                receiver = %request.receiver,
                amount = %request.amount,
                "Transfer COMPLETED"
            ),
            Some(reason) => info!(
                transfer_id = %transfer_id,
                reason = %reason,
                "Transfer FAILED"
            ),
        }

        Ok(TransferOutcome {
            transfer_id: transfer_id.clone(),
            status,
            completed_at: Some(completed_at),
            failure_reason: reason,
        })
    }

    async fn discard(&self, transfer_id: &TransferId) {
        if let Err(e) = self.ledger.discard_pending(transfer_id).await {
            warn!(transfer_id = %transfer_id, error = %e, "Discard failed, recovery will retry");
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_transfer(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<TransferRecord>, TransferError> {
        Ok(self.ledger.get(transfer_id).await?)
    }

    pub async fn transfers_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        Ok(self.ledger.list_for_account(account_id).await?)
    }

    // ========================================================================
    // Recovery & audit
    // ========================================================================

    /// Resolve PENDING records older than `stale_threshold`
    ///
    /// Each record's mutation ID is voided first. If the swap already
    /// landed the void reports it and the record is finalized COMPLETED;
    /// otherwise the void fences out any swap still in flight and the record
    /// is discarded so the caller can retry.
    pub async fn recover_pending(
        &self,
        stale_threshold: Duration,
        batch_size: usize,
    ) -> Result<RecoveryReport, TransferError> {
        let Some(cutoff) = chrono::Duration::from_std(stale_threshold)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return Ok(RecoveryReport::default());
        };

        let stale = self.ledger.find_pending(cutoff, batch_size).await?;
        let mut report = RecoveryReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for record in stale {
            let transfer_id = &record.transfer_id;
            let resolved = match self
                .accounts
                .void_mutation(&MutationId::from(transfer_id))
                .await
            {
                Ok(VoidOutcome::Applied(applied)) => self
                    .ledger
                    .finalize(transfer_id, TransferStatus::Completed, applied.applied_at, None)
                    .await
                    .map(|done| (done, true)),
                Ok(VoidOutcome::Voided | VoidOutcome::AlreadyVoided) => self
                    .ledger
                    .discard_pending(transfer_id)
                    .await
                    .map(|done| (done, false)),
                Err(e) => Err(e),
            };

            match resolved {
                Ok((true, true)) => {
                    info!(transfer_id = %transfer_id, "Recovered transfer as COMPLETED");
                    report.completed += 1;
                }
                Ok((true, false)) => {
                    info!(transfer_id = %transfer_id, "Discarded unapplied PENDING transfer");
                    report.discarded += 1;
                }
                Ok((false, _)) => {
                    debug!(transfer_id = %transfer_id, "Transfer resolved concurrently");
                }
                Err(e) => {
                    error!(transfer_id = %transfer_id, error = %e, "Failed to recover transfer");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Check the conservation invariant across every store
    pub async fn audit(&self) -> Result<ConservationReport, TransferError> {
        let accounts = self.accounts.list_accounts().await?;
        let mutations = self.accounts.list_mutations().await?;
        let transfers = self.ledger.list_all().await?;

        let report = audit::verify_conservation(&accounts, &mutations, &transfers);
        if report.is_conserved() {
            debug!(
                accounts = report.accounts,
                transfers = report.transfers_checked,
                "Conservation audit passed"
            );
        } else {
            error!(violations = report.violations.len(), "Conservation audit FAILED");
        }
        Ok(report)
    }
}

/// A record already exists under this transfer ID
fn adopt_existing(
    request: &TransferRequest,
    existing: TransferRecord,
) -> Result<TransferOutcome, TransferError> {
    if existing.fingerprint() != request.fingerprint() {
        return Err(TransferError::IdempotencyKeyConflict(
            request.transfer_id.clone(),
        ));
    }
    existing
        .outcome()
        .ok_or_else(|| TransferError::AlreadyInProgress(request.transfer_id.clone()))
}

fn guard_error(e: GuardError) -> TransferError {
    match e {
        GuardError::InsufficientFunds { .. } => TransferError::InsufficientFunds,
        GuardError::InvalidAmount | GuardError::PrecisionOverflow { .. } => {
            TransferError::InvalidAmount
        }
        GuardError::BalanceOverflow => TransferError::BalanceOverflow,
    }
}
