//! Account Store contract
//!
//! The engine depends only on this trait. Implementations own the rows; the
//! engine never writes a balance except through [`AccountStore::compare_and_swap`].

use async_trait::async_trait;

use super::models::{
    Account, AppliedMutation, CasOutcome, MutationBatch, MutationId, VoidOutcome,
};
use crate::core_types::AccountId;
use crate::storage::StoreResult;

/// Durable, versioned account rows
///
/// # Contract
/// - `compare_and_swap` is all-or-nothing across every row in the batch
/// - a successful swap sets each row's version to `expected_version + 1`
/// - the journal entry is written in the same atomic unit as the rows
/// - replaying a journaled mutation ID returns `AlreadyApplied` and writes nothing
/// - a voided mutation ID returns `Voided` and writes nothing; void and swap
///   race on the same journal key, so exactly one of them wins
/// - `get` never returns a torn row
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &'static str;

    /// Insert a fresh row (balance 0, version 0)
    async fn create(&self) -> StoreResult<Account>;

    async fn get(&self, account_id: AccountId) -> StoreResult<Option<Account>>;

    /// Conditionally write every row of the batch
    async fn compare_and_swap(&self, batch: &MutationBatch) -> StoreResult<CasOutcome>;

    /// Journal lookup; void entries are not reported
    async fn applied_mutation(&self, mutation_id: &MutationId)
    -> StoreResult<Option<AppliedMutation>>;

    /// Insert a void entry under `mutation_id` unless one is journaled
    async fn void_mutation(&self, mutation_id: &MutationId) -> StoreResult<VoidOutcome>;

    /// Remove a void entry so the ID can be swapped again. Returns false
    /// when there was none.
    async fn clear_void(&self, mutation_id: &MutationId) -> StoreResult<bool>;

    /// Every row, for audit
    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Every applied journal entry, oldest first, for audit
    async fn list_mutations(&self) -> StoreResult<Vec<AppliedMutation>>;
}
