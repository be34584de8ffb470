//! PostgreSQL Account Store
//!
//! The compare-and-swap runs in one transaction: the journal row is inserted
//! first (a duplicate mutation ID short-circuits to `AlreadyApplied`), then
//! each account row is updated with `WHERE version = expected` in ascending
//! `AccountId` order. Any row that does not match rolls the whole batch back.
//!
//! Recovery voids a mutation ID by inserting a `VOID` row under the same
//! primary key, so a void and a late swap serialize on that key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::account::{
    Account, AccountStore, AppliedMutation, CasOutcome, MutationBatch, MutationId, MutationKind,
    Posting, VoidOutcome,
};
use crate::core_types::{AccountId, Version};
use crate::money::Amount;
use crate::storage::{StoreError, StoreResult};

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Journal row under `mutation_id`, void entries included
    async fn journal_entry(&self, mutation_id: &MutationId) -> StoreResult<Option<AppliedMutation>> {
        let row = sqlx::query(
            r#"
            SELECT mutation_id, kind, postings::text AS postings, applied_at
            FROM account_mutations_tb
            WHERE mutation_id = $1
            "#,
        )
        .bind(mutation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(mutation_from_row).transpose()
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn create(&self) -> StoreResult<Account> {
        let account = Account::new(AccountId::generate());
        sqlx::query(
            r#"
            INSERT INTO accounts_tb (account_id, balance_minor_units, version, created_at, updated_at)
            VALUES ($1, 0, 0, $2, $3)
            "#,
        )
        .bind(account.account_id.to_string())
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(account)
    }

    async fn get(&self, account_id: AccountId) -> StoreResult<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, balance_minor_units, version, created_at, updated_at
            FROM accounts_tb
            WHERE account_id = $1
            "#,
        )
        .bind(account_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn compare_and_swap(&self, batch: &MutationBatch) -> StoreResult<CasOutcome> {
        let applied_at = Utc::now();
        let postings = batch.postings();
        let postings_json = serde_json::to_string(&postings)?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO account_mutations_tb (mutation_id, kind, postings, applied_at)
            VALUES ($1, $2, $3::jsonb, $4)
            ON CONFLICT (mutation_id) DO NOTHING
            "#,
        )
        .bind(batch.mutation_id().as_str())
        .bind(batch.kind().id())
        .bind(&postings_json)
        .bind(applied_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.journal_entry(batch.mutation_id()).await? {
                Some(existing) if existing.is_void() => {
                    debug!(mutation_id = %batch.mutation_id(), "Mutation voided");
                    Ok(CasOutcome::Voided)
                }
                Some(existing) => {
                    debug!(mutation_id = %batch.mutation_id(), "Mutation already applied");
                    Ok(CasOutcome::AlreadyApplied(existing))
                }
                // A void was cleared between the insert and the lookup
                None => Err(StoreError::Unavailable(format!(
                    "mutation {} conflicted but is not journaled",
                    batch.mutation_id()
                ))),
            };
        }

        // Updates are already in ascending AccountId order
        for update in batch.updates() {
            let result = sqlx::query(
                r#"
                UPDATE accounts_tb
                SET balance_minor_units = $1, version = version + 1, updated_at = $2
                WHERE account_id = $3 AND version = $4
                "#,
            )
            .bind(to_i64(update.new_balance)?)
            .bind(applied_at)
            .bind(update.account_id.to_string())
            .bind(version_to_i64(update.expected_version)?)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                tx.rollback().await?;
                debug!(
                    mutation_id = %batch.mutation_id(),
                    account_id = %update.account_id,
                    "Version mismatch"
                );
                return Ok(CasOutcome::VersionMismatch);
            }
        }

        tx.commit().await?;

        Ok(CasOutcome::Applied(AppliedMutation {
            mutation_id: batch.mutation_id().clone(),
            kind: batch.kind(),
            postings,
            applied_at,
        }))
    }

    async fn applied_mutation(
        &self,
        mutation_id: &MutationId,
    ) -> StoreResult<Option<AppliedMutation>> {
        Ok(self
            .journal_entry(mutation_id)
            .await?
            .filter(|m| !m.is_void()))
    }

    async fn void_mutation(&self, mutation_id: &MutationId) -> StoreResult<VoidOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO account_mutations_tb (mutation_id, kind, postings, applied_at)
            VALUES ($1, $2, '[]'::jsonb, $3)
            ON CONFLICT (mutation_id) DO NOTHING
            "#,
        )
        .bind(mutation_id.as_str())
        .bind(MutationKind::Void.id())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(VoidOutcome::Voided);
        }
        match self.journal_entry(mutation_id).await? {
            Some(existing) if existing.is_void() => Ok(VoidOutcome::AlreadyVoided),
            Some(existing) => Ok(VoidOutcome::Applied(existing)),
            // Cleared between the insert and the lookup; the caller scans again
            None => Err(StoreError::Unavailable(format!(
                "void of {} conflicted and vanished",
                mutation_id
            ))),
        }
    }

    async fn clear_void(&self, mutation_id: &MutationId) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM account_mutations_tb WHERE mutation_id = $1 AND kind = $2")
                .bind(mutation_id.as_str())
                .bind(MutationKind::Void.id())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, balance_minor_units, version, created_at, updated_at
            FROM accounts_tb
            ORDER BY account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn list_mutations(&self) -> StoreResult<Vec<AppliedMutation>> {
        let rows = sqlx::query(
            r#"
            SELECT mutation_id, kind, postings::text AS postings, applied_at
            FROM account_mutations_tb
            WHERE kind <> $1
            ORDER BY applied_at
            "#,
        )
        .bind(MutationKind::Void.id())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(mutation_from_row).collect()
    }
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    let account_id: String = row.try_get("account_id")?;
    let balance: i64 = row.try_get("balance_minor_units")?;
    let version: i64 = row.try_get("version")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Account {
        account_id: account_id
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad account id: {}", account_id)))?,
        balance: Amount::try_from(balance)
            .map_err(|_| StoreError::Corrupt(format!("negative balance on {}", account_id)))?,
        version: Version::try_from(version)
            .map_err(|_| StoreError::Corrupt(format!("negative version on {}", account_id)))?,
        created_at,
        updated_at,
    })
}

fn mutation_from_row(row: &PgRow) -> StoreResult<AppliedMutation> {
    let mutation_id: String = row.try_get("mutation_id")?;
    let kind: i16 = row.try_get("kind")?;
    let postings: String = row.try_get("postings")?;
    let applied_at: DateTime<Utc> = row.try_get("applied_at")?;

    Ok(AppliedMutation {
        kind: MutationKind::from_id(kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown mutation kind: {}", kind)))?,
        postings: serde_json::from_str::<Vec<Posting>>(&postings)?,
        mutation_id: MutationId::from_raw(mutation_id),
        applied_at,
    })
}

fn to_i64(amount: Amount) -> StoreResult<i64> {
    i64::try_from(amount).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn version_to_i64(version: Version) -> StoreResult<i64> {
    i64::try_from(version).map_err(|e| StoreError::Corrupt(e.to_string()))
}
