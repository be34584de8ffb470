//! PostgreSQL Ledger Entry Store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::core_types::{AccountId, TransferId};
use crate::ledger::{InsertOutcome, LedgerStore};
use crate::money::Amount;
use crate::storage::{StoreError, StoreResult};
use crate::transfer::{FailureReason, TransferRecord, TransferStatus};

const SELECT_COLUMNS: &str = r#"
    SELECT transfer_id, sender_account_id, receiver_account_id, amount_minor_units,
           status, created_at, completed_at, failure_reason
    FROM transfers_tb
"#;

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn insert_pending(&self, record: &TransferRecord) -> StoreResult<InsertOutcome> {
        let amount = i64::try_from(record.amount).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO transfers_tb
                (transfer_id, sender_account_id, receiver_account_id, amount_minor_units,
                 status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (transfer_id) DO NOTHING
            "#,
        )
        .bind(record.transfer_id.as_str())
        .bind(record.sender.to_string())
        .bind(record.receiver.to_string())
        .bind(amount)
        .bind(TransferStatus::Pending.id())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(InsertOutcome::Inserted);
        }
        match self.get(&record.transfer_id).await? {
            Some(existing) => Ok(InsertOutcome::Exists(existing)),
            // Lost a race with a discard; the caller retries with the same ID
            None => Err(StoreError::Unavailable(format!(
                "transfer {} conflicted and vanished",
                record.transfer_id
            ))),
        }
    }

    async fn finalize(
        &self,
        transfer_id: &TransferId,
        status: TransferStatus,
        completed_at: DateTime<Utc>,
        failure_reason: Option<FailureReason>,
    ) -> StoreResult<bool> {
        if !TransferStatus::Pending.can_transition_to(status) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE transfers_tb
            SET status = $1, completed_at = $2, failure_reason = $3
            WHERE transfer_id = $4 AND status = $5
            "#,
        )
        .bind(status.id())
        .bind(completed_at)
        .bind(failure_reason.map(|r| r.as_str()))
        .bind(transfer_id.as_str())
        .bind(TransferStatus::Pending.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn discard_pending(&self, transfer_id: &TransferId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM transfers_tb WHERE transfer_id = $1 AND status = $2")
            .bind(transfer_id.as_str())
            .bind(TransferStatus::Pending.id())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, transfer_id: &TransferId) -> StoreResult<Option<TransferRecord>> {
        let row = sqlx::query(&format!("{} WHERE transfer_id = $1", SELECT_COLUMNS))
            .bind(transfer_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = $1 AND created_at <= $2 ORDER BY created_at LIMIT $3",
            SELECT_COLUMNS
        ))
        .bind(TransferStatus::Pending.id())
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_for_account(&self, account_id: AccountId) -> StoreResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE sender_account_id = $1 OR receiver_account_id = $1 ORDER BY created_at DESC",
            SELECT_COLUMNS
        ))
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_all(&self) -> StoreResult<Vec<TransferRecord>> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> StoreResult<TransferRecord> {
    let transfer_id: String = row.try_get("transfer_id")?;
    let sender: String = row.try_get("sender_account_id")?;
    let receiver: String = row.try_get("receiver_account_id")?;
    let amount: i64 = row.try_get("amount_minor_units")?;
    let status: i16 = row.try_get("status")?;
    let failure_reason: Option<String> = row.try_get("failure_reason")?;

    let corrupt = |what: &str| StoreError::Corrupt(format!("transfer {}: bad {}", transfer_id, what));

    Ok(TransferRecord {
        sender: sender.parse().map_err(|_| corrupt("sender"))?,
        receiver: receiver.parse().map_err(|_| corrupt("receiver"))?,
        amount: Amount::try_from(amount).map_err(|_| corrupt("amount"))?,
        status: TransferStatus::from_id(status).ok_or_else(|| corrupt("status"))?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        failure_reason: failure_reason
            .map(|r| r.parse::<FailureReason>())
            .transpose()
            .map_err(|_| corrupt("failure reason"))?,
        transfer_id: TransferId::new(transfer_id.clone()).map_err(|_| corrupt("id"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::test_support::create_test_pool;
    use crate::transfer::TransferRequest;

    fn pending() -> TransferRecord {
        TransferRecord::pending(&TransferRequest::new(
            TransferId::new(format!("pg-{}", ulid::Ulid::new())).unwrap(),
            AccountId::generate(),
            AccountId::generate(),
            30u64,
        ))
    }

    #[tokio::test]
    async fn test_pg_ledger_lifecycle() {
        let Some(pool) = create_test_pool().await else {
            return;
        };
        let store = PgLedgerStore::new(pool);
        let record = pending();

        assert_eq!(
            store.insert_pending(&record).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert!(matches!(
            store.insert_pending(&record).await.unwrap(),
            InsertOutcome::Exists(_)
        ));

        assert!(
            store
                .finalize(
                    &record.transfer_id,
                    TransferStatus::Failed,
                    Utc::now(),
                    Some(FailureReason::InsufficientFunds)
                )
                .await
                .unwrap()
        );
        assert!(
            !store
                .finalize(&record.transfer_id, TransferStatus::Completed, Utc::now(), None)
                .await
                .unwrap()
        );
        assert!(!store.discard_pending(&record.transfer_id).await.unwrap());

        let stored = store.get(&record.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Failed);
        assert_eq!(stored.failure_reason, Some(FailureReason::InsufficientFunds));
        assert_eq!(
            store.list_for_account(record.sender).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_pg_discard_pending() {
        let Some(pool) = create_test_pool().await else {
            return;
        };
        let store = PgLedgerStore::new(pool);
        let record = pending();
        store.insert_pending(&record).await.unwrap();

        let stale = store.find_pending(Utc::now(), 10_000).await.unwrap();
        assert!(stale.iter().any(|r| r.transfer_id == record.transfer_id));

        assert!(store.discard_pending(&record.transfer_id).await.unwrap());
        assert!(store.get(&record.transfer_id).await.unwrap().is_none());
    }
}
