use sqlx::PgPool;

use crate::storage::StoreResult;

pub const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts_tb (
    account_id          TEXT PRIMARY KEY,
    balance_minor_units BIGINT NOT NULL CHECK (balance_minor_units >= 0),
    version             BIGINT NOT NULL DEFAULT 0,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL
)"#;

pub const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers_tb (
    transfer_id         TEXT PRIMARY KEY,
    sender_account_id   TEXT NOT NULL,
    receiver_account_id TEXT NOT NULL,
    amount_minor_units  BIGINT NOT NULL,
    status              SMALLINT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    completed_at        TIMESTAMPTZ NULL,
    failure_reason      TEXT NULL,
    CHECK (sender_account_id <> receiver_account_id)
)"#;

pub const CREATE_TRANSFERS_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS transfers_tb_pending_idx
    ON transfers_tb (created_at) WHERE status = 0"#;

pub const CREATE_TRANSFERS_SENDER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS transfers_tb_sender_idx ON transfers_tb (sender_account_id)";

pub const CREATE_TRANSFERS_RECEIVER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS transfers_tb_receiver_idx ON transfers_tb (receiver_account_id)";

pub const CREATE_MUTATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS account_mutations_tb (
    mutation_id TEXT PRIMARY KEY,
    kind        SMALLINT NOT NULL,
    postings    JSONB NOT NULL,
    applied_at  TIMESTAMPTZ NOT NULL
)"#;

/// Create tables and indexes if they do not exist
pub async fn ensure_schema(pool: &PgPool) -> StoreResult<()> {
    tracing::info!("Ensuring ledger schema...");

    for statement in [
        CREATE_ACCOUNTS_TABLE,
        CREATE_TRANSFERS_TABLE,
        CREATE_TRANSFERS_STATUS_INDEX,
        CREATE_TRANSFERS_SENDER_INDEX,
        CREATE_TRANSFERS_RECEIVER_INDEX,
        CREATE_MUTATIONS_TABLE,
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Ledger schema ready");
    Ok(())
}
