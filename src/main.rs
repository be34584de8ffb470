//! Wallet Ledger - demo service
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│ Stores (PG / │───▶│   Transfer   │───▶│  Audit   │
//! │  (YAML)  │    │   memory)    │    │    Engine    │    │  (JSON)  │
//! └──────────┘    └──────────────┘    └──────────────┘    └──────────┘
//! ```
//!
//! Usage: `wallet_ledger [--env dev] [--serve]`
//!
//! Runs one recovery pass, a burst of concurrent transfers, and a
//! conservation audit. With `--serve` the recovery worker keeps running
//! until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use rand::Rng;
use tracing::{info, warn};

use wallet_ledger::config::AppConfig;
use wallet_ledger::db::Database;
use wallet_ledger::logging::init_logging;
use wallet_ledger::money::{Amount, format_amount};
use wallet_ledger::persistence::{PgAccountStore, PgLedgerStore, ensure_schema};
use wallet_ledger::{
    AccountId, AccountStore, LedgerStore, MemoryAccountStore, MemoryLedgerStore, RecoveryWorker,
    TransferEngine, TransferError, TransferId, TransferOutcome, TransferRequest, TransferStatus,
};

const DEMO_ACCOUNTS: usize = 4;
const DEMO_TRANSFERS: usize = 200;
const DEMO_OPENING_BALANCE: &str = "1000.00";

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn serve_mode() -> bool {
    std::env::args().any(|a| a == "--serve")
}

async fn build_engine(config: &AppConfig) -> Result<TransferEngine> {
    let (accounts, ledger): (Arc<dyn AccountStore>, Arc<dyn LedgerStore>) =
        match &config.postgres_url {
            Some(url) => {
                let db = Database::connect(url, config.postgres_max_connections)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                db.health_check().await.context("PostgreSQL health check")?;
                ensure_schema(db.pool()).await?;
                (
                    Arc::new(PgAccountStore::new(db.pool().clone())),
                    Arc::new(PgLedgerStore::new(db.pool().clone())),
                )
            }
            None => {
                warn!("No postgres_url configured, using in-memory stores");
                (
                    Arc::new(MemoryAccountStore::new()),
                    Arc::new(MemoryLedgerStore::new()),
                )
            }
        };

    info!(
        account_store = accounts.name(),
        ledger_store = ledger.name(),
        "Stores ready"
    );

    Ok(TransferEngine::new(accounts, ledger)
        .with_retry(config.ledger.retry.policy())
        .with_idempotency_capacity(config.ledger.idempotency_cache_size)
        .with_currency_decimals(config.ledger.currency_decimals))
}

/// Submit one transfer, resubmitting the same ID while the error is retriable
async fn submit(
    engine: &TransferEngine,
    request: TransferRequest,
) -> Result<TransferOutcome, TransferError> {
    loop {
        match engine.transfer(request.clone()).await {
            Err(e) if e.is_retriable() => {
                tokio::time::sleep(engine.retry_policy().max_delay).await;
            }
            other => return other,
        }
    }
}

async fn run_demo(engine: &TransferEngine) -> Result<()> {
    let decimals = engine.currency_decimals();

    let mut accounts: Vec<AccountId> = Vec::with_capacity(DEMO_ACCOUNTS);
    for _ in 0..DEMO_ACCOUNTS {
        let id = engine.create_account().await?;
        engine
            .deposit_decimal(id, DEMO_OPENING_BALANCE.parse()?)
            .await?;
        accounts.push(id);
    }

    let requests: Vec<TransferRequest> = {
        let mut rng = rand::thread_rng();
        let max_minor = 10u64.pow(decimals) * 500;
        (0..DEMO_TRANSFERS)
            .map(|_| {
                let from = rng.gen_range(0..accounts.len());
                let to = (from + rng.gen_range(1..accounts.len())) % accounts.len();
                TransferRequest::new(
                    TransferId::generate(),
                    accounts[from],
                    accounts[to],
                    Amount::new(rng.gen_range(1..=max_minor)),
                )
            })
            .collect()
    };

    let results = join_all(requests.into_iter().map(|req| submit(engine, req))).await;

    let mut completed = 0;
    let mut failed = 0;
    for result in results {
        match result?.status {
            TransferStatus::Completed => completed += 1,
            _ => failed += 1,
        }
    }
    info!(completed, failed, "Demo transfers finished");

    for id in &accounts {
        let balance = engine.get_balance(*id).await?;
        info!(account_id = %id, balance = %format_amount(balance, decimals), "Balance");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&app_config);

    info!(env = %env, "Starting wallet ledger");

    let engine = Arc::new(build_engine(&app_config).await?);
    let worker = RecoveryWorker::new(engine.clone(), app_config.ledger.recovery.worker_config());

    let recovered = worker.scan_and_recover().await?;
    info!(
        completed = recovered.completed,
        discarded = recovered.discarded,
        "Startup recovery pass done"
    );

    run_demo(&engine).await?;

    let audit = engine.audit().await?;
    println!("{}", serde_json::to_string_pretty(&audit)?);
    if !audit.is_conserved() {
        bail!(
            "Conservation audit failed with {} violations",
            audit.violations.len()
        );
    }

    if serve_mode() {
        tokio::select! {
            _ = worker.run() => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
            }
        }
    }

    Ok(())
}
