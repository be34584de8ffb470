//! Wallet Ledger - balance-mutation and transfer engine
//!
//! Moves money between accounts so that no update is lost under concurrency,
//! a transfer applies to both sides or neither, balances never go negative,
//! and conservation of the ledger total can be proven after the fact.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier newtypes (AccountId, TransferId)
//! - [`money`] - Minor-unit amounts, decimal parsing and formatting
//! - [`balance`] - Balance Guard (non-negative debit/credit computation)
//! - [`account`] - Account Store contract, versioned rows, in-memory store
//! - [`ledger`] - Ledger Entry Store contract, in-memory store
//! - [`transfer`] - Transfer Engine, Idempotency Index, retry, recovery worker
//! - [`audit`] - Conservation audit
//! - [`persistence`] - PostgreSQL stores
//! - [`config`] / [`logging`] - Service wiring
//!
//! # Data flow
//!
//! ```text
//! request ─▶ Idempotency Index ─▶ Ledger (PENDING) ─▶ Balance Guard
//!                                                        │
//!    outcome ◀── Ledger (COMPLETED/FAILED) ◀── Account Store CAS
//! ```

// Core types - must be first!
pub mod core_types;
pub mod money;

pub mod account;
pub mod audit;
pub mod balance;
pub mod ledger;
pub mod storage;
pub mod transfer;

// Service wiring
pub mod config;
pub mod db;
pub mod logging;
pub mod persistence;

// Convenient re-exports at crate root
pub use account::{AccountStore, MemoryAccountStore};
pub use audit::{ConservationReport, Violation, verify_conservation};
pub use balance::{BalanceGuard, GuardError};
pub use core_types::{AccountId, TransferId};
pub use ledger::{LedgerStore, MemoryLedgerStore};
pub use money::{Amount, MoneyError};
pub use storage::{StoreError, StoreResult};
pub use transfer::{
    FailureReason, RecoveryReport, RecoveryWorker, RetryPolicy, TransferEngine, TransferError,
    TransferOutcome, TransferRecord, TransferRequest, TransferStatus, WorkerConfig,
};
