//! Ledger Entry Store
//!
//! Durable transfer records keyed by transfer ID. A record is inserted
//! PENDING exactly once, moves to a terminal state exactly once, and is never
//! changed afterwards. The only other write is discarding a PENDING record
//! whose mutation provably never applied.

pub mod memory;
pub mod repository;

pub use memory::MemoryLedgerStore;
pub use repository::{InsertOutcome, LedgerStore};
