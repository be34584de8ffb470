//! Transfer Engine
//!
//! Moves money between two accounts of the same ledger.
//!
//! # State Machine
//!
//! ```text
//! PENDING ──▶ COMPLETED
//!    │
//!    └──────▶ FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Atomic pair**: debit and credit are one compare-and-swap batch; a
//!    version mismatch on either row writes nothing
//! 2. **Lock order**: rows are always read and locked in ascending `AccountId`
//! 3. **Persist-before-move**: the PENDING record exists before any balance changes
//! 4. **Exactly once**: the transfer ID is the idempotency key and the mutation
//!    ID; replays return the stored outcome
//! 5. **Journal decides**: a PENDING record is completed only if its mutation
//!    is journaled, and discarded only after a void entry under its mutation
//!    ID has fenced out any swap still in flight

pub mod engine;
pub mod error;
pub mod idempotency;
pub mod retry;
pub mod state;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use engine::{RecoveryReport, TransferEngine};
pub use error::TransferError;
pub use idempotency::{DEFAULT_OUTCOME_CAPACITY, IdempotencyIndex, Reservation, ReservationGuard};
pub use retry::RetryPolicy;
pub use state::TransferStatus;
pub use types::{
    FailureReason, TransferFingerprint, TransferOutcome, TransferRecord, TransferRequest,
};
pub use worker::{RecoveryWorker, WorkerConfig};
