//! Account Store
//!
//! Versioned balance rows, the compare-and-swap batch that mutates them, and
//! the store contract with an in-memory implementation. The PostgreSQL
//! implementation lives in [`crate::persistence`].

pub mod memory;
pub mod models;
pub mod repository;

pub use memory::MemoryAccountStore;
pub use models::{
    Account, AccountUpdate, AppliedMutation, CasOutcome, MutationBatch, MutationId, MutationKind,
    Posting, VoidOutcome,
};
pub use repository::AccountStore;
