//! PostgreSQL implementations of the account and ledger store contracts

pub mod accounts;
pub mod ledger;
pub mod schema;

pub use accounts::PgAccountStore;
pub use ledger::PgLedgerStore;
pub use schema::ensure_schema;
