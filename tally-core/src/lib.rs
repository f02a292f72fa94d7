//! Tally Ledger Core
//!
//! Account balances backed by an ordered, durable log of signed transactions.
//!
//! # Architecture
//!
//! - **Sortable identifiers**: seconds, counter and randomness; text order is creation order
//! - **Row-locked mutations**: deposit, withdrawal and two-leg transfer in one store transaction
//! - **Idempotent replay**: a repeated `(key, kind)` is a successful no-op
//! - **Reconstruction**: any past balance is read back from the log
//!
//! # Invariants
//!
//! - Balances never go negative
//! - An account's balance equals the ending balance of its latest transaction
//! - Both legs of a transfer commit together or not at all
//! - Transaction identifiers order rows by creation

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod balance;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod id;
pub mod ledger;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DatabaseConfig, EngineConfig};
pub use error::{ErrorKind, LedgerError, Result};
pub use feed::{FeedRequest, Page};
pub use id::{IdError, IdGenerator, Identifier};
pub use ledger::Ledger;
pub use metrics::LedgerMetrics;
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use types::{
    Account, AccountId, BalanceSnapshot, Outcome, Transaction, TransactionId, TransactionKind,
    TransferReceipt, User, UserId,
};
