//! Store contract
//!
//! The engine never talks SQL. It needs a store that gives it:
//!
//! - serializable transactions bounded by a statement timeout, rolled back
//!   when dropped unfinished
//! - explicit row locks on accounts
//! - a conditional debit (`balance >= amount`) and an unconditional credit,
//!   both returning the new balance
//! - a uniqueness constraint on `(idempotency_key, kind)` that reports a
//!   duplicate instead of failing
//!
//! [`PgLedgerStore`] provides this on PostgreSQL, [`MemoryLedgerStore`]
//! in-process.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::{PgLedgerStore, SCHEMA};

use crate::{
    types::{Account, AccountId, Transaction, TransactionId, TransactionKind, User},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Result of inserting a transaction row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row written
    Inserted,
    /// `(idempotency_key, kind)` already taken
    Duplicate,
}

/// Transaction-log filter for the feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    /// Owning accounts to include; empty means all
    pub accounts: Vec<AccountId>,
    /// Only rows with a strictly greater identifier
    pub after: Option<TransactionId>,
    /// Maximum rows returned
    pub fetch: u32,
}

/// Durable ledger storage
#[async_trait]
pub trait LedgerStore: Send + Sync + std::fmt::Debug {
    /// Open a serializable store transaction
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Insert a user
    async fn create_user(&self, user: &User) -> Result<()>;

    /// Insert an account; `UserNotFound` if the owner is absent
    async fn create_account(&self, account: &Account) -> Result<()>;

    /// Look up an account
    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Ending balance of the latest row on `account` created at or before `at`
    async fn ending_balance_at(
        &self,
        account: &AccountId,
        at: DateTime<Utc>,
    ) -> Result<Option<Decimal>>;

    /// Rows in ascending identifier order
    async fn list_transactions(&self, query: &LogQuery) -> Result<Vec<Transaction>>;
}

/// One open store transaction
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock an account row until commit or rollback; `None` if absent
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>>;

    /// Add to the balance; `None` if the account is absent
    async fn credit(&mut self, id: &AccountId, amount: Decimal) -> Result<Option<Decimal>>;

    /// Subtract when `balance >= amount`; `None` when no row matched
    async fn debit(&mut self, id: &AccountId, amount: Decimal) -> Result<Option<Decimal>>;

    /// Whether a committed row already holds `(idempotency_key, kind)`
    async fn idempotency_key_exists(
        &mut self,
        idempotency_key: &str,
        kind: TransactionKind,
    ) -> Result<bool>;

    /// Append a transaction row
    async fn insert_transaction(&mut self, row: &Transaction) -> Result<InsertOutcome>;

    /// Make every write visible atomically
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write
    async fn rollback(self: Box<Self>) -> Result<()>;
}
