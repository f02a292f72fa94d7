//! Main ledger orchestration layer
//!
//! Ties the clock, identifier generator, store, engine, balance
//! reconstructor and feed together behind one handle.
//!
//! # Example
//!
//! ```no_run
//! use rust_decimal::Decimal;
//! use tally_core::{EngineConfig, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> tally_core::Result<()> {
//!     let ledger = Ledger::in_memory(&EngineConfig::default())?;
//!
//!     let user = ledger.create_user("alice").await?;
//!     let account = ledger.create_account(user.id).await?;
//!     ledger.deposit(account.id, Decimal::new(1000, 2), "first-deposit").await?;
//!
//!     Ok(())
//! }
//! ```

use crate::{
    balance::BalanceReconstructor,
    clock::{Clock, SystemClock},
    config::{Config, EngineConfig},
    engine::LedgerEngine,
    feed::{FeedRequest, Page, TransactionFeed},
    id::IdGenerator,
    metrics::LedgerMetrics,
    retry::RetryPolicy,
    store::{LedgerStore, MemoryLedgerStore, PgLedgerStore},
    types::{
        Account, AccountId, BalanceSnapshot, Outcome, Transaction, TransferReceipt, User, UserId,
        AMOUNT_SCALE,
    },
    LedgerError, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

/// Main ledger interface
#[derive(Debug, Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    ids: Arc<IdGenerator>,
    engine: LedgerEngine,
    balances: BalanceReconstructor,
    feed: TransactionFeed,
    metrics: LedgerMetrics,
}

impl Ledger {
    /// Connect to PostgreSQL, creating the schema if configured
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;

        let store = PgLedgerStore::connect(&config.database).await?;
        if config.database.create_schema {
            store.create_schema().await?;
        }

        info!(service = %config.service_name, "Ledger connected");
        Self::with_store(Arc::new(store), Arc::new(SystemClock), &config.engine)
    }

    /// Ledger over a fresh in-process store
    pub fn in_memory(config: &EngineConfig) -> Result<Self> {
        Self::with_store(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(SystemClock),
            config,
        )
    }

    /// Ledger over any store and clock
    pub fn with_store(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = LedgerMetrics::new()?;
        let ids = Arc::new(IdGenerator::new(clock));
        let engine = LedgerEngine::new(
            store.clone(),
            ids.clone(),
            RetryPolicy::new(config.retry.clone()),
            metrics.clone(),
        );

        Ok(Self {
            balances: BalanceReconstructor::new(store.clone()),
            feed: TransactionFeed::new(store.clone(), config),
            store,
            ids,
            engine,
            metrics,
        })
    }

    /// Register a user
    pub async fn create_user(&self, name: &str) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LedgerError::Validation("user name is required".to_string()));
        }

        let (id, created_at) = self.next_id()?;
        let user = User {
            id,
            name: name.to_string(),
            created_at,
        };
        self.store.create_user(&user).await?;

        info!(user_id = %user.id, "User created");
        Ok(user)
    }

    /// Open a zero-balance account for `user_id`
    pub async fn create_account(&self, user_id: UserId) -> Result<Account> {
        let (id, created_at) = self.next_id()?;
        let account = Account {
            id,
            user_id,
            balance: Decimal::new(0, AMOUNT_SCALE),
            created_at,
        };
        self.store.create_account(&account).await?;

        info!(account_id = %account.id, user_id = %user_id, "Account created");
        Ok(account)
    }

    /// Current account row
    pub async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.store
            .get_account(&id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// See [`LedgerEngine::deposit`]
    pub async fn deposit(
        &self,
        account: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<Transaction>> {
        self.engine.deposit(account, amount, idempotency_key).await
    }

    /// See [`LedgerEngine::withdraw`]
    pub async fn withdraw(
        &self,
        account: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<Transaction>> {
        self.engine.withdraw(account, amount, idempotency_key).await
    }

    /// See [`LedgerEngine::transfer`]
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<TransferReceipt>> {
        self.engine
            .transfer(from, to, amount, idempotency_key)
            .await
    }

    /// See [`BalanceReconstructor::balance_as_of`]
    pub async fn balance_as_of(
        &self,
        account: AccountId,
        at: DateTime<Utc>,
    ) -> Result<BalanceSnapshot> {
        self.balances.balance_as_of(account, at).await
    }

    /// See [`TransactionFeed::list`]
    pub async fn list_transactions(&self, request: &FeedRequest) -> Result<Page> {
        self.feed.list(request).await
    }

    /// Ledger clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.ids.clock()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    fn next_id(&self) -> Result<(crate::id::Identifier, DateTime<Utc>)> {
        let issued = self.ids.issue()?;
        self.metrics.ids_generated.inc();
        Ok(issued)
    }
}
