//! In-process store
//!
//! Committed state sits behind one `RwLock`. Account row locks are per-account
//! async mutexes held until the owning transaction finishes, so two units
//! touching the same account serialize exactly as they would on PostgreSQL
//! row locks, and waiting for one is bounded like a statement timeout. Writes
//! are staged in the transaction and applied in one step on commit.

use super::{InsertOutcome, LedgerStore, LedgerTx, LogQuery};
use crate::{
    types::{
        fits_amount_column, Account, AccountId, Transaction, TransactionId, TransactionKind, User,
        UserId,
    },
    LedgerError, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

type IdempotencyKey = (String, TransactionKind);

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    accounts: BTreeMap<AccountId, Account>,
    transactions: BTreeMap<TransactionId, Transaction>,
    idempotency: HashSet<IdempotencyKey>,
}

/// Longest wait for an account row lock
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: DashMap<AccountId, Arc<RowLock<()>>>,
    /// Keys claimed by transactions that have not finished yet
    pending: Mutex<HashSet<IdempotencyKey>>,
    lock_timeout: Duration,
}

/// Store backed by process memory
#[derive(Debug, Clone)]
pub struct MemoryLedgerStore {
    shared: Arc<Shared>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }
}

impl MemoryLedgerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store whose row-lock waits give up after `lock_timeout`
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: DashMap::new(),
                pending: Mutex::new(HashSet::new()),
                lock_timeout,
            }),
        }
    }

    /// Committed transaction rows
    pub fn transaction_count(&self) -> usize {
        self.shared.tables.read().transactions.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryTx {
            shared: self.shared.clone(),
            guards: HashMap::new(),
            balances: HashMap::new(),
            rows: Vec::new(),
            claims: Vec::new(),
            finished: false,
        }))
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        let mut tables = self.shared.tables.write();
        if tables.users.contains_key(&user.id) {
            return Err(LedgerError::Internal(format!("duplicate user id {}", user.id)));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn create_account(&self, account: &Account) -> Result<()> {
        let mut tables = self.shared.tables.write();
        if !tables.users.contains_key(&account.user_id) {
            return Err(LedgerError::UserNotFound(account.user_id));
        }
        if tables.accounts.contains_key(&account.id) {
            return Err(LedgerError::Internal(format!(
                "duplicate account id {}",
                account.id
            )));
        }
        tables.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.shared.tables.read().accounts.get(id).cloned())
    }

    async fn ending_balance_at(
        &self,
        account: &AccountId,
        at: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let tables = self.shared.tables.read();
        Ok(tables
            .transactions
            .values()
            .filter(|row| row.account_id == *account && row.created_at <= at)
            .max_by_key(|row| (row.created_at, row.id))
            .map(|row| row.ending_balance))
    }

    async fn list_transactions(&self, query: &LogQuery) -> Result<Vec<Transaction>> {
        use std::ops::Bound;

        let lower = match query.after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };
        let tables = self.shared.tables.read();
        Ok(tables
            .transactions
            .range((lower, Bound::Unbounded))
            .map(|(_, row)| row)
            .filter(|row| query.accounts.is_empty() || query.accounts.contains(&row.account_id))
            .take(query.fetch as usize)
            .cloned()
            .collect())
    }
}

struct MemoryTx {
    shared: Arc<Shared>,
    guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    /// Balances as this transaction sees them
    balances: HashMap<AccountId, Decimal>,
    rows: Vec<Transaction>,
    claims: Vec<IdempotencyKey>,
    finished: bool,
}

impl MemoryTx {
    /// Take the row lock once, returning the balance visible under it
    async fn locked_balance(&mut self, id: &AccountId) -> Result<Option<Decimal>> {
        if let Some(balance) = self.balances.get(id) {
            return Ok(Some(*balance));
        }

        if !self.shared.tables.read().accounts.contains_key(id) {
            return Ok(None);
        }

        let lock = self
            .shared
            .row_locks
            .entry(*id)
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone();
        let guard = tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                LedgerError::Timeout(format!(
                    "row lock on account {} not acquired within {:?}",
                    id, self.shared.lock_timeout
                ))
            })?;

        let Some(balance) = self
            .shared
            .tables
            .read()
            .accounts
            .get(id)
            .map(|account| account.balance)
        else {
            return Ok(None);
        };
        self.guards.insert(*id, guard);
        self.balances.insert(*id, balance);
        Ok(Some(balance))
    }

    fn release_claims(&mut self) {
        if self.claims.is_empty() {
            return;
        }
        let mut pending = self.shared.pending.lock();
        for claim in self.claims.drain(..) {
            pending.remove(&claim);
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>> {
        let Some(balance) = self.locked_balance(id).await? else {
            return Ok(None);
        };
        let tables = self.shared.tables.read();
        Ok(tables.accounts.get(id).map(|account| Account {
            balance,
            ..account.clone()
        }))
    }

    async fn credit(&mut self, id: &AccountId, amount: Decimal) -> Result<Option<Decimal>> {
        let Some(balance) = self.locked_balance(id).await? else {
            return Ok(None);
        };
        let updated = balance + amount;
        if !fits_amount_column(updated) {
            return Err(LedgerError::Validation(format!(
                "balance of account {} would exceed decimal(15,4)",
                id
            )));
        }
        self.balances.insert(*id, updated);
        Ok(Some(updated))
    }

    async fn debit(&mut self, id: &AccountId, amount: Decimal) -> Result<Option<Decimal>> {
        let Some(balance) = self.locked_balance(id).await? else {
            return Ok(None);
        };
        if balance < amount {
            return Ok(None);
        }
        let updated = balance - amount;
        self.balances.insert(*id, updated);
        Ok(Some(updated))
    }

    async fn idempotency_key_exists(
        &mut self,
        idempotency_key: &str,
        kind: TransactionKind,
    ) -> Result<bool> {
        let key = (idempotency_key.to_string(), kind);
        Ok(self.shared.tables.read().idempotency.contains(&key))
    }

    async fn insert_transaction(&mut self, row: &Transaction) -> Result<InsertOutcome> {
        let key = (row.idempotency_key.clone(), row.kind);

        if self.claims.contains(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        if self.shared.tables.read().idempotency.contains(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        {
            let mut pending = self.shared.pending.lock();
            if !pending.insert(key.clone()) {
                // Another unit holds the key uncommitted; its fate decides ours.
                return Err(LedgerError::Conflict(format!(
                    "idempotency key {:?} ({}) held by a concurrent transaction",
                    row.idempotency_key, row.kind
                )));
            }
        }
        self.claims.push(key);
        self.rows.push(row.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let shared = self.shared.clone();
        {
            let mut tables = shared.tables.write();
            for (id, balance) in &self.balances {
                if let Some(account) = tables.accounts.get_mut(id) {
                    account.balance = *balance;
                }
            }
            for row in self.rows.drain(..) {
                tables
                    .idempotency
                    .insert((row.idempotency_key.clone(), row.kind));
                tables.transactions.insert(row.id, row);
            }
        }
        debug!(accounts = self.balances.len(), "Memory transaction committed");
        self.release_claims();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.release_claims();
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Memory transaction dropped without commit, rolling back");
            self.release_claims();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Identifier;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn id(n: u8) -> Identifier {
        let mut bytes = [0u8; 11];
        bytes[3] = n;
        Identifier::from_bytes(bytes)
    }

    async fn seeded() -> MemoryLedgerStore {
        seed(MemoryLedgerStore::new()).await
    }

    async fn seed(store: MemoryLedgerStore) -> MemoryLedgerStore {
        let now = Utc::now();
        store
            .create_user(&User {
                id: id(1),
                name: "alice".to_string(),
                created_at: now,
            })
            .await
            .unwrap();
        for n in [10, 11] {
            store
                .create_account(&Account {
                    id: id(n),
                    user_id: id(1),
                    balance: Decimal::ZERO,
                    created_at: now,
                })
                .await
                .unwrap();
        }
        store
    }

    fn row(n: u8, account: u8, key: &str, kind: TransactionKind, ending: Decimal) -> Transaction {
        Transaction {
            id: id(n),
            account_id: id(account),
            external_account: None,
            amount: dec!(1.0000),
            kind,
            ending_balance: ending,
            idempotency_key: key.to_string(),
            related_transaction_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_account_requires_user() {
        let store = MemoryLedgerStore::new();
        let result = store
            .create_account(&Account {
                id: id(10),
                user_id: id(99),
                balance: Decimal::ZERO,
                created_at: Utc::now(),
            })
            .await;
        assert!(matches!(result, Err(LedgerError::UserNotFound(_))));
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.credit(&id(10), dec!(5)).await.unwrap(), Some(dec!(5)));
        let outcome = tx
            .insert_transaction(&row(20, 10, "k", TransactionKind::Deposit, dec!(5)))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        // Nothing visible before commit
        assert_eq!(store.transaction_count(), 0);
        tx.commit().await.unwrap();

        assert_eq!(store.transaction_count(), 1);
        let account = store.get_account(&id(10)).await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(5));
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = seeded().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.credit(&id(10), dec!(5)).await.unwrap();
            tx.insert_transaction(&row(20, 10, "k", TransactionKind::Deposit, dec!(5)))
                .await
                .unwrap();
        }
        assert_eq!(store.transaction_count(), 0);

        // The key is free again
        let mut tx = store.begin().await.unwrap();
        let outcome = tx
            .insert_transaction(&row(21, 10, "k", TransactionKind::Deposit, dec!(5)))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_conditional_debit() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.credit(&id(10), dec!(10.0000)).await.unwrap();
        assert_eq!(tx.debit(&id(10), dec!(10.0001)).await.unwrap(), None);
        assert_eq!(
            tx.debit(&id(10), dec!(10.0000)).await.unwrap(),
            Some(dec!(0.0000))
        );
        assert_eq!(tx.debit(&id(99), dec!(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_key_same_kind() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_transaction(&row(20, 10, "k", TransactionKind::Deposit, dec!(1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let outcome = tx
            .insert_transaction(&row(21, 10, "k", TransactionKind::Deposit, dec!(1)))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Duplicate);

        // Same key under another kind is independent
        let outcome = tx
            .insert_transaction(&row(22, 10, "k", TransactionKind::Withdrawal, dec!(0)))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_pending_key_is_conflict() {
        let store = seeded().await;
        let mut first = store.begin().await.unwrap();
        first
            .insert_transaction(&row(20, 10, "k", TransactionKind::Deposit, dec!(1)))
            .await
            .unwrap();

        let mut second = store.begin().await.unwrap();
        let result = second
            .insert_transaction(&row(21, 11, "k", TransactionKind::Deposit, dec!(1)))
            .await;
        assert!(matches!(result, Err(LedgerError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_row_lock_blocks_until_commit() {
        let store = seeded().await;
        let mut first = store.begin().await.unwrap();
        first.lock_account(&id(10)).await.unwrap().unwrap();

        let contender = store.clone();
        let handle = tokio::spawn(async move {
            let mut tx = contender.begin().await.unwrap();
            let account = tx.lock_account(&id(10)).await.unwrap().unwrap();
            account.balance
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        first.credit(&id(10), dec!(3)).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(handle.await.unwrap(), dec!(3));
    }

    #[tokio::test]
    async fn test_row_lock_wait_times_out() {
        let store = seed(MemoryLedgerStore::with_lock_timeout(Duration::from_millis(20))).await;
        let mut holder = store.begin().await.unwrap();
        holder.lock_account(&id(10)).await.unwrap().unwrap();

        let mut waiter = store.begin().await.unwrap();
        let result = waiter.credit(&id(10), dec!(1)).await;
        assert!(matches!(result, Err(LedgerError::Timeout(_))));

        holder.rollback().await.unwrap();
        assert_eq!(
            waiter.credit(&id(10), dec!(1)).await.unwrap(),
            Some(dec!(1))
        );
    }

    #[tokio::test]
    async fn test_credit_beyond_column_precision_rejected() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.credit(&id(10), dec!(99999999999.9999)).await.unwrap();
        let result = tx.credit(&id(10), dec!(0.0001)).await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_key_lookup_sees_committed_rows_only() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_transaction(&row(20, 10, "k", TransactionKind::Withdrawal, dec!(0)))
            .await
            .unwrap();
        assert!(!tx
            .idempotency_key_exists("k", TransactionKind::Withdrawal)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .idempotency_key_exists("k", TransactionKind::Withdrawal)
            .await
            .unwrap());
        assert!(!tx
            .idempotency_key_exists("k", TransactionKind::Deposit)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_after_cursor() {
        let store = seeded().await;
        let mut tx = store.begin().await.unwrap();
        for (n, key) in [(20, "a"), (21, "b"), (22, "c")] {
            tx.insert_transaction(&row(n, 10, key, TransactionKind::Deposit, dec!(1)))
                .await
                .unwrap();
        }
        tx.insert_transaction(&row(23, 11, "d", TransactionKind::Deposit, dec!(1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let page = store
            .list_transactions(&LogQuery {
                accounts: vec![id(10)],
                after: Some(id(20)),
                fetch: 10,
            })
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![id(21), id(22)]);

        let all = store
            .list_transactions(&LogQuery {
                fetch: 3,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }
}
