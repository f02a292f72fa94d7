//! Point-in-time balances
//!
//! A balance at instant `t` is the ending balance of the latest row on the
//! account created at or before `t`, with ties on `created_at` broken by the
//! larger identifier. No row means zero.

use crate::{
    store::LedgerStore,
    types::{AccountId, BalanceSnapshot, AMOUNT_SCALE},
    LedgerError, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

/// Rebuilds balances from the transaction log
#[derive(Debug, Clone)]
pub struct BalanceReconstructor {
    store: Arc<dyn LedgerStore>,
}

impl BalanceReconstructor {
    /// Create a reconstructor over a store
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Balance of `account` as of `at`
    ///
    /// Fails with `AccountNotFound` for an unknown account; an account without
    /// history at `at` reports zero.
    pub async fn balance_as_of(
        &self,
        account: AccountId,
        at: DateTime<Utc>,
    ) -> Result<BalanceSnapshot> {
        if self.store.get_account(&account).await?.is_none() {
            return Err(LedgerError::AccountNotFound(account));
        }

        let balance = self
            .store
            .ending_balance_at(&account, at)
            .await?
            .unwrap_or_else(|| Decimal::new(0, AMOUNT_SCALE));

        debug!(account_id = %account, at = %at, balance = %balance, "Balance reconstructed");

        Ok(BalanceSnapshot {
            account_id: account,
            balance,
            timestamp: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        engine::LedgerEngine,
        id::{IdGenerator, Identifier},
        metrics::LedgerMetrics,
        retry::RetryPolicy,
        store::MemoryLedgerStore,
        types::{Account, User},
    };
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_balance_history() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let ids = Arc::new(IdGenerator::new(clock.clone()));
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());

        let user = User {
            id: ids.generate().unwrap(),
            name: "u".to_string(),
            created_at: clock.now(),
        };
        store.create_user(&user).await.unwrap();
        let account = Account {
            id: ids.generate().unwrap(),
            user_id: user.id,
            balance: Decimal::ZERO,
            created_at: clock.now(),
        };
        store.create_account(&account).await.unwrap();

        let engine = LedgerEngine::new(
            store.clone(),
            ids,
            RetryPolicy::default(),
            LedgerMetrics::new().unwrap(),
        );
        let balances = BalanceReconstructor::new(store.clone());

        // T1: deposit 100, T2: withdraw 30
        clock.advance(Duration::minutes(1));
        let t1 = clock.now();
        engine.deposit(account.id, dec!(100), "d").await.unwrap();
        clock.advance(Duration::minutes(1));
        let t2 = clock.now();
        engine.withdraw(account.id, dec!(30), "w").await.unwrap();

        let (balances, account_id) = (&balances, account.id);
        let at = move |t: DateTime<Utc>| balances.balance_as_of(account_id, t);
        assert_eq!(at(t1 - Duration::seconds(1)).await.unwrap().balance, Decimal::ZERO);
        assert_eq!(at(t1).await.unwrap().balance, dec!(100));
        assert_eq!(at(t1 + Duration::seconds(30)).await.unwrap().balance, dec!(100));
        assert_eq!(at(t2).await.unwrap().balance, dec!(70));
        assert_eq!(at(t2 + Duration::days(1)).await.unwrap().balance, dec!(70));
    }

    #[tokio::test]
    async fn test_empty_history_keeps_amount_scale() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ids = IdGenerator::new(clock.clone());
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let user = User {
            id: ids.generate().unwrap(),
            name: "u".to_string(),
            created_at: clock.now(),
        };
        store.create_user(&user).await.unwrap();
        let account = Account {
            id: ids.generate().unwrap(),
            user_id: user.id,
            balance: Decimal::ZERO,
            created_at: clock.now(),
        };
        store.create_account(&account).await.unwrap();

        let snapshot = BalanceReconstructor::new(store)
            .balance_as_of(account.id, clock.now())
            .await
            .unwrap();
        assert_eq!(snapshot.balance.scale(), AMOUNT_SCALE);
        assert_eq!(snapshot.balance.to_string(), "0.0000");
    }

    #[tokio::test]
    async fn test_clock_regression_keeps_latest_balance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let ids = Arc::new(IdGenerator::new(clock.clone()));
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());

        let user = User {
            id: ids.generate().unwrap(),
            name: "u".to_string(),
            created_at: clock.now(),
        };
        store.create_user(&user).await.unwrap();
        let account = Account {
            id: ids.generate().unwrap(),
            user_id: user.id,
            balance: Decimal::ZERO,
            created_at: clock.now(),
        };
        store.create_account(&account).await.unwrap();

        let engine = LedgerEngine::new(
            store.clone(),
            ids,
            RetryPolicy::default(),
            LedgerMetrics::new().unwrap(),
        );
        engine.deposit(account.id, dec!(100), "first").await.unwrap();
        clock.advance(Duration::seconds(-30));
        engine.deposit(account.id, dec!(50), "second").await.unwrap();

        let stored = store.get_account(&account.id).await.unwrap().unwrap().balance;
        assert_eq!(stored, dec!(150));

        let snapshot = BalanceReconstructor::new(store)
            .balance_as_of(account.id, start)
            .await
            .unwrap();
        assert_eq!(snapshot.balance, stored);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let balances = BalanceReconstructor::new(Arc::new(MemoryLedgerStore::new()));
        let ghost = Identifier::from_bytes([3; 11]);
        let result = balances.balance_as_of(ghost, Utc::now()).await;
        assert!(matches!(result, Err(LedgerError::AccountNotFound(id)) if id == ghost));
    }
}
