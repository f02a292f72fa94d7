//! Balance mutations
//!
//! Each operation is one unit of work in a fresh store transaction:
//! lock the account row(s), move the balance, append the transaction row(s),
//! commit. A duplicate `(idempotency_key, kind)` turns the unit into a no-op
//! replay. On every other failure the store transaction is rolled back so no
//! partial state is visible.

use crate::{
    id::IdGenerator,
    metrics::LedgerMetrics,
    retry::RetryPolicy,
    store::{InsertOutcome, LedgerStore, LedgerTx},
    types::{
        normalize_amount, validate_idempotency_key, AccountId, Outcome, Transaction,
        TransactionId, TransactionKind, TransferReceipt,
    },
    ErrorKind, LedgerError, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Deposit, withdrawal and transfer
#[derive(Debug, Clone)]
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    ids: Arc<IdGenerator>,
    retry: RetryPolicy,
    metrics: LedgerMetrics,
}

impl LedgerEngine {
    /// Create an engine over a store
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ids: Arc<IdGenerator>,
        retry: RetryPolicy,
        metrics: LedgerMetrics,
    ) -> Self {
        Self {
            store,
            ids,
            retry,
            metrics,
        }
    }

    /// Credit `amount` to `account`
    pub async fn deposit(
        &self,
        account: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<Transaction>> {
        let started = Instant::now();
        let result = self
            .single(TransactionKind::Deposit, account, amount, idempotency_key)
            .await;
        self.observe("deposit", started, &result);
        result
    }

    /// Debit `amount` from `account` if the balance covers it
    pub async fn withdraw(
        &self,
        account: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<Transaction>> {
        let started = Instant::now();
        let result = self
            .single(TransactionKind::Withdrawal, account, amount, idempotency_key)
            .await;
        self.observe("withdraw", started, &result);
        result
    }

    /// Move `amount` from `from` to `to` as two linked rows
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<TransferReceipt>> {
        let started = Instant::now();
        let result = self.transfer_unit(from, to, amount, idempotency_key).await;
        self.observe("transfer", started, &result);
        result
    }

    async fn single(
        &self,
        kind: TransactionKind,
        account: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<Transaction>> {
        let amount = normalize_amount(amount)?;
        validate_idempotency_key(idempotency_key)?;

        let outcome = self
            .retry
            .run(
                kind.as_str(),
                move || self.try_single(kind, account, amount, idempotency_key),
                || self.metrics.retries.inc(),
            )
            .await?;

        match &outcome {
            Outcome::Applied(row) => info!(
                transaction_id = %row.id,
                account_id = %account,
                kind = %kind,
                amount = %amount,
                ending_balance = %row.ending_balance,
                "Transaction applied"
            ),
            Outcome::Replayed => warn!(
                account_id = %account,
                kind = %kind,
                idempotency_key,
                "Idempotent replay, nothing written"
            ),
        }
        Ok(outcome)
    }

    async fn try_single(
        &self,
        kind: TransactionKind,
        account: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<Transaction>> {
        let mut tx = self.store.begin().await?;
        let result = self
            .apply_single(tx.as_mut(), kind, account, amount, idempotency_key)
            .await;
        finish(tx, result).await
    }

    async fn apply_single(
        &self,
        tx: &mut dyn LedgerTx,
        kind: TransactionKind,
        account: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<Transaction>> {
        let locked = tx
            .lock_account(&account)
            .await?
            .ok_or(LedgerError::AccountNotFound(account))?;

        let ending_balance = if kind.is_credit() {
            tx.credit(&account, amount)
                .await?
                .ok_or(LedgerError::AccountNotFound(account))?
        } else {
            match tx.debit(&account, amount).await? {
                Some(balance) => balance,
                None => {
                    return rejected_debit(
                        tx,
                        idempotency_key,
                        kind,
                        LedgerError::InsufficientFunds {
                            account,
                            requested: amount,
                            available: locked.balance,
                        },
                    )
                    .await
                }
            }
        };

        let (id, created_at) = self.next_id()?;
        let row = Transaction {
            id,
            account_id: account,
            external_account: None,
            amount,
            kind,
            ending_balance,
            idempotency_key: idempotency_key.to_string(),
            related_transaction_id: None,
            created_at,
        };

        match tx.insert_transaction(&row).await? {
            InsertOutcome::Inserted => Ok(Outcome::Applied(row)),
            InsertOutcome::Duplicate => Ok(Outcome::Replayed),
        }
    }

    async fn transfer_unit(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<TransferReceipt>> {
        if from == to {
            return Err(LedgerError::Validation(
                "cannot transfer to the same account".to_string(),
            ));
        }
        let amount = normalize_amount(amount)?;
        validate_idempotency_key(idempotency_key)?;

        let outcome = self
            .retry
            .run(
                "transfer",
                move || self.try_transfer(from, to, amount, idempotency_key),
                || self.metrics.retries.inc(),
            )
            .await?;

        match &outcome {
            Outcome::Applied(receipt) => info!(
                outgoing_id = %receipt.outgoing.id,
                incoming_id = %receipt.incoming.id,
                from = %from,
                to = %to,
                amount = %amount,
                "Transfer applied"
            ),
            Outcome::Replayed => warn!(
                from = %from,
                to = %to,
                idempotency_key,
                "Idempotent transfer replay, nothing written"
            ),
        }
        Ok(outcome)
    }

    async fn try_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<TransferReceipt>> {
        let mut tx = self.store.begin().await?;
        let result = self
            .apply_transfer(tx.as_mut(), from, to, amount, idempotency_key)
            .await;
        finish(tx, result).await
    }

    async fn apply_transfer(
        &self,
        tx: &mut dyn LedgerTx,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<Outcome<TransferReceipt>> {
        // Ascending order whatever the direction, so opposing transfers cannot deadlock
        let (low, high) = if from < to { (from, to) } else { (to, from) };
        let first = tx
            .lock_account(&low)
            .await?
            .ok_or(LedgerError::AccountNotFound(low))?;
        let second = tx
            .lock_account(&high)
            .await?
            .ok_or(LedgerError::AccountNotFound(high))?;
        let available = if first.id == from {
            first.balance
        } else {
            second.balance
        };

        let outgoing_balance = match tx.debit(&from, amount).await? {
            Some(balance) => balance,
            None => {
                return rejected_debit(
                    tx,
                    idempotency_key,
                    TransactionKind::TransferOut,
                    LedgerError::InsufficientFunds {
                        account: from,
                        requested: amount,
                        available,
                    },
                )
                .await
            }
        };
        let incoming_balance = tx
            .credit(&to, amount)
            .await?
            .ok_or(LedgerError::AccountNotFound(to))?;

        // Both legs carry the outgoing leg's instant
        let (outgoing_id, created_at) = self.next_id()?;
        let (incoming_id, _) = self.next_id()?;

        let outgoing = Transaction {
            id: outgoing_id,
            account_id: from,
            external_account: Some(to),
            amount,
            kind: TransactionKind::TransferOut,
            ending_balance: outgoing_balance,
            idempotency_key: idempotency_key.to_string(),
            related_transaction_id: Some(incoming_id),
            created_at,
        };
        let incoming = Transaction {
            id: incoming_id,
            account_id: to,
            external_account: Some(from),
            amount,
            kind: TransactionKind::TransferIn,
            ending_balance: incoming_balance,
            idempotency_key: idempotency_key.to_string(),
            related_transaction_id: Some(outgoing_id),
            created_at,
        };

        for row in [&outgoing, &incoming] {
            if tx.insert_transaction(row).await? == InsertOutcome::Duplicate {
                return Ok(Outcome::Replayed);
            }
        }

        Ok(Outcome::Applied(TransferReceipt { outgoing, incoming }))
    }

    fn next_id(&self) -> Result<(TransactionId, DateTime<Utc>)> {
        let issued = self.ids.issue()?;
        self.metrics.ids_generated.inc();
        Ok(issued)
    }

    fn observe<T>(&self, operation: &str, started: Instant, result: &Result<Outcome<T>>) {
        self.metrics
            .record_duration(operation, started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(Outcome::Applied(_)) => "applied",
            Ok(Outcome::Replayed) => "replayed",
            Err(err) => match err.kind() {
                ErrorKind::Validation => "validation",
                ErrorKind::InsufficientFunds => {
                    warn!(operation, error = %err, "Rejected");
                    "insufficient_funds"
                }
                ErrorKind::NotFound => "not_found",
                ErrorKind::Internal => {
                    error!(operation, error = %err, "Ledger operation failed");
                    "error"
                }
            },
        };
        self.metrics.record_outcome(operation, outcome);
    }
}

/// A debit the balance cannot cover is a replay when the key was already
/// applied; the earlier effect is not validated again.
async fn rejected_debit<T>(
    tx: &mut dyn LedgerTx,
    idempotency_key: &str,
    kind: TransactionKind,
    err: LedgerError,
) -> Result<Outcome<T>> {
    if tx.idempotency_key_exists(idempotency_key, kind).await? {
        return Ok(Outcome::Replayed);
    }
    Err(err)
}

/// Commit applied work, roll back replays and failures
async fn finish<T>(tx: Box<dyn LedgerTx>, result: Result<Outcome<T>>) -> Result<Outcome<T>> {
    match result {
        Ok(Outcome::Applied(receipt)) => {
            tx.commit().await?;
            Ok(Outcome::Applied(receipt))
        }
        Ok(Outcome::Replayed) => {
            tx.rollback().await?;
            Ok(Outcome::Replayed)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after error");
            }
            Err(err)
        }
    }
}
