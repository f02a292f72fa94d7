//! PostgreSQL store (sqlx)

use super::{InsertOutcome, LedgerStore, LedgerTx, LogQuery};
use crate::{
    config::DatabaseConfig,
    id::Identifier,
    types::{Account, AccountId, Transaction, TransactionKind, User},
    LedgerError, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, FromRow, Postgres};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the `(idempotency_key, type)` uniqueness constraint
pub const IDEMPOTENCY_CONSTRAINT: &str = "transactions_idempotency_unique";

/// Idempotent schema DDL
///
/// Identifier columns use the "C" collation so text order is byte order.
/// The related-transaction reference is deferred to commit so both legs of a
/// transfer can be inserted already pointing at each other.
pub const SCHEMA: &str = r#"
DO $$
BEGIN
    CREATE TYPE t_transaction AS ENUM ('deposit', 'withdrawal', 'transfer_in', 'transfer_out');
EXCEPTION
    WHEN duplicate_object THEN NULL;
END
$$;

CREATE TABLE IF NOT EXISTS users (
    id          varchar(20) COLLATE "C" PRIMARY KEY,
    name        varchar(255) NOT NULL,
    created_at  timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS accounts (
    id          varchar(20) COLLATE "C" PRIMARY KEY,
    user_id     varchar(20) COLLATE "C" NOT NULL REFERENCES users (id),
    balance     decimal(15,4) NOT NULL DEFAULT 0 CHECK (balance >= 0),
    created_at  timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS transactions (
    id                      varchar(20) COLLATE "C" PRIMARY KEY,
    account_id              varchar(20) COLLATE "C" NOT NULL REFERENCES accounts (id),
    external_account        varchar(20) COLLATE "C" REFERENCES accounts (id),
    amount                  decimal(15,4) NOT NULL CHECK (amount >= 0),
    type                    t_transaction NOT NULL,
    ending_balance          decimal(15,4) NOT NULL,
    idempotency_key         varchar(100) NOT NULL,
    related_transaction_id  varchar(20) COLLATE "C"
                            REFERENCES transactions (id) DEFERRABLE INITIALLY DEFERRED,
    created_at              timestamptz NOT NULL,
    CONSTRAINT transactions_idempotency_unique UNIQUE (idempotency_key, type)
);

CREATE INDEX IF NOT EXISTS transactions_account_created_idx
    ON transactions (account_id, created_at DESC, id DESC);
"#;

#[derive(FromRow)]
struct AccountRow {
    id: String,
    user_id: String,
    balance: Decimal,
    created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = LedgerError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            id: stored_id(&row.id)?,
            user_id: stored_id(&row.user_id)?,
            balance: row.balance,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: String,
    account_id: String,
    external_account: Option<String>,
    amount: Decimal,
    #[sqlx(rename = "type")]
    kind: TransactionKind,
    ending_balance: Decimal,
    idempotency_key: String,
    related_transaction_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Transaction {
            id: stored_id(&row.id)?,
            account_id: stored_id(&row.account_id)?,
            external_account: row.external_account.as_deref().map(stored_id).transpose()?,
            amount: row.amount,
            kind: row.kind,
            ending_balance: row.ending_balance,
            idempotency_key: row.idempotency_key,
            related_transaction_id: row
                .related_transaction_id
                .as_deref()
                .map(stored_id)
                .transpose()?,
            created_at: row.created_at,
        })
    }
}

/// Identifiers read back from the store are trusted to be well-formed
fn stored_id(text: &str) -> Result<Identifier> {
    Identifier::parse(text)
        .map_err(|e| LedgerError::Internal(format!("stored identifier {:?}: {}", text, e)))
}

/// Map a driver error onto the ledger taxonomy
fn classify(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") => LedgerError::Conflict(db.message().to_string()),
            Some("57014") => LedgerError::Timeout(db.message().to_string()),
            _ => LedgerError::Database(err),
        },
        sqlx::Error::PoolTimedOut => LedgerError::Timeout("connection pool exhausted".to_string()),
        _ => LedgerError::Database(err),
    }
}

fn is_idempotency_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23505") && db.constraint() == Some(IDEMPOTENCY_CONSTRAINT)
        }
        _ => false,
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23503"),
        _ => false,
    }
}

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    statement_timeout_ms: u64,
}

impl PgLedgerStore {
    /// Connect a pool using the database configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self::from_pool(pool, config.statement_timeout_ms))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool, statement_timeout_ms: u64) -> Self {
        Self {
            pool,
            statement_timeout_ms,
        }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the idempotent schema DDL
    pub async fn create_schema(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await?;
        info!("Schema ensured");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        // SET does not take bind parameters
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout_ms
        ))
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        Ok(Box::new(PgTx { tx }))
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query("INSERT INTO users (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(user.id.to_string())
            .bind(&user.name)
            .bind(user.created_at)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, user_id, balance, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(account.id.to_string())
        .bind(account.user_id.to_string())
        .bind(account.balance)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                LedgerError::UserNotFound(account.user_id)
            } else {
                classify(e)
            }
        })?;
        Ok(())
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT id, user_id, balance, created_at FROM accounts WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?
        .map(Account::try_from)
        .transpose()
    }

    async fn ending_balance_at(
        &self,
        account: &AccountId,
        at: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let balance = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT ending_balance FROM transactions
            WHERE account_id = $1 AND created_at <= $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(account.to_string())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        Ok(balance)
    }

    async fn list_transactions(&self, query: &LogQuery) -> Result<Vec<Transaction>> {
        let accounts: Vec<String> = query.accounts.iter().map(|id| id.to_string()).collect();
        let after = query.after.map(|id| id.to_string());

        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, account_id, external_account, amount, type, ending_balance,
                   idempotency_key, related_transaction_id, created_at
            FROM transactions
            WHERE (cardinality($1::varchar[]) = 0 OR account_id = ANY($1))
              AND ($2::varchar IS NULL OR id > $2)
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(&accounts)
        .bind(after)
        .bind(i64::from(query.fetch))
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        debug!(rows = rows.len(), "Transaction page fetched");
        rows.into_iter().map(Transaction::try_from).collect()
    }
}

struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn lock_account(&mut self, id: &AccountId) -> Result<Option<Account>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT id, user_id, balance, created_at FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)?
        .map(Account::try_from)
        .transpose()
    }

    async fn credit(&mut self, id: &AccountId, amount: Decimal) -> Result<Option<Decimal>> {
        sqlx::query_scalar::<_, Decimal>(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING balance",
        )
        .bind(amount)
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)
    }

    async fn debit(&mut self, id: &AccountId, amount: Decimal) -> Result<Option<Decimal>> {
        sqlx::query_scalar::<_, Decimal>(
            r#"
            UPDATE accounts SET balance = balance - $1
            WHERE id = $2 AND balance >= $1
            RETURNING balance
            "#,
        )
        .bind(amount)
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(classify)
    }

    async fn idempotency_key_exists(
        &mut self,
        idempotency_key: &str,
        kind: TransactionKind,
    ) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM transactions WHERE idempotency_key = $1 AND type = $2)",
        )
        .bind(idempotency_key)
        .bind(kind)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(classify)
    }

    async fn insert_transaction(&mut self, row: &Transaction) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (
                id, account_id, external_account, amount, type, ending_balance,
                idempotency_key, related_transaction_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(row.id.to_string())
        .bind(row.account_id.to_string())
        .bind(row.external_account.map(|id| id.to_string()))
        .bind(row.amount)
        .bind(row.kind)
        .bind(row.ending_balance)
        .bind(&row.idempotency_key)
        .bind(row.related_transaction_id.map(|id| id.to_string()))
        .bind(row.created_at)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_idempotency_violation(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(classify(e)),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(classify)
    }
}
