//! Core types for the ledger
//!
//! Money is `Decimal` with four fractional digits, matching the
//! `decimal(15,4)` columns of the store.

use crate::{error::LedgerError, id::Identifier, Result};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account identifier
pub type AccountId = Identifier;

/// User identifier
pub type UserId = Identifier;

/// Transaction identifier
pub type TransactionId = Identifier;

/// Fractional digits kept on every amount and balance
pub const AMOUNT_SCALE: u32 = 4;

/// Integer digits available in `decimal(15,4)`
const AMOUNT_INTEGER_DIGITS: u32 = 11;

/// Longest idempotency key accepted (`varchar(100)`)
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 100;

/// Kind tag of a transaction row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "t_transaction", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Money in
    Deposit,
    /// Money out
    Withdrawal,
    /// Credit leg of a transfer
    TransferIn,
    /// Debit leg of a transfer
    TransferOut,
}

impl TransactionKind {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::TransferIn => "transfer_in",
            TransactionKind::TransferOut => "transfer_out",
        }
    }

    /// Whether the kind increases the owning account's balance
    pub fn is_credit(&self) -> bool {
        matches!(self, TransactionKind::Deposit | TransactionKind::TransferIn)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID
    pub id: UserId,
    /// Display name
    pub name: String,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Account row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account ID
    pub id: AccountId,
    /// Owning user
    pub user_id: UserId,
    /// Current balance; equals the latest transaction's ending balance
    pub balance: Decimal,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Immutable transaction row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,
    /// Account whose balance moved
    pub account_id: AccountId,
    /// Counterparty account (transfers only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account: Option<AccountId>,
    /// Always positive; direction comes from `kind`
    pub amount: Decimal,
    /// Kind tag
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Owning account's balance right after this row
    pub ending_balance: Decimal,
    /// Caller-supplied key, unique together with `kind`
    pub idempotency_key: String,
    /// Opposite leg of a transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_transaction_id: Option<TransactionId>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Result of a mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// New effect written
    Applied(T),
    /// The (key, kind) pair was already used; nothing written
    Replayed,
}

impl<T> Outcome<T> {
    /// True for [`Outcome::Replayed`]
    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed)
    }

    /// Receipt of a new effect
    pub fn applied(self) -> Option<T> {
        match self {
            Outcome::Applied(receipt) => Some(receipt),
            Outcome::Replayed => None,
        }
    }
}

/// Both legs of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    /// `transfer_out` row on the source account
    pub outgoing: Transaction,
    /// `transfer_in` row on the destination account
    pub incoming: Transaction,
}

/// Point-in-time balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    /// Account ID
    pub account_id: AccountId,
    /// Ending balance of the latest row at or before `timestamp`
    pub balance: Decimal,
    /// Requested instant
    pub timestamp: DateTime<Utc>,
}

/// Coerce a caller amount to the stored representation
///
/// Negative amounts are flipped (sign slips are tolerated), extra fractional
/// digits are rounded away from zero at the midpoint, and amounts that do not
/// fit `decimal(15,4)` are rejected.
pub fn normalize_amount(amount: Decimal) -> Result<Decimal> {
    let mut normalized = amount
        .abs()
        .round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    if !fits_amount_column(normalized) {
        return Err(LedgerError::Validation(format!(
            "amount {} exceeds {} integer digits",
            amount, AMOUNT_INTEGER_DIGITS
        )));
    }
    normalized.rescale(AMOUNT_SCALE);
    Ok(normalized)
}

/// Whether `value` is representable in `decimal(15,4)`
pub fn fits_amount_column(value: Decimal) -> bool {
    value.abs() < Decimal::from(10u64.pow(AMOUNT_INTEGER_DIGITS))
}

/// Reject empty or oversized idempotency keys
pub fn validate_idempotency_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(LedgerError::Validation(
            "idempotency key is required".to_string(),
        ));
    }
    if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(LedgerError::Validation(format!(
            "idempotency key longer than {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(())
}
