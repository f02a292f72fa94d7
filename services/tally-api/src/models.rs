use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_core::Identifier;
use validator::Validate;

/// User creation request
#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserResponse {
    pub user_id: Identifier,
}

/// Account creation request
#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    #[validate(length(min = 18, max = 19))]
    pub user_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountResponse {
    pub account_id: Identifier,
}

/// Deposit or withdrawal request
#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MovementRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 100))]
    pub idempotency_key: String,
}

/// Transfer request
#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 100))]
    pub idempotency_key: String,
    #[validate(length(min = 18, max = 19))]
    pub external_account: String,
}

/// Body returned when an idempotency key was already used
#[derive(Debug, Deserialize, Serialize)]
pub struct ReplayResponse {
    pub replayed: bool,
}

/// Balance query string
#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    /// RFC 3339 instant; now when absent
    pub timestamp: Option<String>,
}
