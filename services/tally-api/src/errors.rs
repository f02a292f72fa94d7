use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use tally_core::{ErrorKind, LedgerError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        // Store and driver details stay in the logs
        let error_message = if status_code.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Ledger(err) => match err.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::InsufficientFunds => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl ApiError {
    fn error_type(&self) -> &str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Ledger(err) => match err.kind() {
                ErrorKind::Validation => "validation_error",
                ErrorKind::InsufficientFunds => "insufficient_funds",
                ErrorKind::NotFound => "not_found",
                ErrorKind::Internal => "internal_error",
            },
        }
    }
}
