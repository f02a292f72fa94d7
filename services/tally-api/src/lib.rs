//! HTTP boundary for the Tally ledger

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;

pub use config::AppConfig;
pub use errors::{ApiError, Result};
