//! Configuration for the ledger

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// PostgreSQL connection settings
    pub database: DatabaseConfig,

    /// Engine behaviour
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "tally-ledger".to_string(),
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,

    /// Pool size
    pub max_connections: u32,

    /// Idle connections kept open
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,

    /// Per-statement timeout inside mutation transactions (milliseconds)
    pub statement_timeout_ms: u64,

    /// Run the idempotent schema DDL on connect
    pub create_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 2,
            acquire_timeout_secs: 5,
            statement_timeout_ms: 5_000,
            create_schema: true,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry on serialization conflicts
    pub retry: RetryConfig,

    /// Page size used when the caller asks for zero or fewer rows
    pub default_page_limit: u32,

    /// Largest page served
    pub max_page_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            default_page_limit: 10,
            max_page_limit: 1_000,
        }
    }
}

impl Config {
    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.database.url.is_empty() {
            return Err(crate::LedgerError::Config(
                "database.url is required".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(crate::LedgerError::Config(
                "database.max_connections must be positive".to_string(),
            ));
        }
        self.engine.validate()
    }
}

impl EngineConfig {
    /// Reject inconsistent paging or retry settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.default_page_limit == 0 {
            return Err(crate::LedgerError::Config(
                "engine.default_page_limit must be positive".to_string(),
            ));
        }
        if self.max_page_limit < self.default_page_limit {
            return Err(crate::LedgerError::Config(
                "engine.max_page_limit must be >= engine.default_page_limit".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(crate::LedgerError::Config(
                "engine.retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "tally-ledger");
        assert_eq!(config.engine.default_page_limit, 10);
        assert_eq!(config.engine.retry.max_retries, 3);
        assert!(config.database.create_schema);
    }

    #[test]
    fn test_missing_url_rejected() {
        assert!(Config::default().validate().is_err());

        let mut config = Config::default();
        config.database.url = "postgres://localhost/tally".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"engine": {"default_page_limit": 25}}"#).unwrap();
        assert_eq!(config.engine.default_page_limit, 25);
        assert_eq!(config.engine.max_page_limit, 1_000);
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn test_page_limits_must_be_ordered() {
        let mut engine = EngineConfig::default();
        engine.max_page_limit = 5;
        assert!(engine.validate().is_err());
    }
}
