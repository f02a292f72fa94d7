use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

/// Service configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ledger: tally_core::Config,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    /// Serve from process memory instead of PostgreSQL
    pub in_memory: bool,
    /// `pretty` or `json`
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 4,
            in_memory: false,
            log_format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?
            .set_default("server.in_memory", false)?
            .set_default("server.log_format", "pretty")?
            .set_default("ledger.service_name", "tally-ledger")?
            .set_default("ledger.database.max_connections", 10)?
            .set_default("ledger.database.min_connections", 2)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables, e.g. TALLY__SERVER__PORT
        builder = builder.add_source(Environment::with_prefix("TALLY").separator("__"));

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("ledger.database.url", db_url)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.server.workers == 0 {
            return Err("At least one worker is required".to_string());
        }

        if !matches!(self.server.log_format.as_str(), "pretty" | "json") {
            return Err(format!(
                "Unknown log format {:?}, expected pretty or json",
                self.server.log_format
            ));
        }

        // The database is only needed when not serving from memory
        let ledger = if self.server.in_memory {
            self.ledger.engine.validate()
        } else {
            self.ledger.validate()
        };
        ledger.map_err(|e| e.to_string())
    }
}
