//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString so it
//! never ends up in logs.

use crate::broker::PostgresConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_VISIBILITY_TIMEOUT: i32 = 30;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// How often an idle queue consumer polls Postgres.
    pub poll_interval: Duration,
    /// pgmq visibility timeout, in seconds.
    pub visibility_timeout: i32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let poll_ms: u64 = optional_var("RUNNER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let visibility_timeout: i32 =
            optional_var("RUNNER_VISIBILITY_TIMEOUT", DEFAULT_VISIBILITY_TIMEOUT)?;
        if visibility_timeout <= 0 {
            return Err(Error::Config(
                "RUNNER_VISIBILITY_TIMEOUT must be positive".to_string(),
            ));
        }
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().filter(|v| !v.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            poll_interval: Duration::from_millis(poll_ms),
            visibility_timeout,
        })
    }

    /// Broker settings with `max_connections` sized by the caller.
    pub fn postgres(&self, max_connections: u32) -> PostgresConfig {
        PostgresConfig {
            max_connections,
            visibility_timeout: self.visibility_timeout,
            poll_interval: self.poll_interval,
            ..PostgresConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} has invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}
