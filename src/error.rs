//! Error types for runner-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot derive identity: {0}")]
    Identity(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid channel name {name:?}: {reason}")]
    InvalidChannel { name: String, reason: String },

    #[error("broker is closed")]
    BrokerClosed,

    #[error("{0} already started")]
    AlreadyStarted(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
