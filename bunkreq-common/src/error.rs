//! Common error types for bunkreq

use thiserror::Error;

/// Common result type for bunkreq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the bunkreq crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input (bad merge/split parameters, malformed filter, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A uniqueness constraint rejected the write
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status class an outer API layer should report for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidInput(_) | Error::Config(_) => 400,
            Error::NotFound(_) => 404,
            Error::UniqueViolation(_) => 409,
            Error::Database(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Internal(_) => 500,
        }
    }

    /// True when the error came from a uniqueness constraint, whether
    /// reported by a store implementation or raw from SQLite
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::UniqueViolation(_) => true,
            Error::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }

    /// True for transient SQLite lock contention ("database is locked")
    pub fn is_lock_contention(&self) -> bool {
        match self {
            Error::Database(db_err) => db_err.to_string().contains("database is locked"),
            _ => false,
        }
    }
}
