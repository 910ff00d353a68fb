use super::types::ConnectionId;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("No active transaction: {0}")]
    UnresolvedContext(String),

    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Connection type mismatch: {0}")]
    ConnectionTypeMismatch(String),

    #[error("Connection pool timeout: {0}")]
    PoolTimeout(String),

    #[error("Lock wait timeout: {0}")]
    LockTimeout(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Database '{0}' is not configured")]
    UnknownDatabase(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
