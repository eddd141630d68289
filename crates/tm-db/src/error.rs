//! Error types for tm-db

use thiserror::Error;
use tm_core::Interrupted;

/// Database operation errors
#[derive(Error, Debug)]
pub enum DbError {
    /// Connection error (D001)
    #[error("[D001] Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution error (D002)
    #[error("[D002] SQL execution failed: {0}")]
    ExecutionError(String),

    /// Transaction control failed (D003)
    #[error("[D003] Transaction failed: {0}")]
    TransactionError(String),

    /// Work stopped by the operation context; the transaction was rolled back (D004)
    #[error("[D004] Interrupted before commit: {0}")]
    Interrupted(#[from] Interrupted),

    /// Unexpected value shape in a query result (D005)
    #[error("[D005] Unexpected query result: {0}")]
    UnexpectedResult(String),

    /// Mutex poisoned (D006)
    #[error("[D006] Database mutex poisoned: {0}")]
    MutexPoisoned(String),

    /// Another process holds the database file (D007)
    #[error("[D007] Database is locked by another process: {0}")]
    Locked(String),
}

impl DbError {
    /// Whether the error is a write-write conflict or a key collision raised
    /// by a concurrent session, as opposed to a broken statement or connection.
    pub fn is_conflict(&self) -> bool {
        match self {
            DbError::ExecutionError(msg) | DbError::TransactionError(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("conflict")
                    || msg.contains("duplicate key")
                    || msg.contains("constraint violat")
            }
            _ => false,
        }
    }
}

/// Result type alias for DbError
pub type DbResult<T> = Result<T, DbError>;

impl From<duckdb::Error> for DbError {
    fn from(err: duckdb::Error) -> Self {
        DbError::ExecutionError(err.to_string())
    }
}
