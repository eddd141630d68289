//! Error types for tm-sql

use thiserror::Error;

/// SQL script errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    /// Unknown dialect name (Q001)
    #[error("[Q001] Unknown SQL dialect: {0}")]
    UnknownDialect(String),

    /// Script tries to manage its own transaction (Q002)
    #[error("[Q002] Statement {index} controls transactions ('{keyword}'); migration scripts already run inside a transaction")]
    TransactionControl { index: usize, keyword: String },
}

/// Result type alias for SqlError
pub type SqlResult<T> = Result<T, SqlError>;
