//! tm-db - Database abstraction layer for Tidemark
//!
//! This crate provides the narrow capability traits the migration engine is
//! written against (plain execution, one-transaction script execution, and a
//! session-scoped advisory lock) plus the DuckDB implementation.

pub mod duckdb;
pub mod error;
pub mod traits;

pub use duckdb::DuckDbBackend;
pub use error::{DbError, DbResult};
pub use traits::{Database, DatabaseCore, DatabaseLock, DatabaseTransaction, Row};
