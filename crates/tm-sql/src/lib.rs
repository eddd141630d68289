//! tm-sql - SQL script handling for Tidemark
//!
//! Migration scripts are plain SQL files holding any number of statements.
//! This crate splits them into individual statements with sqlparser's
//! tokenizer, so string literals, quoted identifiers and comments containing
//! `;` never cut a statement in half, and so the engine can check for
//! cancellation between statements.

pub mod dialect;
pub mod error;
pub mod splitter;

pub use dialect::{DuckDbDialect, GenericDialect, SqlDialect};
pub use error::{SqlError, SqlResult};
pub use splitter::StatementSplitter;
