//! tm-core - Core library for Tidemark
//!
//! This crate provides the shared pieces every other Tidemark crate builds
//! on: `tidemark.yml` configuration parsing, the core error type, SHA-256
//! checksums, SQL quoting helpers, and the [`OpContext`] deadline /
//! cancellation carrier passed through every engine operation.

pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub(crate) mod serde_helpers;
pub mod sql_utils;

pub use checksum::{compute_checksum, compute_checksum_bytes};
pub use config::{Config, DbType, LockConfig, MigrationsConfig, VersionFormat};
pub use context::{Interrupted, OpContext};
pub use error::{CoreError, CoreResult};
