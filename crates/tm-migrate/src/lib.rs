//! tm-migrate - Schema migration engine for Tidemark
//!
//! Applies an ordered set of versioned up/down SQL scripts to a database,
//! one transaction per version, while keeping a persistent
//! `(version, dirty)` record and an applied history. Mutating operations run
//! under a cross-process lease lock; a step that fails part-way leaves the
//! schema marked dirty until an operator forces a version.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tm_core::OpContext;
//! use tm_db::{Database, DuckDbBackend};
//! use tm_migrate::{MigrationManager, MigratorSettings};
//!
//! # async fn run() -> tm_migrate::MigrateResult<()> {
//! let db: Arc<dyn Database> = Arc::new(DuckDbBackend::new("app.duckdb").unwrap());
//! let mut manager = MigrationManager::new(db, MigratorSettings::new("migrations"));
//! let ctx = OpContext::background();
//! manager.init(&ctx).await?;
//! let report = manager.run_migrations(&ctx, 0).await?;
//! println!("{} -> {}", report.from, report.to);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod lock;
pub mod manager;
pub mod metrics;
pub mod source;
pub mod version_store;

pub use error::{
    Discrepancy, EngineError, LockError, MigrateError, MigrateResult, SourceError, StepFailure,
    StoreError,
};
pub use lock::{lock_key, LockHandle, Locker};
pub use manager::{
    MigrationManager, MigrationReport, MigrationStatus, MigratorSettings, StepRecord,
};
pub use metrics::{CountingMetrics, MetricsSnapshot, MigrationMetrics, NoopMetrics};
pub use source::{
    CreateOptions, CreatedMigration, Direction, MigrationDefinition, MigrationScript,
    MigrationSet, SourceOptions,
};
pub use version_store::{AppliedRecord, SchemaState, VersionStore};
