//! Error types for tm-migrate
//!
//! Each component has its own error family with stable codes; [`MigrateError`]
//! is the umbrella returned by the public engine operations.

use crate::source::Direction;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tm_core::Interrupted;
use tm_db::DbError;
use tm_sql::SqlError;

/// Migration source errors. None of these are retryable.
#[derive(Error, Debug)]
pub enum SourceError {
    /// File name does not follow `{version}_{name}.{up|down}.sql` (S001)
    #[error("[S001] Malformed migration file name '{name}': {reason}")]
    MalformedName { name: String, reason: String },

    /// Two files claim the same version and direction, or disagree on the name (S002)
    #[error("[S002] Duplicate migration version {version}: '{first}' and '{second}'")]
    DuplicateVersion {
        version: u64,
        first: String,
        second: String,
    },

    /// One half of an up/down pair is missing (S003)
    #[error("[S003] Migration {version} has no {missing} script")]
    MissingPair { version: u64, missing: Direction },

    /// Directory or file could not be read (S004)
    #[error("[S004] Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No migrations found and empty sets are not allowed (S005)
    #[error("[S005] No migrations found in {path}")]
    Empty { path: PathBuf },
}

/// Version store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The state table could not be read or written (V001)
    #[error("[V001] Version store unavailable: {0}")]
    Unavailable(#[from] DbError),

    /// Compare-and-set lost: the persisted state is not what the caller expected (V002)
    #[error("[V002] Version store conflict: expected clean version {expected}, found version {found} (dirty: {dirty})")]
    Conflict { expected: u64, found: u64, dirty: bool },

    /// Version does not fit the `BIGINT` state column (V003)
    #[error("[V003] Version {version} is out of range (maximum {max})", max = i64::MAX)]
    VersionOutOfRange { version: u64 },
}

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Another session kept the lock for the whole wait (L001)
    #[error("[L001] Timed out after {waited:?} waiting for migration lock '{key}'")]
    Timeout { key: String, waited: Duration },

    /// The lease could not be renewed and may now belong to someone else (L002)
    #[error("[L002] Migration lock '{key}' was lost")]
    Lost { key: String },

    /// The backend failed while taking or releasing the lock (L003)
    #[error("[L003] Lock backend failure: {0}")]
    Backend(#[from] DbError),

    /// The caller cancelled the operation while it waited for the lock (L004)
    #[error("[L004] Cancelled while waiting for migration lock '{key}'")]
    Cancelled { key: String },
}

/// What went wrong inside a step that had already marked the schema dirty
#[derive(Error, Debug)]
pub enum StepFailure {
    /// The script transaction failed or was interrupted and rolled back
    #[error(transparent)]
    Script(#[from] DbError),

    /// The script committed but recording the new version failed
    #[error("script committed but recording it failed: {0}")]
    Record(#[from] StoreError),
}

/// Migration engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// A previous step failed part-way; repair and `force` first (G001)
    #[error("[G001] Schema is dirty at version {version}; fix the database manually and force a version")]
    DirtySchema { version: u64 },

    /// The migration has no down script (G002)
    #[error("[G002] Migration {version} is irreversible (no down script)")]
    Irreversible { version: u64 },

    /// A step failed; the schema stays dirty at the last committed version (G003)
    #[error("[G003] Migration {version} ({direction}) failed: {source}")]
    StepFailed {
        version: u64,
        direction: Direction,
        #[source]
        source: StepFailure,
    },

    /// Validation found one or more problems (G004)
    #[error("[G004] Migration validation failed with {} problem(s):\n{}", .discrepancies.len(), format_discrepancies(.discrepancies))]
    ValidationFailed { discrepancies: Vec<Discrepancy> },

    /// The migration source could not be loaded at init (G005)
    #[error("[G005] Invalid migration source: {0}")]
    SourceInvalid(#[source] SourceError),

    /// `init` has not been called (G006)
    #[error("[G006] Migration manager is not initialized")]
    NotInitialized,

    /// `close` has been called (G007)
    #[error("[G007] Migration manager is closed")]
    Closed,

    /// The persisted or requested version has no loaded migration (G008)
    #[error("[G008] No migration with version {version} in the source")]
    MissingMigration { version: u64 },

    /// Rollback requested at version 0 (G009)
    #[error("[G009] Nothing to roll back: no migrations are applied")]
    NothingToRollback,

    /// A script could not be turned into statements; nothing was run (G010)
    #[error("[G010] Migration {version} ({direction}) has an invalid script: {source}")]
    InvalidScript {
        version: u64,
        direction: Direction,
        #[source]
        source: SqlError,
    },

    /// The context ended between steps; the schema is clean (G011)
    #[error("[G011] Stopped before making further changes: {0}")]
    Interrupted(Interrupted),
}

/// Umbrella error for engine operations
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl MigrateError {
    /// Whether repeating the same call later may succeed without any repair
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrateError::Store(StoreError::Unavailable(_))
                | MigrateError::Lock(LockError::Timeout { .. })
        )
    }
}

/// Result type alias for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Result type alias for version store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for lock operations
pub type LockResult<T> = Result<T, LockError>;

/// Result type alias for engine operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// One problem found by `validate_migrations`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// A script file changed since it was loaded
    ChecksumMismatch { version: u64, direction: Direction },
    /// A script file is gone or unreadable
    FileMissing {
        version: u64,
        direction: Direction,
        path: PathBuf,
    },
    /// Re-loading the directory failed
    SourceReload(String),
    /// A version appeared on disk after init
    Added { version: u64 },
    /// A version disappeared from disk after init
    Removed { version: u64 },
    /// Versions are not strictly increasing
    OutOfOrder { previous: u64, version: u64 },
    /// An applied version has no migration in the source
    AppliedMissing { version: u64 },
    /// The applied up script differs from the one in the source
    HistoryDrift {
        version: u64,
        recorded: String,
        current: String,
    },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discrepancy::ChecksumMismatch { version, direction } => {
                write!(f, "{version} ({direction}): file changed since it was loaded")
            }
            Discrepancy::FileMissing {
                version,
                direction,
                path,
            } => write!(
                f,
                "{version} ({direction}): {} is missing or unreadable",
                path.display()
            ),
            Discrepancy::SourceReload(message) => {
                write!(f, "re-loading the source failed: {message}")
            }
            Discrepancy::Added { version } => write!(f, "{version}: added after load"),
            Discrepancy::Removed { version } => write!(f, "{version}: removed after load"),
            Discrepancy::OutOfOrder { previous, version } => {
                write!(f, "{version}: not greater than preceding version {previous}")
            }
            Discrepancy::AppliedMissing { version } => {
                write!(f, "{version}: applied but not present in the source")
            }
            Discrepancy::HistoryDrift {
                version,
                recorded,
                current,
            } => write!(
                f,
                "{version}: applied checksum {} differs from source checksum {}",
                short(recorded),
                short(current)
            ),
        }
    }
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

fn format_discrepancies(discrepancies: &[Discrepancy]) -> String {
    discrepancies
        .iter()
        .map(|d| format!("  - {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}
