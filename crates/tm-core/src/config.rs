//! Configuration types and parsing for tidemark.yml

use crate::error::{CoreError, CoreResult};
use crate::serde_helpers::{
    default_lease_ttl_secs, default_lock_timeout_secs, default_migration_timeout_secs,
    default_sequence_digits,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default DuckDB database path
const DEFAULT_DB_PATH: &str = "tidemark.duckdb";

/// Config file names tried by [`Config::load_from_dir`], in order.
pub const CONFIG_FILE_NAMES: &[&str] = &["tidemark.yml", "tidemark.yaml"];

/// Main project configuration from tidemark.yml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Project name, used only in log output
    pub name: String,

    /// Database connection configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Migration source and engine behaviour
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Cross-process lock behaviour
    #[serde(default)]
    pub lock: LockConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database type
    #[serde(rename = "type", default)]
    pub db_type: DbType,

    /// Database path (for DuckDB file-based or :memory:)
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DbType::default(),
            path: default_db_path(),
        }
    }
}

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    /// DuckDB (file-based or in-memory)
    #[default]
    DuckDb,
}

/// How `tm create` numbers new migrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VersionFormat {
    /// UTC timestamp, `YYYYMMDDHHMMSS`
    #[default]
    Timestamp,
    /// Highest existing version plus one, zero-padded
    Sequence,
}

/// Migration source and engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationsConfig {
    /// Directory holding `{version}_{name}.{up|down}.sql` files
    #[serde(default = "default_migrations_path")]
    pub path: String,

    /// Table holding the single `(version, dirty)` state row
    #[serde(default = "default_migrations_table")]
    pub table: String,

    /// Deadline in seconds for one up/down call, lock wait included (0 disables it)
    #[serde(default = "default_migration_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum forward steps per `up` (0 = all pending)
    #[serde(default)]
    pub steps: usize,

    /// Fail loading when an up script has no down script
    #[serde(default)]
    pub require_reversible: bool,

    /// Accept a migrations directory with no migrations
    #[serde(default)]
    pub allow_empty: bool,

    /// Reject `force` to versions that are not loaded migrations
    #[serde(default)]
    pub strict_force: bool,

    /// Numbering scheme for newly created migrations
    #[serde(default)]
    pub version_format: VersionFormat,

    /// Width of sequence-numbered versions
    #[serde(default = "default_sequence_digits")]
    pub sequence_digits: usize,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            path: default_migrations_path(),
            table: default_migrations_table(),
            timeout_secs: default_migration_timeout_secs(),
            steps: 0,
            require_reversible: false,
            allow_empty: false,
            strict_force: false,
            version_format: VersionFormat::default(),
            sequence_digits: default_sequence_digits(),
        }
    }
}

impl MigrationsConfig {
    /// Per-call deadline shared by every step of the call, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Name of the applied-history table that sits next to the state table
    pub fn history_table(&self) -> String {
        format!("{}_history", self.table)
    }

    /// Resolve the migrations directory against a project root
    pub fn path_absolute(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

/// Cross-process lock behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// How long to wait for another process to release the lock
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,

    /// Lease lifetime; a crashed holder frees the lock after this long
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl LockConfig {
    /// Lock wait timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Lease lifetime
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "tidemark".to_string(),
            database: DatabaseConfig::default(),
            migrations: MigrationsConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoWithPath {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        log::debug!("Loaded config '{}' from {}", config.name, path.display());
        Ok(config)
    }

    /// Load configuration from a project directory
    /// Looks for tidemark.yml or tidemark.yaml
    pub fn load_from_dir(dir: &Path) -> CoreResult<Self> {
        for file_name in CONFIG_FILE_NAMES {
            let path = dir.join(file_name);
            if path.exists() {
                return Self::load(&path);
            }
        }
        Err(CoreError::ConfigNotFound {
            path: dir.join(CONFIG_FILE_NAMES[0]).display().to_string(),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::ConfigInvalid {
                message: "Project name cannot be empty".to_string(),
            });
        }

        if self.migrations.path.trim().is_empty() {
            return Err(CoreError::ConfigInvalid {
                message: "migrations.path cannot be empty".to_string(),
            });
        }

        if !is_plain_table_name(&self.migrations.table) {
            return Err(CoreError::ConfigInvalid {
                message: format!(
                    "migrations.table '{}' must be an identifier, optionally schema-qualified",
                    self.migrations.table
                ),
            });
        }

        if !(1..=20).contains(&self.migrations.sequence_digits) {
            return Err(CoreError::ConfigInvalid {
                message: format!(
                    "migrations.sequence_digits must be between 1 and 20, got {}",
                    self.migrations.sequence_digits
                ),
            });
        }

        if self.lock.lease_ttl_secs == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "lock.lease_ttl_secs must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

/// `name` or `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`
fn is_plain_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_migrations_path() -> String {
    "migrations".to_string()
}

fn default_migrations_table() -> String {
    "schema_migrations".to_string()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
