//! Migration source: loading, ordering and creating migration files.
//!
//! A migration directory holds pairs of files named
//! `{version}_{name}.up.sql` and `{version}_{name}.down.sql`. Versions are
//! positive decimal integers; leading zeros are allowed and ignored when
//! ordering, so `0001_init.up.sql` and `1_init.up.sql` collide.

use crate::error::{SourceError, SourceResult};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tm_core::{compute_checksum, VersionFormat};

static FILE_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn file_name_re() -> &'static Regex {
    FILE_NAME_RE
        .get_or_init(|| Regex::new(r"^([0-9]+)_(.+)\.(up|down)\.sql$").expect("valid regex"))
}

/// Largest version the state table can hold (stored as BIGINT)
const MAX_VERSION: u64 = i64::MAX as u64;

/// Which way a script moves the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// A script file as loaded from disk
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub path: PathBuf,
    pub sql: String,
    /// SHA-256 of the content at load time
    pub checksum: String,
}

impl MigrationScript {
    fn read(path: &Path) -> SourceResult<Self> {
        let sql = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let checksum = compute_checksum(&sql);
        Ok(Self {
            path: path.to_path_buf(),
            sql,
            checksum,
        })
    }
}

/// One versioned change-set. `down` is `None` for irreversible migrations.
#[derive(Debug, Clone)]
pub struct MigrationDefinition {
    pub version: u64,
    pub name: String,
    pub up: MigrationScript,
    pub down: Option<MigrationScript>,
}

impl MigrationDefinition {
    /// Whether the migration can be rolled back
    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    /// Script for a direction, if present
    pub fn script(&self, direction: Direction) -> Option<&MigrationScript> {
        match direction {
            Direction::Up => Some(&self.up),
            Direction::Down => self.down.as_ref(),
        }
    }

    /// All scripts present, up first
    pub fn scripts(&self) -> impl Iterator<Item = (Direction, &MigrationScript)> {
        std::iter::once((Direction::Up, &self.up))
            .chain(self.down.iter().map(|down| (Direction::Down, down)))
    }
}

/// Loading rules
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceOptions {
    /// Every up script must have a down script
    pub require_reversible: bool,
    /// An empty directory is a valid (empty) set
    pub allow_empty: bool,
}

/// Migrations ordered ascending by version, no duplicates
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<MigrationDefinition>,
}

impl MigrationSet {
    /// Migrations with a version greater than `version`, ascending
    pub fn pending_after(&self, version: u64) -> impl Iterator<Item = &MigrationDefinition> {
        let start = self.migrations.partition_point(|m| m.version <= version);
        self.migrations[start..].iter()
    }

    /// Migration with exactly `version`
    pub fn get(&self, version: u64) -> Option<&MigrationDefinition> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|i| &self.migrations[i])
    }

    /// Greatest version below `version`, or 0 when there is none
    pub fn previous_version(&self, version: u64) -> u64 {
        let end = self.migrations.partition_point(|m| m.version < version);
        end.checked_sub(1)
            .map_or(0, |i| self.migrations[i].version)
    }

    /// Highest version in the set
    pub fn latest(&self) -> Option<&MigrationDefinition> {
        self.migrations.last()
    }

    pub fn versions(&self) -> Vec<u64> {
        self.migrations.iter().map(|m| m.version).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationDefinition> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl<'a> IntoIterator for &'a MigrationSet {
    type Item = &'a MigrationDefinition;
    type IntoIter = std::slice::Iter<'a, MigrationDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.iter()
    }
}

/// Parsed migration file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileName {
    pub version: u64,
    pub name: String,
    pub direction: Direction,
}

/// Parse `{version}_{name}.{up|down}.sql`
pub(crate) fn parse_file_name(file_name: &str) -> SourceResult<FileName> {
    let malformed = |reason: &str| SourceError::MalformedName {
        name: file_name.to_string(),
        reason: reason.to_string(),
    };

    let caps = file_name_re()
        .captures(file_name)
        .ok_or_else(|| malformed("expected {version}_{name}.up.sql or {version}_{name}.down.sql"))?;

    let version: u64 = caps[1]
        .parse()
        .map_err(|_| malformed("version does not fit in a 64-bit integer"))?;
    if version == 0 {
        return Err(malformed("version 0 is reserved for the empty schema"));
    }
    if version > MAX_VERSION {
        return Err(malformed("version exceeds the largest storable version"));
    }

    let direction = if &caps[3] == "up" {
        Direction::Up
    } else {
        Direction::Down
    };

    Ok(FileName {
        version,
        name: caps[2].to_string(),
        direction,
    })
}

/// Migration-looking `.sql` files in `dir`, sorted by file name
fn sql_files(dir: &Path) -> SourceResult<Vec<(String, PathBuf)>> {
    let io_err = |source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_dir() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            log::debug!("Skipping non UTF-8 file name in {}", dir.display());
            continue;
        };
        if file_name.starts_with('.') || !file_name.ends_with(".sql") {
            continue;
        }
        files.push((file_name, entry.path()));
    }
    files.sort();
    Ok(files)
}

#[derive(Default)]
struct PartialMigration {
    name: String,
    up: Option<MigrationScript>,
    down: Option<MigrationScript>,
}

impl PartialMigration {
    fn slot(&mut self, direction: Direction) -> &mut Option<MigrationScript> {
        match direction {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }
}

/// Load and validate every migration in `dir`.
///
/// Sub-directories, hidden files and files not ending in `.sql` are ignored.
pub fn load(dir: &Path, options: &SourceOptions) -> SourceResult<MigrationSet> {
    let mut partials: BTreeMap<u64, PartialMigration> = BTreeMap::new();

    for (file_name, path) in sql_files(dir)? {
        let parsed = parse_file_name(&file_name)?;
        let entry = partials.entry(parsed.version).or_insert_with(|| PartialMigration {
            name: parsed.name.clone(),
            ..Default::default()
        });

        if entry.name != parsed.name {
            return Err(SourceError::DuplicateVersion {
                version: parsed.version,
                first: entry.name.clone(),
                second: parsed.name,
            });
        }

        let slot = entry.slot(parsed.direction);
        if let Some(existing) = slot {
            return Err(SourceError::DuplicateVersion {
                version: parsed.version,
                first: existing.path.display().to_string(),
                second: path.display().to_string(),
            });
        }
        *slot = Some(MigrationScript::read(&path)?);
    }

    let mut migrations = Vec::with_capacity(partials.len());
    for (version, partial) in partials {
        let Some(up) = partial.up else {
            return Err(SourceError::MissingPair {
                version,
                missing: Direction::Up,
            });
        };
        if partial.down.is_none() && options.require_reversible {
            return Err(SourceError::MissingPair {
                version,
                missing: Direction::Down,
            });
        }
        migrations.push(MigrationDefinition {
            version,
            name: partial.name,
            up,
            down: partial.down,
        });
    }

    if migrations.is_empty() && !options.allow_empty {
        return Err(SourceError::Empty {
            path: dir.to_path_buf(),
        });
    }

    log::debug!(
        "Loaded {} migration(s) from {}",
        migrations.len(),
        dir.display()
    );
    Ok(MigrationSet { migrations })
}

/// Numbering rules for [`create`]
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub format: VersionFormat,
    pub sequence_digits: usize,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            format: VersionFormat::Timestamp,
            sequence_digits: 6,
        }
    }
}

/// Result of [`create`]
#[derive(Debug, Clone)]
pub struct CreatedMigration {
    pub version: u64,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
}

/// Create an empty up/down pair at the next version in `dir`.
///
/// The directory is created if needed. Existing files are never overwritten.
pub fn create(dir: &Path, name: &str, options: &CreateOptions) -> SourceResult<CreatedMigration> {
    let normalized = normalize_name(name);
    if normalized.is_empty() {
        return Err(SourceError::MalformedName {
            name: name.to_string(),
            reason: "name must contain at least one letter or digit".to_string(),
        });
    }

    std::fs::create_dir_all(dir).map_err(|source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let highest = sql_files(dir)?
        .iter()
        .filter_map(|(file_name, _)| parse_file_name(file_name).ok())
        .map(|parsed| parsed.version)
        .max()
        .unwrap_or(0);

    let version = match options.format {
        VersionFormat::Timestamp => {
            let stamp: u64 = chrono::Utc::now()
                .format("%Y%m%d%H%M%S")
                .to_string()
                .parse()
                .unwrap_or(0);
            stamp.max(highest + 1)
        }
        VersionFormat::Sequence => highest + 1,
    };
    let version_text = match options.format {
        VersionFormat::Timestamp => version.to_string(),
        VersionFormat::Sequence => {
            format!("{:0width$}", version, width = options.sequence_digits)
        }
    };

    let up_path = dir.join(format!("{version_text}_{normalized}.up.sql"));
    let down_path = dir.join(format!("{version_text}_{normalized}.down.sql"));
    for path in [&up_path, &down_path] {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| SourceError::Io {
                path: path.clone(),
                source,
            })?;
    }

    log::info!("Created migration {version} ({normalized})");
    Ok(CreatedMigration {
        version,
        up_path,
        down_path,
    })
}

/// Lower-case `name` and collapse runs of anything not alphanumeric into `_`
pub(crate) fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
#[path = "source_test.rs"]
mod tests;
