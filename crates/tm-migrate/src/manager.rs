//! Migration orchestration.
//!
//! [`MigrationManager`] ties the source, the version store and the lock
//! together. Every step follows the same protocol:
//!
//! 1. the lease must still be held;
//! 2. the script is split into statements (a bad script stops here, clean);
//! 3. the state row is marked dirty with a compare-and-set;
//! 4. the script runs in one transaction;
//! 5. the new version is committed and `dirty` cleared.
//!
//! A failure in 4 or 5 leaves the row dirty at the last committed version,
//! and nothing but [`MigrationManager::force_version`] clears it. All steps
//! of one call share that call's deadline.

use crate::error::{Discrepancy, EngineError, MigrateResult, StepFailure, StoreResult};
use crate::lock::{LockHandle, Locker};
use crate::metrics::{MigrationMetrics, NoopMetrics};
use crate::source::{self, Direction, MigrationDefinition, MigrationSet, SourceOptions};
use crate::version_store::{SchemaState, VersionStore};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tm_core::{compute_checksum_bytes, Config, OpContext};
use tm_db::Database;
use tm_sql::StatementSplitter;

/// Engine settings, usually derived from `tidemark.yml`
#[derive(Debug, Clone)]
pub struct MigratorSettings {
    /// Directory holding the migration files
    pub migrations_path: PathBuf,
    /// State table name, optionally schema-qualified
    pub table: String,
    /// Deadline for one `run_migrations` / `rollback` / `rollback_all` call,
    /// lock wait included; `None` for no deadline
    pub call_timeout: Option<Duration>,
    /// How long to wait for another session's lock
    pub lock_timeout: Duration,
    /// Lease lifetime of the lock
    pub lease_ttl: Duration,
    pub require_reversible: bool,
    pub allow_empty: bool,
    /// Only allow forcing to 0 or a loaded version
    pub strict_force: bool,
}

impl MigratorSettings {
    /// Defaults for everything except the migrations directory
    pub fn new(migrations_path: impl Into<PathBuf>) -> Self {
        let mut settings = Self::from_config(&Config::default(), Path::new(""));
        settings.migrations_path = migrations_path.into();
        settings
    }

    /// Settings from a loaded config, resolving paths against `project_root`
    pub fn from_config(config: &Config, project_root: &Path) -> Self {
        Self {
            migrations_path: config.migrations.path_absolute(project_root),
            table: config.migrations.table.clone(),
            call_timeout: config.migrations.timeout(),
            lock_timeout: config.lock.timeout(),
            lease_ttl: config.lock.lease_ttl(),
            require_reversible: config.migrations.require_reversible,
            allow_empty: config.migrations.allow_empty,
            strict_force: config.migrations.strict_force,
        }
    }

    fn source_options(&self) -> SourceOptions {
        SourceOptions {
            require_reversible: self.require_reversible,
            allow_empty: self.allow_empty,
        }
    }
}

/// One committed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub version: u64,
    pub name: String,
    pub direction: Direction,
    pub elapsed: Duration,
}

/// Outcome of a successful run or rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Version before the operation
    pub from: u64,
    /// Version after the operation
    pub to: u64,
    pub steps: Vec<StepRecord>,
    pub elapsed: Duration,
}

impl MigrationReport {
    fn starting_at(version: u64) -> Self {
        Self {
            from: version,
            to: version,
            steps: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the operation changed anything
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Per-migration view for status listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: u64,
    pub name: String,
    /// At or below the current version
    pub applied: bool,
    /// When the history recorded it, if it did
    pub applied_at: Option<String>,
    pub reversible: bool,
}

enum Lifecycle {
    Uninitialized,
    Ready(MigrationSet),
    Closed,
}

/// Runs migrations against one database
pub struct MigrationManager {
    db: Arc<dyn Database>,
    settings: MigratorSettings,
    store: VersionStore,
    locker: Locker,
    splitter: StatementSplitter,
    metrics: Arc<dyn MigrationMetrics>,
    lifecycle: Lifecycle,
}

impl MigrationManager {
    pub fn new(db: Arc<dyn Database>, settings: MigratorSettings) -> Self {
        let metrics: Arc<dyn MigrationMetrics> = Arc::new(NoopMetrics);
        let store = VersionStore::new(db.clone(), &settings.table);
        let locker = Self::locker_for(&db, &settings, metrics.clone());
        let splitter = StatementSplitter::for_backend(db.db_type());
        Self {
            db,
            settings,
            store,
            locker,
            splitter,
            metrics,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    /// Report engine events to `metrics` instead of discarding them
    pub fn with_metrics(mut self, metrics: Arc<dyn MigrationMetrics>) -> Self {
        self.locker = Self::locker_for(&self.db, &self.settings, metrics.clone());
        self.metrics = metrics;
        self
    }

    fn locker_for(
        db: &Arc<dyn Database>,
        settings: &MigratorSettings,
        metrics: Arc<dyn MigrationMetrics>,
    ) -> Locker {
        Locker::new(
            db.clone(),
            &settings.table,
            settings.lock_timeout,
            settings.lease_ttl,
            metrics,
        )
    }

    pub fn settings(&self) -> &MigratorSettings {
        &self.settings
    }

    /// Load the source and make sure the state table exists.
    ///
    /// Calling it again reloads the source.
    pub async fn init(&mut self, ctx: &OpContext) -> MigrateResult<()> {
        if matches!(self.lifecycle, Lifecycle::Closed) {
            return Err(EngineError::Closed.into());
        }
        ctx.check().map_err(EngineError::Interrupted)?;

        let set = source::load(
            &self.settings.migrations_path,
            &self.settings.source_options(),
        )
        .map_err(EngineError::SourceInvalid)?;
        self.store.ensure_initialized().await?;

        log::info!(
            "Loaded {} migration(s) from {} (latest: {})",
            set.len(),
            self.settings.migrations_path.display(),
            set.latest().map_or(0, |m| m.version)
        );
        self.lifecycle = Lifecycle::Ready(set);
        Ok(())
    }

    /// The loaded migration set
    pub fn migrations(&self) -> MigrateResult<&MigrationSet> {
        match &self.lifecycle {
            Lifecycle::Uninitialized => Err(EngineError::NotInitialized.into()),
            Lifecycle::Closed => Err(EngineError::Closed.into()),
            Lifecycle::Ready(set) => Ok(set),
        }
    }

    /// Apply pending migrations in ascending order; `steps == 0` applies all
    pub async fn run_migrations(
        &self,
        ctx: &OpContext,
        steps: usize,
    ) -> MigrateResult<MigrationReport> {
        let set = self.migrations()?;
        let started = Instant::now();
        let ctx = ctx.child(self.settings.call_timeout);
        let lock = self.locker.acquire(&ctx).await?;
        let result = self.apply_pending(&ctx, set, &lock, steps).await;
        self.finish(lock, result, started).await
    }

    /// Revert the most recently applied migration
    pub async fn rollback(&self, ctx: &OpContext) -> MigrateResult<MigrationReport> {
        let set = self.migrations()?;
        let started = Instant::now();
        let ctx = ctx.child(self.settings.call_timeout);
        let lock = self.locker.acquire(&ctx).await?;
        let result = self.revert(&ctx, set, &lock, false).await;
        self.finish(lock, result, started).await
    }

    /// Revert every applied migration under a single lock
    pub async fn rollback_all(&self, ctx: &OpContext) -> MigrateResult<MigrationReport> {
        let set = self.migrations()?;
        let started = Instant::now();
        let ctx = ctx.child(self.settings.call_timeout);
        let lock = self.locker.acquire(&ctx).await?;
        let result = self.revert(&ctx, set, &lock, true).await;
        self.finish(lock, result, started).await
    }

    /// Current persisted state; takes no lock.
    ///
    /// Needs no loaded source, so it also works before [`init`](Self::init)
    /// and reports `(0, false)` on a fresh database.
    pub async fn get_version(&self) -> MigrateResult<SchemaState> {
        if matches!(self.lifecycle, Lifecycle::Closed) {
            return Err(EngineError::Closed.into());
        }
        self.store.ensure_initialized().await?;
        Ok(self.store.read().await?)
    }

    /// Every loaded migration with its applied mark
    pub async fn status(&self) -> MigrateResult<Vec<MigrationStatus>> {
        let set = self.migrations()?;
        let state = self.get_version().await?;
        let history = self.store.applied_checksums().await?;
        Ok(set
            .iter()
            .map(|m| MigrationStatus {
                version: m.version,
                name: m.name.clone(),
                applied: m.version <= state.version,
                applied_at: history.get(&m.version).map(|r| r.applied_at.clone()),
                reversible: m.is_reversible(),
            })
            .collect())
    }

    /// Overwrite the persisted version and clear `dirty` without running scripts.
    ///
    /// This is the recovery path after a failed step has been repaired by hand.
    pub async fn force_version(&self, ctx: &OpContext, version: u64) -> MigrateResult<()> {
        let set = self.migrations()?;
        if self.settings.strict_force && version != 0 && set.get(version).is_none() {
            return Err(EngineError::MissingMigration { version }.into());
        }

        let lock = self.locker.acquire(ctx).await?;
        let result = self.force_locked(version).await;
        self.release(lock).await;
        result
    }

    async fn force_locked(&self, version: u64) -> MigrateResult<()> {
        let before = self.store.read().await?;
        self.store.force_version(version).await?;
        log::warn!(
            "Forced schema version {} (was {}, dirty: {})",
            version,
            before.version,
            before.dirty
        );
        Ok(())
    }

    /// Check the loaded source and the applied history for integrity problems.
    ///
    /// Takes no lock and changes nothing. Every check runs; all problems are
    /// reported together.
    pub async fn validate_migrations(&self, ctx: &OpContext) -> MigrateResult<()> {
        let set = self.migrations()?;
        let mut discrepancies = Vec::new();

        for migration in set {
            for (direction, script) in migration.scripts() {
                match std::fs::read(&script.path) {
                    Ok(bytes) if compute_checksum_bytes(&bytes) != script.checksum => {
                        discrepancies.push(Discrepancy::ChecksumMismatch {
                            version: migration.version,
                            direction,
                        });
                    }
                    Ok(_) => {}
                    Err(_) => discrepancies.push(Discrepancy::FileMissing {
                        version: migration.version,
                        direction,
                        path: script.path.clone(),
                    }),
                }
            }
        }
        ctx.check().map_err(EngineError::Interrupted)?;

        match source::load(
            &self.settings.migrations_path,
            &self.settings.source_options(),
        ) {
            Ok(fresh) => {
                for version in fresh.versions() {
                    if set.get(version).is_none() {
                        discrepancies.push(Discrepancy::Added { version });
                    }
                }
                for version in set.versions() {
                    if fresh.get(version).is_none() {
                        discrepancies.push(Discrepancy::Removed { version });
                    }
                }
            }
            Err(e) => discrepancies.push(Discrepancy::SourceReload(e.to_string())),
        }

        for pair in set.versions().windows(2) {
            if pair[0] >= pair[1] {
                discrepancies.push(Discrepancy::OutOfOrder {
                    previous: pair[0],
                    version: pair[1],
                });
            }
        }
        ctx.check().map_err(EngineError::Interrupted)?;

        let state = self.store.read().await?;
        let history = self.store.applied_checksums().await?;
        let mut applied: BTreeSet<u64> = history.keys().copied().collect();
        if state.version > 0 {
            applied.insert(state.version);
        }
        for version in applied {
            if set.get(version).is_none() {
                discrepancies.push(Discrepancy::AppliedMissing { version });
            }
        }

        for (version, record) in &history {
            if let Some(m) = set.get(*version) {
                if record.checksum != m.up.checksum {
                    discrepancies.push(Discrepancy::HistoryDrift {
                        version: *version,
                        recorded: record.checksum.clone(),
                        current: m.up.checksum.clone(),
                    });
                }
            }
        }

        if discrepancies.is_empty() {
            log::info!("Validated {} migration(s)", set.len());
            Ok(())
        } else {
            Err(EngineError::ValidationFailed { discrepancies }.into())
        }
    }

    /// Drop the loaded source. Idempotent; any later call fails with `Closed`.
    pub fn close(&mut self) -> MigrateResult<()> {
        if !matches!(self.lifecycle, Lifecycle::Closed) {
            log::debug!("Closing migration manager");
        }
        self.lifecycle = Lifecycle::Closed;
        Ok(())
    }

    async fn apply_pending(
        &self,
        ctx: &OpContext,
        set: &MigrationSet,
        lock: &LockHandle,
        steps: usize,
    ) -> MigrateResult<MigrationReport> {
        let state = self.clean_state().await?;
        let limit = if steps == 0 { usize::MAX } else { steps };
        let pending: Vec<&MigrationDefinition> =
            set.pending_after(state.version).take(limit).collect();

        let mut report = MigrationReport::starting_at(state.version);
        if pending.is_empty() {
            log::info!("No pending migrations at version {}", state.version);
            return Ok(report);
        }

        for migration in pending {
            let record = self
                .step(ctx, lock, migration, Direction::Up, report.to, migration.version)
                .await?;
            report.to = migration.version;
            report.steps.push(record);
        }
        Ok(report)
    }

    async fn revert(
        &self,
        ctx: &OpContext,
        set: &MigrationSet,
        lock: &LockHandle,
        all: bool,
    ) -> MigrateResult<MigrationReport> {
        let state = self.clean_state().await?;
        let mut report = MigrationReport::starting_at(state.version);
        if state.version == 0 {
            if all {
                log::info!("Nothing applied; rollback of all migrations is a no-op");
                return Ok(report);
            }
            return Err(EngineError::NothingToRollback.into());
        }

        while report.to > 0 {
            let current = report.to;
            let migration = set
                .get(current)
                .ok_or(EngineError::MissingMigration { version: current })?;
            if !migration.is_reversible() {
                return Err(EngineError::Irreversible { version: current }.into());
            }
            let previous = set.previous_version(current);
            let record = self
                .step(ctx, lock, migration, Direction::Down, current, previous)
                .await?;
            report.to = previous;
            report.steps.push(record);
            if !all {
                break;
            }
        }
        Ok(report)
    }

    /// Read the state and refuse to continue when it is dirty
    async fn clean_state(&self) -> MigrateResult<SchemaState> {
        let state = self.store.read().await?;
        if state.dirty {
            return Err(EngineError::DirtySchema {
                version: state.version,
            }
            .into());
        }
        Ok(state)
    }

    /// Run one script, moving the state from `current` to `target`
    async fn step(
        &self,
        ctx: &OpContext,
        lock: &LockHandle,
        migration: &MigrationDefinition,
        direction: Direction,
        current: u64,
        target: u64,
    ) -> MigrateResult<StepRecord> {
        let version = migration.version;
        let script = migration
            .script(direction)
            .ok_or(EngineError::Irreversible { version })?;

        lock.ensure_held()?;
        let statements =
            self.splitter
                .split(&script.sql)
                .map_err(|source| EngineError::InvalidScript {
                    version,
                    direction,
                    source,
                })?;
        ctx.check().map_err(EngineError::Interrupted)?;

        log::info!(
            "Migrating {} {} ({}), {} statement(s)",
            direction,
            version,
            migration.name,
            statements.len()
        );
        let started = Instant::now();
        self.store.mark_dirty(current).await?;

        let outcome = match self.db.run_in_transaction(ctx, &statements).await {
            Ok(()) => self
                .record(migration, direction, target)
                .await
                .map_err(StepFailure::Record),
            Err(e) => Err(StepFailure::Script(e)),
        };

        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => {
                self.metrics.step_succeeded(version, direction, elapsed);
                log::info!(
                    "Migrated {} {} in {:?}, schema now at version {}",
                    direction,
                    version,
                    elapsed,
                    target
                );
                Ok(StepRecord {
                    version,
                    name: migration.name.clone(),
                    direction,
                    elapsed,
                })
            }
            Err(source) => {
                self.metrics.step_failed(version, direction, elapsed);
                log::error!(
                    "Migration {} {} failed; schema left dirty at version {}: {}",
                    direction,
                    version,
                    current,
                    source
                );
                Err(EngineError::StepFailed {
                    version,
                    direction,
                    source,
                }
                .into())
            }
        }
    }

    async fn record(
        &self,
        migration: &MigrationDefinition,
        direction: Direction,
        target: u64,
    ) -> StoreResult<()> {
        match direction {
            Direction::Up => self.store.commit_applied(migration).await,
            Direction::Down => {
                self.store
                    .commit_reverted(target, migration.version)
                    .await
            }
        }
    }

    /// Release the lock and stamp the report with the total time
    async fn finish(
        &self,
        lock: LockHandle,
        result: MigrateResult<MigrationReport>,
        started: Instant,
    ) -> MigrateResult<MigrationReport> {
        self.release(lock).await;
        result.map(|mut report| {
            report.elapsed = started.elapsed();
            report
        })
    }

    /// A failed release never masks the operation's own outcome; the lease
    /// expires on its own.
    async fn release(&self, lock: LockHandle) {
        let key = lock.key().to_string();
        if let Err(e) = lock.release().await {
            log::warn!("Failed to release migration lock '{key}': {e}");
        }
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
