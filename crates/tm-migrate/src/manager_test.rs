use super::*;
use crate::error::{LockError, MigrateError, SourceError, StoreError};
use crate::metrics::CountingMetrics;
use async_trait::async_trait;
use std::fs;
use tempfile::TempDir;
use tm_core::Interrupted;
use tm_db::{
    DatabaseCore, DatabaseLock, DatabaseTransaction, DbError, DbResult, DuckDbBackend, Row,
};

fn write(dir: &Path, file: &str, sql: &str) {
    fs::write(dir.join(file), sql).unwrap();
}

/// Three reversible migrations: users, users.email, posts
fn standard_migrations(dir: &Path) {
    write(dir, "1_users.up.sql", "CREATE TABLE users (id INTEGER, name VARCHAR);");
    write(dir, "1_users.down.sql", "DROP TABLE users;");
    write(dir, "2_email.up.sql", "ALTER TABLE users ADD COLUMN email VARCHAR;");
    write(dir, "2_email.down.sql", "ALTER TABLE users DROP COLUMN email;");
    write(dir, "3_posts.up.sql", "CREATE TABLE posts (id INTEGER, body VARCHAR);");
    write(dir, "3_posts.down.sql", "DROP TABLE posts;");
}

fn settings(dir: &Path) -> MigratorSettings {
    let mut settings = MigratorSettings::new(dir);
    settings.lock_timeout = Duration::from_millis(500);
    settings
}

async fn ready_manager(dir: &Path) -> (MigrationManager, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(DuckDbBackend::in_memory().unwrap());
    let mut manager = MigrationManager::new(db.clone(), settings(dir));
    manager.init(&OpContext::background()).await.unwrap();
    (manager, db)
}

async fn table_exists(db: &Arc<dyn Database>, table: &str) -> bool {
    let rows = db
        .query_rows(&format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = '{table}'"
        ))
        .await
        .unwrap();
    rows[0][0].as_deref() == Some("1")
}

fn clean(version: u64) -> SchemaState {
    SchemaState {
        version,
        dirty: false,
    }
}

#[tokio::test]
async fn test_operations_before_init_fail() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let db: Arc<dyn Database> = Arc::new(DuckDbBackend::in_memory().unwrap());
    let manager = MigrationManager::new(db, settings(dir.path()));
    let ctx = OpContext::background();

    assert!(matches!(
        manager.run_migrations(&ctx, 0).await,
        Err(MigrateError::Engine(EngineError::NotInitialized))
    ));
    assert!(matches!(
        manager.validate_migrations(&ctx).await,
        Err(MigrateError::Engine(EngineError::NotInitialized))
    ));
}

#[tokio::test]
async fn test_get_version_needs_no_init_or_source() {
    let dir = TempDir::new().unwrap();
    let db: Arc<dyn Database> = Arc::new(DuckDbBackend::in_memory().unwrap());
    // the migrations directory does not even exist
    let manager = MigrationManager::new(db, settings(&dir.path().join("missing")));

    assert_eq!(manager.get_version().await.unwrap(), clean(0));
    assert_eq!(manager.get_version().await.unwrap(), clean(0));
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (mut manager, _db) = ready_manager(dir.path()).await;

    manager.close().unwrap();
    manager.close().unwrap();
    assert!(matches!(
        manager.get_version().await,
        Err(MigrateError::Engine(EngineError::Closed))
    ));
    assert!(matches!(
        manager.rollback(&OpContext::background()).await,
        Err(MigrateError::Engine(EngineError::Closed))
    ));
    assert!(matches!(
        manager.init(&OpContext::background()).await,
        Err(MigrateError::Engine(EngineError::Closed))
    ));
}

#[tokio::test]
async fn test_init_with_invalid_source() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "1_orphan.down.sql", "SELECT 1;");
    let db: Arc<dyn Database> = Arc::new(DuckDbBackend::in_memory().unwrap());
    let mut manager = MigrationManager::new(db, settings(dir.path()));
    let err = manager.init(&OpContext::background()).await.unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Engine(EngineError::SourceInvalid(SourceError::MissingPair { .. }))
    ));
}

#[tokio::test]
async fn test_init_reloads_source() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (mut manager, _db) = ready_manager(dir.path()).await;
    assert_eq!(manager.migrations().unwrap().len(), 3);

    write(dir.path(), "4_tags.up.sql", "CREATE TABLE tags (id INTEGER);");
    manager.init(&OpContext::background()).await.unwrap();
    assert_eq!(manager.migrations().unwrap().len(), 4);
}

#[tokio::test]
async fn test_run_reports_steps() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, db) = ready_manager(dir.path()).await;

    let report = manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap();
    assert_eq!(report.from, 0);
    assert_eq!(report.to, 3);
    let versions: Vec<u64> = report.steps.iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert!(report.steps.iter().all(|s| s.direction == Direction::Up));
    assert!(table_exists(&db, "posts").await);

    let again = manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap();
    assert!(again.is_noop());
    assert_eq!((again.from, again.to), (3, 3));
}

#[tokio::test]
async fn test_rollback_single_step() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, db) = ready_manager(dir.path()).await;
    let ctx = OpContext::background();
    manager.run_migrations(&ctx, 0).await.unwrap();

    let report = manager.rollback(&ctx).await.unwrap();
    assert_eq!((report.from, report.to), (3, 2));
    assert_eq!(report.steps[0].direction, Direction::Down);
    assert!(!table_exists(&db, "posts").await);
    assert_eq!(manager.get_version().await.unwrap(), clean(2));
}

#[tokio::test]
async fn test_rollback_at_zero() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, _db) = ready_manager(dir.path()).await;
    let ctx = OpContext::background();

    assert!(matches!(
        manager.rollback(&ctx).await,
        Err(MigrateError::Engine(EngineError::NothingToRollback))
    ));
    let report = manager.rollback_all(&ctx).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(report.to, 0);
}

#[tokio::test]
async fn test_rollback_all_returns_to_zero() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, db) = ready_manager(dir.path()).await;
    let ctx = OpContext::background();
    manager.run_migrations(&ctx, 0).await.unwrap();

    let report = manager.rollback_all(&ctx).await.unwrap();
    let versions: Vec<u64> = report.steps.iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![3, 2, 1]);
    assert_eq!(manager.get_version().await.unwrap(), clean(0));
    assert!(!table_exists(&db, "users").await);
}

#[tokio::test]
async fn test_rollback_all_stops_at_irreversible() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "1_base.up.sql", "CREATE TABLE base (id INTEGER);");
    write(dir.path(), "2_seed.up.sql", "CREATE TABLE seed (id INTEGER);");
    write(dir.path(), "3_extra.up.sql", "CREATE TABLE extra (id INTEGER);");
    write(dir.path(), "3_extra.down.sql", "DROP TABLE extra;");
    let (manager, _db) = ready_manager(dir.path()).await;
    let ctx = OpContext::background();
    manager.run_migrations(&ctx, 0).await.unwrap();

    let err = manager.rollback_all(&ctx).await.unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Engine(EngineError::Irreversible { version: 2 })
    ));
    assert_eq!(manager.get_version().await.unwrap(), clean(2));
}

#[tokio::test]
async fn test_rollback_of_missing_migration() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, _db) = ready_manager(dir.path()).await;
    let ctx = OpContext::background();
    manager.force_version(&ctx, 7).await.unwrap();

    assert!(matches!(
        manager.rollback(&ctx).await,
        Err(MigrateError::Engine(EngineError::MissingMigration { version: 7 }))
    ));
}

#[tokio::test]
async fn test_transaction_control_in_script_is_rejected_before_dirty() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "1_manual.up.sql",
        "BEGIN;\nCREATE TABLE t (id INTEGER);\nCOMMIT;",
    );
    let (manager, _db) = ready_manager(dir.path()).await;

    let err = manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Engine(EngineError::InvalidScript { version: 1, .. })
    ));
    assert_eq!(manager.get_version().await.unwrap(), clean(0));
}

#[tokio::test]
async fn test_cancelled_context_stops_before_marking_dirty() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, db) = ready_manager(dir.path()).await;

    let ctx = OpContext::background();
    ctx.cancel_handle().cancel();
    let err = manager.run_migrations(&ctx, 0).await.unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Engine(EngineError::Interrupted(_))
    ));
    assert_eq!(manager.get_version().await.unwrap(), clean(0));
    assert!(!table_exists(&db, "users").await);
}

#[tokio::test]
async fn test_expired_call_deadline_stops_before_any_step() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let db: Arc<dyn Database> = Arc::new(DuckDbBackend::in_memory().unwrap());
    let mut expired = settings(dir.path());
    expired.call_timeout = Some(Duration::ZERO);
    let mut manager = MigrationManager::new(db.clone(), expired);
    manager.init(&OpContext::background()).await.unwrap();

    let err = manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Engine(EngineError::Interrupted(Interrupted::DeadlineExceeded))
    ));
    assert_eq!(manager.get_version().await.unwrap(), clean(0));
    assert!(!table_exists(&db, "users").await);
}

/// DuckDB backend whose deadline-bound transactions take at least `delay`.
/// Version bookkeeping runs under a background context and is not slowed.
struct SlowScripts {
    inner: DuckDbBackend,
    delay: Duration,
}

#[async_trait]
impl DatabaseCore for SlowScripts {
    async fn execute(&self, sql: &str) -> DbResult<usize> {
        self.inner.execute(sql).await
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.inner.execute_batch(sql).await
    }

    async fn query_rows(&self, sql: &str) -> DbResult<Vec<Row>> {
        self.inner.query_rows(sql).await
    }

    fn db_type(&self) -> &'static str {
        self.inner.db_type()
    }

    fn target_id(&self) -> String {
        self.inner.target_id()
    }
}

#[async_trait]
impl DatabaseTransaction for SlowScripts {
    async fn run_in_transaction(&self, ctx: &OpContext, statements: &[String]) -> DbResult<()> {
        if ctx.deadline().is_some() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.run_in_transaction(ctx, statements).await
    }
}

#[async_trait]
impl DatabaseLock for SlowScripts {
    async fn try_advisory_lock(&self, key: &str, owner: &str, ttl: Duration) -> DbResult<bool> {
        self.inner.try_advisory_lock(key, owner, ttl).await
    }

    async fn renew_advisory_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> DbResult<bool> {
        self.inner.renew_advisory_lock(key, owner, ttl).await
    }

    async fn advisory_unlock(&self, key: &str, owner: &str) -> DbResult<()> {
        self.inner.advisory_unlock(key, owner).await
    }
}

#[tokio::test]
async fn test_timeout_bounds_the_whole_call() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let db: Arc<dyn Database> = Arc::new(SlowScripts {
        inner: DuckDbBackend::in_memory().unwrap(),
        delay: Duration::from_millis(200),
    });
    // every step fits the timeout on its own; all three together do not
    let mut bounded = settings(dir.path());
    bounded.call_timeout = Some(Duration::from_millis(500));
    let mut manager = MigrationManager::new(db.clone(), bounded);
    manager.init(&OpContext::background()).await.unwrap();

    let started = Instant::now();
    let err = manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        err,
        MigrateError::Engine(EngineError::StepFailed {
            version: 3,
            direction: Direction::Up,
            source: StepFailure::Script(DbError::Interrupted(Interrupted::DeadlineExceeded)),
        })
    ));
    assert_eq!(
        manager.get_version().await.unwrap(),
        SchemaState {
            version: 2,
            dirty: true
        }
    );
    assert!(table_exists(&db, "users").await);
    assert!(!table_exists(&db, "posts").await);

    // a single step stays inside the same budget
    manager.force_version(&OpContext::background(), 2).await.unwrap();
    let report = manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap();
    assert_eq!(report.to, 3);
}

#[tokio::test]
async fn test_force_version_while_dirty() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    write(dir.path(), "2_email.up.sql", "ALTER TABLE nope ADD COLUMN x INTEGER;");
    let (manager, _db) = ready_manager(dir.path()).await;
    let ctx = OpContext::background();

    assert!(manager.run_migrations(&ctx, 0).await.is_err());
    assert!(manager.get_version().await.unwrap().dirty);

    manager.force_version(&ctx, 1).await.unwrap();
    assert_eq!(manager.get_version().await.unwrap(), clean(1));
}

#[tokio::test]
async fn test_strict_force() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let db: Arc<dyn Database> = Arc::new(DuckDbBackend::in_memory().unwrap());
    let mut strict = settings(dir.path());
    strict.strict_force = true;
    let mut manager = MigrationManager::new(db, strict);
    let ctx = OpContext::background();
    manager.init(&ctx).await.unwrap();

    assert!(matches!(
        manager.force_version(&ctx, 5).await,
        Err(MigrateError::Engine(EngineError::MissingMigration { version: 5 }))
    ));
    manager.force_version(&ctx, 2).await.unwrap();
    manager.force_version(&ctx, 0).await.unwrap();
    assert_eq!(manager.get_version().await.unwrap(), clean(0));
}

#[tokio::test]
async fn test_status_marks_applied() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, _db) = ready_manager(dir.path()).await;
    manager
        .run_migrations(&OpContext::background(), 2)
        .await
        .unwrap();

    let status = manager.status().await.unwrap();
    let marks: Vec<(u64, bool)> = status.iter().map(|s| (s.version, s.applied)).collect();
    assert_eq!(marks, vec![(1, true), (2, true), (3, false)]);
    assert!(status[0].applied_at.is_some());
    assert!(status[2].applied_at.is_none());
    assert!(status.iter().all(|s| s.reversible));
}

#[tokio::test]
async fn test_validate_reports_missing_file_and_added_version() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, _db) = ready_manager(dir.path()).await;

    fs::remove_file(dir.path().join("2_email.down.sql")).unwrap();
    write(dir.path(), "4_tags.up.sql", "CREATE TABLE tags (id INTEGER);");

    let err = manager
        .validate_migrations(&OpContext::background())
        .await
        .unwrap_err();
    let discrepancies = match err {
        MigrateError::Engine(EngineError::ValidationFailed { discrepancies }) => discrepancies,
        other => panic!("expected validation failure, got {other}"),
    };
    assert!(discrepancies.contains(&Discrepancy::FileMissing {
        version: 2,
        direction: Direction::Down,
        path: dir.path().join("2_email.down.sql"),
    }));
    assert!(discrepancies.contains(&Discrepancy::Added { version: 4 }));
}

#[tokio::test]
async fn test_validate_reports_applied_version_missing_from_source() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, _db) = ready_manager(dir.path()).await;
    manager
        .force_version(&OpContext::background(), 9)
        .await
        .unwrap();

    let err = manager
        .validate_migrations(&OpContext::background())
        .await
        .unwrap_err();
    let discrepancies = match err {
        MigrateError::Engine(EngineError::ValidationFailed { discrepancies }) => discrepancies,
        other => panic!("expected validation failure, got {other}"),
    };
    assert_eq!(
        discrepancies,
        vec![Discrepancy::AppliedMissing { version: 9 }]
    );
}

#[tokio::test]
async fn test_validate_accepts_applied_irreversible_migration() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "1_users.up.sql", "CREATE TABLE users (id INTEGER);");
    write(dir.path(), "1_users.down.sql", "DROP TABLE users;");
    write(dir.path(), "2_seed.up.sql", "INSERT INTO users VALUES (1);");
    let (manager, _db) = ready_manager(dir.path()).await;
    let ctx = OpContext::background();

    manager.run_migrations(&ctx, 0).await.unwrap();
    manager.validate_migrations(&ctx).await.unwrap();
    assert!(matches!(
        manager.rollback(&ctx).await,
        Err(MigrateError::Engine(EngineError::Irreversible { version: 2 }))
    ));
}

#[tokio::test]
async fn test_metrics_are_reported() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let db: Arc<dyn Database> = Arc::new(DuckDbBackend::in_memory().unwrap());
    let metrics = Arc::new(CountingMetrics::new());
    let mut manager =
        MigrationManager::new(db, settings(dir.path())).with_metrics(metrics.clone());
    let ctx = OpContext::background();
    manager.init(&ctx).await.unwrap();

    manager.run_migrations(&ctx, 0).await.unwrap();
    manager.rollback(&ctx).await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.applied, 3);
    assert_eq!(snapshot.reverted, 1);
    assert_eq!(snapshot.failed, 0);
    assert_eq!(snapshot.lock_acquisitions, 2);
}

#[tokio::test]
async fn test_mutating_call_times_out_on_held_lock() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let backend = DuckDbBackend::in_memory().unwrap();
    let other: Arc<dyn Database> = Arc::new(backend.try_clone().unwrap());
    let db: Arc<dyn Database> = Arc::new(backend);
    let mut manager = MigrationManager::new(db, settings(dir.path()));
    manager.init(&OpContext::background()).await.unwrap();

    let holder = Locker::new(
        other,
        "schema_migrations",
        Duration::from_secs(1),
        Duration::from_secs(30),
        Arc::new(NoopMetrics),
    );
    let held = holder.acquire(&OpContext::background()).await.unwrap();

    let err = manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::Lock(LockError::Timeout { .. })));
    assert!(err.is_retryable());
    assert_eq!(manager.get_version().await.unwrap(), clean(0));

    held.release().await.unwrap();
    manager
        .run_migrations(&OpContext::background(), 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dirty_state_left_by_another_session_blocks_run() {
    let dir = TempDir::new().unwrap();
    standard_migrations(dir.path());
    let (manager, db) = ready_manager(dir.path()).await;

    // another session marked the schema dirty and never finished
    let store = VersionStore::new(db, "schema_migrations");
    store.mark_dirty(0).await.unwrap();
    let err = store.mark_dirty(0).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    assert!(matches!(
        manager.run_migrations(&OpContext::background(), 0).await,
        Err(MigrateError::Engine(EngineError::DirtySchema { version: 0 }))
    ));
}
