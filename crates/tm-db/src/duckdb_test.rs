use super::*;
use std::time::Duration;
use tm_core::OpContext;

fn count(db: &DuckDbBackend, sql: &str) -> usize {
    let rows = db.query_rows_sync(sql).unwrap();
    rows[0][0].as_deref().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_in_memory() {
    let db = DuckDbBackend::in_memory().unwrap();
    assert_eq!(db.db_type(), "duckdb");
    assert_eq!(db.target_id(), ":memory:");
}

#[tokio::test]
async fn test_execute_and_query_rows() {
    let db = DuckDbBackend::new(":memory:").unwrap();
    db.execute_batch("CREATE TABLE t (id INTEGER, name VARCHAR, ok BOOLEAN)")
        .await
        .unwrap();
    let affected = db
        .execute("INSERT INTO t VALUES (1, 'a', true), (2, NULL, false)")
        .await
        .unwrap();
    assert_eq!(affected, 2);

    let rows = db
        .query_rows("SELECT id, name, ok FROM t ORDER BY id")
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![
                Some("1".to_string()),
                Some("a".to_string()),
                Some("true".to_string())
            ],
            vec![Some("2".to_string()), None, Some("false".to_string())],
        ]
    );
}

#[tokio::test]
async fn test_from_path_target_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.duckdb");
    let first = DuckDbBackend::from_path(&path).unwrap();
    let first_target = first.target_id();
    drop(first);
    let second = DuckDbBackend::from_path(&path).unwrap();
    assert_eq!(first_target, second.target_id());
    assert!(first_target.ends_with("app.duckdb"));
}

#[tokio::test]
async fn test_transaction_commits() {
    let db = DuckDbBackend::in_memory().unwrap();
    let ctx = OpContext::background();
    db.run_in_transaction(
        &ctx,
        &[
            "CREATE TABLE t (id INTEGER)".to_string(),
            "INSERT INTO t VALUES (1), (2)".to_string(),
        ],
    )
    .await
    .unwrap();
    assert_eq!(count(&db, "SELECT COUNT(*) FROM t"), 2);
}

#[tokio::test]
async fn test_transaction_rolls_back_on_failure() {
    let db = DuckDbBackend::in_memory().unwrap();
    db.execute_batch("CREATE TABLE t (id INTEGER)").await.unwrap();
    let ctx = OpContext::background();

    let err = db
        .run_in_transaction(
            &ctx,
            &[
                "INSERT INTO t VALUES (1)".to_string(),
                "CREATE TABLE extra (id INTEGER)".to_string(),
                "INSERT INTO missing_table VALUES (1)".to_string(),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ExecutionError(ref m) if m.contains("statement 3")));

    assert_eq!(count(&db, "SELECT COUNT(*) FROM t"), 0);
    assert_eq!(
        count(
            &db,
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 'extra'"
        ),
        0
    );

    // connection is usable after the rollback
    db.execute("INSERT INTO t VALUES (5)").await.unwrap();
    assert_eq!(count(&db, "SELECT COUNT(*) FROM t"), 1);
}

#[tokio::test]
async fn test_cancelled_context_runs_nothing() {
    let db = DuckDbBackend::in_memory().unwrap();
    let ctx = OpContext::background();
    ctx.cancel_handle().cancel();

    let err = db
        .run_in_transaction(&ctx, &["CREATE TABLE t (id INTEGER)".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Interrupted(_)));
    assert_eq!(
        count(
            &db,
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 't'"
        ),
        0
    );
}

#[tokio::test]
async fn test_expired_deadline_rolls_back() {
    let db = DuckDbBackend::in_memory().unwrap();
    let ctx = OpContext::with_timeout(Duration::ZERO);
    let err = db
        .run_in_transaction(&ctx, &["CREATE TABLE t (id INTEGER)".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Interrupted(_)));
}

#[tokio::test]
async fn test_lock_contention_between_sessions() {
    let a = DuckDbBackend::in_memory().unwrap();
    let b = a.try_clone().unwrap();
    let ttl = Duration::from_secs(30);

    assert!(a.try_advisory_lock("k", "owner-a", ttl).await.unwrap());
    assert!(!b.try_advisory_lock("k", "owner-b", ttl).await.unwrap());

    // re-acquiring as the current owner is allowed
    assert!(a.try_advisory_lock("k", "owner-a", ttl).await.unwrap());

    a.advisory_unlock("k", "owner-a").await.unwrap();
    assert!(b.try_advisory_lock("k", "owner-b", ttl).await.unwrap());
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let a = DuckDbBackend::in_memory().unwrap();
    let b = a.try_clone().unwrap();

    assert!(a
        .try_advisory_lock("k", "owner-a", Duration::from_millis(1))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(b
        .try_advisory_lock("k", "owner-b", Duration::from_secs(30))
        .await
        .unwrap());
    // the previous holder can no longer renew
    assert!(!a
        .renew_advisory_lock("k", "owner-a", Duration::from_secs(30))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_renew_and_unlock() {
    let db = DuckDbBackend::in_memory().unwrap();
    let ttl = Duration::from_secs(30);
    assert!(db.try_advisory_lock("k", "me", ttl).await.unwrap());
    assert!(db.renew_advisory_lock("k", "me", ttl).await.unwrap());
    assert!(!db.renew_advisory_lock("k", "someone-else", ttl).await.unwrap());

    // unlocking as a non-owner leaves the lease in place
    db.advisory_unlock("k", "someone-else").await.unwrap();
    assert!(db.renew_advisory_lock("k", "me", ttl).await.unwrap());

    db.advisory_unlock("k", "me").await.unwrap();
    assert!(!db.renew_advisory_lock("k", "me", ttl).await.unwrap());
}

#[tokio::test]
async fn test_unlock_without_lock_table_is_noop() {
    let db = DuckDbBackend::in_memory().unwrap();
    db.advisory_unlock("never-taken", "me").await.unwrap();
}

#[test]
fn test_rollback_without_transaction_keeps_connection_usable() {
    let db = DuckDbBackend::in_memory().unwrap();
    {
        let conn = db.work().unwrap();
        // nothing is open, so ROLLBACK fails; that failure must not escape
        rollback(&conn, "test");
    }
    db.execute_batch_sync("CREATE TABLE after_rollback (id INTEGER)")
        .unwrap();
    assert_eq!(count(&db, "SELECT COUNT(*) FROM after_rollback"), 0);
}

#[test]
fn test_file_lock_conflict_is_classified() {
    let path = Path::new("/data/app.duckdb");
    let locked = open_error(
        "IO Error: Could not set lock on file \"/data/app.duckdb\": Conflicting lock is held in /usr/bin/tm (PID 42)",
        path,
    );
    assert!(matches!(locked, DbError::Locked(ref msg) if msg.contains("PID 42")));

    let other = open_error("IO Error: Cannot open file: Permission denied", path);
    assert!(matches!(other, DbError::ConnectionError(_)));
}
