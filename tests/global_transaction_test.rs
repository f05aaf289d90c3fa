//! Integration tests for global transactions.
//!
//! While a global transaction is open, every client obtained for its connection
//! name runs inside it, so rolling it back reverts everything done meanwhile.

use db_conn_manager::config::PoolOptions;
use db_conn_manager::models::ClientMode;
use db_conn_manager::{ConnectionConfig, Database, DatabaseConfig, DbError};
use std::sync::Arc;
use tempfile::TempDir;

async fn setup_db(dir: &TempDir) -> Database {
    let config = DatabaseConfig::new("app")
        .with_connection(
            "app",
            ConnectionConfig::sqlite(dir.path().join("app.db").to_string_lossy().into_owned()),
        )
        .with_connection(
            "audit",
            ConnectionConfig::sqlite(dir.path().join("audit.db").to_string_lossy().into_owned())
                .with_pool(PoolOptions {
                    max_connections: Some(2),
                    ..Default::default()
                }),
        );
    let db = Database::new(config).await.unwrap();
    for name in ["app", "audit"] {
        db.connection(Some(name), None)
            .await
            .unwrap()
            .raw("CREATE TABLE events (label TEXT)")
            .execute()
            .await
            .unwrap();
    }
    db
}

async fn count(db: &Database, name: &str) -> i64 {
    let row = db
        .connection(Some(name), None)
        .await
        .unwrap()
        .raw("SELECT count(*) AS n FROM events")
        .fetch_one()
        .await
        .unwrap();
    row["n"].as_i64().unwrap()
}

#[tokio::test]
async fn test_rollback_reverts_all_intercepted_work() {
    let dir = TempDir::new().unwrap();
    let db = setup_db(&dir).await;

    db.begin_global_transaction(None).await.unwrap();

    // Clients obtained anywhere for "app" are routed into the global transaction
    for mode in [None, Some(ClientMode::Write), Some(ClientMode::Dual)] {
        db.connection(None, mode)
            .await
            .unwrap()
            .raw("INSERT INTO events (label) VALUES ('intercepted')")
            .execute()
            .await
            .unwrap();
    }
    db.transaction_with(None, |trx| async move {
        trx.raw("INSERT INTO events (label) VALUES ('nested')")
            .execute()
            .await
    })
    .await
    .unwrap();
    assert_eq!(count(&db, "app").await, 4);

    db.rollback_global_transaction(None).await.unwrap();
    assert_eq!(count(&db, "app").await, 0);
}

#[tokio::test]
async fn test_commit_keeps_intercepted_work() {
    let dir = TempDir::new().unwrap();
    let db = setup_db(&dir).await;

    db.begin_global_transaction(None).await.unwrap();
    db.connection(None, None)
        .await
        .unwrap()
        .raw("INSERT INTO events (label) VALUES ('kept')")
        .execute()
        .await
        .unwrap();
    db.commit_global_transaction(None).await.unwrap();

    assert_eq!(count(&db, "app").await, 1);
}

#[tokio::test]
async fn test_second_global_transaction_fails() {
    let dir = TempDir::new().unwrap();
    let db = setup_db(&dir).await;

    let first = db.begin_global_transaction(None).await.unwrap();
    let err = db.begin_global_transaction(Some("app")).await.unwrap_err();
    assert!(matches!(err, DbError::GlobalTransactionActive { ref name } if name == "app"));

    // Other connection names are independent
    let audit = db.begin_global_transaction(Some("audit")).await.unwrap();
    assert_ne!(first.id(), audit.id());

    db.rollback_global_transaction(None).await.unwrap();
    db.rollback_global_transaction(Some("audit")).await.unwrap();

    // Once finished a new one may begin
    db.begin_global_transaction(None).await.unwrap();
    db.rollback_global_transaction(None).await.unwrap();
}

#[tokio::test]
async fn test_overlapping_scopes_inside_global_are_refused() {
    let dir = TempDir::new().unwrap();
    let db = setup_db(&dir).await;
    db.begin_global_transaction(None).await.unwrap();

    let first = db.transaction(None).await.unwrap();
    first
        .raw("INSERT INTO events (label) VALUES ('first')")
        .execute()
        .await
        .unwrap();

    // A second scope would sit inside the first on the server
    let err = db.transaction(None).await.unwrap_err();
    assert!(
        matches!(err, DbError::NestedTransactionActive { .. }),
        "{err:?}"
    );

    first.rollback().await.unwrap();
    let second = db.transaction(None).await.unwrap();
    second
        .raw("INSERT INTO events (label) VALUES ('second')")
        .execute()
        .await
        .unwrap();
    second.commit().await.unwrap();
    assert_eq!(count(&db, "app").await, 1);

    db.rollback_global_transaction(None).await.unwrap();
    assert_eq!(count(&db, "app").await, 0);
}

#[tokio::test]
async fn test_concurrent_begins_admit_exactly_one() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(setup_db(&dir).await);

    let attempts = (0..4).map(|_| {
        let db = Arc::clone(&db);
        tokio::spawn(async move { db.begin_global_transaction(Some("audit")).await })
    });
    let results = futures_util::future::join_all(attempts).await;

    let mut started = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => started += 1,
            Err(DbError::GlobalTransactionActive { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(started, 1);
    db.rollback_global_transaction(Some("audit")).await.unwrap();
}

#[tokio::test]
async fn test_global_transaction_only_intercepts_its_name() {
    let dir = TempDir::new().unwrap();
    let db = setup_db(&dir).await;

    db.begin_global_transaction(Some("audit")).await.unwrap();
    let app = db.connection(Some("app"), None).await.unwrap();
    assert!(app.bound_transaction().is_none());
    app.raw("INSERT INTO events (label) VALUES ('direct')")
        .execute()
        .await
        .unwrap();

    db.rollback_global_transaction(Some("audit")).await.unwrap();
    assert_eq!(count(&db, "app").await, 1);
}

#[tokio::test]
async fn test_teardown_rolls_back_open_global_transaction() {
    let dir = TempDir::new().unwrap();
    let db = setup_db(&dir).await;

    db.begin_global_transaction(None).await.unwrap();
    db.connection(None, None)
        .await
        .unwrap()
        .raw("INSERT INTO events (label) VALUES ('lost')")
        .execute()
        .await
        .unwrap();
    db.teardown().await.unwrap();

    assert_eq!(count(&db, "app").await, 0);
}
