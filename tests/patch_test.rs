//! Integration tests for hot config replacement.
//!
//! `patch` must route new work to the new config while work that already holds
//! the old pools finishes there.

use db_conn_manager::models::ConnectionState;
use db_conn_manager::{ConnectionConfig, Database, DatabaseConfig};
use std::time::Duration;
use tempfile::TempDir;

fn sqlite(dir: &TempDir, file: &str) -> ConnectionConfig {
    ConnectionConfig::sqlite(dir.path().join(file).to_string_lossy().into_owned())
}

async fn labels(db: &Database, name: &str) -> Vec<String> {
    db.connection(Some(name), None)
        .await
        .unwrap()
        .raw("SELECT label FROM items ORDER BY rowid")
        .fetch_all()
        .await
        .unwrap()
        .into_iter()
        .filter_map(|row| row.get("label").and_then(|v| v.as_str()).map(str::to_string))
        .collect()
}

async fn wait_for_drain(db: &Database) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while db.manager().draining_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retired pools were not drained");
}

#[tokio::test]
async fn test_patch_routes_new_queries_to_new_config() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(
        DatabaseConfig::new("tenant").with_connection("tenant", sqlite(&dir, "old.db")),
    )
    .await
    .unwrap();

    let old = db.connection(None, None).await.unwrap();
    old.raw("CREATE TABLE items (label TEXT)").execute().await.unwrap();
    old.raw("INSERT INTO items VALUES ('old')").execute().await.unwrap();
    drop(old);

    db.manager()
        .patch("tenant", sqlite(&dir, "new.db"))
        .await
        .unwrap();
    assert_eq!(
        db.manager().get("tenant").await.unwrap().state,
        ConnectionState::Open
    );

    let new = db.connection(None, None).await.unwrap();
    new.raw("CREATE TABLE items (label TEXT)").execute().await.unwrap();
    new.raw("INSERT INTO items VALUES ('new')").execute().await.unwrap();
    drop(new);

    assert_eq!(labels(&db, "tenant").await, vec!["new"]);
    wait_for_drain(&db).await;
}

#[tokio::test]
async fn test_in_flight_transaction_finishes_on_old_pool() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(
        DatabaseConfig::new("tenant").with_connection("tenant", sqlite(&dir, "old.db")),
    )
    .await
    .unwrap();
    db.connection(None, None)
        .await
        .unwrap()
        .raw("CREATE TABLE items (label TEXT)")
        .execute()
        .await
        .unwrap();

    let trx = db.transaction(None).await.unwrap();
    trx.raw("INSERT INTO items VALUES ('before patch')")
        .execute()
        .await
        .unwrap();

    db.manager()
        .patch("tenant", sqlite(&dir, "new.db"))
        .await
        .unwrap();
    assert_eq!(db.manager().draining_count(), 1);

    // New work lands on the new database
    db.connection(None, None)
        .await
        .unwrap()
        .raw("CREATE TABLE items (label TEXT)")
        .execute()
        .await
        .unwrap();

    // The open transaction keeps its reserved connection on the old database
    trx.raw("INSERT INTO items VALUES ('after patch')")
        .execute()
        .await
        .unwrap();
    assert_eq!(db.manager().draining_count(), 1);
    trx.commit().await.unwrap();
    drop(trx);

    wait_for_drain(&db).await;
    assert!(labels(&db, "tenant").await.is_empty());

    let archive = Database::new(
        DatabaseConfig::new("archive").with_connection("archive", sqlite(&dir, "old.db")),
    )
    .await
    .unwrap();
    assert_eq!(
        labels(&archive, "archive").await,
        vec!["before patch", "after patch"]
    );
}

#[tokio::test]
async fn test_patch_of_closed_entry_stays_closed() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(
        DatabaseConfig::new("tenant").with_connection("tenant", sqlite(&dir, "old.db")),
    )
    .await
    .unwrap();
    db.manager().connect("tenant").await.unwrap();
    db.manager().close("tenant", false).await.unwrap();

    db.manager()
        .patch("tenant", sqlite(&dir, "new.db"))
        .await
        .unwrap();
    let entry = db.manager().get("tenant").await.unwrap();
    assert_eq!(entry.state, ConnectionState::Closed);
    assert!(
        entry
            .config
            .driver
            .display_target()
            .ends_with("new.db")
    );
    assert_eq!(db.manager().draining_count(), 0);
}

#[tokio::test]
async fn test_invalid_patch_keeps_old_config() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(
        DatabaseConfig::new("tenant").with_connection("tenant", sqlite(&dir, "old.db")),
    )
    .await
    .unwrap();

    assert!(db.manager().patch("tenant", ConnectionConfig::sqlite("")).await.is_err());
    let entry = db.manager().get("tenant").await.unwrap();
    assert!(entry.config.driver.display_target().ends_with("old.db"));
}
