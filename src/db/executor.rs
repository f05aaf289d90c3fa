//! Statement execution engine.
//!
//! Runs one compiled statement against a pool, a checked-out connection or an
//! open transaction, with:
//! - Parameterized queries (unparameterized SQL runs unprepared, so statements
//!   that cannot be prepared still work)
//! - An opt-in client-side watchdog that can ask the server to cancel
//! - A `DbEvent::Query` for every execution
//!
//! # Architecture
//!
//! The per-driver code lives in generated submodules (`mysql`, `postgres`,
//! `sqlite`) that are generic over the sqlx executor, so pools, pooled
//! connections and transactions share one implementation per driver.

use crate::db::params::{build_mysql_query, build_postgres_query, build_sqlite_query};
use crate::db::pool::{DbConnection, DbPool};
use crate::db::transaction::DbTransaction;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::events::{DbEvent, EventBus, QueryEvent};
use crate::models::{CompiledQuery, JsonRow, PoolRole, QueryParam, QueryTimeout};
use std::time::Instant;
use tracing::{debug, warn};

/// Where a statement runs.
pub(crate) enum Target<'a> {
    Pool(&'a DbPool),
    Connection(&'a mut DbConnection),
    Transaction(&'a mut DbTransaction),
}

/// What to do with the statement's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Fetch,
    Execute,
}

#[derive(Debug)]
pub(crate) enum Output {
    Rows(Vec<JsonRow>),
    RowsAffected(u64),
}

/// Who is running the statement, for events and logs.
pub(crate) struct StatementContext<'a> {
    pub connection: &'a str,
    pub role: PoolRole,
    pub transaction_id: Option<&'a str>,
    pub events: &'a EventBus,
    pub debug: bool,
    /// Pool used to issue cancel requests from a second connection.
    pub cancel_pool: &'a DbPool,
}

/// Run a statement, applying the timeout and emitting a query event.
pub(crate) async fn run(
    ctx: &StatementContext<'_>,
    target: Target<'_>,
    query: &CompiledQuery,
    operation: Operation,
    timeout: Option<QueryTimeout>,
) -> DbResult<Output> {
    let start = Instant::now();

    if ctx.debug {
        debug!(
            connection = %ctx.connection,
            role = ?ctx.role,
            transaction_id = ?ctx.transaction_id,
            sql = %query.sql,
            params = query.bindings.len(),
            "Executing statement"
        );
    }

    let result = match timeout {
        None => dispatch(target, &query.sql, &query.bindings, operation).await,
        Some(timeout) => watched(ctx, target, query, operation, timeout).await,
    };

    ctx.events.emit(DbEvent::Query(QueryEvent {
        connection: ctx.connection.to_string(),
        sql: query.sql.clone(),
        bindings: query.bindings.clone(),
        duration: start.elapsed(),
        role: ctx.role,
        transaction_id: ctx.transaction_id.map(str::to_string),
        error: result.as_ref().err().map(|e| e.to_string()),
    }));

    result
}

async fn watched(
    ctx: &StatementContext<'_>,
    target: Target<'_>,
    query: &CompiledQuery,
    operation: Operation,
    timeout: QueryTimeout,
) -> DbResult<Output> {
    let start = Instant::now();
    let can_cancel = ctx.cancel_pool.db_type().supports_cancellation();

    if !(timeout.options.cancel && can_cancel) {
        let fut = dispatch(target, &query.sql, &query.bindings, operation);
        return match tokio::time::timeout(timeout.duration, fut).await {
            Ok(result) => result,
            Err(_) => {
                if timeout.options.cancel {
                    debug!(
                        connection = %ctx.connection,
                        "Driver cannot cancel statements; it keeps running server-side"
                    );
                }
                Err(DbError::query_timeout(elapsed_ms(start), false))
            }
        };
    }

    // Pin the statement to one physical connection so its backend can be cancelled
    let mut checked_out: DbConnection;
    let (target, backend_id) = match target {
        Target::Pool(pool) => {
            checked_out = pool.acquire().await?;
            let backend_id = checked_out.backend_id().await?;
            (Target::Connection(&mut checked_out), backend_id)
        }
        Target::Connection(conn) => {
            let backend_id = conn.backend_id().await?;
            (Target::Connection(conn), backend_id)
        }
        Target::Transaction(tx) => {
            let backend_id = tx.backend_id().await?;
            (Target::Transaction(tx), backend_id)
        }
    };

    let fut = dispatch(target, &query.sql, &query.bindings, operation);
    tokio::pin!(fut);
    match tokio::time::timeout(timeout.duration, &mut fut).await {
        Ok(result) => result,
        Err(_) => {
            let cancelled = match backend_id {
                Some(id) => match ctx.cancel_pool.cancel_backend(id).await {
                    Ok(cancelled) => cancelled,
                    Err(e) => {
                        warn!(
                            connection = %ctx.connection,
                            backend_id = id,
                            error = %e,
                            "Failed to cancel timed out statement"
                        );
                        false
                    }
                },
                None => false,
            };
            Err(DbError::query_timeout(elapsed_ms(start), cancelled))
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

async fn dispatch(
    target: Target<'_>,
    sql: &str,
    params: &[QueryParam],
    operation: Operation,
) -> DbResult<Output> {
    macro_rules! on {
        ($module:ident, $executor:expr) => {
            match operation {
                Operation::Fetch => $module::fetch_all($executor, sql, params)
                    .await
                    .map(Output::Rows),
                Operation::Execute => $module::execute($executor, sql, params)
                    .await
                    .map(Output::RowsAffected),
            }
        };
    }

    let result = match target {
        Target::Pool(DbPool::MySql(p)) => on!(mysql, p),
        Target::Pool(DbPool::Postgres(p)) => on!(postgres, p),
        Target::Pool(DbPool::SQLite(p)) => on!(sqlite, p),
        Target::Connection(DbConnection::MySql(c)) => on!(mysql, &mut **c),
        Target::Connection(DbConnection::Postgres(c)) => on!(postgres, &mut **c),
        Target::Connection(DbConnection::SQLite(c)) => on!(sqlite, &mut **c),
        Target::Transaction(DbTransaction::MySql(tx)) => on!(mysql, &mut **tx),
        Target::Transaction(DbTransaction::Postgres(tx)) => on!(postgres, &mut **tx),
        Target::Transaction(DbTransaction::SQLite(tx)) => on!(sqlite, &mut **tx),
    };
    result.map_err(DbError::from)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module provides the same interface adapted to its driver.

macro_rules! driver_module {
    ($module:ident, $db:ty, $build:path) => {
        mod $module {
            use super::*;

            pub async fn fetch_all<'e, 'q: 'e, E>(
                executor: E,
                sql: &'q str,
                params: &'q [QueryParam],
            ) -> Result<Vec<JsonRow>, sqlx::Error>
            where
                E: sqlx::Executor<'e, Database = $db>,
            {
                let rows = if params.is_empty() {
                    executor.fetch_all(sql).await?
                } else {
                    $build(sql, params).fetch_all(executor).await?
                };
                Ok(rows.iter().map(RowToJson::to_json_row).collect())
            }

            pub async fn execute<'e, 'q: 'e, E>(
                executor: E,
                sql: &'q str,
                params: &'q [QueryParam],
            ) -> Result<u64, sqlx::Error>
            where
                E: sqlx::Executor<'e, Database = $db>,
            {
                let result = if params.is_empty() {
                    executor.execute(sql).await?
                } else {
                    $build(sql, params).execute(executor).await?
                };
                Ok(result.rows_affected())
            }
        }
    };
}

driver_module!(mysql, sqlx::MySql, build_mysql_query);
driver_module!(postgres, sqlx::Postgres, build_postgres_query);
driver_module!(sqlite, sqlx::Sqlite, build_sqlite_query);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolOptions, SqliteParams, DriverConfig};
    use crate::models::TimeoutOptions;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn sqlite_pool(dir: &TempDir) -> DbPool {
        let driver = DriverConfig::Sqlite(SqliteParams {
            filename: dir.path().join("exec.db").to_string_lossy().into_owned(),
            create_if_missing: true,
            read_only: false,
        });
        DbPool::connect(&driver, &PoolOptions::default()).await.unwrap()
    }

    fn context<'a>(pool: &'a DbPool, events: &'a EventBus) -> StatementContext<'a> {
        StatementContext {
            connection: "local",
            role: PoolRole::Write,
            transaction_id: None,
            events,
            debug: true,
            cancel_pool: pool,
        }
    }

    #[tokio::test]
    async fn test_execute_and_fetch_with_bindings() {
        let dir = TempDir::new().unwrap();
        let pool = sqlite_pool(&dir).await;
        let events = EventBus::default();
        let ctx = context(&pool, &events);

        let create = CompiledQuery::new("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)");
        run(&ctx, Target::Pool(&pool), &create, Operation::Execute, None)
            .await
            .unwrap();

        let insert = CompiledQuery::new("INSERT INTO users (name) VALUES (?), (?)")
            .with_binding("ada")
            .with_binding("grace");
        let Output::RowsAffected(n) =
            run(&ctx, Target::Pool(&pool), &insert, Operation::Execute, None)
                .await
                .unwrap()
        else {
            panic!("expected affected rows");
        };
        assert_eq!(n, 2);

        let select = CompiledQuery::new("SELECT id, name FROM users WHERE name = ?")
            .with_binding("grace");
        let Output::Rows(rows) = run(&ctx, Target::Pool(&pool), &select, Operation::Fetch, None)
            .await
            .unwrap()
        else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], serde_json::json!("grace"));
        assert_eq!(rows[0]["id"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_every_execution_emits_query_event() {
        let dir = TempDir::new().unwrap();
        let pool = sqlite_pool(&dir).await;
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let ctx = context(&pool, &events);

        let bad = CompiledQuery::new("SELECT * FROM missing_table");
        assert!(
            run(&ctx, Target::Pool(&pool), &bad, Operation::Fetch, None)
                .await
                .is_err()
        );

        let Ok(DbEvent::Query(event)) = rx.try_recv() else {
            panic!("expected query event");
        };
        assert_eq!(event.connection, "local");
        assert_eq!(event.sql, "SELECT * FROM missing_table");
        assert!(event.error.is_some());
    }

    #[tokio::test]
    async fn test_watchdog_times_out_without_cancel() {
        let dir = TempDir::new().unwrap();
        let pool = sqlite_pool(&dir).await;
        let events = EventBus::default();
        let ctx = context(&pool, &events);

        let slow = CompiledQuery::new(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 50000000) \
             SELECT count(*) FROM c",
        );
        let timeout = QueryTimeout {
            duration: Duration::from_millis(20),
            options: TimeoutOptions { cancel: true },
        };
        let err = run(&ctx, Target::Pool(&pool), &slow, Operation::Fetch, Some(timeout))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::QueryTimeout { cancelled: false, .. }));
    }
}
