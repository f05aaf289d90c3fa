//! Transaction clients with savepoint nesting.
//!
//! A transaction holds one physical connection from the write pool for its whole
//! lifetime. Nested levels are savepoints on that same connection. Every level
//! has its own state (`Active → Committed | RolledBack`), and a level is only
//! usable while it and all of its ancestors are active.
//!
//! The server keeps the savepoints of one transaction in a single stack, so a
//! level may have at most one open child. Ending a level ends every level
//! opened inside it with the same state.
//!
//! Statements on one transaction are serialized by a FIFO `tokio::sync::Mutex`
//! around the reserved connection, so they run strictly in issuance order.

use crate::db::connection::{Connection, ConnectionLease};
use crate::db::executor::{self, Operation, Output, StatementContext, Target};
use crate::db::pool::{DbPool, PoolSet};
use crate::db::query_client::Statement;
use crate::error::{DbError, DbResult};
use crate::events::DbEvent;
use crate::models::{CompileQuery, CompiledQuery, PoolRole, QueryTimeout, TransactionState};
use sqlx::{Executor, MySql, Postgres, Sqlite, Transaction};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let driver = impl_tx_dispatch!(self, {
            MySql(_t) => "MySql",
            Postgres(_t) => "Postgres",
            SQLite(_t) => "SQLite",
        });
        f.debug_tuple("DbTransaction").field(&driver).finish()
    }
}

impl DbTransaction {
    /// Check out a connection and issue `BEGIN`.
    pub async fn begin(pool: &DbPool) -> DbResult<Self> {
        let tx = match pool {
            DbPool::MySql(p) => DbTransaction::MySql(p.begin().await?),
            DbPool::Postgres(p) => DbTransaction::Postgres(p.begin().await?),
            DbPool::SQLite(p) => DbTransaction::SQLite(p.begin().await?),
        };
        Ok(tx)
    }

    pub async fn commit(self) -> DbResult<()> {
        impl_tx_dispatch!(self, {
            MySql(tx) => tx.commit().await,
            Postgres(tx) => tx.commit().await,
            SQLite(tx) => tx.commit().await,
        })
        .map_err(DbError::from)
    }

    pub async fn rollback(self) -> DbResult<()> {
        impl_tx_dispatch!(self, {
            MySql(tx) => tx.rollback().await,
            Postgres(tx) => tx.rollback().await,
            SQLite(tx) => tx.rollback().await,
        })
        .map_err(DbError::from)
    }

    /// Run a control statement (savepoints) without preparing it.
    async fn execute_control(&mut self, sql: &str) -> DbResult<()> {
        impl_tx_dispatch!(self, {
            MySql(tx) => (&mut **tx).execute(sql).await.map(|_| ()),
            Postgres(tx) => (&mut **tx).execute(sql).await.map(|_| ()),
            SQLite(tx) => (&mut **tx).execute(sql).await.map(|_| ()),
        })
        .map_err(DbError::from)
    }

    /// Server-side id of the reserved session.
    pub async fn backend_id(&mut self) -> DbResult<Option<i64>> {
        let id: Option<i64> = match self {
            DbTransaction::Postgres(tx) => Some(
                sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
                    .fetch_one(&mut **tx)
                    .await?
                    .into(),
            ),
            DbTransaction::MySql(tx) => {
                let id = sqlx::query_scalar::<_, u64>("SELECT CONNECTION_ID()")
                    .fetch_one(&mut **tx)
                    .await?;
                i64::try_from(id).ok()
            }
            DbTransaction::SQLite(_) => None,
        };
        Ok(id)
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// State shared by every level of one physical transaction.
struct PhysicalTransaction {
    id: String,
    connection: Arc<Connection>,
    pools: Arc<PoolSet>,
    tx: Mutex<Option<DbTransaction>>,
    savepoints: AtomicUsize,
    /// Open savepoint levels, innermost last.
    levels: std::sync::Mutex<Vec<Weak<Level>>>,
    global: bool,
    _lease: ConnectionLease,
}

impl PhysicalTransaction {
    fn innermost_level(&self) -> Option<Arc<Level>> {
        let levels = self.levels.lock().ok()?;
        levels.iter().rev().find_map(Weak::upgrade)
    }
}

impl Drop for PhysicalTransaction {
    fn drop(&mut self) {
        // Dropping the sqlx transaction queues a ROLLBACK on its connection
        if self.tx.get_mut().take().is_some() {
            warn!(
                transaction_id = %self.id,
                connection = %self.connection.name(),
                "Transaction dropped without commit or rollback; rolling back"
            );
            self.connection.untrack_transaction(&self.id);
            self.connection.events().emit(DbEvent::Rollback {
                connection: self.connection.name().to_string(),
                transaction_id: self.id.clone(),
            });
        }
    }
}

struct Level {
    depth: usize,
    savepoint: Option<String>,
    state: watch::Sender<TransactionState>,
    parent: Option<Arc<Level>>,
}

impl Level {
    fn new(depth: usize, savepoint: Option<String>, parent: Option<Arc<Level>>) -> Self {
        let (state, _) = watch::channel(TransactionState::Active);
        Self {
            depth,
            savepoint,
            state,
            parent,
        }
    }
}

/// One level of a database transaction.
///
/// Cloning yields another handle to the same level. Query clients bound with
/// `use_transaction` execute through it.
#[derive(Clone)]
pub struct TransactionClient {
    physical: Arc<PhysicalTransaction>,
    level: Arc<Level>,
}

impl std::fmt::Debug for TransactionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionClient")
            .field("id", &self.physical.id)
            .field("connection", &self.physical.connection.name())
            .field("depth", &self.level.depth)
            .field("state", &self.state())
            .field("global", &self.physical.global)
            .finish()
    }
}

impl TransactionClient {
    /// Begin a transaction on the write pool of `pools`.
    pub(crate) async fn begin(
        connection: Arc<Connection>,
        pools: Arc<PoolSet>,
        global: bool,
    ) -> DbResult<Self> {
        let lease = connection.lease();
        let tx = DbTransaction::begin(pools.write()).await?;
        let id = generate_transaction_id();
        connection.track_transaction(&id, global);

        info!(
            transaction_id = %id,
            connection = %connection.name(),
            global,
            "Transaction started"
        );

        Ok(Self {
            physical: Arc::new(PhysicalTransaction {
                id,
                connection,
                pools,
                tx: Mutex::new(Some(tx)),
                savepoints: AtomicUsize::new(0),
                levels: std::sync::Mutex::new(Vec::new()),
                global,
                _lease: lease,
            }),
            level: Arc::new(Level::new(0, None, None)),
        })
    }

    /// Id of the physical transaction (shared by nested levels).
    pub fn id(&self) -> &str {
        &self.physical.id
    }

    pub fn connection_name(&self) -> &str {
        self.physical.connection.name()
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.physical.connection
    }

    pub(crate) fn pools(&self) -> &Arc<PoolSet> {
        &self.physical.pools
    }

    /// 0 for the outermost level, +1 per savepoint.
    pub fn depth(&self) -> usize {
        self.level.depth
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.level.savepoint.as_deref()
    }

    pub fn is_global(&self) -> bool {
        self.physical.global
    }

    pub fn state(&self) -> TransactionState {
        *self.level.state.borrow()
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_ended()
    }

    /// Observe this level's state; resolves when it commits or rolls back.
    pub fn completion(&self) -> watch::Receiver<TransactionState> {
        self.level.state.subscribe()
    }

    /// Start building a statement from raw SQL.
    pub fn raw(&self, sql: impl Into<String>) -> Statement<'_> {
        Statement::for_transaction(self, CompiledQuery::new(sql))
    }

    /// Start building a statement from a compiled query.
    pub fn query(&self, query: &(impl CompileQuery + ?Sized)) -> Statement<'_> {
        Statement::for_transaction(self, query.compile())
    }

    fn closed_error(&self, state: TransactionState) -> DbError {
        let id = match &self.level.savepoint {
            Some(sp) => format!("{}:{}", self.physical.id, sp),
            None => self.physical.id.clone(),
        };
        DbError::transaction_closed(id, state.to_string())
    }

    /// Fails unless this level and every ancestor is still active.
    fn ensure_active(&self) -> DbResult<()> {
        let mut level = Some(&self.level);
        while let Some(current) = level {
            let state = *current.state.borrow();
            if state.is_ended() {
                return Err(self.closed_error(state));
            }
            level = current.parent.as_ref();
        }
        Ok(())
    }

    /// Mark this level and every level opened inside it as ended.
    fn finish(&self, state: TransactionState) {
        if let Ok(mut levels) = self.physical.levels.lock() {
            let start = match self.level.savepoint {
                None => 0,
                Some(_) => levels
                    .iter()
                    .position(|l| std::ptr::eq(l.as_ptr(), Arc::as_ptr(&self.level)))
                    .unwrap_or(levels.len()),
            };
            for level in levels.drain(start..).filter_map(|l| l.upgrade()) {
                level.state.send_if_modified(|current| {
                    if current.is_ended() {
                        false
                    } else {
                        *current = state;
                        true
                    }
                });
            }
        }
        self.level.state.send_replace(state);
    }

    pub(crate) async fn run(
        &self,
        query: &CompiledQuery,
        operation: Operation,
        timeout: Option<QueryTimeout>,
    ) -> DbResult<Output> {
        let mut slot = self.physical.tx.lock().await;
        self.ensure_active()?;
        let tx = slot
            .as_mut()
            .ok_or_else(|| self.closed_error(TransactionState::Committed))?;

        let connection = &self.physical.connection;
        let ctx = StatementContext {
            connection: connection.name(),
            role: PoolRole::Write,
            transaction_id: Some(&self.physical.id),
            events: connection.events(),
            debug: connection.config().debug,
            cancel_pool: self.physical.pools.write(),
        };
        executor::run(&ctx, Target::Transaction(tx), query, operation, timeout).await
    }

    /// Open a nested level backed by a savepoint.
    ///
    /// Fails with `NestedTransactionActive` while this level already has an
    /// open child.
    pub async fn transaction(&self) -> DbResult<TransactionClient> {
        let mut slot = self.physical.tx.lock().await;
        self.ensure_active()?;
        let tx = slot
            .as_mut()
            .ok_or_else(|| self.closed_error(TransactionState::Committed))?;

        if let Some(open) = self
            .physical
            .innermost_level()
            .filter(|open| !Arc::ptr_eq(open, &self.level))
        {
            return Err(DbError::nested_transaction_active(
                self.physical.id.clone(),
                open.savepoint.clone().unwrap_or_default(),
            ));
        }

        let seq = self.physical.savepoints.fetch_add(1, Ordering::Relaxed) + 1;
        let savepoint = format!("sp_{seq}");
        tx.execute_control(&format!("SAVEPOINT {savepoint}")).await?;

        debug!(
            transaction_id = %self.physical.id,
            savepoint = %savepoint,
            depth = self.level.depth + 1,
            "Savepoint created"
        );

        let level = Arc::new(Level::new(
            self.level.depth + 1,
            Some(savepoint),
            Some(Arc::clone(&self.level)),
        ));
        if let Ok(mut levels) = self.physical.levels.lock() {
            levels.retain(|l| l.strong_count() > 0);
            levels.push(Arc::downgrade(&level));
        }

        Ok(TransactionClient {
            physical: Arc::clone(&self.physical),
            level,
        })
    }

    /// Run `f` in a nested level: commit on `Ok`, roll back on `Err`.
    pub async fn transaction_with<F, Fut, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(TransactionClient) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let nested = self.transaction().await?;
        managed(nested, f).await
    }

    /// Commit this level.
    ///
    /// Nested levels release their savepoint. The outermost level issues
    /// `COMMIT` and returns the connection to the pool; if `COMMIT` fails the
    /// transaction ends rolled back and the error is returned.
    pub async fn commit(&self) -> DbResult<()> {
        let mut slot = self.physical.tx.lock().await;
        self.ensure_active()?;

        if let Some(savepoint) = &self.level.savepoint {
            let tx = slot
                .as_mut()
                .ok_or_else(|| self.closed_error(TransactionState::Committed))?;
            tx.execute_control(&format!("RELEASE SAVEPOINT {savepoint}"))
                .await?;
            self.finish(TransactionState::Committed);
            debug!(transaction_id = %self.physical.id, savepoint = %savepoint, "Savepoint released");
            return Ok(());
        }

        let tx = slot
            .take()
            .ok_or_else(|| self.closed_error(TransactionState::Committed))?;
        let result = tx.commit().await;
        let connection = &self.physical.connection;
        connection.untrack_transaction(&self.physical.id);

        match &result {
            Ok(()) => {
                self.finish(TransactionState::Committed);
                info!(transaction_id = %self.physical.id, connection = %connection.name(), "Transaction committed");
                connection.events().emit(DbEvent::Commit {
                    connection: connection.name().to_string(),
                    transaction_id: self.physical.id.clone(),
                });
            }
            Err(e) => {
                self.finish(TransactionState::RolledBack);
                warn!(transaction_id = %self.physical.id, error = %e, "Commit failed; transaction rolled back");
                connection.events().emit(DbEvent::Rollback {
                    connection: connection.name().to_string(),
                    transaction_id: self.physical.id.clone(),
                });
            }
        }
        result
    }

    /// Roll back this level.
    ///
    /// Nested levels revert to their savepoint and leave the parent active. The
    /// outermost level issues `ROLLBACK` and returns the connection to the pool.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut slot = self.physical.tx.lock().await;
        self.ensure_active()?;

        if let Some(savepoint) = &self.level.savepoint {
            let tx = slot
                .as_mut()
                .ok_or_else(|| self.closed_error(TransactionState::RolledBack))?;
            tx.execute_control(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                .await?;
            tx.execute_control(&format!("RELEASE SAVEPOINT {savepoint}"))
                .await?;
            self.finish(TransactionState::RolledBack);
            debug!(transaction_id = %self.physical.id, savepoint = %savepoint, "Rolled back to savepoint");
            return Ok(());
        }

        let tx = slot
            .take()
            .ok_or_else(|| self.closed_error(TransactionState::RolledBack))?;
        let result = tx.rollback().await;
        let connection = &self.physical.connection;
        connection.untrack_transaction(&self.physical.id);
        self.finish(TransactionState::RolledBack);

        if let Err(e) = &result {
            warn!(transaction_id = %self.physical.id, error = %e, "Rollback reported an error");
        } else {
            info!(transaction_id = %self.physical.id, connection = %connection.name(), "Transaction rolled back");
        }
        connection.events().emit(DbEvent::Rollback {
            connection: connection.name().to_string(),
            transaction_id: self.physical.id.clone(),
        });
        result
    }
}

/// Commit `trx` when `f` succeeds, roll it back when `f` fails.
pub(crate) async fn managed<F, Fut, T>(trx: TransactionClient, f: F) -> DbResult<T>
where
    F: FnOnce(TransactionClient) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    match f(trx.clone()).await {
        Ok(value) => {
            // The closure may have completed the transaction itself
            if !trx.is_completed() {
                trx.commit().await?;
            }
            Ok(value)
        }
        Err(e) => {
            if !trx.is_completed() {
                if let Err(rollback_err) = trx.rollback().await {
                    warn!(
                        transaction_id = %trx.id(),
                        error = %rollback_err,
                        "Rollback after failed transaction body also failed"
                    );
                }
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::events::EventBus;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn connected(dir: &TempDir) -> (Arc<Connection>, Arc<PoolSet>) {
        let path = dir.path().join("tx.db").to_string_lossy().into_owned();
        let conn = Arc::new(Connection::new(
            "local",
            ConnectionConfig::sqlite(path),
            EventBus::default(),
            Duration::from_secs(1),
        ));
        conn.connect().await.unwrap();
        let pools = conn.pools().await.unwrap();
        (conn, pools)
    }

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
    }

    #[tokio::test]
    async fn test_levels_track_depth_and_state() {
        let dir = TempDir::new().unwrap();
        let (conn, pools) = connected(&dir).await;

        let outer = TransactionClient::begin(Arc::clone(&conn), pools, false)
            .await
            .unwrap();
        assert_eq!(outer.depth(), 0);
        assert_eq!(conn.open_transaction_count(), 1);
        assert_eq!(conn.active_leases(), 1);

        let inner = outer.transaction().await.unwrap();
        assert_eq!(inner.depth(), 1);
        assert_eq!(inner.savepoint(), Some("sp_1"));
        assert_eq!(inner.id(), outer.id());

        inner.rollback().await.unwrap();
        assert_eq!(inner.state(), TransactionState::RolledBack);
        assert!(outer.state().is_active());

        outer.commit().await.unwrap();
        assert!(outer.is_completed());
        assert_eq!(conn.open_transaction_count(), 0);

        drop(inner);
        drop(outer);
        assert_eq!(conn.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_child_of_finished_parent_is_closed() {
        let dir = TempDir::new().unwrap();
        let (conn, pools) = connected(&dir).await;
        let outer = TransactionClient::begin(conn, pools, false).await.unwrap();
        let inner = outer.transaction().await.unwrap();

        outer.rollback().await.unwrap();
        let err = inner.commit().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionClosed { .. }));
        let err = outer.rollback().await.unwrap_err();
        assert!(matches!(err, DbError::TransactionClosed { ref state, .. } if state == "rolled back"));
    }

    #[tokio::test]
    async fn test_completion_resolves_on_commit() {
        let dir = TempDir::new().unwrap();
        let (conn, pools) = connected(&dir).await;
        let trx = TransactionClient::begin(conn, pools, false).await.unwrap();
        let mut completion = trx.completion();

        let waiter = tokio::spawn(async move {
            completion
                .wait_for(|state| state.is_ended())
                .await
                .map(|state| *state)
        });
        trx.commit().await.unwrap();
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            TransactionState::Committed
        );
    }

    #[tokio::test]
    async fn test_dropping_open_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (conn, pools) = connected(&dir).await;
        let mut rx = conn.events().subscribe();

        let trx = TransactionClient::begin(Arc::clone(&conn), pools, false)
            .await
            .unwrap();
        let id = trx.id().to_string();
        drop(trx);

        assert_eq!(conn.open_transaction_count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Ok(DbEvent::Rollback { ref transaction_id, .. }) if *transaction_id == id
        ));
    }

    #[tokio::test]
    async fn test_managed_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let (conn, pools) = connected(&dir).await;
        let trx = TransactionClient::begin(conn, pools, false).await.unwrap();

        let result: DbResult<()> = trx
            .transaction_with(|nested| async move {
                assert_eq!(nested.depth(), 1);
                Err(DbError::invalid_input("abort"))
            })
            .await;
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
        assert!(trx.state().is_active());
        trx.rollback().await.unwrap();
    }
}
