//! Top-level facade over the connection registry.
//!
//! A [`Database`] is built from a [`DatabaseConfig`], registers every named
//! connection up front and hands out query clients and transactions by name.
//! It also owns global transactions: while one is open for a name, every client
//! obtained for that name runs inside it.

use crate::config::DatabaseConfig;
use crate::db::manager::ConnectionManager;
use crate::db::query_client::QueryClient;
use crate::db::transaction::{self, TransactionClient};
use crate::error::{DbError, DbResult};
use crate::events::{DbEvent, EventBus};
use crate::models::{ClientMode, HealthReport};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

pub struct Database {
    primary: String,
    manager: Arc<ConnectionManager>,
    globals: Mutex<HashMap<String, TransactionClient>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("primary", &self.primary)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Register every connection in `config`. Nothing connects until first use.
    pub async fn new(config: DatabaseConfig) -> DbResult<Self> {
        Self::with_manager(config, ConnectionManager::new(EventBus::default())).await
    }

    /// Like [`Database::new`], registering into a caller-built manager.
    pub async fn with_manager(config: DatabaseConfig, manager: ConnectionManager) -> DbResult<Self> {
        config
            .validate()
            .map_err(|e| DbError::invalid_config(&config.connection, e.to_string()))?;

        for (name, connection) in &config.connections {
            manager.add(name, connection.clone()).await?;
        }
        info!(
            primary = %config.connection,
            connections = config.connections.len(),
            "Database initialized"
        );

        Ok(Self {
            primary: config.connection,
            manager: Arc::new(manager),
            globals: Mutex::new(HashMap::new()),
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Name used when callers omit one.
    pub fn primary_connection_name(&self) -> &str {
        &self.primary
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.manager.subscribe()
    }

    fn resolve<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.unwrap_or(&self.primary)
    }

    async fn global_for(&self, name: &str) -> Option<TransactionClient> {
        self.globals
            .lock()
            .await
            .get(name)
            .filter(|trx| !trx.is_completed())
            .cloned()
    }

    /// A query client for `name` (the primary connection when `None`).
    ///
    /// The connection is opened on first use. While a global transaction is
    /// open for `name` the client is bound to it.
    pub async fn connection(
        &self,
        name: Option<&str>,
        mode: Option<ClientMode>,
    ) -> DbResult<QueryClient> {
        let name = self.resolve(name);
        let mode = mode.unwrap_or_default();

        if let Some(global) = self.global_for(name).await {
            let client = QueryClient::new(
                Arc::clone(global.connection()),
                Arc::clone(global.pools()),
                mode,
            );
            return Ok(client.use_transaction(&global));
        }

        let connection = self.manager.acquire(name).await?;
        let pools = connection.pools().await?;
        Ok(QueryClient::new(connection, pools, mode))
    }

    /// Open a transaction on `name`. Inside a global transaction this is a savepoint.
    pub async fn transaction(&self, name: Option<&str>) -> DbResult<TransactionClient> {
        self.connection(name, Some(ClientMode::Write))
            .await?
            .transaction()
            .await
    }

    /// Run `f` in a transaction, committing on `Ok` and rolling back on `Err`.
    pub async fn transaction_with<F, Fut, T>(&self, name: Option<&str>, f: F) -> DbResult<T>
    where
        F: FnOnce(TransactionClient) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let trx = self.transaction(name).await?;
        transaction::managed(trx, f).await
    }

    /// Open the global transaction for `name`.
    ///
    /// Fails with [`DbError::GlobalTransactionActive`] when one is already open.
    pub async fn begin_global_transaction(&self, name: Option<&str>) -> DbResult<TransactionClient> {
        let name = self.resolve(name);
        let mut globals = self.globals.lock().await;
        if globals.get(name).is_some_and(|trx| !trx.is_completed()) {
            return Err(DbError::global_transaction_active(name));
        }

        let connection = self.manager.acquire(name).await?;
        let pools = connection.pools().await?;
        let trx = TransactionClient::begin(connection, pools, true).await?;
        globals.insert(name.to_string(), trx.clone());
        info!(connection = %name, transaction_id = %trx.id(), "Global transaction started");
        Ok(trx)
    }

    async fn take_global(&self, name: &str) -> DbResult<TransactionClient> {
        self.globals
            .lock()
            .await
            .remove(name)
            .filter(|trx| !trx.is_completed())
            .ok_or_else(|| DbError::no_global_transaction(name))
    }

    pub async fn commit_global_transaction(&self, name: Option<&str>) -> DbResult<()> {
        let name = self.resolve(name);
        self.take_global(name).await?.commit().await
    }

    pub async fn rollback_global_transaction(&self, name: Option<&str>) -> DbResult<()> {
        let name = self.resolve(name);
        self.take_global(name).await?.rollback().await
    }

    /// The open global transaction for `name`, if any.
    pub async fn global_transaction(&self, name: Option<&str>) -> Option<TransactionClient> {
        self.global_for(self.resolve(name)).await
    }

    /// Health of every connection with health checks enabled.
    pub async fn report(&self) -> HealthReport {
        self.manager.report().await
    }

    /// Roll back open global transactions, then close every connection.
    pub async fn teardown(&self) -> DbResult<()> {
        let globals: Vec<(String, TransactionClient)> =
            self.globals.lock().await.drain().collect();
        for (name, trx) in globals {
            if trx.is_completed() {
                continue;
            }
            warn!(connection = %name, transaction_id = %trx.id(), "Rolling back global transaction at teardown");
            if let Err(e) = trx.rollback().await {
                warn!(connection = %name, error = %e, "Global transaction rollback failed");
            }
        }
        self.manager.close_all(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, PoolOptions};
    use tempfile::TempDir;

    async fn database(dir: &TempDir) -> Database {
        let path = dir.path().join("app.db").to_string_lossy().into_owned();
        let config = DatabaseConfig::new("app").with_connection(
            "app",
            ConnectionConfig::sqlite(path).with_pool(PoolOptions {
                max_connections: Some(2),
                ..Default::default()
            }),
        );
        Database::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_primary_is_rejected() {
        let config = DatabaseConfig::new("missing");
        let err = Database::new(config).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_connection_defaults_to_primary_and_connects_lazily() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir).await;
        assert_eq!(db.primary_connection_name(), "app");
        assert!(!db.manager().is_connected("app").await);

        let client = db.connection(None, None).await.unwrap();
        assert_eq!(client.connection_name(), "app");
        assert_eq!(client.mode(), ClientMode::Dual);
        assert!(db.manager().is_connected("app").await);
    }

    #[tokio::test]
    async fn test_unknown_connection_name() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir).await;
        let err = db.connection(Some("other"), None).await.unwrap_err();
        assert!(matches!(err, DbError::UnknownConnection { .. }));
    }

    #[tokio::test]
    async fn test_commit_without_global_transaction_fails() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir).await;
        let err = db.commit_global_transaction(None).await.unwrap_err();
        assert!(matches!(err, DbError::NoGlobalTransaction { .. }));
    }

    #[tokio::test]
    async fn test_clients_bind_to_global_transaction() {
        let dir = TempDir::new().unwrap();
        let db = database(&dir).await;
        let global = db.begin_global_transaction(None).await.unwrap();
        assert!(global.is_global());

        let client = db.connection(None, None).await.unwrap();
        assert_eq!(
            client.bound_transaction().map(|t| t.id().to_string()),
            Some(global.id().to_string())
        );

        let nested = db.transaction(None).await.unwrap();
        assert_eq!(nested.id(), global.id());
        assert_eq!(nested.depth(), 1);
        nested.commit().await.unwrap();

        db.rollback_global_transaction(None).await.unwrap();
        assert!(db.global_transaction(None).await.is_none());
        db.teardown().await.unwrap();
    }
}
