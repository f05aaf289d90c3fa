//! Query clients and statement builders.
//!
//! A [`QueryClient`] resolves the read/write intent of each statement to a pool
//! and runs it, or forwards it to the transaction it is bound to. Statements are
//! built with [`QueryClient::raw`] or [`QueryClient::query`] and executed with
//! one of the `fetch_*`/`execute` terminals.

use crate::db::classify;
use crate::db::connection::{Connection, ConnectionLease};
use crate::db::executor::{self, Operation, Output, StatementContext, Target};
use crate::db::pool::PoolSet;
use crate::db::transaction::{self, TransactionClient};
use crate::error::{DbError, DbResult};
use crate::models::{
    ClientMode, CompileQuery, CompiledQuery, JsonRow, PoolRole, QueryParam, QueryTimeout,
    TimeoutOptions,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A short-lived handle for issuing statements against one connection.
pub struct QueryClient {
    connection: Arc<Connection>,
    pools: Arc<PoolSet>,
    mode: ClientMode,
    transaction: Option<TransactionClient>,
    _lease: ConnectionLease,
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("connection", &self.connection.name())
            .field("mode", &self.mode)
            .field("transaction", &self.transaction.as_ref().map(|t| t.id()))
            .finish()
    }
}

impl QueryClient {
    pub(crate) fn new(connection: Arc<Connection>, pools: Arc<PoolSet>, mode: ClientMode) -> Self {
        let lease = connection.lease();
        Self {
            connection,
            pools,
            mode,
            transaction: None,
            _lease: lease,
        }
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    pub fn connection_name(&self) -> &str {
        self.connection.name()
    }

    /// The transaction this client is bound to, if any.
    pub fn bound_transaction(&self) -> Option<&TransactionClient> {
        self.transaction.as_ref()
    }

    /// Route every following statement through `trx`'s reserved connection.
    pub fn use_transaction(mut self, trx: &TransactionClient) -> Self {
        self.transaction = Some(trx.clone());
        self
    }

    pub fn raw(&self, sql: impl Into<String>) -> Statement<'_> {
        Statement {
            runner: Runner::Client(self),
            query: CompiledQuery::new(sql),
            timeout: None,
        }
    }

    pub fn query(&self, query: &(impl CompileQuery + ?Sized)) -> Statement<'_> {
        Statement {
            runner: Runner::Client(self),
            query: query.compile(),
            timeout: None,
        }
    }

    /// Open a transaction on a dedicated write connection.
    ///
    /// A client already bound to a transaction opens a savepoint inside it.
    pub async fn transaction(&self) -> DbResult<TransactionClient> {
        if self.mode == ClientMode::Read {
            return Err(DbError::read_only_client(
                self.connection.name(),
                "transaction",
            ));
        }
        match &self.transaction {
            Some(trx) => trx.transaction().await,
            None => {
                TransactionClient::begin(
                    Arc::clone(&self.connection),
                    Arc::clone(&self.pools),
                    false,
                )
                .await
            }
        }
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on `Err`.
    pub async fn transaction_with<F, Fut, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(TransactionClient) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let trx = self.transaction().await?;
        transaction::managed(trx, f).await
    }

    /// Pool role a statement runs on when not bound to a transaction.
    pub fn resolve_role(&self, sql: &str) -> PoolRole {
        match self.mode {
            ClientMode::Write => PoolRole::Write,
            ClientMode::Read => PoolRole::Read,
            ClientMode::Dual => classify::classify(sql, self.pools.db_type()),
        }
    }

    async fn run(
        &self,
        query: &CompiledQuery,
        operation: Operation,
        timeout: Option<QueryTimeout>,
    ) -> DbResult<Output> {
        if let Some(trx) = &self.transaction {
            return trx.run(query, operation, timeout).await;
        }

        let role = self.resolve_role(&query.sql);
        let pool = self.pools.pool(role);
        let ctx = StatementContext {
            connection: self.connection.name(),
            role,
            transaction_id: None,
            events: self.connection.events(),
            debug: self.connection.config().debug,
            cancel_pool: pool,
        };
        executor::run(&ctx, Target::Pool(pool), query, operation, timeout).await
    }
}

enum Runner<'c> {
    Client(&'c QueryClient),
    Transaction(&'c TransactionClient),
}

/// A compiled statement waiting to be executed.
#[must_use = "statements do nothing until fetched or executed"]
pub struct Statement<'c> {
    runner: Runner<'c>,
    query: CompiledQuery,
    timeout: Option<QueryTimeout>,
}

impl<'c> Statement<'c> {
    pub(crate) fn for_transaction(trx: &'c TransactionClient, query: CompiledQuery) -> Self {
        Self {
            runner: Runner::Transaction(trx),
            query,
            timeout: None,
        }
    }

    /// Append a positional binding.
    pub fn bind(mut self, param: impl Into<QueryParam>) -> Self {
        self.query.bindings.push(param.into());
        self
    }

    /// Stop waiting after `duration`.
    ///
    /// With `options.cancel` the server is asked to cancel the statement on
    /// drivers that support it. Otherwise it keeps running server-side.
    pub fn timeout(mut self, duration: Duration, options: TimeoutOptions) -> Self {
        self.timeout = Some(QueryTimeout { duration, options });
        self
    }

    /// The SQL and bindings that would be sent.
    pub fn to_sql(&self) -> &CompiledQuery {
        &self.query
    }

    async fn run(&self, operation: Operation) -> DbResult<Output> {
        match self.runner {
            Runner::Client(client) => client.run(&self.query, operation, self.timeout).await,
            Runner::Transaction(trx) => trx.run(&self.query, operation, self.timeout).await,
        }
    }

    pub async fn fetch_all(self) -> DbResult<Vec<JsonRow>> {
        match self.run(Operation::Fetch).await? {
            Output::Rows(rows) => Ok(rows),
            Output::RowsAffected(_) => Err(DbError::internal("fetch returned no row set")),
        }
    }

    pub async fn fetch_optional(self) -> DbResult<Option<JsonRow>> {
        Ok(self.fetch_all().await?.into_iter().next())
    }

    pub async fn fetch_one(self) -> DbResult<JsonRow> {
        self.fetch_optional()
            .await?
            .ok_or_else(|| DbError::from(sqlx::Error::RowNotFound))
    }

    /// Run the statement and return the number of affected rows.
    pub async fn execute(self) -> DbResult<u64> {
        match self.run(Operation::Execute).await? {
            Output::RowsAffected(n) => Ok(n),
            Output::Rows(_) => Err(DbError::internal("execute returned a row set")),
        }
    }
}
