//! A named connection and the lifecycle of its pools.
//!
//! # Concurrency
//!
//! - The pool slot is a `tokio::sync::Mutex`; `connect` and `disconnect` do their
//!   check-and-set while holding it, so two racing calls never build or destroy
//!   pools twice
//! - `ready` mirrors the slot for lock-free reads
//! - Leases count the query and transaction clients still using this connection;
//!   retired connections are disposed once the count reaches zero
//! - Open transactions are tracked in a `std::sync::Mutex` that is never held
//!   across an await point

use crate::config::{ConnectionConfig, LONG_RUNNING_TRANSACTION_SECS};
use crate::db::pool::PoolSet;
use crate::error::{DbError, DbResult};
use crate::events::{DbEvent, EventBus};
use crate::models::{ConnectionReport, DatabaseType, Health, TransactionInfo};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

struct OpenTransaction {
    started_at: DateTime<Utc>,
    started: Instant,
    global: bool,
}

pub struct Connection {
    name: String,
    config: ConnectionConfig,
    pools: Mutex<Option<Arc<PoolSet>>>,
    ready: AtomicBool,
    has_read_write_replicas: bool,
    leases: Arc<watch::Sender<usize>>,
    transactions: std::sync::Mutex<HashMap<String, OpenTransaction>>,
    events: EventBus,
    probe_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("db_type", &self.config.db_type())
            .field("ready", &self.is_ready())
            .field("has_read_write_replicas", &self.has_read_write_replicas)
            .field("active_leases", &self.active_leases())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Construct without connecting.
    pub fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        events: EventBus,
        probe_timeout: Duration,
    ) -> Self {
        let (leases, _) = watch::channel(0);
        Self {
            name: name.into(),
            has_read_write_replicas: config.has_read_write_replicas(),
            config,
            pools: Mutex::new(None),
            ready: AtomicBool::new(false),
            leases: Arc::new(leases),
            transactions: std::sync::Mutex::new(HashMap::new()),
            events,
            probe_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn db_type(&self) -> DatabaseType {
        self.config.db_type()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Fixed at construction from the config.
    pub fn has_read_write_replicas(&self) -> bool {
        self.has_read_write_replicas
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    /// Build the pools. A no-op when they already exist.
    pub async fn connect(&self) -> DbResult<()> {
        let mut slot = self.pools.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        match PoolSet::connect(&self.name, &self.config).await {
            Ok(pools) => {
                *slot = Some(Arc::new(pools));
                self.ready.store(true, Ordering::Release);
                info!(connection = %self.name, "Connected");
                self.events.emit(DbEvent::Connect {
                    connection: self.name.clone(),
                });
                Ok(())
            }
            Err(e) => {
                error!(connection = %self.name, error = %e, "Connection failed");
                self.events.emit(DbEvent::Error {
                    connection: self.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Drain and close the pools.
    ///
    /// Waits up to the pool acquire timeout for checked-out connections to come
    /// back. The connection is marked disconnected even when that wait fails.
    pub async fn disconnect(&self) -> DbResult<()> {
        let mut slot = self.pools.lock().await;
        let Some(pools) = slot.take() else {
            return Ok(());
        };
        self.ready.store(false, Ordering::Release);

        let drain_timeout = self.config.pool.acquire_timeout_or_default();
        let result = match tokio::time::timeout(drain_timeout, pools.close()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(DbError::timeout("pool drain", drain_timeout.as_secs())),
        };
        drop(slot);

        match &result {
            Ok(()) => {
                info!(connection = %self.name, "Disconnected");
                self.events.emit(DbEvent::Disconnect {
                    connection: self.name.clone(),
                });
            }
            Err(e) => {
                warn!(
                    connection = %self.name,
                    error = %e,
                    open_transactions = self.open_transaction_count(),
                    "Disconnect did not drain cleanly"
                );
                self.events.emit(DbEvent::DisconnectError {
                    connection: self.name.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    /// Pools of a connected connection.
    pub async fn pools(&self) -> DbResult<Arc<PoolSet>> {
        self.pools.lock().await.clone().ok_or_else(|| {
            DbError::connection(
                format!("Connection '{}' is not connected", self.name),
                "Call connect() before issuing queries",
            )
        })
    }

    /// Probe every pool with a trivial query under the probe timeout.
    pub async fn get_report(&self) -> ConnectionReport {
        let mut report = ConnectionReport {
            name: self.name.clone(),
            health: Health::default(),
            pools: Vec::new(),
            open_transactions: self.open_transactions(),
        };

        let pools = match self.pools().await {
            Ok(pools) => pools,
            Err(e) => {
                report.health = Health::unhealthy("Connection is not open", e.to_string());
                return report;
            }
        };

        let start = Instant::now();
        let probes = futures_util::future::join_all(pools.all().map(|(role, pool)| async move {
            let result = match tokio::time::timeout(self.probe_timeout, pool.ping()).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout("health probe", self.probe_timeout.as_secs())),
            };
            (role, result)
        }))
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let failures: Vec<String> = probes
            .into_iter()
            .filter_map(|(role, result)| result.err().map(|e| format!("{role:?} pool: {e}")))
            .collect();

        report.pools = pools.stats();
        report.health = if failures.is_empty() {
            Health::healthy(latency_ms)
        } else {
            Health::unhealthy("Health probe failed", failures.join("; "))
        };

        let mut warnings = Vec::new();
        let exhausted = report.pools.iter().filter(|s| s.is_exhausted()).count();
        if exhausted > 0 {
            warnings.push(format!("{exhausted} pool(s) exhausted"));
        }
        let long_running = report
            .open_transactions
            .iter()
            .filter(|t| t.duration_secs >= LONG_RUNNING_TRANSACTION_SECS)
            .count();
        if long_running > 0 {
            warnings.push(format!(
                "{long_running} transaction(s) open longer than {LONG_RUNNING_TRANSACTION_SECS}s"
            ));
        }
        if !warnings.is_empty() {
            let warnings = warnings.join(", ");
            report.health.message = Some(match report.health.message.take() {
                Some(message) => format!("{message}; {warnings}"),
                None => warnings,
            });
        }

        debug!(
            connection = %self.name,
            healthy = report.health.healthy,
            latency_ms,
            "Health probe finished"
        );
        report
    }

    /// Server version reported by the write pool.
    pub async fn server_version(&self) -> DbResult<Option<String>> {
        Ok(self.pools().await?.write().server_version().await)
    }

    /// Register a user of this connection. Dropping the lease releases it.
    pub fn lease(&self) -> ConnectionLease {
        self.leases.send_modify(|count| *count += 1);
        ConnectionLease {
            leases: Arc::clone(&self.leases),
        }
    }

    pub fn active_leases(&self) -> usize {
        *self.leases.borrow()
    }

    /// Resolve once no lease is outstanding.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.leases.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub(crate) fn track_transaction(&self, id: &str, global: bool) {
        if let Ok(mut txs) = self.transactions.lock() {
            txs.insert(
                id.to_string(),
                OpenTransaction {
                    started_at: Utc::now(),
                    started: Instant::now(),
                    global,
                },
            );
        }
    }

    pub(crate) fn untrack_transaction(&self, id: &str) {
        if let Ok(mut txs) = self.transactions.lock() {
            txs.remove(id);
        }
    }

    /// Transactions currently holding a physical connection, oldest first.
    pub fn open_transactions(&self) -> Vec<TransactionInfo> {
        let Ok(txs) = self.transactions.lock() else {
            return Vec::new();
        };
        let mut open: Vec<TransactionInfo> = txs
            .iter()
            .map(|(id, tx)| TransactionInfo {
                transaction_id: id.clone(),
                connection: self.name.clone(),
                started_at: tx.started_at,
                duration_secs: tx.started.elapsed().as_secs(),
                global: tx.global,
            })
            .collect();
        open.sort_by_key(|t| t.started_at);
        open
    }

    pub fn open_transaction_count(&self) -> usize {
        self.transactions.lock().map(|txs| txs.len()).unwrap_or(0)
    }
}

/// RAII marker that a client is still using a connection.
///
/// Retired connections (replaced by `patch`) are disconnected once every lease
/// taken before the swap has been dropped.
#[derive(Debug)]
pub struct ConnectionLease {
    leases: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.leases
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
