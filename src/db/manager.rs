//! Connection registry.
//!
//! Single source of truth for named connections. Structural operations (`add`,
//! `patch`, `close`) are serialized through one `RwLock`; no lock is held while a
//! pool connects, drains or probes.

use crate::config::{ConnectionConfig, DEFAULT_PROBE_TIMEOUT_SECS, validate_name};
use crate::db::connection::Connection;
use crate::error::{DbError, DbResult};
use crate::events::{DbEvent, EventBus};
use crate::models::{ConnectionReport, ConnectionState, ConnectionSummary, Health, HealthReport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Entry {
    config: ConnectionConfig,
    connection: Option<Arc<Connection>>,
    state: ConnectionState,
}

/// Snapshot of a registry entry.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub name: String,
    pub config: ConnectionConfig,
    pub connection: Option<Arc<Connection>>,
    pub state: ConnectionState,
}

/// A connection replaced by `patch`, drained in the background.
struct Retired {
    name: String,
    connection: Arc<Connection>,
    drain: JoinHandle<()>,
}

pub struct ConnectionManager {
    entries: RwLock<HashMap<String, Entry>>,
    retired: std::sync::Mutex<Vec<Retired>>,
    events: EventBus,
    probe_timeout: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

impl ConnectionManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retired: std::sync::Mutex::new(Vec::new()),
            events,
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }

    /// Upper bound for each health probe issued by `report`.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.events.subscribe()
    }

    fn check_config(name: &str, config: &ConnectionConfig) -> DbResult<()> {
        validate_name(name).map_err(|e| DbError::invalid_config(name, e.to_string()))?;
        config
            .validate()
            .map_err(|e| DbError::invalid_config(name, e.to_string()))
    }

    fn new_connection(&self, name: &str, config: &ConnectionConfig) -> Arc<Connection> {
        Arc::new(Connection::new(
            name,
            config.clone(),
            self.events.clone(),
            self.probe_timeout,
        ))
    }

    /// Register a connection without connecting it.
    ///
    /// A name may be reused once its previous entry is closed.
    pub async fn add(&self, name: impl Into<String>, config: ConnectionConfig) -> DbResult<()> {
        let name = name.into();
        Self::check_config(&name, &config)?;

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&name)
            && existing.state != ConnectionState::Closed
        {
            return Err(DbError::duplicate_connection(name));
        }

        info!(
            connection = %name,
            db_type = %config.db_type(),
            target = %config.driver.display_target(),
            "Connection registered"
        );
        entries.insert(
            name,
            Entry {
                config,
                connection: None,
                state: ConnectionState::Registered,
            },
        );
        Ok(())
    }

    /// Connect a registered entry. Idempotent while the entry is open.
    pub async fn connect(&self, name: &str) -> DbResult<()> {
        let connection = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| DbError::unknown_connection(name))?;

            if entry.state == ConnectionState::Closing {
                return Err(DbError::connection(
                    format!("Connection '{name}' is closing"),
                    "Retry once close completes",
                ));
            }
            let open = entry.state == ConnectionState::Open;

            match &entry.connection {
                Some(conn) if open && conn.is_ready() => return Ok(()),
                // Another caller is connecting; join it
                Some(conn) => Arc::clone(conn),
                None => {
                    let conn = self.new_connection(name, &entry.config);
                    entry.connection = Some(Arc::clone(&conn));
                    conn
                }
            }
        };

        let result = connection.connect().await;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name)
            && entry
                .connection
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &connection))
        {
            match &result {
                Ok(()) => entry.state = ConnectionState::Open,
                Err(_) => {
                    entry.connection = None;
                    if entry.state == ConnectionState::Open {
                        entry.state = ConnectionState::Registered;
                    }
                }
            }
        }
        result
    }

    /// Snapshot of an entry. `None` for unknown names.
    pub async fn get(&self, name: &str) -> Option<ConnectionEntry> {
        let entries = self.entries.read().await;
        entries.get(name).map(|entry| ConnectionEntry {
            name: name.to_string(),
            config: entry.config.clone(),
            connection: entry.connection.clone(),
            state: entry.state,
        })
    }

    pub async fn has(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.entries
            .read()
            .await
            .get(name)
            .is_some_and(|entry| entry.state == ConnectionState::Open)
    }

    /// Replace the config of an entry without interrupting in-flight work.
    ///
    /// The current pools are retired: clients and transactions that already hold
    /// them keep running, and the pools are closed once the last of them is
    /// dropped. The next `connect` or `acquire` builds pools from `config`.
    /// Patching an unknown name registers it.
    pub async fn patch(&self, name: impl Into<String>, config: ConnectionConfig) -> DbResult<()> {
        let name = name.into();
        Self::check_config(&name, &config)?;

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&name) else {
            drop(entries);
            return self.add(name, config).await;
        };

        entry.config = config;
        if let Some(old) = entry.connection.take() {
            self.retire(&name, old);
        }

        info!(connection = %name, state = %entry.state, "Connection config patched");
        Ok(())
    }

    fn retire(&self, name: &str, connection: Arc<Connection>) {
        debug!(
            connection = %name,
            active_leases = connection.active_leases(),
            "Retiring connection pools"
        );
        let draining = Arc::clone(&connection);
        let drain = tokio::spawn(async move {
            draining.wait_until_idle().await;
            if let Err(e) = draining.disconnect().await {
                warn!(connection = %draining.name(), error = %e, "Retired pools did not close cleanly");
            }
        });

        if let Ok(mut retired) = self.retired.lock() {
            retired.retain(|r| !r.drain.is_finished());
            retired.push(Retired {
                name: name.to_string(),
                connection,
                drain,
            });
        }
    }

    /// Number of retired connections whose pools are still being drained.
    pub fn draining_count(&self) -> usize {
        self.retired
            .lock()
            .map(|retired| retired.iter().filter(|r| !r.drain.is_finished()).count())
            .unwrap_or(0)
    }

    /// Close an entry's pools. With `release` the entry is also removed.
    ///
    /// The entry ends `Closed` (or removed) even when draining fails; the
    /// failure is still returned.
    pub async fn close(&self, name: &str, release: bool) -> DbResult<()> {
        let connection = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| DbError::unknown_connection(name))?;
            entry.state = ConnectionState::Closing;
            entry.connection.take()
        };

        let result = match &connection {
            Some(conn) => conn.disconnect().await,
            None => Ok(()),
        };

        let mut entries = self.entries.write().await;
        if release {
            entries.remove(name);
        } else if let Some(entry) = entries.get_mut(name) {
            entry.state = ConnectionState::Closed;
        }
        drop(entries);

        match &result {
            Ok(()) => info!(connection = %name, release, "Connection closed"),
            Err(e) => warn!(connection = %name, release, error = %e, "Connection closed with errors"),
        }
        result
    }

    /// Close every entry, attempting all of them even when some fail.
    ///
    /// Also drains pools retired by `patch`. Failures are aggregated into
    /// [`DbError::Teardown`].
    pub async fn close_all(&self, release: bool) -> DbResult<()> {
        let names = self.names().await;
        let closes = futures_util::future::join_all(names.iter().map(|name| async move {
            (name.clone(), self.close(name, release).await)
        }))
        .await;

        let retired = self
            .retired
            .lock()
            .map(|mut retired| std::mem::take(&mut *retired))
            .unwrap_or_default();
        let drains = futures_util::future::join_all(retired.into_iter().map(|r| async move {
            r.drain.abort();
            (format!("{} (retired)", r.name), r.connection.disconnect().await)
        }))
        .await;

        let failures: Vec<(String, String)> = closes
            .into_iter()
            .chain(drains)
            .filter_map(|(name, result)| result.err().map(|e| (name, e.to_string())))
            .collect();

        if failures.is_empty() {
            info!(connections = names.len(), release, "All connections closed");
            Ok(())
        } else {
            for (name, error) in &failures {
                warn!(connection = %name, error = %error, "Teardown failure");
            }
            Err(DbError::teardown(failures))
        }
    }

    pub async fn release(&self, name: &str) -> DbResult<()> {
        self.close(name, true).await
    }

    /// Probe every health-checked connection concurrently.
    ///
    /// Each probe is bounded by the probe timeout and isolated from the others.
    pub async fn report(&self) -> HealthReport {
        let targets: Vec<(String, ConnectionState, Option<Arc<Connection>>)> = {
            let entries = self.entries.read().await;
            let mut targets: Vec<_> = entries
                .iter()
                .filter(|(_, entry)| entry.config.health_check)
                .map(|(name, entry)| (name.clone(), entry.state, entry.connection.clone()))
                .collect();
            targets.sort_by(|a, b| a.0.cmp(&b.0));
            targets
        };

        let reports = futures_util::future::join_all(targets.into_iter().map(
            |(name, state, connection)| async move {
                match connection {
                    Some(conn) if state == ConnectionState::Open => conn.get_report().await,
                    _ => ConnectionReport {
                        name,
                        health: Health::unhealthy(
                            format!("Connection is {state}"),
                            "No open pool to probe",
                        ),
                        pools: Vec::new(),
                        open_transactions: Vec::new(),
                    },
                }
            },
        ))
        .await;

        HealthReport::from_reports(reports)
    }

    /// A connected connection for `name`, connecting lazily.
    pub async fn acquire(&self, name: &str) -> DbResult<Arc<Connection>> {
        if let Some(conn) = self.open_connection(name).await? {
            return Ok(conn);
        }
        self.connect(name).await?;
        self.open_connection(name).await?.ok_or_else(|| {
            DbError::connection(
                format!("Connection '{name}' changed while connecting"),
                "Retry the operation",
            )
        })
    }

    async fn open_connection(&self, name: &str) -> DbResult<Option<Arc<Connection>>> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| DbError::unknown_connection(name))?;
        Ok(match (&entry.connection, entry.state) {
            (Some(conn), ConnectionState::Open) if conn.is_ready() => Some(Arc::clone(conn)),
            _ => None,
        })
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Listing of every entry without credentials.
    pub async fn summaries(&self) -> Vec<ConnectionSummary> {
        let entries = self.entries.read().await;
        let mut summaries: Vec<ConnectionSummary> = entries
            .iter()
            .map(|(name, entry)| ConnectionSummary {
                name: name.clone(),
                db_type: entry.config.db_type(),
                state: entry.state,
                has_read_write_replicas: entry.config.has_read_write_replicas(),
                health_check: entry.config.health_check,
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}
