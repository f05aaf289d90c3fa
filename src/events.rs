//! Lifecycle and query events.
//!
//! Observers (loggers, metrics collectors) subscribe to a bounded broadcast
//! channel. Emitting never blocks: with no subscribers events are dropped, and
//! a subscriber that falls behind by more than the channel capacity observes
//! `RecvError::Lagged` and skips ahead.

use crate::models::{PoolRole, QueryParam};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An event emitted by a connection, transaction or query client.
#[derive(Debug, Clone)]
pub enum DbEvent {
    /// Pools for the connection were built.
    Connect { connection: String },
    /// Building the pools failed.
    Error { connection: String, error: String },
    /// Pools were drained and closed.
    Disconnect { connection: String },
    /// Draining failed. The connection is still marked disconnected.
    DisconnectError { connection: String, error: String },
    /// The outermost level of a transaction committed.
    Commit {
        connection: String,
        transaction_id: String,
    },
    /// The outermost level of a transaction rolled back.
    Rollback {
        connection: String,
        transaction_id: String,
    },
    /// A statement finished executing (successfully or not).
    Query(QueryEvent),
}

impl DbEvent {
    /// Name of the connection the event belongs to.
    pub fn connection(&self) -> &str {
        match self {
            Self::Connect { connection }
            | Self::Error { connection, .. }
            | Self::Disconnect { connection }
            | Self::DisconnectError { connection, .. }
            | Self::Commit { connection, .. }
            | Self::Rollback { connection, .. } => connection,
            Self::Query(event) => &event.connection,
        }
    }
}

/// Details of an executed statement.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub connection: String,
    pub sql: String,
    pub bindings: Vec<QueryParam>,
    pub duration: Duration,
    /// Pool the statement ran on (transactions always use the write pool).
    pub role: PoolRole,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
}

/// Broadcast fan-out of [`DbEvent`]s. Cheap to clone; clones share the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DbEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DbEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DbEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
