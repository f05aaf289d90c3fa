//! Database access layer.
//!
//! This module provides:
//! - Driver pools and the per-connection write/read pool set
//! - Named connections and the registry that owns them
//! - Query clients with read/write routing
//! - Transactions with savepoint nesting
//! - Row decoding and parameter binding per driver
//! - Database dispatch macros for reducing code duplication

pub mod classify;
pub mod connection;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod params;
pub mod pool;
pub mod query_client;
pub mod transaction;
pub mod types;

pub use classify::{classify, is_read_only};
pub use connection::{Connection, ConnectionLease};
pub use manager::{ConnectionEntry, ConnectionManager};
pub use pool::{DbConnection, DbPool, PoolSet};
pub use query_client::{QueryClient, Statement};
pub use transaction::{DbTransaction, TransactionClient};
