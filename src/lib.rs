//! Pooled multi-connection database manager.
//!
//! This library manages named database connections (SQLite, PostgreSQL, MySQL)
//! with connection pooling, read/write replica routing, nested transactions via
//! savepoints, and global transactions for test isolation.

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod events;
pub mod models;

pub use config::{ConnectionConfig, DatabaseConfig};
pub use database::Database;
pub use db::{ConnectionManager, QueryClient, Statement, TransactionClient};
pub use error::{DbError, DbResult};
pub use events::{DbEvent, EventBus, QueryEvent};
