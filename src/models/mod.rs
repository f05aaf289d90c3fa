//! Data models for the connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod health;
pub mod query;

// Re-export commonly used types
pub use connection::{
    ClientMode, ConnectionState, ConnectionSummary, DatabaseType, TransactionInfo,
    TransactionState,
};
pub use health::{ConnectionReport, Health, HealthReport, PoolRole, PoolStats};
pub use query::{
    CompileQuery, CompiledQuery, JsonRow, QueryParam, QueryTimeout, TimeoutOptions,
};
