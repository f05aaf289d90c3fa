//! Error types for the connection manager.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Structural errors (duplicate/unknown names, closed transactions) are never retried;
//! connectivity and timeout errors are reported as retryable so callers can decide.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection '{name}' is already registered")]
    DuplicateConnection { name: String },

    #[error("Connection '{name}' is not registered")]
    UnknownConnection { name: String },

    #[error("Invalid configuration for '{name}': {message}")]
    InvalidConfig { name: String, message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction '{transaction_id}' is already {state}")]
    TransactionClosed {
        transaction_id: String,
        state: String,
    },

    #[error("Transaction '{transaction_id}' already has an open nested level '{savepoint}'")]
    NestedTransactionActive {
        transaction_id: String,
        savepoint: String,
    },

    #[error("A global transaction is already active on connection '{name}'")]
    GlobalTransactionActive { name: String },

    #[error("No global transaction is active on connection '{name}'")]
    NoGlobalTransaction { name: String },

    #[error("Client for '{name}' was created in read mode: {operation} requires a write client")]
    ReadOnlyClient { name: String, operation: String },

    #[error("Query timed out after {elapsed_ms}ms (cancelled: {cancelled})")]
    QueryTimeout { elapsed_ms: u64, cancelled: bool },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Failed to close {} connection(s): {}", failures.len(), format_failures(failures))]
    Teardown { failures: Vec<(String, String)> },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, message)| format!("{name}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DbError {
    /// Create a duplicate connection error.
    pub fn duplicate_connection(name: impl Into<String>) -> Self {
        Self::DuplicateConnection { name: name.into() }
    }

    /// Create an unknown connection error.
    pub fn unknown_connection(name: impl Into<String>) -> Self {
        Self::UnknownConnection { name: name.into() }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create an error for a transaction used after it completed.
    pub fn transaction_closed(transaction_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self::TransactionClosed {
            transaction_id: transaction_id.into(),
            state: state.into(),
        }
    }

    pub fn nested_transaction_active(
        transaction_id: impl Into<String>,
        savepoint: impl Into<String>,
    ) -> Self {
        Self::NestedTransactionActive {
            transaction_id: transaction_id.into(),
            savepoint: savepoint.into(),
        }
    }

    pub fn global_transaction_active(name: impl Into<String>) -> Self {
        Self::GlobalTransactionActive { name: name.into() }
    }

    pub fn no_global_transaction(name: impl Into<String>) -> Self {
        Self::NoGlobalTransaction { name: name.into() }
    }

    pub fn read_only_client(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::ReadOnlyClient {
            name: name.into(),
            operation: operation.into(),
        }
    }

    /// Create a statement watchdog timeout error.
    pub fn query_timeout(elapsed_ms: u64, cancelled: bool) -> Self {
        Self::QueryTimeout {
            elapsed_ms,
            cancelled,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an aggregated teardown error.
    pub fn teardown(failures: Vec<(String, String)>) -> Self {
        Self::Teardown { failures }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::TransactionClosed { .. } => {
                Some("Start a new transaction instead of reusing a completed one")
            }
            Self::NestedTransactionActive { .. } => {
                Some("Commit or rollback the open nested transaction before starting another")
            }
            Self::GlobalTransactionActive { .. } => {
                Some("Commit or rollback the active global transaction first")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::QueryTimeout { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection parameters and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
