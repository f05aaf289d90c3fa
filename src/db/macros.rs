//! Database dispatch macros for reducing code duplication.
//!
//! Pools, checked-out connections and transactions are all three-variant enums
//! over the concrete sqlx drivers. These macros generate the match arms so each
//! call site reads as one expression per driver.

/// Dispatch over the variants of a [`DbPool`](crate::db::pool::DbPool).
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Dispatch over the variants of a [`DbTransaction`](crate::db::transaction::DbTransaction).
#[macro_export]
macro_rules! impl_tx_dispatch {
    ($tx:expr, { $($variant:ident($t:ident) => $body:expr),+ $(,)? }) => {
        match $tx {
            $(
                $crate::db::transaction::DbTransaction::$variant($t) => $body,
            )+
        }
    };
}

/// Apply the same expression to every variant of a [`DbPool`](crate::db::pool::DbPool).
///
/// Only usable when the body type-checks identically for each driver.
#[macro_export]
macro_rules! with_each_pool {
    ($pool:expr, $p:ident => $body:expr) => {
        $crate::impl_db_dispatch!($pool, {
            MySql($p) => $body,
            Postgres($p) => $body,
            SQLite($p) => $body,
        })
    };
}

pub use impl_db_dispatch;
pub use impl_tx_dispatch;
pub use with_each_pool;
