//! Read/write classification of SQL statements.
//!
//! Decides which pool a `Dual`-mode query client sends a statement to. The rule
//! is deterministic and conservative, since reads may be served by a replica
//! that lags the primary:
//!
//! - **Read**: every statement in the text is a query whose body is a plain
//!   `SELECT`, `VALUES`, `TABLE` or a set operation / subquery of those, every
//!   CTE is itself a read, and there is no locking clause (`FOR UPDATE`,
//!   `FOR SHARE`, ...) and no `SELECT ... INTO`. `SHOW ...` statements and
//!   `EXPLAIN` of a read are reads too.
//! - **Write**: everything else, including DML, DDL, transaction control,
//!   procedure calls, `EXPLAIN ANALYZE` of a write, and SQL that fails to parse.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) with the dialect of the target
//! database.

use crate::models::{DatabaseType, PoolRole};
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

/// Get the appropriate SQL dialect for the given database type.
fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Pool a statement should run on when the client mode is `Dual`.
pub fn classify(sql: &str, db_type: DatabaseType) -> PoolRole {
    if is_read_only(sql, db_type) {
        PoolRole::Read
    } else {
        PoolRole::Write
    }
}

/// True when `sql` parses and every statement in it only reads.
pub fn is_read_only(sql: &str, db_type: DatabaseType) -> bool {
    let dialect = get_dialect(db_type);
    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) => !statements.is_empty() && statements.iter().all(is_read_statement),
        Err(_) => false,
    }
}

fn is_read_statement(stmt: &Statement) -> bool {
    match stmt {
        Statement::Query(query) => is_read_query(query),
        Statement::Explain { statement, .. } => is_read_statement(statement),
        Statement::ExplainTable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => true,
        _ => false,
    }
}

fn is_read_query(query: &Query) -> bool {
    if !query.locks.is_empty() {
        return false;
    }
    let ctes_read = query
        .with
        .as_ref()
        .is_none_or(|with| with.cte_tables.iter().all(|cte| is_read_query(&cte.query)));
    ctes_read && is_read_set_expr(&query.body)
}

fn is_read_set_expr(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => is_read_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            is_read_set_expr(left) && is_read_set_expr(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}
