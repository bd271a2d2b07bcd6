//! Read-only guard for SQL requests.
//!
//! Parses the statement with [sqlparser](https://docs.rs/sqlparser/) in the
//! dialect of the target database, so formatting tricks and comments cannot
//! smuggle a write past the check.

use crate::hooks::Validator;
use crate::models::{DatabaseType, SqlRequest};
use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use tracing::debug;

/// Accepts only queries, SHOW statements and EXPLAIN of those.
#[derive(Debug, Clone, Copy)]
pub struct ReadOnlySql {
    database_type: DatabaseType,
}

impl ReadOnlySql {
    pub fn new(database_type: DatabaseType) -> Self {
        Self { database_type }
    }

    fn dialect(&self) -> Box<dyn Dialect> {
        match self.database_type {
            DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
            DatabaseType::MySQL => Box::new(MySqlDialect {}),
            DatabaseType::SQLite => Box::new(SQLiteDialect {}),
        }
    }

    /// `Err` names the first statement that is not read-only.
    pub fn check(&self, sql: &str) -> Result<(), String> {
        let statements = Parser::parse_sql(self.dialect().as_ref(), sql)
            .map_err(|e| format!("unparseable SQL: {e}"))?;
        if statements.is_empty() {
            return Err("empty SQL statement".into());
        }
        match statements.iter().find(|s| !is_read_only(s)) {
            Some(stmt) => Err(format!("not a read-only statement: {stmt}")),
            None => Ok(()),
        }
    }
}

impl Validator<SqlRequest> for ReadOnlySql {
    fn validate(&self, request: &SqlRequest) -> bool {
        match self.check(&request.sql) {
            Ok(()) => true,
            Err(reason) => {
                debug!(reason = %reason, "Read-only guard rejected request");
                false
            }
        }
    }

    fn name(&self) -> &str {
        "read_only_sql"
    }
}

fn is_read_only(stmt: &Statement) -> bool {
    match stmt {
        Statement::Query(_)
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ExplainTable { .. } => true,
        // EXPLAIN ANALYZE runs the statement, so the inner one must be read-only too
        Statement::Explain { statement, .. } => is_read_only(statement),
        _ => false,
    }
}
