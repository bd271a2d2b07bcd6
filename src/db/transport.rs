//! Database transport.

use super::connection::SqlConnection;
use super::decode::RowToJson;
use super::params::{bind_mysql, bind_postgres, bind_sqlite};
use crate::error::{DataResult, DataRetrievalError};
use crate::models::{DatabaseConfig, DatabaseType, RawResult, SqlRequest};
use crate::transport::{AsyncTransactional, AsyncTransport};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{Value as JsonValue, json};
use sqlx::Executor;
use std::future::Future;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

const CONNECTIVITY_PROBE: &str = "SELECT 1";

/// Transport over a single sqlx connection.
#[derive(Debug, Clone)]
pub struct SqlTransport {
    config: DatabaseConfig,
}

/// The connection held by a connected database provider.
///
/// Requests issued concurrently on one handle are serialized.
#[derive(Debug)]
pub struct SqlHandle {
    database_type: DatabaseType,
    conn: Mutex<SqlConnection>,
}

impl SqlHandle {
    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }
}

impl SqlTransport {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        future: impl Future<Output = DataResult<T>>,
    ) -> DataResult<T> {
        let limit = self.config.query_timeout;
        match timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(DataRetrievalError::timeout(operation, limit)),
        }
    }

    async fn raw_statement(&self, handle: &SqlHandle, sql: &str) -> DataResult<()> {
        let mut conn = handle.conn.lock().await;
        self.bounded(sql, execute_raw(&mut conn, sql)).await
    }
}

#[async_trait]
impl AsyncTransport for SqlTransport {
    type Handle = SqlHandle;
    type Request = SqlRequest;

    fn name(&self) -> &'static str {
        "database"
    }

    async fn open(&self) -> DataResult<SqlHandle> {
        let mut conn = SqlConnection::open(&self.config).await?;
        // Connectivity test; a failure here is a connection failure.
        let tested = self
            .bounded("connectivity test", fetch_rows(&mut conn, &probe_request()))
            .await;
        if let Err(e) = tested {
            if let Err(close_err) = conn.close().await {
                debug!(error = %close_err, "Close after failed connectivity test");
            }
            return Err(e.into_connection_error());
        }
        debug!(
            database_type = %self.config.database_type,
            target = %self.config.masked_url(),
            "Database connection ready"
        );
        Ok(SqlHandle {
            database_type: conn.database_type(),
            conn: Mutex::new(conn),
        })
    }

    async fn close(&self, handle: SqlHandle) -> DataResult<()> {
        handle.conn.into_inner().close().await
    }

    async fn run(&self, handle: &SqlHandle, request: &SqlRequest) -> DataResult<RawResult> {
        let database_type = handle.database_type;
        let mut conn = handle.conn.lock().await;
        let records = self
            .bounded("query execution", fetch_rows(&mut conn, request))
            .await?;
        let row_count = records.len();
        Ok(RawResult::new(records)
            .with_metadata("query", request.sql.clone())
            .with_metadata("fetch_type", request.fetch.as_str())
            .with_metadata("database_type", database_type.to_string())
            .with_metadata("row_count", row_count))
    }

    async fn execute(&self, handle: &SqlHandle, request: &SqlRequest) -> DataResult<RawResult> {
        let database_type = handle.database_type;
        let mut conn = handle.conn.lock().await;
        let outcome = self
            .bounded("write operation", execute_write(&mut conn, request))
            .await?;
        let summary = json!({
            "rows_affected": outcome.rows_affected,
            "last_insert_id": outcome.last_insert_id,
        });
        Ok(RawResult::new(vec![summary])
            .with_metadata("query", request.sql.clone())
            .with_metadata("database_type", database_type.to_string())
            .with_metadata("rows_affected", outcome.rows_affected)
            .with_metadata("last_insert_id", json!(outcome.last_insert_id)))
    }

    async fn probe(&self, handle: &SqlHandle) -> bool {
        let mut conn = handle.conn.lock().await;
        self.bounded("health check", fetch_rows(&mut conn, &probe_request()))
            .await
            .is_ok()
    }
}

#[async_trait]
impl AsyncTransactional for SqlTransport {
    async fn begin(&self, handle: &SqlHandle) -> DataResult<()> {
        let sql = match handle.database_type {
            DatabaseType::MySQL => "START TRANSACTION",
            _ => "BEGIN",
        };
        self.raw_statement(handle, sql).await
    }

    async fn commit(&self, handle: &SqlHandle) -> DataResult<()> {
        self.raw_statement(handle, "COMMIT").await
    }

    async fn rollback(&self, handle: &SqlHandle) -> DataResult<()> {
        self.raw_statement(handle, "ROLLBACK").await
    }
}

fn probe_request() -> SqlRequest {
    SqlRequest::new(CONNECTIVITY_PROBE).fetch_one()
}

// =============================================================================
// Statement execution
// =============================================================================
//
// Statements without parameters go through the raw executor: some SQL
// (procedures, multi-statement scripts) cannot be prepared.

struct WriteOutcome {
    rows_affected: u64,
    last_insert_id: Option<u64>,
}

async fn fetch_rows(conn: &mut SqlConnection, request: &SqlRequest) -> DataResult<Vec<JsonValue>> {
    let limit = request.fetch.row_limit().unwrap_or(usize::MAX);
    let sql = request.sql.as_str();
    let params = request.params.as_slice();

    let records = match conn {
        SqlConnection::MySql(c) => {
            let rows: Vec<_> = if params.is_empty() {
                (&mut *c).fetch(sql).take(limit).try_collect().await?
            } else {
                bind_mysql(sqlx::query(sql), params)
                    .fetch(&mut *c)
                    .take(limit)
                    .try_collect()
                    .await?
            };
            rows.iter().map(RowToJson::to_json).collect()
        }
        SqlConnection::Postgres(c) => {
            let rows: Vec<_> = if params.is_empty() {
                (&mut *c).fetch(sql).take(limit).try_collect().await?
            } else {
                bind_postgres(sqlx::query(sql), params)
                    .fetch(&mut *c)
                    .take(limit)
                    .try_collect()
                    .await?
            };
            rows.iter().map(RowToJson::to_json).collect()
        }
        SqlConnection::SQLite(c) => {
            let rows: Vec<_> = if params.is_empty() {
                (&mut *c).fetch(sql).take(limit).try_collect().await?
            } else {
                bind_sqlite(sqlx::query(sql), params)
                    .fetch(&mut *c)
                    .take(limit)
                    .try_collect()
                    .await?
            };
            rows.iter().map(RowToJson::to_json).collect()
        }
    };
    Ok(records)
}

async fn execute_write(conn: &mut SqlConnection, request: &SqlRequest) -> DataResult<WriteOutcome> {
    let sql = request.sql.as_str();
    let params = request.params.as_slice();

    let outcome = match conn {
        SqlConnection::MySql(c) => {
            let done = if params.is_empty() {
                (&mut *c).execute(sql).await?
            } else {
                bind_mysql(sqlx::query(sql), params).execute(&mut *c).await?
            };
            WriteOutcome {
                rows_affected: done.rows_affected(),
                last_insert_id: Some(done.last_insert_id()).filter(|id| *id != 0),
            }
        }
        SqlConnection::Postgres(c) => {
            let done = if params.is_empty() {
                (&mut *c).execute(sql).await?
            } else {
                bind_postgres(sqlx::query(sql), params).execute(&mut *c).await?
            };
            WriteOutcome {
                rows_affected: done.rows_affected(),
                last_insert_id: None,
            }
        }
        SqlConnection::SQLite(c) => {
            let done = if params.is_empty() {
                (&mut *c).execute(sql).await?
            } else {
                bind_sqlite(sqlx::query(sql), params).execute(&mut *c).await?
            };
            WriteOutcome {
                rows_affected: done.rows_affected(),
                last_insert_id: u64::try_from(done.last_insert_rowid())
                    .ok()
                    .filter(|id| *id != 0),
            }
        }
    };
    Ok(outcome)
}

async fn execute_raw(conn: &mut SqlConnection, sql: &str) -> DataResult<()> {
    match conn {
        SqlConnection::MySql(c) => {
            (&mut *c).execute(sql).await?;
        }
        SqlConnection::Postgres(c) => {
            (&mut *c).execute(sql).await?;
        }
        SqlConnection::SQLite(c) => {
            (&mut *c).execute(sql).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn memory() -> (SqlTransport, SqlHandle) {
        let transport = SqlTransport::new(DatabaseConfig::sqlite_memory());
        let handle = transport.open().await.unwrap();
        transport
            .execute(
                &handle,
                &SqlRequest::new("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"),
            )
            .await
            .unwrap();
        (transport, handle)
    }

    #[tokio::test]
    async fn test_fetch_modes() {
        let (transport, handle) = memory().await;
        for name in ["ada", "grace", "linus"] {
            transport
                .execute(
                    &handle,
                    &SqlRequest::new("INSERT INTO users (name) VALUES (?)").bind(name),
                )
                .await
                .unwrap();
        }

        let all = transport
            .run(&handle, &SqlRequest::new("SELECT * FROM users ORDER BY id"))
            .await
            .unwrap();
        assert_eq!(all.records.len(), 3);
        assert_eq!(all.metadata["fetch_type"], "all");
        assert_eq!(all.metadata["row_count"], 3);
        assert_eq!(all.metadata["database_type"], "SQLite");

        let one = transport
            .run(
                &handle,
                &SqlRequest::new("SELECT name FROM users ORDER BY id").fetch_one(),
            )
            .await
            .unwrap();
        assert_eq!(one.records, vec![json!({"name": "ada"})]);

        let two = transport
            .run(
                &handle,
                &SqlRequest::new("SELECT name FROM users ORDER BY id").fetch_many(2),
            )
            .await
            .unwrap();
        assert_eq!(two.records.len(), 2);
        assert_eq!(two.metadata["fetch_type"], "many");
    }

    #[tokio::test]
    async fn test_execute_reports_rows_affected() {
        let (transport, handle) = memory().await;
        let raw = transport
            .execute(
                &handle,
                &SqlRequest::new("INSERT INTO users (name) VALUES (?), (?)")
                    .bind("a")
                    .bind("b"),
            )
            .await
            .unwrap();
        assert_eq!(raw.records[0]["rows_affected"], 2);
        assert_eq!(raw.records[0]["last_insert_id"], 2);
    }

    #[tokio::test]
    async fn test_bad_sql_is_query_error() {
        let (transport, handle) = memory().await;
        let err = transport
            .run(&handle, &SqlRequest::new("SELECT * FROM missing_table"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (transport, handle) = memory().await;
        transport.begin(&handle).await.unwrap();
        transport
            .execute(&handle, &SqlRequest::new("INSERT INTO users (name) VALUES ('tmp')"))
            .await
            .unwrap();
        transport.rollback(&handle).await.unwrap();

        let raw = transport
            .run(&handle, &SqlRequest::new("SELECT COUNT(*) AS n FROM users"))
            .await
            .unwrap();
        assert_eq!(raw.records[0]["n"], 0);
        assert!(transport.probe(&handle).await);
        transport.close(handle).await.unwrap();
    }
}
