//! Single database connections.
//!
//! Uses the database-specific sqlx connection types rather than `Any` so
//! every column type decodes with full fidelity.

use crate::error::{DataResult, DataRetrievalError};
use crate::models::{DatabaseConfig, DatabaseType};
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, MySqlConnection, PgConnection, SqliteConnection};
use std::str::FromStr;
use tokio::time::timeout;
use tracing::debug;

/// An open connection to one of the supported databases.
#[derive(Debug)]
pub enum SqlConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl SqlConnection {
    /// Open a connection, bounded by `config.connect_timeout`.
    pub async fn open(config: &DatabaseConfig) -> DataResult<Self> {
        debug!(target = %config.masked_url(), "Opening database connection");
        let limit = config.connect_timeout;
        match timeout(limit, Self::connect(config)).await {
            Ok(result) => result,
            Err(_) => Err(DataRetrievalError::timeout("database connect", limit)),
        }
    }

    async fn connect(config: &DatabaseConfig) -> DataResult<Self> {
        let connection = match config.database_type {
            DatabaseType::MySQL => {
                let options = mysql_options(config)?;
                Self::MySql(MySqlConnection::connect_with(&options).await.map_err(connect_error)?)
            }
            DatabaseType::PostgreSQL => {
                let options = postgres_options(config)?;
                Self::Postgres(PgConnection::connect_with(&options).await.map_err(connect_error)?)
            }
            DatabaseType::SQLite => {
                let options = sqlite_options(config)?;
                Self::SQLite(
                    SqliteConnection::connect_with(&options)
                        .await
                        .map_err(connect_error)?,
                )
            }
        };
        Ok(connection)
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            Self::MySql(_) => DatabaseType::MySQL,
            Self::Postgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Close gracefully, flushing any pending protocol traffic.
    pub async fn close(self) -> DataResult<()> {
        match self {
            Self::MySql(c) => c.close().await?,
            Self::Postgres(c) => c.close().await?,
            Self::SQLite(c) => c.close().await?,
        }
        Ok(())
    }
}

fn connect_error(e: sqlx::Error) -> DataRetrievalError {
    let message = format!("Failed to connect: {e}");
    DataRetrievalError::connection_with(message, e)
}

fn invalid_option(what: &str, value: &str) -> DataRetrievalError {
    DataRetrievalError::connection(format!("Invalid {what}: {value}"))
}

fn mysql_options(config: &DatabaseConfig) -> DataResult<MySqlConnectOptions> {
    let mut options = MySqlConnectOptions::new()
        .host(config.host.as_deref().unwrap_or("localhost"))
        .charset("utf8mb4");
    if let Some(port) = config.port {
        options = options.port(port);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    if let Some(username) = &config.username {
        options = options.username(username);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(mode) = &config.ssl_mode {
        let mode =
            MySqlSslMode::from_str(mode).map_err(|_| invalid_option("MySQL ssl mode", mode))?;
        options = options.ssl_mode(mode);
    }
    Ok(options)
}

fn postgres_options(config: &DatabaseConfig) -> DataResult<PgConnectOptions> {
    let mut options = PgConnectOptions::new().host(config.host.as_deref().unwrap_or("localhost"));
    if let Some(port) = config.port {
        options = options.port(port);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    if let Some(username) = &config.username {
        options = options.username(username);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(mode) = &config.ssl_mode {
        let mode =
            PgSslMode::from_str(mode).map_err(|_| invalid_option("PostgreSQL sslmode", mode))?;
        options = options.ssl_mode(mode);
    }
    Ok(options)
}

fn sqlite_options(config: &DatabaseConfig) -> DataResult<SqliteConnectOptions> {
    match &config.database {
        None => SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DataRetrievalError::connection_with("Invalid SQLite options", e)),
        Some(path) => Ok(SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(config.create_if_missing)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_open_sqlite_memory() {
        let conn = SqlConnection::open(&DatabaseConfig::sqlite_memory())
            .await
            .unwrap();
        assert_eq!(conn.database_type(), DatabaseType::SQLite);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_sqlite_file_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let mut config = DatabaseConfig::sqlite(path.to_string_lossy());
        config.create_if_missing = false;

        let err = SqlConnection::open(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = DatabaseConfig::new(DatabaseType::PostgreSQL);
        config.ssl_mode = Some("sometimes".into());
        let err = postgres_options(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().contains("sometimes"));
    }
}
