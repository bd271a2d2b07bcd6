//! Database transport.
//!
//! - Single connections per provider (PostgreSQL, MySQL, SQLite)
//! - Row decoding to JSON objects
//! - Positional parameter binding
//! - Read-only SQL guard

pub mod connection;
pub mod decode;
mod params;
pub mod sql_validator;
pub mod transport;

pub use connection::SqlConnection;
pub use sql_validator::ReadOnlySql;
pub use transport::{SqlHandle, SqlTransport};

use crate::error::DataResult;
use crate::models::DatabaseConfig;
use crate::provider::{AsyncProvider, SyncProvider};
use crate::transport::Blocking;

/// Blocking database provider.
pub type SqlProvider = SyncProvider<Blocking<SqlTransport>>;

/// Non-blocking database provider.
pub type AsyncSqlProvider = AsyncProvider<SqlTransport>;

impl SqlProvider {
    pub fn from_config(config: DatabaseConfig) -> DataResult<Self> {
        Ok(SyncProvider::new(Blocking::new(SqlTransport::new(config))?))
    }
}

impl AsyncSqlProvider {
    pub fn from_config(config: DatabaseConfig) -> Self {
        AsyncProvider::new(SqlTransport::new(config))
    }
}
