//! Data Retrieval Library
//!
//! A uniform fetch/execute surface over heterogeneous data sources (SQL
//! databases and REST endpoints) with a connection lifecycle state machine,
//! validation/transformation hooks and retry with backoff.
//!
//! ```ignore
//! use data_retrieval::db::SqlProvider;
//! use data_retrieval::models::{DatabaseConfig, SqlRequest};
//!
//! let mut provider = SqlProvider::from_config(DatabaseConfig::sqlite("app.db"))?;
//! let users = provider.with_connection(|p| p.fetch(&SqlRequest::new("SELECT * FROM users")))?;
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod models;
pub mod provider;
pub mod rest;
pub mod retry;
pub mod transport;

pub use config::Config;
pub use error::{DataResult, DataRetrievalError, ErrorKind};
pub use hooks::{Transformer, Validator};
pub use models::{ProviderStatus, QueryResult};
pub use provider::{AsyncProvider, SyncProvider};
pub use retry::RetryPolicy;
