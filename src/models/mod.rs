//! Data models shared by providers and transports.

pub mod connection;
pub mod request;
pub mod result;
pub mod status;

pub use connection::{DatabaseConfig, DatabaseType, RestConfig};
pub use request::{FetchMode, HttpMethod, QueryParam, RestRequest, SqlRequest};
pub use result::{Metadata, QueryResult, RawResult};
pub use status::ProviderStatus;
