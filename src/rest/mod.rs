//! REST transport.
//!
//! - reqwest session with default headers, user agent, timeout and cookie store
//! - Response body parsing with envelope detection
//! - Pagination metadata and totals

pub mod response;
pub mod transport;

pub use response::{ParsedBody, parse_body};
pub use transport::{RestSession, RestTransport};

use crate::error::DataResult;
use crate::models::RestConfig;
use crate::provider::{AsyncProvider, SyncProvider};
use crate::transport::Blocking;

/// Blocking REST provider.
pub type RestProvider = SyncProvider<Blocking<RestTransport>>;

/// Non-blocking REST provider.
pub type AsyncRestProvider = AsyncProvider<RestTransport>;

impl RestProvider {
    pub fn from_config(config: RestConfig) -> DataResult<Self> {
        Ok(SyncProvider::new(Blocking::new(RestTransport::new(config))?))
    }
}

impl AsyncRestProvider {
    pub fn from_config(config: RestConfig) -> Self {
        AsyncProvider::new(RestTransport::new(config))
    }
}
