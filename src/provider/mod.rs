//! Providers: the uniform fetch/execute surface over any transport.
//!
//! A provider owns exactly one transport handle (when connected), one hook
//! pipeline and its retry policies. [`SyncProvider`] blocks the calling
//! thread; [`AsyncProvider`] suspends at every I/O boundary.

pub mod async_provider;
pub mod state;
pub mod sync_provider;

pub use async_provider::{AsyncConnectionGuard, AsyncProvider, AsyncTransaction};
pub use state::ConnectionState;
pub use sync_provider::{ConnectionGuard, SyncProvider, Transaction};

use crate::models::Metadata;
use serde_json::json;
use std::time::Instant;

/// Which transport capability a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Fetch,
    Execute,
}

impl Operation {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Execute => "execute",
        }
    }
}

pub(crate) fn new_provider_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Metadata every provider adds on top of what the transport reported.
pub(crate) fn completion_metadata(
    provider_id: &str,
    transport: &str,
    started: Instant,
    retries: u32,
) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("provider".into(), json!(provider_id));
    metadata.insert("transport".into(), json!(transport));
    metadata.insert(
        "latency_ms".into(),
        json!(started.elapsed().as_millis() as u64),
    );
    metadata.insert("retries".into(), json!(retries));
    metadata
}
