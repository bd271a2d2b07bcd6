//! Capabilities a provider needs from the thing doing the actual I/O.
//!
//! A transport opens and closes a handle, runs requests on it and answers a
//! cheap liveness probe. Database-like transports also expose
//! begin/commit/rollback. Blocking providers use [`Transport`], async ones
//! [`AsyncTransport`]; [`Blocking`] turns the latter into the former.

mod blocking;

pub use blocking::Blocking;

use crate::error::DataResult;
use crate::models::RawResult;
use async_trait::async_trait;
use std::fmt::Debug;

/// Blocking transport.
pub trait Transport {
    type Handle;
    type Request: Clone + Debug + 'static;

    /// Short label used in logs and result metadata.
    fn name(&self) -> &'static str;

    fn open(&self) -> DataResult<Self::Handle>;

    fn close(&self, handle: Self::Handle) -> DataResult<()>;

    /// Run a read request.
    fn run(&self, handle: &Self::Handle, request: &Self::Request) -> DataResult<RawResult>;

    /// Run a mutating request. Defaults to [`Transport::run`].
    fn execute(&self, handle: &Self::Handle, request: &Self::Request) -> DataResult<RawResult> {
        self.run(handle, request)
    }

    /// Cheap liveness check; must not change any state.
    fn probe(&self, handle: &Self::Handle) -> bool;
}

/// Blocking transport with transactions.
pub trait Transactional: Transport {
    fn begin(&self, handle: &Self::Handle) -> DataResult<()>;
    fn commit(&self, handle: &Self::Handle) -> DataResult<()>;
    fn rollback(&self, handle: &Self::Handle) -> DataResult<()>;
}

/// Non-blocking transport.
///
/// Requests take the handle by shared reference so several can be in flight
/// on one handle; transports that need exclusive access serialize internally.
#[async_trait]
pub trait AsyncTransport: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;
    type Request: Clone + Debug + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    async fn open(&self) -> DataResult<Self::Handle>;

    async fn close(&self, handle: Self::Handle) -> DataResult<()>;

    async fn run(&self, handle: &Self::Handle, request: &Self::Request) -> DataResult<RawResult>;

    async fn execute(
        &self,
        handle: &Self::Handle,
        request: &Self::Request,
    ) -> DataResult<RawResult> {
        self.run(handle, request).await
    }

    async fn probe(&self, handle: &Self::Handle) -> bool;
}

#[async_trait]
pub trait AsyncTransactional: AsyncTransport {
    async fn begin(&self, handle: &Self::Handle) -> DataResult<()>;
    async fn commit(&self, handle: &Self::Handle) -> DataResult<()>;
    async fn rollback(&self, handle: &Self::Handle) -> DataResult<()>;
}
