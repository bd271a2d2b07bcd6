//! Non-blocking provider.
//!
//! Every call that touches the transport is a suspension point. Public
//! operations take `&mut self`, so one instance runs at most one operation
//! at a time; [`AsyncProvider::fetch_multiple`] and
//! [`AsyncProvider::fetch_stream`] are the sanctioned way to overlap
//! requests on a single connection.
//!
//! Release on cancellation: guards and transactions that are dropped while
//! still holding the connection hand it to a detached task that rolls back
//! (for transactions) and closes it, so an aborted task never leaks a handle.

use super::state::ConnectionState;
use super::{Operation, completion_metadata, new_provider_id};
use crate::error::{DataResult, DataRetrievalError};
use crate::hooks::{HookPipeline, Transformer, Validator};
use crate::models::{ProviderStatus, QueryResult};
use crate::retry::{RetryPolicy, with_retry_async};
use crate::transport::{AsyncTransactional, AsyncTransport};
use futures_util::future::{BoxFuture, join_all, try_join_all};
use futures_util::stream::{self, Stream, StreamExt};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Requests kept in flight by `fetch_stream` unless configured otherwise.
pub const DEFAULT_STREAM_CONCURRENCY: usize = 4;

pub struct AsyncProvider<T: AsyncTransport> {
    id: String,
    transport: Arc<T>,
    state: ConnectionState<T::Handle>,
    hooks: HookPipeline<T::Request>,
    retry_policy: RetryPolicy,
    execute_policy: RetryPolicy,
    operation_timeout: Option<Duration>,
    stream_concurrency: usize,
}

impl<T: AsyncTransport> AsyncProvider<T> {
    pub fn new(transport: T) -> Self {
        Self {
            id: new_provider_id(),
            transport: Arc::new(transport),
            state: ConnectionState::new(),
            hooks: HookPipeline::new(),
            retry_policy: RetryPolicy::default(),
            execute_policy: RetryPolicy::no_retry(),
            operation_timeout: None,
            stream_concurrency: DEFAULT_STREAM_CONCURRENCY,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_validator(mut self, validator: impl Validator<T::Request> + 'static) -> Self {
        self.hooks.set_validator(validator);
        self
    }

    pub fn with_transformer(mut self, transformer: impl Transformer + 'static) -> Self {
        self.hooks.set_transformer(transformer);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_execute_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.execute_policy = policy;
        self
    }

    /// Deadline applied to each individual attempt of connect, fetch, execute
    /// and health check.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_stream_concurrency(mut self, concurrency: usize) -> Self {
        self.stream_concurrency = concurrency.max(1);
        self
    }

    pub fn set_validator(&mut self, validator: impl Validator<T::Request> + 'static) {
        self.hooks.set_validator(validator);
    }

    pub fn set_transformer(&mut self, transformer: impl Transformer + 'static) {
        self.hooks.set_transformer(transformer);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ProviderStatus {
        self.state.status()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn has_connection(&self) -> bool {
        self.state.has_handle()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn connect(&mut self) -> DataResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        let stale = self.state.begin_connect();
        let mut pending = PendingConnect {
            state: &mut self.state,
            settled: false,
        };
        if let Some(stale) = stale {
            close_handle(&self.id, &*self.transport, stale).await;
        }

        info!(provider = %self.id, transport = self.transport.name(), "Connecting");
        let transport = &*self.transport;
        let limit = self.operation_timeout;
        let retried = with_retry_async(&self.retry_policy, "connect", || {
            bounded(limit, "connect", transport.open())
        })
        .await;
        let attempts = retried.attempts;
        match retried.result {
            Ok(handle) => {
                pending.connected(handle);
                info!(provider = %self.id, attempts, "Connected");
                Ok(())
            }
            Err(err) => {
                pending.failed();
                let err = err.into_connection_error();
                error!(provider = %self.id, attempts, error = %err, "Connect failed");
                Err(err)
            }
        }
    }

    /// Close the transport and return to `DISCONNECTED`. Idempotent; close
    /// errors are logged.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.state.release() {
            close_handle(&self.id, &*self.transport, handle).await;
            info!(provider = %self.id, "Disconnected");
        }
    }

    /// Scoped acquisition. Prefer [`AsyncConnectionGuard::release`] to end the
    /// scope; a guard that is merely dropped (including by cancellation)
    /// closes the connection on a detached task.
    pub async fn async_connection(&mut self) -> DataResult<AsyncConnectionGuard<'_, T>> {
        self.connect().await?;
        Ok(AsyncConnectionGuard {
            provider: self,
            released: false,
        })
    }

    /// Run `f` inside a scoped acquisition.
    ///
    /// ```ignore
    /// let rows = provider
    ///     .with_connection(move |p| Box::pin(async move { p.fetch(&request).await }))
    ///     .await?;
    /// ```
    pub async fn with_connection<R, F>(&mut self, f: F) -> DataResult<R>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, DataResult<R>>,
    {
        let mut guard = self.async_connection().await?;
        let result = f(&mut *guard).await;
        guard.release().await;
        result
    }

    /// Hand the held connection to a background task that closes it.
    fn detach_release(&mut self) {
        let Some(handle) = self.state.release() else {
            return;
        };
        let id = self.id.clone();
        let transport = Arc::clone(&self.transport);
        spawn_cleanup(&self.id, async move {
            close_handle(&id, &*transport, handle).await;
            debug!(provider = %id, "Released connection in background");
        });
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn fetch(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.perform(request, &self.retry_policy, Operation::Fetch)
            .await
    }

    /// Like [`fetch`](Self::fetch) but an empty result is a query error.
    pub async fn fetch_or_raise(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        let result = self.fetch(request).await?;
        if result.is_empty() {
            return Err(DataRetrievalError::query(format!(
                "no data returned for {request:?}"
            )));
        }
        Ok(result)
    }

    pub async fn execute(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.perform(request, &self.execute_policy, Operation::Execute)
            .await
    }

    /// Fetch every request concurrently. Results come back in request order;
    /// the first failure fails the whole call and abandons the rest.
    pub async fn fetch_multiple(
        &mut self,
        requests: &[T::Request],
    ) -> DataResult<Vec<QueryResult>> {
        let this = &*self;
        try_join_all(
            requests
                .iter()
                .map(|request| this.perform(request, &this.retry_policy, Operation::Fetch)),
        )
        .await
    }

    /// Fetch every request concurrently, keeping each outcome, in request order.
    pub async fn fetch_each(&mut self, requests: &[T::Request]) -> Vec<DataResult<QueryResult>> {
        let this = &*self;
        join_all(
            requests
                .iter()
                .map(|request| this.perform(request, &this.retry_policy, Operation::Fetch)),
        )
        .await
    }

    /// Yield results in request order while keeping up to the configured
    /// number of requests in flight.
    pub fn fetch_stream(
        &mut self,
        requests: Vec<T::Request>,
    ) -> impl Stream<Item = DataResult<QueryResult>> + '_ {
        let this = &*self;
        stream::iter(requests)
            .map(move |request| async move {
                this.perform(&request, &this.retry_policy, Operation::Fetch)
                    .await
            })
            .buffered(this.stream_concurrency)
    }

    /// Probe the transport. `false` when not connected or when the probe
    /// exceeds the operation timeout.
    pub async fn health_check(&self) -> bool {
        let Ok(handle) = self.state.handle("health check") else {
            return false;
        };
        let probe = async { Ok(self.transport.probe(handle).await) };
        bounded(self.operation_timeout, "health check", probe)
            .await
            .unwrap_or(false)
    }

    async fn perform(
        &self,
        request: &T::Request,
        policy: &RetryPolicy,
        operation: Operation,
    ) -> DataResult<QueryResult> {
        self.hooks.validate(request)?;
        let handle = self.state.handle(operation.as_str())?;

        let started = Instant::now();
        let transport = &*self.transport;
        let limit = self.operation_timeout;
        let retried = with_retry_async(policy, operation.as_str(), || {
            bounded(limit, operation.as_str(), async move {
                match operation {
                    Operation::Fetch => transport.run(handle, request).await,
                    Operation::Execute => transport.execute(handle, request).await,
                }
            })
        })
        .await;
        let retries = retried.retries();
        let raw = retried.result?;
        let raw = self.hooks.transform(raw)?;

        debug!(
            provider = %self.id,
            operation = operation.as_str(),
            records = raw.records.len(),
            retries,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Operation completed"
        );
        Ok(QueryResult::from_raw(
            raw,
            completion_metadata(&self.id, self.transport.name(), started, retries),
        ))
    }
}

impl<T: AsyncTransactional> AsyncProvider<T> {
    /// Like `detach_release`, rolling back the open transaction first.
    fn detach_rollback(&mut self) {
        let Some(handle) = self.state.release() else {
            return;
        };
        let id = self.id.clone();
        let transport = Arc::clone(&self.transport);
        spawn_cleanup(&self.id, async move {
            detached_rollback(&id, &*transport, &handle).await;
            close_handle(&id, &*transport, handle).await;
            debug!(provider = %id, "Rolled back and released connection in background");
        });
    }

    /// Begin a transaction on the held connection.
    ///
    /// Finish it with [`AsyncTransaction::commit`] or
    /// [`AsyncTransaction::rollback`]. Dropping it unfinished rolls back and
    /// releases the connection in the background.
    pub async fn transaction(&mut self) -> DataResult<AsyncTransaction<'_, T>> {
        let handle = self.state.handle("begin transaction")?;
        self.transport.begin(handle).await?;
        debug!(provider = %self.id, "Transaction started");
        Ok(AsyncTransaction {
            provider: self,
            finished: false,
        })
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn in_transaction<R, F>(&mut self, f: F) -> DataResult<R>
    where
        F: for<'a, 'p> FnOnce(&'a mut AsyncTransaction<'p, T>) -> BoxFuture<'a, DataResult<R>>,
    {
        let mut tx = self.transaction().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Execute every request in one transaction; all or nothing.
    pub async fn execute_batch(&mut self, requests: &[T::Request]) -> DataResult<Vec<QueryResult>> {
        let mut tx = self.transaction().await?;
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match tx.execute(request).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    tx.rollback().await;
                    return Err(err);
                }
            }
        }
        tx.commit().await?;
        Ok(results)
    }
}

impl<T: AsyncTransport> Drop for AsyncProvider<T> {
    fn drop(&mut self) {
        self.detach_release();
    }
}

impl<T: AsyncTransport> std::fmt::Debug for AsyncProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProvider")
            .field("id", &self.id)
            .field("transport", &self.transport.name())
            .field("status", &self.state.status())
            .finish_non_exhaustive()
    }
}

async fn bounded<R>(
    limit: Option<Duration>,
    operation: &str,
    future: impl Future<Output = DataResult<R>>,
) -> DataResult<R> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(DataRetrievalError::timeout(operation, limit)),
        },
        None => future.await,
    }
}

fn spawn_cleanup(id: &str, cleanup: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(cleanup);
        }
        Err(_) => {
            warn!(provider = %id, "No runtime available, dropping connection without close");
        }
    }
}

async fn close_handle<T: AsyncTransport>(id: &str, transport: &T, handle: T::Handle) {
    if let Err(e) = transport.close(handle).await {
        warn!(provider = %id, error = %e, "Error while closing connection");
    }
}

async fn detached_rollback<T: AsyncTransactional>(id: &str, transport: &T, handle: &T::Handle) {
    if let Err(e) = transport.rollback(handle).await {
        warn!(provider = %id, error = %e, "Rollback failed");
    }
}

/// Puts a connect whose future was dropped before settling back into
/// `DISCONNECTED`.
struct PendingConnect<'a, H> {
    state: &'a mut ConnectionState<H>,
    settled: bool,
}

impl<H> PendingConnect<'_, H> {
    fn connected(&mut self, handle: H) {
        self.settled = true;
        self.state.connected(handle);
    }

    fn failed(&mut self) {
        self.settled = true;
        self.state.failed();
    }
}

impl<H> Drop for PendingConnect<'_, H> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.release();
        }
    }
}

// =============================================================================
// Scoped acquisition
// =============================================================================

pub struct AsyncConnectionGuard<'p, T: AsyncTransport> {
    provider: &'p mut AsyncProvider<T>,
    released: bool,
}

impl<T: AsyncTransport> AsyncConnectionGuard<'_, T> {
    /// End the scope, closing the connection before returning.
    pub async fn release(mut self) {
        self.released = true;
        self.provider.disconnect().await;
    }
}

impl<T: AsyncTransport> std::fmt::Debug for AsyncConnectionGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnectionGuard")
            .field("provider", &*self.provider)
            .field("released", &self.released)
            .finish()
    }
}

impl<T: AsyncTransport> Deref for AsyncConnectionGuard<'_, T> {
    type Target = AsyncProvider<T>;

    fn deref(&self) -> &Self::Target {
        self.provider
    }
}

impl<T: AsyncTransport> DerefMut for AsyncConnectionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.provider
    }
}

impl<T: AsyncTransport> Drop for AsyncConnectionGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            self.provider.detach_release();
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

pub struct AsyncTransaction<'p, T: AsyncTransactional> {
    provider: &'p mut AsyncProvider<T>,
    finished: bool,
}

impl<T: AsyncTransactional> AsyncTransaction<'_, T> {
    /// Execute inside the transaction. Never retried.
    pub async fn execute(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.provider
            .perform(request, &RetryPolicy::no_retry(), Operation::Execute)
            .await
    }

    pub async fn fetch(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.provider
            .perform(request, &RetryPolicy::no_retry(), Operation::Fetch)
            .await
    }

    /// Commit once. A failed commit is followed by a rollback.
    ///
    /// The transaction only counts as finished once the transport answered;
    /// a commit cancelled mid-flight is rolled back by `Drop`.
    pub async fn commit(mut self) -> DataResult<()> {
        let provider = &*self.provider;
        let handle = provider.state.handle("commit")?;
        let outcome = match provider.transport.commit(handle).await {
            Ok(()) => {
                debug!(provider = %provider.id, "Transaction committed");
                Ok(())
            }
            Err(err) => {
                warn!(provider = %provider.id, error = %err, "Commit failed, rolling back");
                detached_rollback(&provider.id, &*provider.transport, handle).await;
                Err(err)
            }
        };
        self.finished = true;
        outcome
    }

    /// Roll back. Failures are logged, not returned.
    pub async fn rollback(mut self) {
        let provider = &*self.provider;
        if let Ok(handle) = provider.state.handle("rollback") {
            detached_rollback(&provider.id, &*provider.transport, handle).await;
            debug!(provider = %provider.id, "Transaction rolled back");
        }
        self.finished = true;
    }
}

impl<T: AsyncTransactional> Drop for AsyncTransaction<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                provider = %self.provider.id,
                "Transaction dropped unfinished, rolling back in background"
            );
            self.provider.detach_rollback();
        }
    }
}
