//! Blocking provider.

use super::state::ConnectionState;
use super::{Operation, completion_metadata, new_provider_id};
use crate::error::{DataResult, DataRetrievalError};
use crate::hooks::{HookPipeline, Transformer, Validator};
use crate::models::{ProviderStatus, QueryResult};
use crate::retry::{RetryPolicy, with_retry};
use crate::transport::{Transactional, Transport};
use std::ops::{Deref, DerefMut};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Uniform blocking access to one data source.
///
/// Creating a provider has no side effects; the transport is opened by
/// [`connect`](Self::connect) or for the lifetime of a
/// [`connection`](Self::connection) guard. Dropping the provider disconnects it.
pub struct SyncProvider<T: Transport> {
    id: String,
    transport: T,
    state: ConnectionState<T::Handle>,
    hooks: HookPipeline<T::Request>,
    retry_policy: RetryPolicy,
    execute_policy: RetryPolicy,
}

impl<T: Transport> SyncProvider<T> {
    pub fn new(transport: T) -> Self {
        Self {
            id: new_provider_id(),
            transport,
            state: ConnectionState::new(),
            hooks: HookPipeline::new(),
            retry_policy: RetryPolicy::default(),
            execute_policy: RetryPolicy::no_retry(),
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

    /// Policy for `connect` and `fetch`.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Policy for `execute`. Defaults to a single attempt.
    pub fn with_execute_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.execute_policy = policy;
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

    /// Whether a transport handle is currently held.
    pub fn has_connection(&self) -> bool {
        self.state.has_handle()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the transport. A no-op when already connected.
    ///
    /// On failure the provider is left in `ERROR` and the error is reported
    /// as a connection error.
    pub fn connect(&mut self) -> DataResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        if let Some(stale) = self.state.begin_connect() {
            self.close_handle(stale);
        }

        info!(provider = %self.id, transport = self.transport.name(), "Connecting");
        let transport = &self.transport;
        let retried = with_retry(&self.retry_policy, "connect", || transport.open());
        let attempts = retried.attempts;
        match retried.result {
            Ok(handle) => {
                self.state.connected(handle);
                info!(provider = %self.id, attempts, "Connected");
                Ok(())
            }
            Err(err) => {
                self.state.failed();
                let err = err.into_connection_error();
                error!(provider = %self.id, attempts, error = %err, "Connect failed");
                Err(err)
            }
        }
    }

    /// Close the transport and return to `DISCONNECTED`. Never fails; close
    /// errors are logged.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.state.release() {
            self.close_handle(handle);
            info!(provider = %self.id, "Disconnected");
        }
    }

    fn close_handle(&self, handle: T::Handle) {
        if let Err(e) = self.transport.close(handle) {
            warn!(provider = %self.id, error = %e, "Error while closing connection");
        }
    }

    /// Scoped acquisition: connects if needed and disconnects when the guard drops.
    pub fn connection(&mut self) -> DataResult<ConnectionGuard<'_, T>> {
        self.connect()?;
        Ok(ConnectionGuard { provider: self })
    }

    /// Run `f` inside a scoped acquisition.
    pub fn with_connection<R, F>(&mut self, f: F) -> DataResult<R>
    where
        F: FnOnce(&mut Self) -> DataResult<R>,
    {
        let mut guard = self.connection()?;
        f(&mut *guard)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn fetch(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.perform(request, &self.retry_policy, Operation::Fetch)
    }

    /// Like [`fetch`](Self::fetch) but an empty result is a query error.
    pub fn fetch_or_raise(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        let result = self.fetch(request)?;
        if result.is_empty() {
            return Err(DataRetrievalError::query(format!(
                "no data returned for {request:?}"
            )));
        }
        Ok(result)
    }

    /// Run a mutating request under the execute policy.
    pub fn execute(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.perform(request, &self.execute_policy, Operation::Execute)
    }

    /// Probe the transport. `false` when not connected.
    pub fn health_check(&self) -> bool {
        match self.state.handle("health check") {
            Ok(handle) => self.transport.probe(handle),
            Err(_) => false,
        }
    }

    fn perform(
        &self,
        request: &T::Request,
        policy: &RetryPolicy,
        operation: Operation,
    ) -> DataResult<QueryResult> {
        self.hooks.validate(request)?;
        let handle = self.state.handle(operation.as_str())?;

        let started = Instant::now();
        let retried = with_retry(policy, operation.as_str(), || match operation {
            Operation::Fetch => self.transport.run(handle, request),
            Operation::Execute => self.transport.execute(handle, request),
        });
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

impl<T: Transactional> SyncProvider<T> {
    /// Run `f` inside a transaction.
    ///
    /// Commits once when `f` returns `Ok`; rolls back when it returns `Err`
    /// or panics. Requires a connected provider.
    pub fn transaction<R, F>(&mut self, f: F) -> DataResult<R>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> DataResult<R>,
    {
        let handle = self.state.handle("begin transaction")?;
        self.transport.begin(handle)?;
        debug!(provider = %self.id, "Transaction started");

        let mut tx = Transaction {
            provider: self,
            finished: false,
        };
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Execute every request in one transaction; all or nothing.
    pub fn execute_batch(&mut self, requests: &[T::Request]) -> DataResult<Vec<QueryResult>> {
        self.transaction(|tx| requests.iter().map(|r| tx.execute(r)).collect())
    }
}

impl<T: Transport> Drop for SyncProvider<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<T: Transport> std::fmt::Debug for SyncProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("id", &self.id)
            .field("transport", &self.transport.name())
            .field("status", &self.state.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Scoped acquisition
// =============================================================================

/// Connected provider that disconnects when dropped, on every exit path.
pub struct ConnectionGuard<'p, T: Transport> {
    provider: &'p mut SyncProvider<T>,
}

impl<T: Transport> Deref for ConnectionGuard<'_, T> {
    type Target = SyncProvider<T>;

    fn deref(&self) -> &Self::Target {
        self.provider
    }
}

impl<T: Transport> DerefMut for ConnectionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.provider
    }
}

impl<T: Transport> Drop for ConnectionGuard<'_, T> {
    fn drop(&mut self) {
        self.provider.disconnect();
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Open transaction; holds the provider's connection exclusively.
pub struct Transaction<'p, T: Transactional> {
    provider: &'p SyncProvider<T>,
    finished: bool,
}

impl<T: Transactional> Transaction<'_, T> {
    /// Execute inside the transaction. Never retried.
    pub fn execute(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.provider
            .perform(request, &RetryPolicy::no_retry(), Operation::Execute)
    }

    /// Read inside the transaction, seeing its uncommitted writes.
    pub fn fetch(&mut self, request: &T::Request) -> DataResult<QueryResult> {
        self.provider
            .perform(request, &RetryPolicy::no_retry(), Operation::Fetch)
    }

    fn commit(&mut self) -> DataResult<()> {
        self.finished = true;
        let handle = self.provider.state.handle("commit")?;
        match self.provider.transport.commit(handle) {
            Ok(()) => {
                debug!(provider = %self.provider.id, "Transaction committed");
                Ok(())
            }
            Err(err) => {
                warn!(provider = %self.provider.id, error = %err, "Commit failed, rolling back");
                self.rollback_quietly();
                Err(err)
            }
        }
    }

    fn rollback(&mut self) {
        self.finished = true;
        self.rollback_quietly();
        debug!(provider = %self.provider.id, "Transaction rolled back");
    }

    fn rollback_quietly(&self) {
        if let Ok(handle) = self.provider.state.handle("rollback") {
            if let Err(e) = self.provider.transport.rollback(handle) {
                warn!(provider = %self.provider.id, error = %e, "Rollback failed");
            }
        }
    }
}

impl<T: Transactional> Drop for Transaction<'_, T> {
    fn drop(&mut self) {
        // Only reached without commit/rollback when the closure panicked.
        if !self.finished {
            self.rollback_quietly();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::RawResult;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::time::Duration;

    /// Counts calls and fails the first `fail_opens` opens.
    #[derive(Default)]
    struct Counting {
        fail_opens: Cell<u32>,
        opens: Cell<u32>,
        closes: Cell<u32>,
        runs: Cell<u32>,
        log: RefCell<Vec<String>>,
    }

    impl Transport for Counting {
        type Handle = ();
        type Request = String;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn open(&self) -> DataResult<()> {
            self.opens.set(self.opens.get() + 1);
            if self.fail_opens.get() > 0 {
                self.fail_opens.set(self.fail_opens.get() - 1);
                return Err(DataRetrievalError::query("handshake refused"));
            }
            Ok(())
        }

        fn close(&self, _handle: ()) -> DataResult<()> {
            self.closes.set(self.closes.get() + 1);
            Ok(())
        }

        fn run(&self, _handle: &(), request: &String) -> DataResult<RawResult> {
            self.runs.set(self.runs.get() + 1);
            self.log.borrow_mut().push(request.clone());
            Ok(RawResult::new(vec![json!(request)]))
        }

        fn probe(&self, _handle: &()) -> bool {
            true
        }
    }

    fn provider() -> SyncProvider<Counting> {
        SyncProvider::new(Counting::default())
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO))
    }

    #[test]
    fn test_new_provider_has_no_side_effects() {
        let p = provider();
        assert_eq!(p.status(), ProviderStatus::Disconnected);
        assert_eq!(p.transport().opens.get(), 0);
        assert!(!p.health_check());
    }

    #[test]
    fn test_connect_retries_then_succeeds() {
        let mut p = provider();
        p.transport().fail_opens.set(2);
        p.connect().unwrap();
        assert_eq!(p.transport().opens.get(), 3);
        assert!(p.is_connected());
        assert!(p.has_connection());
    }

    #[test]
    fn test_connect_failure_enters_error_with_connection_kind() {
        let mut p = provider();
        p.transport().fail_opens.set(10);
        let err = p.connect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(p.status(), ProviderStatus::Error);
        assert!(!p.has_connection());

        // explicit recovery
        p.transport().fail_opens.set(0);
        p.connect().unwrap();
        assert_eq!(p.status(), ProviderStatus::Connected);
    }

    #[test]
    fn test_fetch_requires_connection() {
        let mut p = provider();
        let err = p.fetch(&"x".to_string()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.message().contains("CONNECTED"));
        assert_eq!(p.transport().runs.get(), 0);
    }

    #[test]
    fn test_fetch_adds_provider_metadata() {
        let mut p = provider().with_id("orders");
        p.connect().unwrap();
        let result = p.fetch(&"a".to_string()).unwrap();
        assert_eq!(result.data(), &[json!("a")]);
        assert_eq!(result.meta("provider"), Some(&json!("orders")));
        assert_eq!(result.meta("transport"), Some(&json!("counting")));
        assert_eq!(result.meta("retries"), Some(&json!(0)));
        assert!(result.meta("latency_ms").is_some());
    }

    #[test]
    fn test_connection_guard_disconnects() {
        let mut p = provider();
        {
            let mut guard = p.connection().unwrap();
            assert!(guard.is_connected());
            guard.fetch(&"a".to_string()).unwrap();
        }
        assert_eq!(p.status(), ProviderStatus::Disconnected);
        assert_eq!(p.transport().closes.get(), 1);
    }

    #[test]
    fn test_with_connection_disconnects_on_error() {
        let mut p = provider();
        let result: DataResult<()> =
            p.with_connection(|_| Err(DataRetrievalError::query("boom")));
        assert!(result.is_err());
        assert_eq!(p.status(), ProviderStatus::Disconnected);
        assert!(!p.has_connection());
    }
}
