//! In-memory transport doubles shared by the integration tests.
//!
//! Requests are table names for reads and `table=value` for writes. The
//! backing store, call counters and injected failures are all inspectable
//! through [`Mock::state`], even after the provider has been dropped.

#![allow(dead_code)]

use async_trait::async_trait;
use data_retrieval::error::{DataResult, DataRetrievalError, ErrorKind};
use data_retrieval::models::RawResult;
use data_retrieval::transport::{AsyncTransactional, AsyncTransport, Transactional, Transport};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type Store = BTreeMap<String, Vec<JsonValue>>;

#[derive(Debug, Default)]
pub struct MockState {
    pub opens: u32,
    pub closes: u32,
    pub runs: u32,
    pub executes: u32,
    pub probes: u32,
    pub begins: u32,
    pub commits: u32,
    pub rollbacks: u32,
    /// Number of upcoming opens that fail with a connection error.
    pub fail_opens: u32,
    /// Failures handed out to upcoming run/execute calls, in order.
    pub failures: VecDeque<ErrorKind>,
    /// Latency for the async double, keyed by request or by `open`/`commit`.
    pub latency_ms: BTreeMap<String, u64>,
    /// Committed data.
    pub store: Store,
    /// Working copy while a transaction is open.
    pub pending: Option<Store>,
    /// Order in which async requests finished.
    pub completed: Vec<String>,
    next_handle: u32,
}

impl MockState {
    pub fn transport_calls(&self) -> u32 {
        self.opens + self.runs + self.executes + self.probes + self.begins
    }

    fn open(&mut self) -> DataResult<u32> {
        self.opens += 1;
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(DataRetrievalError::connection("connection refused"));
        }
        self.next_handle += 1;
        Ok(self.next_handle)
    }

    fn close(&mut self) {
        self.closes += 1;
        // a dropped connection discards any open transaction
        self.pending = None;
    }

    fn injected_failure(&mut self) -> DataResult<()> {
        match self.failures.pop_front() {
            Some(kind) => Err(error_of(kind)),
            None => Ok(()),
        }
    }

    fn view(&self) -> &Store {
        self.pending.as_ref().unwrap_or(&self.store)
    }

    fn run(&mut self, request: &str) -> DataResult<RawResult> {
        self.runs += 1;
        self.injected_failure()?;
        let records = self.view().get(request).cloned().unwrap_or_default();
        Ok(RawResult::new(records).with_metadata("table", request))
    }

    fn execute(&mut self, request: &str) -> DataResult<RawResult> {
        self.executes += 1;
        self.injected_failure()?;
        let (table, value) = request
            .split_once('=')
            .ok_or_else(|| DataRetrievalError::query(format!("malformed write '{request}'")))?;
        let target = self.pending.as_mut().unwrap_or(&mut self.store);
        target.entry(table.to_string()).or_default().push(json!(value));
        Ok(RawResult::new(vec![json!({"rows_affected": 1})]))
    }

    fn begin(&mut self) -> DataResult<()> {
        self.begins += 1;
        self.pending = Some(self.store.clone());
        Ok(())
    }

    fn commit(&mut self) -> DataResult<()> {
        self.commits += 1;
        if let Some(pending) = self.pending.take() {
            self.store = pending;
        }
        Ok(())
    }

    fn rollback(&mut self) -> DataResult<()> {
        self.rollbacks += 1;
        self.pending = None;
        Ok(())
    }
}

pub fn error_of(kind: ErrorKind) -> DataRetrievalError {
    match kind {
        ErrorKind::Connection => DataRetrievalError::connection("injected connection failure"),
        ErrorKind::Query => DataRetrievalError::query("injected query failure"),
        ErrorKind::Validation => DataRetrievalError::validation("injected validation failure"),
        ErrorKind::Timeout => {
            DataRetrievalError::timeout("injected operation", Duration::from_millis(5))
        }
    }
}

/// Blocking transactional double.
#[derive(Debug, Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<MockState>>,
}

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &str, records: Vec<JsonValue>) -> Self {
        self.state().store.insert(table.to_string(), records);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// A handle on the same state for the async double.
    pub fn to_async(&self) -> AsyncMock {
        AsyncMock { inner: self.clone() }
    }
}

impl Transport for Mock {
    type Handle = u32;
    type Request = String;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(&self) -> DataResult<u32> {
        self.state().open()
    }

    fn close(&self, _handle: u32) -> DataResult<()> {
        self.state().close();
        Ok(())
    }

    fn run(&self, _handle: &u32, request: &String) -> DataResult<RawResult> {
        self.state().run(request)
    }

    fn execute(&self, _handle: &u32, request: &String) -> DataResult<RawResult> {
        self.state().execute(request)
    }

    fn probe(&self, _handle: &u32) -> bool {
        self.state().probes += 1;
        true
    }
}

impl Transactional for Mock {
    fn begin(&self, _handle: &u32) -> DataResult<()> {
        self.state().begin()
    }

    fn commit(&self, _handle: &u32) -> DataResult<()> {
        self.state().commit()
    }

    fn rollback(&self, _handle: &u32) -> DataResult<()> {
        self.state().rollback()
    }
}

/// Non-blocking double sharing state with a [`Mock`]; honours `latency_ms`.
#[derive(Debug, Clone)]
pub struct AsyncMock {
    inner: Mock,
}

impl AsyncMock {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.state()
    }

    async fn delay(&self, request: &str) {
        let latency = self.state().latency_ms.get(request).copied();
        if let Some(ms) = latency {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl AsyncTransport for AsyncMock {
    type Handle = u32;
    type Request = String;

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&self) -> DataResult<u32> {
        self.delay("open").await;
        self.state().open()
    }

    async fn close(&self, _handle: u32) -> DataResult<()> {
        self.state().close();
        Ok(())
    }

    async fn run(&self, _handle: &u32, request: &String) -> DataResult<RawResult> {
        self.delay(request).await;
        let mut state = self.state();
        state.completed.push(request.clone());
        state.run(request)
    }

    async fn execute(&self, _handle: &u32, request: &String) -> DataResult<RawResult> {
        self.delay(request).await;
        self.state().execute(request)
    }

    async fn probe(&self, _handle: &u32) -> bool {
        self.state().probes += 1;
        true
    }
}

#[async_trait]
impl AsyncTransactional for AsyncMock {
    async fn begin(&self, _handle: &u32) -> DataResult<()> {
        self.state().begin()
    }

    async fn commit(&self, _handle: &u32) -> DataResult<()> {
        self.delay("commit").await;
        self.state().commit()
    }

    async fn rollback(&self, _handle: &u32) -> DataResult<()> {
        self.state().rollback()
    }
}

/// Yield until `condition` holds; detached cleanup runs on the test runtime.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
