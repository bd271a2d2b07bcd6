use super::{AsyncTransactional, AsyncTransport, Transactional, Transport};
use crate::error::{DataResult, DataRetrievalError};
use crate::models::RawResult;
use std::future::Future;
use tokio::runtime::{Builder, Runtime};

/// Drives an [`AsyncTransport`] from blocking code.
///
/// Owns a current-thread runtime so every handle the inner transport opens
/// stays bound to the same reactor for its whole life. Calls made from
/// inside another Tokio runtime are moved to a scoped thread, since blocking
/// a worker of the outer runtime is not allowed.
pub struct Blocking<T> {
    inner: T,
    runtime: Option<Runtime>,
}

impl<T: AsyncTransport> Blocking<T> {
    pub fn new(inner: T) -> DataResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                DataRetrievalError::connection_with("failed to start blocking runtime", e)
            })?;
        Ok(Self {
            inner,
            runtime: Some(runtime),
        })
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        // Only `Drop` takes the runtime out.
        let runtime = self
            .runtime
            .as_ref()
            .expect("blocking runtime is present until drop");

        if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::scope(|s| {
                match s.spawn(|| runtime.block_on(future)).join() {
                    Ok(output) => output,
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            })
        } else {
            runtime.block_on(future)
        }
    }
}

impl<T> Drop for Blocking<T> {
    fn drop(&mut self) {
        // A plain drop panics when it happens inside another runtime.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl<T: AsyncTransport> Transport for Blocking<T> {
    type Handle = T::Handle;
    type Request = T::Request;

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn open(&self) -> DataResult<Self::Handle> {
        self.block_on(self.inner.open())
    }

    fn close(&self, handle: Self::Handle) -> DataResult<()> {
        self.block_on(self.inner.close(handle))
    }

    fn run(&self, handle: &Self::Handle, request: &Self::Request) -> DataResult<RawResult> {
        self.block_on(self.inner.run(handle, request))
    }

    fn execute(&self, handle: &Self::Handle, request: &Self::Request) -> DataResult<RawResult> {
        self.block_on(self.inner.execute(handle, request))
    }

    fn probe(&self, handle: &Self::Handle) -> bool {
        self.block_on(self.inner.probe(handle))
    }
}

impl<T: AsyncTransactional> Transactional for Blocking<T> {
    fn begin(&self, handle: &Self::Handle) -> DataResult<()> {
        self.block_on(self.inner.begin(handle))
    }

    fn commit(&self, handle: &Self::Handle) -> DataResult<()> {
        self.block_on(self.inner.commit(handle))
    }

    fn rollback(&self, handle: &Self::Handle) -> DataResult<()> {
        self.block_on(self.inner.rollback(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl AsyncTransport for Echo {
        type Handle = u32;
        type Request = String;

        fn name(&self) -> &'static str {
            "echo"
        }

        async fn open(&self) -> DataResult<u32> {
            tokio::task::yield_now().await;
            Ok(self.opened.fetch_add(1, Ordering::SeqCst) as u32)
        }

        async fn close(&self, _handle: u32) -> DataResult<()> {
            Ok(())
        }

        async fn run(&self, handle: &u32, request: &String) -> DataResult<RawResult> {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            Ok(RawResult::new(vec![json!({"handle": handle, "echo": request})]))
        }

        async fn probe(&self, _handle: &u32) -> bool {
            true
        }
    }

    fn echo() -> Blocking<Echo> {
        Blocking::new(Echo {
            opened: AtomicUsize::new(0),
        })
        .unwrap()
    }

    #[test]
    fn test_blocking_outside_runtime() {
        let transport = echo();
        let handle = transport.open().unwrap();
        let raw = transport.run(&handle, &"ping".to_string()).unwrap();
        assert_eq!(raw.records[0]["echo"], "ping");
        assert!(transport.probe(&handle));
        transport.close(handle).unwrap();
    }

    #[tokio::test]
    async fn test_blocking_inside_runtime() {
        let transport = echo();
        let handle = transport.open().unwrap();
        let raw = transport.run(&handle, &"pong".to_string()).unwrap();
        assert_eq!(raw.records[0]["echo"], "pong");
        // dropping inside the outer runtime must not panic
        drop(transport);
    }
}
