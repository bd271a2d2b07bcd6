//! Connection state machine shared by every provider.
//!
//! ```text
//! DISCONNECTED --begin_connect--> CONNECTING --connected--> CONNECTED
//!                                     |                        |
//!                                  failed                   release
//!                                     v                        v
//!                                   ERROR  --begin_connect-->  DISCONNECTED
//! ```
//!
//! The handle is stored next to the status so that "holds a handle" and
//! "is CONNECTED" can never disagree.

use crate::error::{DataResult, DataRetrievalError};
use crate::models::ProviderStatus;

#[derive(Debug)]
pub struct ConnectionState<H> {
    status: ProviderStatus,
    handle: Option<H>,
}

impl<H> ConnectionState<H> {
    pub fn new() -> Self {
        Self {
            status: ProviderStatus::Disconnected,
            handle: None,
        }
    }

    pub fn status(&self) -> ProviderStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Enter CONNECTING. Any handle still held is returned so the caller can close it.
    pub fn begin_connect(&mut self) -> Option<H> {
        self.status = ProviderStatus::Connecting;
        self.handle.take()
    }

    /// Enter CONNECTED holding `handle`.
    pub fn connected(&mut self, handle: H) {
        self.handle = Some(handle);
        self.status = ProviderStatus::Connected;
    }

    /// Enter ERROR after a failed connect.
    pub fn failed(&mut self) -> Option<H> {
        self.status = ProviderStatus::Error;
        self.handle.take()
    }

    /// Enter DISCONNECTED, handing back the handle if one was held.
    pub fn release(&mut self) -> Option<H> {
        self.status = ProviderStatus::Disconnected;
        self.handle.take()
    }

    /// Borrow the handle, failing unless CONNECTED.
    pub fn handle(&self, operation: &str) -> DataResult<&H> {
        match (&self.status, &self.handle) {
            (ProviderStatus::Connected, Some(handle)) => Ok(handle),
            _ => Err(self.not_connected(operation)),
        }
    }

    fn not_connected(&self, operation: &str) -> DataRetrievalError {
        DataRetrievalError::connection(format!(
            "cannot {operation}: provider must be CONNECTED (current status: {})",
            self.status
        ))
    }
}

impl<H> Default for ConnectionState<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn assert_invariant<H>(state: &ConnectionState<H>) {
        assert_eq!(state.is_connected(), state.has_handle());
    }

    #[test]
    fn test_initial_state() {
        let state: ConnectionState<u32> = ConnectionState::new();
        assert_eq!(state.status(), ProviderStatus::Disconnected);
        assert_invariant(&state);
    }

    #[test]
    fn test_successful_connect() {
        let mut state = ConnectionState::new();
        assert!(state.begin_connect().is_none());
        assert_eq!(state.status(), ProviderStatus::Connecting);
        assert_invariant(&state);

        state.connected(7u32);
        assert_eq!(state.status(), ProviderStatus::Connected);
        assert_eq!(*state.handle("fetch").unwrap(), 7);
        assert_invariant(&state);

        assert_eq!(state.release(), Some(7));
        assert_eq!(state.status(), ProviderStatus::Disconnected);
        assert_invariant(&state);
    }

    #[test]
    fn test_failed_connect_enters_error() {
        let mut state: ConnectionState<u32> = ConnectionState::new();
        state.begin_connect();
        state.failed();
        assert_eq!(state.status(), ProviderStatus::Error);
        assert_invariant(&state);

        let err = state.handle("fetch").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.message().contains("CONNECTED"));
        assert!(err.message().contains("ERROR"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut state: ConnectionState<u32> = ConnectionState::new();
        assert!(state.release().is_none());
        assert!(state.release().is_none());
        assert_eq!(state.status(), ProviderStatus::Disconnected);
    }

    #[test]
    fn test_reconnect_returns_stale_handle() {
        let mut state = ConnectionState::new();
        state.begin_connect();
        state.connected(1u32);
        assert_eq!(state.begin_connect(), Some(1));
        assert_invariant(&state);
    }
}
