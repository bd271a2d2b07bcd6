//! Error taxonomy shared by every provider and transport.
//!
//! All failures surface as a [`DataRetrievalError`]. Callers branch on the
//! variant (or on [`ErrorKind`]) to tell connection problems from query
//! problems, rejected input and missed deadlines. Each variant keeps the
//! underlying cause when one exists, reachable through
//! [`std::error::Error::source`].

use std::time::Duration;
use thiserror::Error;

/// Boxed cause carried by error variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DataRetrievalError {
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Timeout: {}", timeout_message(.operation, .deadline))]
    Timeout {
        operation: String,
        /// `None` when the deadline was enforced by a lower layer that did not report it.
        deadline: Option<Duration>,
        #[source]
        source: Option<BoxError>,
    },
}

/// Discriminant of a [`DataRetrievalError`], handy for matching and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Query,
    Validation,
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

impl DataRetrievalError {
    /// Create a connection error without an underlying cause.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error wrapping its cause.
    pub fn connection_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Create a query error without an underlying cause.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            source: None,
        }
    }

    /// Create a query error wrapping its cause.
    pub fn query_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Query {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error for an operation that missed its deadline.
    pub fn timeout(operation: impl Into<String>, deadline: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            deadline: Some(deadline),
            source: None,
        }
    }

    /// Create a timeout error reported by a client library, wrapping its cause.
    pub fn timeout_with(
        operation: impl Into<String>,
        deadline: Option<Duration>,
        cause: impl Into<BoxError>,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            deadline,
            source: Some(cause.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Query { .. } => ErrorKind::Query,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Human-readable message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Connection { message, .. }
            | Self::Query { message, .. }
            | Self::Validation { message, .. } => message.clone(),
            Self::Timeout {
                operation,
                deadline,
                ..
            } => timeout_message(operation, deadline),
        }
    }

    /// Invalid input stays invalid; everything else may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }

    /// Reclassify as a connection error, keeping the original as the cause.
    pub fn into_connection_error(self) -> Self {
        match self {
            Self::Connection { .. } => self,
            other => Self::connection_with(other.message(), other),
        }
    }

    /// Reclassify as a query error, keeping the original as the cause.
    pub fn into_query_error(self) -> Self {
        match self {
            Self::Query { .. } => self,
            other => Self::query_with(other.message(), other),
        }
    }
}

impl From<sqlx::Error> for DataRetrievalError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Configuration(_)
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::AnyDriverError(_)
            | sqlx::Error::WorkerCrashed => {
                DataRetrievalError::connection_with(err.to_string(), err)
            }
            sqlx::Error::PoolTimedOut => {
                DataRetrievalError::timeout_with("connection acquire", None, err)
            }
            sqlx::Error::Database(db_err) => {
                let message = match db_err.code() {
                    Some(code) => format!("{} (code {})", db_err.message(), code),
                    None => db_err.message().to_string(),
                };
                DataRetrievalError::query_with(message, err)
            }
            _ => DataRetrievalError::query_with(err.to_string(), err),
        }
    }
}

impl From<reqwest::Error> for DataRetrievalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            let operation = match err.url() {
                Some(url) => format!("request to {}", url),
                None => "request".to_string(),
            };
            DataRetrievalError::timeout_with(operation, None, err)
        } else if err.is_connect() {
            DataRetrievalError::connection_with(err.to_string(), err)
        } else {
            DataRetrievalError::query_with(err.to_string(), err)
        }
    }
}

fn timeout_message(operation: &str, deadline: &Option<Duration>) -> String {
    match deadline {
        Some(deadline) => format!("{} exceeded {}ms", operation, deadline.as_millis()),
        None => format!("{operation} timed out"),
    }
}

/// Result type alias for data retrieval operations.
pub type DataResult<T> = Result<T, DataRetrievalError>;
