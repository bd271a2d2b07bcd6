//! Validation and transformation hooks run around every fetch.
//!
//! A provider holds one [`Validator`] and one [`Transformer`] behind a
//! [`HookPipeline`]. Both default to pass-through implementations and can be
//! replaced at construction or through the provider's setters. Closures work
//! directly:
//!
//! ```ignore
//! let provider = SyncProvider::new(transport)
//!     .with_validator(|req: &SqlRequest| !req.sql.trim().is_empty())
//!     .with_transformer(|raw: RawResult| Ok(raw));
//! ```

use crate::error::{BoxError, DataResult, DataRetrievalError};
use crate::models::RawResult;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Decides whether a request may reach the transport.
pub trait Validator<R>: Send + Sync {
    fn validate(&self, request: &R) -> bool;

    /// Name used in the rejection message.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Rewrites a successful transport result before it is wrapped.
pub trait Transformer: Send + Sync {
    fn transform(&self, raw: RawResult) -> Result<RawResult, BoxError>;
}

/// Accepts every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<R> Validator<R> for AcceptAll {
    fn validate(&self, _request: &R) -> bool {
        true
    }

    fn name(&self) -> &str {
        "accept_all"
    }
}

/// Returns results unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transformer for Identity {
    fn transform(&self, raw: RawResult) -> Result<RawResult, BoxError> {
        Ok(raw)
    }
}

impl<R, F> Validator<R> for F
where
    F: Fn(&R) -> bool + Send + Sync,
{
    fn validate(&self, request: &R) -> bool {
        self(request)
    }
}

impl<F> Transformer for F
where
    F: Fn(RawResult) -> Result<RawResult, BoxError> + Send + Sync,
{
    fn transform(&self, raw: RawResult) -> Result<RawResult, BoxError> {
        self(raw)
    }
}

/// The validator/transformer pair owned by a provider.
pub struct HookPipeline<R> {
    validator: Arc<dyn Validator<R>>,
    transformer: Arc<dyn Transformer>,
}

impl<R: 'static> HookPipeline<R> {
    pub fn new() -> Self {
        Self {
            validator: Arc::new(AcceptAll),
            transformer: Arc::new(Identity),
        }
    }

    pub fn set_validator(&mut self, validator: impl Validator<R> + 'static) {
        self.validator = Arc::new(validator);
    }

    pub fn set_transformer(&mut self, transformer: impl Transformer + 'static) {
        self.transformer = Arc::new(transformer);
    }

    /// Fails with a validation error when the validator rejects the request.
    pub fn validate(&self, request: &R) -> DataResult<()> {
        if self.validator.validate(request) {
            Ok(())
        } else {
            debug!(validator = self.validator.name(), "Request rejected");
            Err(DataRetrievalError::validation(format!(
                "request rejected by validator '{}'",
                self.validator.name()
            )))
        }
    }

    /// Applies the transformer; its failures count as query failures.
    pub fn transform(&self, raw: RawResult) -> DataResult<RawResult> {
        self.transformer
            .transform(raw)
            .map_err(|e| DataRetrievalError::query_with(format!("transform failed: {e}"), e))
    }
}

impl<R: 'static> Default for HookPipeline<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for HookPipeline<R> {
    fn clone(&self) -> Self {
        Self {
            validator: Arc::clone(&self.validator),
            transformer: Arc::clone(&self.transformer),
        }
    }
}

impl<R> fmt::Debug for HookPipeline<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookPipeline")
            .field("validator", &self.validator.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_defaults_pass_through() {
        let hooks: HookPipeline<String> = HookPipeline::new();
        assert!(hooks.validate(&"anything".to_string()).is_ok());

        let raw = RawResult::new(vec![json!(1), json!(2)]);
        assert_eq!(hooks.transform(raw.clone()).unwrap(), raw);
    }

    #[test]
    fn test_rejecting_validator() {
        let mut hooks: HookPipeline<i64> = HookPipeline::new();
        hooks.set_validator(|n: &i64| *n > 0);

        assert!(hooks.validate(&5).is_ok());
        let err = hooks.validate(&-1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_transform_failure_is_query_error() {
        let mut hooks: HookPipeline<()> = HookPipeline::new();
        hooks.set_transformer(|_raw: RawResult| -> Result<RawResult, BoxError> {
            Err("missing field 'id'".into())
        });

        let err = hooks.transform(RawResult::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
        assert!(err.message().contains("missing field 'id'"));
    }

    #[test]
    fn test_transformer_rewrites_records() {
        let mut hooks: HookPipeline<()> = HookPipeline::new();
        hooks.set_transformer(|mut raw: RawResult| -> Result<RawResult, BoxError> {
            raw.records.retain(|r| r["active"] == json!(true));
            Ok(raw)
        });

        let raw = RawResult::new(vec![
            json!({"id": 1, "active": true}),
            json!({"id": 2, "active": false}),
        ]);
        let out = hooks.transform(raw).unwrap();
        assert_eq!(out.records, vec![json!({"id": 1, "active": true})]);
    }

    #[test]
    fn test_named_validator_in_message() {
        struct NonEmpty;
        impl Validator<String> for NonEmpty {
            fn validate(&self, request: &String) -> bool {
                !request.is_empty()
            }
            fn name(&self) -> &str {
                "non_empty"
            }
        }

        let mut hooks: HookPipeline<String> = HookPipeline::new();
        hooks.set_validator(NonEmpty);
        let err = hooks.validate(&String::new()).unwrap_err();
        assert!(err.message().contains("non_empty"));
    }
}
