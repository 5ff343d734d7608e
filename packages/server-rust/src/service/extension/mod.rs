//! Lifecycle hooks around function dispatch.
//!
//! An [`ExtensionPipeline`] holds an explicit, ordered list of extensions and
//! runs them at three points of every call:
//!
//! 1. [`LifecyclePoint::RequestValidated`]: after parsing, before resolution.
//! 2. [`LifecyclePoint::ExecutingFunction`]: after resolution, before invoke.
//! 3. [`LifecyclePoint::FunctionExecuted`]: after invoke, before encoding.
//!
//! The first two may stop propagation with a replacement response, which
//! skips invocation. The third may replace the response and always runs, so
//! short-circuited calls are still observed. A hook that errors or panics
//! aborts the pipeline with an internal error.

pub mod deprecation;
pub mod rate_limit;
pub mod timing;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use forrst_core::{CallContext, ResponseObject, ValidatedRequest};
use futures_util::FutureExt;
use tracing::warn;

use super::error::DispatchError;
use super::function::FunctionDescriptor;

pub use deprecation::DeprecationExtension;
pub use rate_limit::{InMemoryRateLimiter, RateDecision, RateLimitExtension, RateLimiter};
pub use timing::TimingExtension;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The three hook points, in the order they fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePoint {
    RequestValidated,
    ExecutingFunction,
    FunctionExecuted,
}

impl fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestValidated => "request_validated",
            Self::ExecutingFunction => "executing_function",
            Self::FunctionExecuted => "function_executed",
        })
    }
}

/// Fired once the request has been parsed and validated.
#[derive(Debug, Clone, Copy)]
pub struct RequestValidated<'a> {
    pub request: &'a ValidatedRequest,
    pub context: &'a CallContext,
}

/// Fired once the target function has been resolved.
#[derive(Debug, Clone, Copy)]
pub struct ExecutingFunction<'a> {
    pub request: &'a ValidatedRequest,
    pub context: &'a CallContext,
    pub descriptor: &'a FunctionDescriptor,
}

/// Fired with the response about to be returned.
#[derive(Debug, Clone, Copy)]
pub struct FunctionExecuted<'a> {
    pub request: &'a ValidatedRequest,
    pub context: &'a CallContext,
    /// `None` when resolution failed or a hook stopped before resolution.
    pub descriptor: Option<&'a FunctionDescriptor>,
    /// Current response, including replacements by earlier hooks.
    pub response: &'a ResponseObject,
    /// Whether an earlier hook stopped propagation.
    pub short_circuited: bool,
}

/// Result of a hook at the first two points.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    Continue,
    /// Skip the remaining hooks at this point and answer with this response.
    StopPropagation(ResponseObject),
}

// ---------------------------------------------------------------------------
// Extension trait
// ---------------------------------------------------------------------------

/// Interceptor with three optional hooks. Defaults do nothing.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Name, also the key under which callers pass options in the request's
    /// `extension` block.
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// An error aborts the call with `INTERNAL_ERROR`.
    async fn on_request_validated(
        &self,
        _event: &RequestValidated<'_>,
    ) -> Result<HookOutcome, DispatchError> {
        Ok(HookOutcome::Continue)
    }

    /// # Errors
    ///
    /// An error aborts the call with `INTERNAL_ERROR`.
    async fn on_executing_function(
        &self,
        _event: &ExecutingFunction<'_>,
    ) -> Result<HookOutcome, DispatchError> {
        Ok(HookOutcome::Continue)
    }

    /// Returning `Some` replaces the response for the remaining hooks.
    ///
    /// # Errors
    ///
    /// An error aborts the call with `INTERNAL_ERROR`.
    async fn on_function_executed(
        &self,
        _event: &FunctionExecuted<'_>,
    ) -> Result<Option<ResponseObject>, DispatchError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// ExtensionPipeline
// ---------------------------------------------------------------------------

/// Ordered extensions, run strictly in the order given.
#[derive(Clone, Default)]
pub struct ExtensionPipeline {
    extensions: Vec<Arc<dyn Extension>>,
}

/// Awaits one hook, turning an error or a panic into
/// [`DispatchError::Extension`].
async fn guarded<T>(
    extension: &'static str,
    point: LifecyclePoint,
    hook: impl Future<Output = Result<T, DispatchError>>,
) -> Result<T, DispatchError> {
    let reason = match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(err)) => err.to_string(),
        Err(_) => "panicked".to_string(),
    };
    warn!(extension, point = %point, reason = %reason, "extension hook failed");
    Err(DispatchError::Extension { extension, reason })
}

impl ExtensionPipeline {
    #[must_use]
    pub fn new(extensions: Vec<Arc<dyn Extension>>) -> Self {
        Self { extensions }
    }

    /// Appends an extension after those already present.
    #[must_use]
    pub fn with(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Extension names in run order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    /// Whether `key` names an installed extension.
    #[must_use]
    pub fn recognizes(&self, key: &str) -> bool {
        self.extensions.iter().any(|e| e.name() == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Runs `on_request_validated` hooks until one stops.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Extension`] if a hook fails or panics.
    pub async fn request_validated(
        &self,
        event: &RequestValidated<'_>,
    ) -> Result<HookOutcome, DispatchError> {
        for ext in &self.extensions {
            let hook = ext.on_request_validated(event);
            match guarded(ext.name(), LifecyclePoint::RequestValidated, hook).await? {
                HookOutcome::Continue => {}
                stop @ HookOutcome::StopPropagation(_) => return Ok(stop),
            }
        }
        Ok(HookOutcome::Continue)
    }

    /// Runs `on_executing_function` hooks until one stops.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Extension`] if a hook fails or panics.
    pub async fn executing_function(
        &self,
        event: &ExecutingFunction<'_>,
    ) -> Result<HookOutcome, DispatchError> {
        for ext in &self.extensions {
            let hook = ext.on_executing_function(event);
            match guarded(ext.name(), LifecyclePoint::ExecutingFunction, hook).await? {
                HookOutcome::Continue => {}
                stop @ HookOutcome::StopPropagation(_) => return Ok(stop),
            }
        }
        Ok(HookOutcome::Continue)
    }

    /// Threads `response` through every `on_function_executed` hook and
    /// returns the final response.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Extension`] if a hook fails or panics.
    pub async fn function_executed(
        &self,
        request: &ValidatedRequest,
        context: &CallContext,
        descriptor: Option<&FunctionDescriptor>,
        mut response: ResponseObject,
        short_circuited: bool,
    ) -> Result<ResponseObject, DispatchError> {
        for ext in &self.extensions {
            let event = FunctionExecuted {
                request,
                context,
                descriptor,
                response: &response,
                short_circuited,
            };
            let hook = ext.on_function_executed(&event);
            let replacement = guarded(ext.name(), LifecyclePoint::FunctionExecuted, hook).await?;
            if let Some(replacement) = replacement {
                response = replacement;
            }
        }
        Ok(response)
    }
}

impl fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPipeline")
            .field("extensions", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use forrst_core::{ErrorCode, ErrorInfo, RequestObject, ValidationRules};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    /// Appends `name:point` to a shared log and optionally stops or fails.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        stop_at: Option<LifecyclePoint>,
        fail_at: Option<LifecyclePoint>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                stop_at: None,
                fail_at: None,
            }
        }

        fn record(&self, point: LifecyclePoint) -> Result<(), DispatchError> {
            self.log.lock().push(format!("{}:{point}", self.name));
            if self.fail_at == Some(point) {
                return Err(DispatchError::Internal(anyhow::anyhow!("boom")));
            }
            Ok(())
        }

        fn outcome(&self, point: LifecyclePoint) -> HookOutcome {
            if self.stop_at == Some(point) {
                HookOutcome::StopPropagation(ResponseObject::failure(
                    Some("r1".into()),
                    ErrorInfo::new(ErrorCode::Forbidden, self.name),
                ))
            } else {
                HookOutcome::Continue
            }
        }
    }

    #[async_trait]
    impl Extension for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_request_validated(
            &self,
            _event: &RequestValidated<'_>,
        ) -> Result<HookOutcome, DispatchError> {
            self.record(LifecyclePoint::RequestValidated)?;
            Ok(self.outcome(LifecyclePoint::RequestValidated))
        }

        async fn on_executing_function(
            &self,
            _event: &ExecutingFunction<'_>,
        ) -> Result<HookOutcome, DispatchError> {
            self.record(LifecyclePoint::ExecutingFunction)?;
            Ok(self.outcome(LifecyclePoint::ExecutingFunction))
        }

        async fn on_function_executed(
            &self,
            event: &FunctionExecuted<'_>,
        ) -> Result<Option<ResponseObject>, DispatchError> {
            self.record(LifecyclePoint::FunctionExecuted)?;
            Ok(Some(
                event
                    .response
                    .clone()
                    .with_meta_entry(self.name, json!(event.short_circuited)),
            ))
        }
    }

    struct Panicky;

    #[async_trait]
    impl Extension for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }

        async fn on_request_validated(
            &self,
            _event: &RequestValidated<'_>,
        ) -> Result<HookOutcome, DispatchError> {
            panic!("hook bug")
        }
    }

    fn make_request() -> ValidatedRequest {
        forrst_core::validate(
            RequestObject::new("r1", "app.echo", json!({})),
            &ValidationRules::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn hooks_run_in_given_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ExtensionPipeline::new(vec![
            Arc::new(Recorder::new("b", &log)),
            Arc::new(Recorder::new("a", &log)),
        ]);
        let request = make_request();
        let ctx = CallContext::system("n1");

        let outcome = pipeline
            .request_validated(&RequestValidated {
                request: &request,
                context: &ctx,
            })
            .await
            .unwrap();
        assert_eq!(outcome, HookOutcome::Continue);
        assert_eq!(*log.lock(), vec!["b:request_validated", "a:request_validated"]);
    }

    #[tokio::test]
    async fn stop_skips_remaining_hooks_at_that_point() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut first = Recorder::new("first", &log);
        first.stop_at = Some(LifecyclePoint::RequestValidated);
        let pipeline = ExtensionPipeline::new(vec![
            Arc::new(first),
            Arc::new(Recorder::new("second", &log)),
        ]);
        let request = make_request();
        let ctx = CallContext::system("n1");

        let outcome = pipeline
            .request_validated(&RequestValidated {
                request: &request,
                context: &ctx,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, HookOutcome::StopPropagation(_)));
        assert_eq!(*log.lock(), vec!["first:request_validated"]);
    }

    #[tokio::test]
    async fn function_executed_threads_replacements() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ExtensionPipeline::new(vec![
            Arc::new(Recorder::new("x", &log)),
            Arc::new(Recorder::new("y", &log)),
        ]);
        let request = make_request();
        let ctx = CallContext::system("n1");

        let response = pipeline
            .function_executed(
                &request,
                &ctx,
                None,
                ResponseObject::success(Some("r1".into()), json!(1)),
                true,
            )
            .await
            .unwrap();
        let meta = response.meta().unwrap();
        assert_eq!(meta["x"], true);
        assert_eq!(meta["y"], true);
    }

    #[tokio::test]
    async fn failing_hook_aborts_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("failing", &log);
        failing.fail_at = Some(LifecyclePoint::FunctionExecuted);
        let pipeline = ExtensionPipeline::new(vec![
            Arc::new(failing),
            Arc::new(Recorder::new("after", &log)),
        ]);
        let request = make_request();
        let ctx = CallContext::system("n1");

        let err = pipeline
            .function_executed(&request, &ctx, None, ResponseObject::success(None, json!(1)), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(*log.lock(), vec!["failing:function_executed"]);
    }

    #[tokio::test]
    async fn panicking_hook_becomes_internal_error() {
        let pipeline = ExtensionPipeline::default().with(Panicky);
        let request = make_request();
        let ctx = CallContext::system("n1");

        let err = pipeline
            .request_validated(&RequestValidated {
                request: &request,
                context: &ctx,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Extension { extension: "panicky", .. }));
        assert_eq!(err.to_error_info(), ErrorInfo::internal());
    }

    #[test]
    fn recognizes_installed_names() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = ExtensionPipeline::new(vec![Arc::new(Recorder::new("audit", &log))]);
        assert!(pipeline.recognizes("audit"));
        assert!(!pipeline.recognizes("rate_limit"));
    }
}
