//! Per-call deadline.
//!
//! Fails calls that do not produce an outcome within
//! [`InboundCall::timeout_ms`] with [`DispatchError::Timeout`]. A streamed
//! call only has to start in time; consuming the stream is not bounded here.
//!
//! The deadline drops the dispatcher future. A call cut short therefore
//! never reaches the `FunctionExecuted` hooks: its `UNAVAILABLE` response
//! carries no extension `meta`, and the function's own future is cancelled
//! at its next await point.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use crate::service::dispatcher::{DispatchOutcome, InboundCall};
use crate::service::error::DispatchError;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that enforces the timeout carried by each call.
#[derive(Debug, Clone)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<InboundCall> for TimeoutService<S>
where
    S: Service<InboundCall, Response = DispatchOutcome, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = DispatchOutcome;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: InboundCall) -> Self::Future {
        let timeout_ms = call.timeout_ms;
        let fut = self.inner.call(call);
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DispatchError::Timeout { timeout_ms }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use forrst_core::ErrorCode;
    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::testing::{make_call, SlowService};

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer.layer(SlowService { delay_ms: 10 });
        let outcome = svc.oneshot(make_call(1000)).await.unwrap();
        assert!(outcome.response().is_some());
    }

    #[tokio::test]
    async fn exceeds_timeout_returns_error() {
        let svc = TimeoutLayer.layer(SlowService { delay_ms: 200 });
        let err = svc.oneshot(make_call(50)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { timeout_ms: 50 }));
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }
}
