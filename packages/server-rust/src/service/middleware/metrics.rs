//! Call metrics: one `tracing` span per call plus `metrics` counters and a
//! latency histogram.
//!
//! - `forrst_calls_total{outcome}`: `ok`, `error`, `stream` or `rejected`
//!   (failed inside the middleware stack).
//! - `forrst_call_duration_seconds`: time to produce the outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::dispatcher::{DispatchOutcome, InboundCall};
use crate::service::error::DispatchError;

pub const CALLS_TOTAL: &str = "forrst_calls_total";
pub const CALL_DURATION_SECONDS: &str = "forrst_call_duration_seconds";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments calls with timing and outcome counts.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome_label(result: &Result<DispatchOutcome, DispatchError>) -> &'static str {
    match result {
        Ok(DispatchOutcome::Response(response)) if response.is_success() => "ok",
        Ok(DispatchOutcome::Response(_)) => "error",
        Ok(DispatchOutcome::Stream { .. }) => "stream",
        Err(_) => "rejected",
    }
}

impl<S> Service<InboundCall> for MetricsService<S>
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
        let span = info_span!(
            "forrst_call",
            trace_id = %call.context.trace_id,
            codec = ?call.codec,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "call complete");

                metrics::counter!(CALLS_TOTAL, "outcome" => outcome).increment(1);
                metrics::histogram!(CALL_DURATION_SECONDS).record(elapsed.as_secs_f64());

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
