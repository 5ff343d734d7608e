//! Pipeline composition: wraps the dispatcher with every middleware layer.

use std::sync::Arc;

use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::DispatchConfig;
use crate::service::dispatcher::{DispatchOutcome, DispatchService, Dispatcher, InboundCall};
use crate::service::error::DispatchError;

/// Type-erased, cloneable dispatch pipeline, as held by transports.
pub type DispatchPipeline = BoxCloneSyncService<InboundCall, DispatchOutcome, DispatchError>;

/// Builds the dispatch pipeline around `dispatcher`.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer`: reject when overloaded, before doing any work
/// 2. `TimeoutLayer`: enforce the per-call deadline
/// 3. `MetricsLayer`: record timing and outcome
#[must_use]
pub fn build_dispatch_pipeline(
    dispatcher: Arc<Dispatcher>,
    config: &DispatchConfig,
) -> DispatchPipeline {
    let service = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_calls))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .service(DispatchService::new(dispatcher));
    BoxCloneSyncService::new(service)
}

/// Runs one call through `pipeline`, turning middleware rejections into
/// protocol responses.
pub async fn call_pipeline(pipeline: &DispatchPipeline, call: InboundCall) -> DispatchOutcome {
    let id = call.request_id();
    let mut svc = pipeline.clone();
    let result = match svc.ready().await {
        Ok(svc) => svc.call(call).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(outcome) => outcome,
        Err(err) => DispatchOutcome::Response(err.into_response(id)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
