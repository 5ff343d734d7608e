//! Tower middleware for the dispatch pipeline.
//!
//! - [`load_shed`]: semaphore-based concurrency limiting
//! - [`timeout`]: per-call deadline
//! - [`metrics`]: tracing span, counters and latency histogram
//! - [`pipeline`]: composes the layers around the dispatcher

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, call_pipeline, DispatchPipeline};
pub use timeout::TimeoutLayer;
