//! axum handlers and the state they share.

pub mod health;
pub mod rpc;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use rpc::rpc_handler;

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::service::{DispatchPipeline, FunctionRegistry};

/// Shared handler state. Every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Dispatch pipeline every `POST /forrst` call runs through.
    pub pipeline: DispatchPipeline,
    /// Read by the health endpoint.
    pub registry: Arc<FunctionRegistry>,
    /// Stamped into each call's `CallContext`.
    pub node_id: Arc<str>,
    /// Per-call timeout; a client may only lower it.
    pub call_timeout_ms: u64,
    pub shutdown: Arc<ShutdownController>,
    pub start_time: Instant,
}
