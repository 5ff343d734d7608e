/// Dispatcher-level configuration.
///
/// Controls call timeouts, concurrency limits, and the lifetime and sweeping
/// of deferred operations.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Unique identifier for this node, stamped into every [`CallContext`].
    ///
    /// [`CallContext`]: forrst_core::CallContext
    pub node_id: String,
    /// Default timeout for a single call in milliseconds.
    pub default_call_timeout_ms: u64,
    /// Maximum number of concurrent calls before load shedding.
    pub max_concurrent_calls: u32,
    /// How long an async operation may stay non-terminal before it expires.
    pub operation_ttl_secs: u64,
    /// Interval between expiry sweeps in milliseconds.
    pub operation_sweep_interval_ms: u64,
    /// Upper bound on operations expired per sweep.
    pub operation_sweep_batch: usize,
    /// Capacity of the operation worker's job queue.
    pub worker_channel_capacity: usize,
    /// How long a stopping worker waits for running jobs before aborting
    /// them, in milliseconds.
    pub worker_shutdown_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            default_call_timeout_ms: 30_000,
            max_concurrent_calls: 1000,
            operation_ttl_secs: 86_400,
            operation_sweep_interval_ms: 60_000,
            operation_sweep_batch: 100,
            worker_channel_capacity: 256,
            worker_shutdown_timeout_ms: 10_000,
        }
    }
}

impl DispatchConfig {
    /// Operation time-to-live as a `chrono` duration.
    #[must_use]
    pub fn operation_ttl(&self) -> chrono::Duration {
        i64::try_from(self.operation_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::days(36_500))
    }
}
