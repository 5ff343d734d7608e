//! `forrst-server`: serves the built-in functions over `POST /forrst`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use forrst_server::network::{NetworkConfig, NetworkModule};
use forrst_server::service::{
    register_system_functions, spawn_operation_worker, CancellationRegistry, DeprecationExtension,
    DispatchConfig, Dispatcher, ExtensionPipeline, FunctionRegistry, InMemoryOperationRepository,
    InMemoryRateLimiter, OperationRepository, RateLimitExtension, TimingExtension,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forrst-server", version)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "FORRST_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind. 0 picks a free port.
    #[arg(long, env = "FORRST_PORT", default_value_t = 8080)]
    port: u16,

    /// Node identifier stamped into every call context.
    #[arg(long, env = "FORRST_NODE_ID", default_value = "forrst-1")]
    node_id: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "FORRST_LOG_JSON")]
    log_json: bool,

    /// Serve Prometheus metrics on this address (e.g. 0.0.0.0:9090).
    #[arg(long, env = "FORRST_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Default per-call timeout in milliseconds.
    #[arg(long, env = "FORRST_CALL_TIMEOUT_MS", default_value_t = 30_000)]
    call_timeout_ms: u64,

    /// Concurrent calls before load shedding.
    #[arg(long, env = "FORRST_MAX_CONCURRENT_CALLS", default_value_t = 1000)]
    max_concurrent_calls: u32,

    /// Lifetime of a deferred operation in seconds.
    #[arg(long, env = "FORRST_OPERATION_TTL_SECS", default_value_t = 86_400)]
    operation_ttl_secs: u64,

    /// Grace period for running operations when the worker stops, in
    /// milliseconds.
    #[arg(long, env = "FORRST_WORKER_SHUTDOWN_TIMEOUT_MS", default_value_t = 10_000)]
    worker_shutdown_timeout_ms: u64,

    /// Calls allowed per rate-limit window and key.
    #[arg(long, env = "FORRST_RATE_LIMIT", default_value_t = 600)]
    rate_limit: u32,

    /// Rate-limit window in seconds.
    #[arg(long, env = "FORRST_RATE_WINDOW_SECS", default_value_t = 60)]
    rate_window_secs: u64,

    /// Largest accepted request body in bytes.
    #[arg(long, env = "FORRST_MAX_BODY_BYTES", default_value_t = 4 * 1024 * 1024)]
    max_body_bytes: usize,

    /// Comma-separated CORS origins; `*` allows any.
    #[arg(long, env = "FORRST_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,
}

impl Args {
    fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            node_id: self.node_id.clone(),
            default_call_timeout_ms: self.call_timeout_ms,
            max_concurrent_calls: self.max_concurrent_calls,
            operation_ttl_secs: self.operation_ttl_secs,
            worker_shutdown_timeout_ms: self.worker_shutdown_timeout_ms,
            ..DispatchConfig::default()
        }
    }

    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            max_body_bytes: self.max_body_bytes,
            request_timeout: Duration::from_millis(self.call_timeout_ms.saturating_add(5_000)),
            ..NetworkConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,forrst_server=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "prometheus exporter listening");
    }

    let dispatch_config = args.dispatch_config();
    let repository: Arc<dyn OperationRepository> = Arc::new(InMemoryOperationRepository::new());
    let cancellations = Arc::new(CancellationRegistry::new());
    let registry = Arc::new(FunctionRegistry::new());
    register_system_functions(&registry, Arc::clone(&repository), Arc::clone(&cancellations))?;

    let (mut worker, executor) =
        spawn_operation_worker(Arc::clone(&repository), cancellations, &dispatch_config)?;

    let extensions = ExtensionPipeline::default()
        .with(TimingExtension)
        .with(RateLimitExtension::new(
            Arc::new(InMemoryRateLimiter::new()),
            args.rate_limit,
            Duration::from_secs(args.rate_window_secs),
        ))
        .with(DeprecationExtension);

    let dispatcher = Arc::new(Dispatcher::new(
        dispatch_config,
        registry,
        repository,
        extensions,
        Arc::new(executor),
    ));

    let mut network = NetworkModule::new(args.network_config(), dispatcher);
    let port = network.start().await?;
    info!(node_id = %args.node_id, port, "forrst server started");

    network
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    worker.stop().await;
    info!("forrst server stopped");
    Ok(())
}
