//! HTTP server lifecycle with deferred startup.
//!
//! `new()` builds shared state, `start()` binds the listener and `serve()`
//! accepts connections until the shutdown future resolves. Callers can read
//! the bound port between `start()` and `serve()`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{health_handler, liveness_handler, readiness_handler, rpc_handler, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::{build_dispatch_pipeline, DispatchPipeline, Dispatcher};

/// Owns the listener, the dispatch pipeline and the shutdown controller.
pub struct NetworkModule {
    config: NetworkConfig,
    dispatcher: Arc<Dispatcher>,
    pipeline: DispatchPipeline,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
    start_time: Instant,
}

impl NetworkModule {
    /// Wraps `dispatcher` in the dispatch pipeline. Binds nothing yet.
    #[must_use]
    pub fn new(config: NetworkConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let pipeline = build_dispatch_pipeline(Arc::clone(&dispatcher), dispatcher.config());
        Self {
            config,
            dispatcher,
            pipeline,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Routes:
    /// - `POST /forrst`: protocol calls
    /// - `GET /health`, `/health/live`, `/health/ready`
    pub fn build_router(&self) -> Router {
        let dispatch = self.dispatcher.config();
        let state = AppState {
            pipeline: self.pipeline.clone(),
            registry: Arc::clone(self.dispatcher.registry()),
            node_id: Arc::from(dispatch.node_id.as_str()),
            call_timeout_ms: dispatch.default_call_timeout_ms,
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        Router::new()
            .route("/forrst", post(rpc_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// On shutdown the controller moves to `Draining` (new calls get
    /// `UNAVAILABLE`, open streams end), axum stops accepting, and in-flight
    /// calls get up to `drain_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or on a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let router = self.build_router();
        let controller = Arc::clone(&self.shutdown);
        controller.set_ready();
        info!(addr = %listener.local_addr()?, "serving forrst over HTTP");

        let signal = Arc::clone(&controller);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("shutdown requested; draining");
                signal.trigger_shutdown();
            })
            .await?;

        controller.trigger_shutdown();
        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("all in-flight calls drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with calls in flight"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use forrst_core::{Codec, RequestObject};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    use super::*;
    use crate::network::HealthState;
    use crate::service::{
        register_system_functions, CancellationRegistry, DispatchConfig, ExtensionPipeline,
        FunctionRegistry, InMemoryOperationRepository, OperationExecutor, OperationJob,
    };

    struct NoExecutor;

    #[async_trait]
    impl OperationExecutor for NoExecutor {
        async fn submit(&self, _job: OperationJob) -> anyhow::Result<()> {
            anyhow::bail!("no worker")
        }
    }

    fn make_module() -> NetworkModule {
        let registry = Arc::new(FunctionRegistry::new());
        let repository = Arc::new(InMemoryOperationRepository::new());
        register_system_functions(
            &registry,
            repository.clone(),
            Arc::new(CancellationRegistry::new()),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(
            DispatchConfig {
                node_id: "n1".into(),
                ..DispatchConfig::default()
            },
            registry,
            repository,
            ExtensionPipeline::default(),
            Arc::new(NoExecutor),
        );
        NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".into(),
                ..NetworkConfig::default()
            },
            Arc::new(dispatcher),
        )
    }

    #[test]
    fn new_does_not_bind() {
        let module = make_module();
        assert!(module.listener.is_none());
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn router_serves_rpc_and_probes() {
        let module = make_module();
        let router = module.build_router();

        let ready = router
            .clone()
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        module.shutdown_controller().set_ready();
        let body = Codec::Json
            .encode_request(&RequestObject::new("p1", "forrst.ping", json!({})))
            .unwrap();
        let response = router
            .oneshot(
                Request::post("/forrst")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut module = make_module();
        module.config.max_body_bytes = 16;
        module.shutdown_controller().set_ready();
        let response = module
            .build_router()
            .oneshot(
                Request::post("/forrst")
                    .header("content-type", "application/json")
                    .body(Body::from(vec![b' '; 1024]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = make_module()
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serves_then_drains_on_shutdown() {
        let mut module = make_module();
        let port = module.start().await.unwrap();
        assert!(port > 0);
        let controller = module.shutdown_controller();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async move {
            let _ = stop_rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET /health/live HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
