//! Request lifecycle: parse, hooks, resolution, execution, hooks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use forrst_core::{CallContext, Codec, ResponseObject, ValidatedRequest, ValidationRules};
use serde_json::json;
use tower::Service;
use tracing::debug;

use super::config::DispatchConfig;
use super::engine::{Execution, ExecutionEngine};
use super::error::DispatchError;
use super::extension::{ExecutingFunction, ExtensionPipeline, HookOutcome, RequestValidated};
use super::function::FunctionDescriptor;
use super::operation::OperationRepository;
use super::registry::FunctionRegistry;
use super::stream::ResultStream;
use super::worker::OperationExecutor;

// ---------------------------------------------------------------------------
// DispatchOutcome
// ---------------------------------------------------------------------------

/// What the transport sends back for one call.
pub enum DispatchOutcome {
    Response(ResponseObject),
    /// A streamed call. `response` is the acknowledgement after
    /// `FunctionExecuted` hooks ran on it; transports may surface its `meta`.
    Stream {
        id: String,
        response: ResponseObject,
        stream: ResultStream,
    },
}

impl DispatchOutcome {
    /// The response, if this is not a stream.
    #[must_use]
    pub fn response(&self) -> Option<&ResponseObject> {
        match self {
            Self::Response(response) => Some(response),
            Self::Stream { .. } => None,
        }
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream { .. })
    }
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Self::Stream { id, .. } => f.debug_struct("Stream").field("id", id).finish_non_exhaustive(),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Drives one call through the full lifecycle.
///
/// All collaborators are injected; the dispatcher holds no global state.
pub struct Dispatcher {
    config: DispatchConfig,
    rules: ValidationRules,
    registry: Arc<FunctionRegistry>,
    extensions: ExtensionPipeline,
    engine: ExecutionEngine,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: DispatchConfig,
        registry: Arc<FunctionRegistry>,
        repository: Arc<dyn OperationRepository>,
        extensions: ExtensionPipeline,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        let rules = ValidationRules::default().with_extensions(extensions.names());
        let engine = ExecutionEngine::new(repository, executor, config.operation_ttl());
        Self {
            config,
            rules,
            registry,
            extensions,
            engine,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Handles raw request bytes. Never fails: every failure becomes a
    /// response, with `id: null` when the id could not be read.
    pub async fn dispatch(&self, raw: &[u8], codec: Codec, ctx: CallContext) -> DispatchOutcome {
        let request = match forrst_core::parse(raw, codec, &self.rules) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "request rejected");
                let id = err.request_id().map(str::to_owned);
                return DispatchOutcome::Response(DispatchError::from(err).into_response(id));
            }
        };
        self.dispatch_validated(&request, &ctx).await
    }

    /// Handles an already validated request.
    pub async fn dispatch_validated(
        &self,
        request: &ValidatedRequest,
        ctx: &CallContext,
    ) -> DispatchOutcome {
        debug!(
            request_id = request.id(),
            function = request.function(),
            caller = ctx.caller_id().unwrap_or("anonymous"),
            "dispatching call"
        );
        match self.run(request, ctx).await {
            Ok(outcome) => outcome,
            // Hook failures skip the remaining hooks.
            Err(err) => DispatchOutcome::Response(err.into_response(Some(request.id().to_string()))),
        }
    }

    async fn run(
        &self,
        request: &ValidatedRequest,
        ctx: &CallContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        let id = Some(request.id().to_string());

        let validated = RequestValidated {
            request,
            context: ctx,
        };
        if let HookOutcome::StopPropagation(response) =
            self.extensions.request_validated(&validated).await?
        {
            return self.finish(request, ctx, None, response, true).await;
        }

        let function = match self.registry.resolve(request.function(), request.constraint()) {
            Ok(function) => function,
            Err(err) => {
                debug!(function = request.function(), error = %err, "resolution failed");
                return self.finish(request, ctx, None, err.into_response(id), false).await;
            }
        };
        let descriptor = &function.descriptor;

        let executing = ExecutingFunction {
            request,
            context: ctx,
            descriptor,
        };
        if let HookOutcome::StopPropagation(response) =
            self.extensions.executing_function(&executing).await?
        {
            return self.finish(request, ctx, Some(descriptor), response, true).await;
        }

        match self.engine.execute(&function, request, ctx).await {
            Execution::Response(response) => {
                self.finish(request, ctx, Some(descriptor), response, false).await
            }
            Execution::Stream(stream) => {
                let ack = ResponseObject::success(id, json!({ "streaming": true }));
                let response = self
                    .extensions
                    .function_executed(request, ctx, Some(descriptor), ack, false)
                    .await?;
                if !response.is_success() {
                    // Dropping the stream cancels it before it produced anything.
                    return Ok(DispatchOutcome::Response(response));
                }
                Ok(DispatchOutcome::Stream {
                    id: request.id().to_string(),
                    response,
                    stream,
                })
            }
        }
    }

    async fn finish(
        &self,
        request: &ValidatedRequest,
        ctx: &CallContext,
        descriptor: Option<&FunctionDescriptor>,
        response: ResponseObject,
        short_circuited: bool,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.extensions
            .function_executed(request, ctx, descriptor, response, short_circuited)
            .await
            .map(DispatchOutcome::Response)
    }
}

// ---------------------------------------------------------------------------
// Tower service
// ---------------------------------------------------------------------------

/// One call as handed over by a transport.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub payload: Bytes,
    pub codec: Codec,
    pub context: CallContext,
    /// Deadline for producing the outcome, enforced by the timeout layer.
    pub timeout_ms: u64,
}

impl InboundCall {
    #[must_use]
    pub fn new(payload: Bytes, codec: Codec, context: CallContext, timeout_ms: u64) -> Self {
        Self {
            payload,
            codec,
            context,
            timeout_ms,
        }
    }

    /// Best-effort request id, for answering middleware rejections.
    #[must_use]
    pub fn request_id(&self) -> Option<String> {
        self.codec
            .parse_request(&self.payload)
            .ok()
            .map(|request| request.id)
    }
}

/// [`Dispatcher`] as a `tower::Service<InboundCall>`.
#[derive(Clone)]
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchService {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl Service<InboundCall> for DispatchService {
    type Response = DispatchOutcome;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: InboundCall) -> Self::Future {
        let dispatcher = Arc::clone(&self.dispatcher);
        Box::pin(async move {
            Ok(dispatcher
                .dispatch(&call.payload, call.codec, call.context)
                .await)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use forrst_core::{Arguments, ErrorCode, ErrorInfo, RequestObject, StreamChunk};
    use futures_util::StreamExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::service::extension::{Extension, FunctionExecuted, TimingExtension};
    use crate::service::function::{
        Function, Implementation, ItemStream, StreamContext, StreamItem, StreamingFunction,
    };
    use crate::service::operation::{InMemoryOperationRepository, OperationJob};

    struct Counter {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Function for Counter {
        async fn call(&self, _arguments: Arguments, _ctx: &CallContext) -> Result<Value, DispatchError> {
            Ok(json!(self.calls.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    struct Ticker;

    impl StreamingFunction for Ticker {
        fn stream(&self, _arguments: Arguments, _ctx: StreamContext) -> ItemStream {
            Box::pin(futures_util::stream::iter(vec![Ok(StreamItem::Data(json!("tick")))]))
        }
    }

    struct NoExecutor;

    #[async_trait]
    impl OperationExecutor for NoExecutor {
        async fn submit(&self, _job: OperationJob) -> anyhow::Result<()> {
            anyhow::bail!("no worker")
        }
    }

    /// Answers `FORBIDDEN` at `RequestValidated` when `early`, otherwise at
    /// `ExecutingFunction`.
    struct Gate {
        early: bool,
    }

    fn forbidden(request: &ValidatedRequest) -> HookOutcome {
        HookOutcome::StopPropagation(ResponseObject::failure(
            Some(request.id().to_string()),
            ErrorInfo::new(ErrorCode::Forbidden, "closed"),
        ))
    }

    #[async_trait]
    impl Extension for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }

        async fn on_request_validated(
            &self,
            event: &RequestValidated<'_>,
        ) -> Result<HookOutcome, DispatchError> {
            Ok(if self.early {
                forbidden(event.request)
            } else {
                HookOutcome::Continue
            })
        }

        async fn on_executing_function(
            &self,
            event: &ExecutingFunction<'_>,
        ) -> Result<HookOutcome, DispatchError> {
            Ok(forbidden(event.request))
        }
    }

    /// What one `FunctionExecuted` hook saw.
    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        short_circuited: bool,
        function: Option<String>,
        code: Option<ErrorCode>,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Arc<parking_lot::Mutex<Vec<Seen>>>,
    }

    #[async_trait]
    impl Extension for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn on_function_executed(
            &self,
            event: &FunctionExecuted<'_>,
        ) -> Result<Option<ResponseObject>, DispatchError> {
            self.seen.lock().push(Seen {
                short_circuited: event.short_circuited,
                function: event.descriptor.map(|d| d.urn.clone()),
                code: event.response.primary_error().map(|e| e.code.clone()),
            });
            Ok(None)
        }
    }

    /// Turns every response into `DEPENDENCY_ERROR`.
    struct Sabotage;

    #[async_trait]
    impl Extension for Sabotage {
        fn name(&self) -> &'static str {
            "sabotage"
        }

        async fn on_function_executed(
            &self,
            event: &FunctionExecuted<'_>,
        ) -> Result<Option<ResponseObject>, DispatchError> {
            Ok(Some(ResponseObject::failure(
                event.response.id().map(str::to_owned),
                ErrorInfo::new(ErrorCode::DependencyError, "sabotaged"),
            )))
        }
    }

    fn make_dispatcher(extensions: ExtensionPipeline) -> (Dispatcher, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(FunctionRegistry::new());
        registry
            .register(
                FunctionDescriptor::new("app.count", "1.0.0").unwrap(),
                Implementation::sync(Counter {
                    calls: Arc::clone(&calls),
                }),
            )
            .unwrap();
        registry
            .register(
                FunctionDescriptor::new("app.ticks", "1.0.0").unwrap(),
                Implementation::stream(Ticker),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(
            DispatchConfig::default(),
            registry,
            Arc::new(InMemoryOperationRepository::new()),
            extensions,
            Arc::new(NoExecutor),
        );
        (dispatcher, calls)
    }

    fn encode(request: &RequestObject) -> Vec<u8> {
        Codec::Json.encode_request(request).unwrap()
    }

    async fn call(dispatcher: &Dispatcher, request: &RequestObject) -> ResponseObject {
        match dispatcher
            .dispatch(&encode(request), Codec::Json, CallContext::system("n1"))
            .await
        {
            DispatchOutcome::Response(response) => response,
            DispatchOutcome::Stream { .. } => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn sync_call_round_trip() {
        let (dispatcher, calls) = make_dispatcher(ExtensionPipeline::default());
        let response = call(&dispatcher, &RequestObject::new("r1", "app.count", json!({}))).await;
        assert_eq!(response.result(), Some(&json!(1)));
        assert_eq!(response.id(), Some("r1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unparseable_body_has_null_id() {
        let (dispatcher, _) = make_dispatcher(ExtensionPipeline::default());
        let DispatchOutcome::Response(response) = dispatcher
            .dispatch(b"{not json", Codec::Json, CallContext::system("n1"))
            .await
        else {
            panic!("expected a response");
        };
        assert_eq!(response.id(), None);
        assert_eq!(response.primary_error().unwrap().code, ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn unknown_function_flows_through_hooks() {
        let (dispatcher, _) =
            make_dispatcher(ExtensionPipeline::default().with(TimingExtension));
        let response = call(&dispatcher, &RequestObject::new("r2", "app.nope", json!({}))).await;
        assert_eq!(
            response.primary_error().unwrap().code,
            ErrorCode::FunctionNotFound
        );
        assert!(response.meta().unwrap().contains_key("duration_ms"));
    }

    #[tokio::test]
    async fn stop_at_executing_function_skips_invocation() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let (dispatcher, calls) = make_dispatcher(
            ExtensionPipeline::default()
                .with(Gate { early: false })
                .with(recorder),
        );
        let response = call(&dispatcher, &RequestObject::new("r3", "app.count", json!({}))).await;
        assert_eq!(response.primary_error().unwrap().code, ErrorCode::Forbidden);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            *seen.lock(),
            vec![Seen {
                short_circuited: true,
                function: Some("app.count".into()),
                code: Some(ErrorCode::Forbidden),
            }]
        );
    }

    #[tokio::test]
    async fn stop_at_request_validated_still_fires_function_executed() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let (dispatcher, calls) = make_dispatcher(
            ExtensionPipeline::default()
                .with(Gate { early: true })
                .with(recorder)
                .with(TimingExtension),
        );
        let response = call(&dispatcher, &RequestObject::new("r3b", "app.count", json!({}))).await;
        assert_eq!(response.primary_error().unwrap().code, ErrorCode::Forbidden);
        assert_eq!(response.id(), Some("r3b"));
        assert!(response.meta().unwrap().contains_key("duration_ms"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            *seen.lock(),
            vec![Seen {
                short_circuited: true,
                function: None,
                code: Some(ErrorCode::Forbidden),
            }]
        );
    }

    #[tokio::test]
    async fn completed_call_is_not_short_circuited() {
        let recorder = Recorder::default();
        let seen = Arc::clone(&recorder.seen);
        let (dispatcher, _) = make_dispatcher(ExtensionPipeline::default().with(recorder));
        call(&dispatcher, &RequestObject::new("r3c", "app.count", json!({}))).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].short_circuited);
        assert_eq!(seen[0].code, None);
    }

    #[tokio::test]
    async fn unknown_extension_key_is_invalid_request() {
        let (dispatcher, _) = make_dispatcher(ExtensionPipeline::default());
        let request =
            RequestObject::new("r4", "app.count", json!({})).with_extension("mystery", json!({}));
        let response = call(&dispatcher, &request).await;
        assert_eq!(
            response.primary_error().unwrap().code,
            ErrorCode::InvalidRequest
        );
        assert_eq!(response.id(), Some("r4"));
    }

    #[tokio::test]
    async fn streamed_call_returns_stream_with_ack() {
        let (dispatcher, _) =
            make_dispatcher(ExtensionPipeline::default().with(TimingExtension));
        let outcome = dispatcher
            .dispatch(
                &encode(&RequestObject::new("r5", "app.ticks", json!({}))),
                Codec::Json,
                CallContext::system("n1"),
            )
            .await;
        let DispatchOutcome::Stream { id, response, stream } = outcome else {
            panic!("expected a stream");
        };
        assert_eq!(id, "r5");
        assert!(response.meta().unwrap().contains_key("duration_ms"));
        let chunks: Vec<StreamChunk> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn hook_replacing_stream_ack_cancels_stream() {
        let (dispatcher, _) = make_dispatcher(ExtensionPipeline::default().with(Sabotage));
        let outcome = dispatcher
            .dispatch(
                &encode(&RequestObject::new("r6", "app.ticks", json!({}))),
                Codec::Json,
                CallContext::system("n1"),
            )
            .await;
        let response = outcome.response().unwrap();
        assert_eq!(
            response.primary_error().unwrap().code,
            ErrorCode::DependencyError
        );
    }

    #[tokio::test]
    async fn tower_service_wraps_dispatch() {
        let (dispatcher, _) = make_dispatcher(ExtensionPipeline::default());
        let svc = DispatchService::new(Arc::new(dispatcher));
        let inbound = InboundCall::new(
            Bytes::from(encode(&RequestObject::new("r7", "app.count", json!({})))),
            Codec::Json,
            CallContext::system("n1"),
            1000,
        );
        assert_eq!(inbound.request_id().as_deref(), Some("r7"));
        let outcome = svc.oneshot(inbound).await.unwrap();
        assert!(outcome.response().unwrap().is_success());
    }
}
