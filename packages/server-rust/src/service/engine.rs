//! Invokes a resolved function in its registered execution mode.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use forrst_core::{
    Arguments, CallContext, ErrorCode, ErrorInfo, Operation, OperationStatus, ResponseObject,
    ValidatedRequest, ValidationResult,
};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::error::DispatchError;
use super::function::{
    AsyncFunction, Function, FunctionDescriptor, Implementation, RegisteredFunction,
    StreamContext, StreamingFunction,
};
use super::operation::{update_operation, OperationJob, OperationRepository};
use super::stream::ResultStream;
use super::worker::OperationExecutor;

/// What executing a function produced.
pub enum Execution {
    /// Sync result, sync failure, or the handle of an accepted async call.
    Response(ResponseObject),
    /// Streamed result; nothing has run yet.
    Stream(ResultStream),
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Runs sync, streaming and async functions.
pub struct ExecutionEngine {
    repository: Arc<dyn OperationRepository>,
    executor: Arc<dyn OperationExecutor>,
    operation_ttl: chrono::Duration,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(
        repository: Arc<dyn OperationRepository>,
        executor: Arc<dyn OperationExecutor>,
        operation_ttl: chrono::Duration,
    ) -> Self {
        Self {
            repository,
            executor,
            operation_ttl,
        }
    }

    /// Validates arguments against the descriptor's schema, then invokes.
    ///
    /// Never fails: every failure, panics included, is folded into the
    /// returned response or stream.
    pub async fn execute(
        &self,
        function: &RegisteredFunction,
        request: &ValidatedRequest,
        ctx: &CallContext,
    ) -> Execution {
        let id = Some(request.id().to_string());
        if let ValidationResult::Invalid { errors } =
            function.descriptor.arguments.validate(request.arguments())
        {
            return Execution::Response(
                DispatchError::SchemaValidation { violations: errors }.into_response(id),
            );
        }

        let arguments = request.arguments().clone();
        match &function.implementation {
            Implementation::Sync(f) => {
                Execution::Response(Self::call_sync(f.as_ref(), arguments, ctx, id).await)
            }
            Implementation::Stream(f) => Execution::Stream(Self::open_stream(f.as_ref(), arguments, ctx)),
            Implementation::Async(f) => Execution::Response(
                self.start_async(Arc::clone(f), &function.descriptor, arguments, ctx, id)
                    .await,
            ),
        }
    }

    async fn call_sync(
        function: &dyn Function,
        arguments: Arguments,
        ctx: &CallContext,
        id: Option<String>,
    ) -> ResponseObject {
        match AssertUnwindSafe(function.call(arguments, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => ResponseObject::success(id, result),
            Ok(Err(err)) => err.into_response(id),
            Err(_) => {
                error!(request_id = id.as_deref(), "function panicked");
                ResponseObject::failure(id, ErrorInfo::internal())
            }
        }
    }

    fn open_stream(
        function: &dyn StreamingFunction,
        arguments: Arguments,
        ctx: &CallContext,
    ) -> ResultStream {
        let cancel = CancellationToken::new();
        let stream_ctx = StreamContext::new(ctx.clone(), cancel.clone());
        match std::panic::catch_unwind(AssertUnwindSafe(|| function.stream(arguments, stream_ctx))) {
            Ok(inner) => ResultStream::new(inner, cancel),
            Err(_) => ResultStream::failed(&DispatchError::Internal(anyhow::anyhow!(
                "stream producer panicked on start"
            ))),
        }
    }

    async fn start_async(
        &self,
        function: Arc<dyn AsyncFunction>,
        descriptor: &FunctionDescriptor,
        arguments: Arguments,
        ctx: &CallContext,
        id: Option<String>,
    ) -> ResponseObject {
        let now = Utc::now();
        let mut operation = Operation::new(
            descriptor.urn.clone(),
            descriptor.version.to_string(),
            ctx.caller_id().map(str::to_owned),
            now,
        );
        if let Some(expires_at) = now.checked_add_signed(self.operation_ttl) {
            operation = operation.with_expiry(expires_at);
        }
        if let Err(e) = self.repository.create(&operation).await {
            return DispatchError::from(e).into_response(id);
        }

        let operation_id = operation.id.clone();
        let job = OperationJob {
            operation_id: operation_id.clone(),
            function,
            arguments,
            context: ctx.clone(),
        };
        if let Err(e) = self.executor.submit(job).await {
            warn!(operation_id = %operation_id, error = %e, "operation could not be scheduled");
            let info = ErrorInfo::new(ErrorCode::Unavailable, "Operation could not be scheduled");
            let recorded = info.clone();
            // Queued operations only fail by way of processing.
            if let Err(e) = update_operation(self.repository.as_ref(), &operation_id, move |op| {
                let now = Utc::now();
                op.transition_to(OperationStatus::Processing, now)?;
                op.fail(vec![recorded], now)
            })
            .await
            {
                warn!(operation_id = %operation_id, error = %e, "unscheduled operation not marked failed");
            }
            return ResponseObject::failure(id, info.with_detail("operation_id", operation_id.as_str()));
        }

        debug!(operation_id = %operation_id, function = %descriptor.urn, "operation accepted");
        match serde_json::to_value(operation.handle()) {
            Ok(handle) => ResponseObject::success(id, handle),
            Err(e) => DispatchError::Internal(e.into()).into_response(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
