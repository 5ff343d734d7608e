use std::sync::Arc;

use chrono::Utc;
use forrst_core::{Arguments, CallContext, OperationId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::repository::{update_operation, OperationRepository, UpdateError};
use crate::service::function::AsyncFunction;

/// One deferred call handed to an [`OperationExecutor`](crate::service::worker::OperationExecutor).
pub struct OperationJob {
    pub operation_id: OperationId,
    pub function: Arc<dyn AsyncFunction>,
    pub arguments: Arguments,
    pub context: CallContext,
}

impl std::fmt::Debug for OperationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationJob")
            .field("operation_id", &self.operation_id)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Writes progress for a running operation through the repository.
#[derive(Clone)]
pub struct ProgressReporter {
    repository: Arc<dyn OperationRepository>,
    operation_id: OperationId,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(repository: Arc<dyn OperationRepository>, operation_id: OperationId) -> Self {
        Self {
            repository,
            operation_id,
        }
    }

    /// Records a completion ratio, clamped to `0.0..=1.0`.
    ///
    /// # Errors
    ///
    /// Fails once the operation has left the running state (cancelled or
    /// expired); callers usually treat that as a signal to stop.
    pub async fn report(&self, progress: f64) -> Result<(), UpdateError> {
        update_operation(self.repository.as_ref(), &self.operation_id, |op| {
            op.set_progress(progress, Utc::now())
        })
        .await
        .map(|_| ())
    }

    /// Records progress together with a status message in `metadata.message`.
    ///
    /// # Errors
    ///
    /// Same as [`report`](Self::report).
    pub async fn report_with_message(
        &self,
        progress: f64,
        message: impl Into<String>,
    ) -> Result<(), UpdateError> {
        let message = Value::String(message.into());
        update_operation(self.repository.as_ref(), &self.operation_id, move |op| {
            let now = Utc::now();
            op.set_progress(progress, now)?;
            op.set_metadata("message", message, now)
        })
        .await
        .map(|_| ())
    }
}

/// What an [`AsyncFunction`] sees while it runs.
#[derive(Clone)]
pub struct JobContext {
    pub operation_id: OperationId,
    pub call: CallContext,
    pub progress: ProgressReporter,
    cancel: CancellationToken,
}

impl JobContext {
    #[must_use]
    pub fn new(
        operation_id: OperationId,
        call: CallContext,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            operation_id,
            call,
            progress,
            cancel,
        }
    }

    /// True once `forrst.operation.cancel`, expiry or shutdown fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the operation is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}
