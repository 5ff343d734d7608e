//! `forrst.operation.*` system functions: status, list and cancel.
//!
//! All three are scoped to the caller: an identified caller only sees
//! operations it created. An operation outside the caller's scope is
//! reported exactly like an unknown one.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use forrst_core::{
    ArgumentSchema, Arguments, CallContext, FieldKind, Operation, OperationId, OperationStatus,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::cancellation::CancellationRegistry;
use super::repository::{
    update_operation, ListQuery, OperationRepository, RepositoryError, UpdateError,
};
use crate::service::error::DispatchError;
use crate::service::function::{DescriptorError, Function, FunctionDescriptor};

pub const STATUS_URN: &str = "forrst.operation.status";
pub const LIST_URN: &str = "forrst.operation.list";
pub const CANCEL_URN: &str = "forrst.operation.cancel";

/// Largest `limit` argument accepted by `forrst.operation.list`. The
/// repository still caps the page itself.
pub const MAX_REQUESTED_LIMIT: u64 = 100;

/// Attempts at cancelling before a concurrent writer is assumed to have won.
const CANCEL_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn operation_id_arg(arguments: &Arguments) -> Result<OperationId, DispatchError> {
    let raw = arguments
        .get("operation_id")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::invalid_arguments("`operation_id` must be a string"))?;
    OperationId::parse(raw).map_err(|e| DispatchError::InvalidArguments {
        message: e.to_string(),
        details: Some(json!({ "field": "operation_id" })),
    })
}

fn optional_str<'a>(arguments: &'a Arguments, name: &str) -> Option<&'a str> {
    arguments.get(name).and_then(Value::as_str)
}

/// Loads `id` if it exists and the caller may see it.
async fn find_visible(
    repository: &dyn OperationRepository,
    id: &OperationId,
    ctx: &CallContext,
) -> Result<Option<Operation>, DispatchError> {
    match repository.find(id).await {
        Ok(op) if ctx.caller.owner_scope().permits(op.caller_id.as_deref()) => Ok(Some(op)),
        Ok(_) | Err(RepositoryError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|e| DispatchError::Internal(e.into()))
}

// ---------------------------------------------------------------------------
// forrst.operation.status
// ---------------------------------------------------------------------------

/// Returns the full record of one operation.
pub struct OperationStatusFunction {
    repository: Arc<dyn OperationRepository>,
}

impl OperationStatusFunction {
    #[must_use]
    pub fn new(repository: Arc<dyn OperationRepository>) -> Self {
        Self { repository }
    }

    /// # Errors
    ///
    /// Never fails for the built-in URN and version.
    pub fn descriptor() -> Result<FunctionDescriptor, DescriptorError> {
        Ok(FunctionDescriptor::new(STATUS_URN, "1.0.0")?
            .with_description("Returns the current record of an async operation")
            .with_arguments(ArgumentSchema::new().required("operation_id", FieldKind::String)))
    }
}

#[async_trait]
impl Function for OperationStatusFunction {
    async fn call(&self, arguments: Arguments, ctx: &CallContext) -> Result<Value, DispatchError> {
        let id = operation_id_arg(&arguments)?;
        let operation = find_visible(self.repository.as_ref(), &id, ctx)
            .await?
            .ok_or_else(|| DispatchError::OperationNotFound(id.to_string()))?;
        to_value(&operation)
    }
}

// ---------------------------------------------------------------------------
// forrst.operation.list
// ---------------------------------------------------------------------------

/// Pages through the caller's operations.
pub struct OperationListFunction {
    repository: Arc<dyn OperationRepository>,
}

impl OperationListFunction {
    #[must_use]
    pub fn new(repository: Arc<dyn OperationRepository>) -> Self {
        Self { repository }
    }

    /// # Errors
    ///
    /// Never fails for the built-in URN and version.
    pub fn descriptor() -> Result<FunctionDescriptor, DescriptorError> {
        Ok(FunctionDescriptor::new(LIST_URN, "1.0.0")?
            .with_description("Lists the caller's async operations, oldest first")
            .with_arguments(
                ArgumentSchema::new()
                    .optional("status", FieldKind::String)
                    .optional("function", FieldKind::String)
                    .optional("limit", FieldKind::Integer)
                    .optional("cursor", FieldKind::String),
            ))
    }

    fn query(arguments: &Arguments, ctx: &CallContext) -> Result<ListQuery, DispatchError> {
        let mut query = ListQuery::new(ctx.caller.owner_scope());
        if let Some(status) = optional_str(arguments, "status") {
            query.status = Some(OperationStatus::from_str(status)?);
        }
        query.function = optional_str(arguments, "function").map(str::to_owned);
        query.cursor = optional_str(arguments, "cursor").map(str::to_owned);
        match arguments.get("limit") {
            None | Some(Value::Null) => {}
            Some(limit) => {
                let limit = limit
                    .as_u64()
                    .filter(|n| (1..=MAX_REQUESTED_LIMIT).contains(n))
                    .ok_or_else(|| DispatchError::InvalidArguments {
                        message: format!("`limit` must be between 1 and {MAX_REQUESTED_LIMIT}"),
                        details: Some(json!({ "field": "limit" })),
                    })?;
                query.limit = usize::try_from(limit).unwrap_or(usize::MAX);
            }
        }
        Ok(query)
    }
}

#[async_trait]
impl Function for OperationListFunction {
    async fn call(&self, arguments: Arguments, ctx: &CallContext) -> Result<Value, DispatchError> {
        let query = Self::query(&arguments, ctx)?;
        let page = self.repository.list(&query).await?;

        let mut result = Map::new();
        result.insert("operations".into(), to_value(&page.items)?);
        if let Some(cursor) = page.next_cursor {
            result.insert("next_cursor".into(), Value::String(cursor));
        }
        Ok(Value::Object(result))
    }
}

// ---------------------------------------------------------------------------
// forrst.operation.cancel
// ---------------------------------------------------------------------------

/// Moves a live operation to `cancelled` and fires its token.
pub struct OperationCancelFunction {
    repository: Arc<dyn OperationRepository>,
    cancellations: Arc<CancellationRegistry>,
}

impl OperationCancelFunction {
    #[must_use]
    pub fn new(
        repository: Arc<dyn OperationRepository>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            repository,
            cancellations,
        }
    }

    /// # Errors
    ///
    /// Never fails for the built-in URN and version.
    pub fn descriptor() -> Result<FunctionDescriptor, DescriptorError> {
        Ok(FunctionDescriptor::new(CANCEL_URN, "1.0.0")?
            .with_description("Requests cooperative cancellation of an async operation")
            .with_arguments(ArgumentSchema::new().required("operation_id", FieldKind::String)))
    }
}

#[async_trait]
impl Function for OperationCancelFunction {
    async fn call(&self, arguments: Arguments, ctx: &CallContext) -> Result<Value, DispatchError> {
        let id = operation_id_arg(&arguments)?;

        for _ in 0..CANCEL_ATTEMPTS {
            let operation = find_visible(self.repository.as_ref(), &id, ctx)
                .await?
                .ok_or_else(|| DispatchError::CancellationTokenUnknown(id.to_string()))?;
            if operation.is_terminal() {
                return Err(DispatchError::CancellationTooLate {
                    id: id.to_string(),
                    status: operation.status,
                });
            }

            match update_operation(self.repository.as_ref(), &id, |op| {
                op.transition_to(OperationStatus::Cancelled, Utc::now())
            })
            .await
            {
                Ok(updated) => {
                    let signalled = self.cancellations.cancel(&id);
                    debug!(operation_id = %id, signalled, "operation cancelled");
                    return to_value(&updated.handle());
                }
                // Someone else moved it between our read and write; look again.
                Err(UpdateError::Repository(RepositoryError::Conflict { .. }))
                | Err(UpdateError::Operation(_)) => {}
                Err(UpdateError::Repository(e)) => return Err(e.into()),
            }
        }
        Err(DispatchError::Unavailable(format!(
            "operation {id} kept changing while being cancelled"
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
