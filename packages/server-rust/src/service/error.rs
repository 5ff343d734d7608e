//! Dispatch failures and their mapping onto the wire error taxonomy.
//!
//! Every failure raised below the transport ends up as a [`DispatchError`].
//! [`DispatchError::to_error_info`] is the single place where a failure is
//! turned into a client-visible [`ErrorInfo`]; internal causes are logged
//! there and never copied into the response.

use forrst_core::{ErrorCode, ErrorInfo, OperationError, OperationStatus, ProtocolError, ResponseObject};
use serde_json::Value;

use super::operation::RepositoryError;

/// Failure anywhere in the dispatch path.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("function not found: {urn} ({constraint})")]
    FunctionNotFound { urn: String, constraint: String },
    #[error("invalid arguments: {message}")]
    InvalidArguments {
        message: String,
        details: Option<Value>,
    },
    #[error("arguments failed schema validation: {}", violations.join("; "))]
    SchemaValidation { violations: Vec<String> },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("operation not found: {0}")]
    OperationNotFound(String),
    #[error("unknown cancellation target: {0}")]
    CancellationTokenUnknown(String),
    #[error("operation {id} is already {status}")]
    CancellationTooLate { id: String, status: OperationStatus },
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("call cancelled")]
    Cancelled,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("dependency failed: {0}")]
    Dependency(String),
    #[error("extension `{extension}` failed: {reason}")]
    Extension {
        extension: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    /// A failure the function chose to report verbatim, including custom codes.
    #[error("{0}")]
    Application(ErrorInfo),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Shorthand for [`DispatchError::InvalidArguments`] without details.
    #[must_use]
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
            details: None,
        }
    }

    /// Wire error code this failure maps to.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(ProtocolError::Parse(_)) => ErrorCode::ParseError,
            Self::Protocol(ProtocolError::InvalidRequest { .. }) => ErrorCode::InvalidRequest,
            Self::FunctionNotFound { .. } | Self::OperationNotFound(_) => {
                ErrorCode::FunctionNotFound
            }
            Self::InvalidArguments { .. } => ErrorCode::InvalidArguments,
            Self::SchemaValidation { .. } => ErrorCode::SchemaValidationFailed,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::CancellationTokenUnknown(_) => ErrorCode::CancellationTokenUnknown,
            Self::CancellationTooLate { .. } => ErrorCode::CancellationTooLate,
            Self::Timeout { .. } | Self::Overloaded | Self::Cancelled | Self::Unavailable(_) => {
                ErrorCode::Unavailable
            }
            Self::Dependency(_) => ErrorCode::DependencyError,
            Self::Operation(OperationError::MalformedId(_) | OperationError::UnknownStatus(_)) => {
                ErrorCode::InvalidArguments
            }
            Self::Repository(RepositoryError::NotFound(_)) => ErrorCode::FunctionNotFound,
            Self::Repository(RepositoryError::InvalidCursor(_)) => ErrorCode::InvalidArguments,
            Self::Repository(RepositoryError::Backend(_)) => ErrorCode::DependencyError,
            Self::Application(info) => info.code.clone(),
            Self::Operation(_)
            | Self::Repository(_)
            | Self::Extension { .. }
            | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Client-visible error entry.
    ///
    /// Failures that map to `INTERNAL_ERROR` are logged with their full cause
    /// and replaced by a generic message.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        let code = self.code();
        match self {
            Self::Protocol(err) => err.to_error_info(),
            Self::Application(info) => info.clone(),
            Self::InvalidArguments { message, details } => {
                let info = ErrorInfo::new(code, message.clone());
                match details {
                    Some(details) => info.with_details(details.clone()),
                    None => info,
                }
            }
            Self::SchemaValidation { violations } => {
                ErrorInfo::new(code, "Arguments failed schema validation")
                    .with_detail("violations", violations.clone())
            }
            Self::RateLimited { retry_after_ms } => {
                ErrorInfo::new(code, "Rate limit exceeded")
                    .with_detail("retry_after_ms", *retry_after_ms)
            }
            Self::OperationNotFound(id) => {
                ErrorInfo::new(code, "Operation not found").with_detail("operation_id", id.as_str())
            }
            Self::CancellationTooLate { id, status } => ErrorInfo::new(code, self.to_string())
                .with_detail("operation_id", id.as_str())
                .with_detail("status", status.as_str()),
            Self::Repository(RepositoryError::Backend(cause)) => {
                tracing::warn!(error = %cause, "operation store failure");
                ErrorInfo::new(code, "Operation store unavailable")
            }
            _ if code == ErrorCode::InternalError => {
                tracing::error!(error = %self, "internal dispatch failure");
                ErrorInfo::internal()
            }
            _ => ErrorInfo::new(code, self.to_string()),
        }
    }

    /// Failure response for request `id`.
    #[must_use]
    pub fn into_response(self, id: Option<String>) -> ResponseObject {
        ResponseObject::failure(id, self.to_error_info())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
