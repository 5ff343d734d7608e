//! Callable function contracts and the descriptors they are registered under.
//!
//! A function is registered with exactly one execution mode, expressed by
//! which trait it implements:
//!
//! - [`Function`]: request/response, the result is returned inline.
//! - [`StreamingFunction`]: emits progress and data items, then finishes.
//! - [`AsyncFunction`]: runs in the background; the caller gets an operation
//!   handle and polls `forrst.operation.status`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use forrst_core::messages::is_valid_urn;
use forrst_core::{ArgumentSchema, Arguments, CallContext, ErrorCode};
use futures_util::stream::BoxStream;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::DispatchError;
use super::operation::JobContext;

// ---------------------------------------------------------------------------
// Function traits
// ---------------------------------------------------------------------------

/// Request/response function.
#[async_trait]
pub trait Function: Send + Sync {
    /// Produces the call result.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`] becomes the response's primary error.
    async fn call(&self, arguments: Arguments, ctx: &CallContext) -> Result<Value, DispatchError>;
}

/// One item produced by a [`StreamingFunction`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Progress {
        progress: f64,
        message: Option<String>,
    },
    Data(Value),
    /// Ends the stream, optionally with a final result.
    Done(Option<Value>),
}

/// Items of a streamed call. An `Err` item ends the stream.
pub type ItemStream = BoxStream<'static, Result<StreamItem, DispatchError>>;

/// Context handed to a [`StreamingFunction`].
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub call: CallContext,
    cancel: CancellationToken,
}

impl StreamContext {
    #[must_use]
    pub fn new(call: CallContext, cancel: CancellationToken) -> Self {
        Self { call, cancel }
    }

    /// Set once the consumer has gone away.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when the consumer drops the stream.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Function that streams its result.
pub trait StreamingFunction: Send + Sync {
    /// Starts producing items. The stream should stop early once
    /// [`StreamContext::is_cancelled`] turns true.
    fn stream(&self, arguments: Arguments, ctx: StreamContext) -> ItemStream;
}

/// Function executed in the background under an operation record.
#[async_trait]
pub trait AsyncFunction: Send + Sync {
    /// Runs to completion. Cancellation is cooperative: implementations
    /// should check [`JobContext::is_cancelled`] between units of work.
    ///
    /// # Errors
    ///
    /// An error moves the operation to `failed` with the error recorded.
    async fn run(&self, arguments: Arguments, job: JobContext) -> Result<Value, DispatchError>;
}

// ---------------------------------------------------------------------------
// Implementation / ExecutionMode
// ---------------------------------------------------------------------------

/// How a function produces its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sync,
    Stream,
    Async,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sync => "sync",
            Self::Stream => "stream",
            Self::Async => "async",
        })
    }
}

/// A registered function body.
#[derive(Clone)]
pub enum Implementation {
    Sync(Arc<dyn Function>),
    Stream(Arc<dyn StreamingFunction>),
    Async(Arc<dyn AsyncFunction>),
}

impl Implementation {
    #[must_use]
    pub fn sync(function: impl Function + 'static) -> Self {
        Self::Sync(Arc::new(function))
    }

    #[must_use]
    pub fn stream(function: impl StreamingFunction + 'static) -> Self {
        Self::Stream(Arc::new(function))
    }

    #[must_use]
    pub fn deferred(function: impl AsyncFunction + 'static) -> Self {
        Self::Async(Arc::new(function))
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Sync(_) => ExecutionMode::Sync,
            Self::Stream(_) => ExecutionMode::Stream,
            Self::Async(_) => ExecutionMode::Async,
        }
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Implementation::{}", self.mode())
    }
}

// ---------------------------------------------------------------------------
// FunctionDescriptor
// ---------------------------------------------------------------------------

/// Rejected descriptor input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("malformed function urn `{0}`")]
    InvalidUrn(String),
    #[error("invalid version `{input}`: {reason}")]
    InvalidVersion { input: String, reason: String },
}

/// Static metadata for one registered `(urn, version)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDescriptor {
    pub urn: String,
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub arguments: ArgumentSchema,
    /// Free-form description of the result shape, for discovery only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error codes the function may return besides the standard set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorCode>,
    /// Deprecation notice. `Some` marks the version as deprecated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
}

impl FunctionDescriptor {
    /// Creates a descriptor with an empty argument schema.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] if `urn` is malformed or `version` is not a
    /// full semantic version.
    pub fn new(urn: impl Into<String>, version: &str) -> Result<Self, DescriptorError> {
        let urn = urn.into();
        if !is_valid_urn(&urn) {
            return Err(DescriptorError::InvalidUrn(urn));
        }
        let version = Version::parse(version).map_err(|e| DescriptorError::InvalidVersion {
            input: version.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            urn,
            version,
            description: None,
            arguments: ArgumentSchema::default(),
            result: None,
            errors: Vec::new(),
            deprecated: None,
        })
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: ArgumentSchema) -> Self {
        self.arguments = arguments;
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn with_errors(mut self, errors: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.errors.extend(errors);
        self
    }

    #[must_use]
    pub fn deprecated(mut self, notice: impl Into<String>) -> Self {
        self.deprecated = Some(notice.into());
        self
    }
}

/// A descriptor paired with its implementation, as held by the registry.
#[derive(Debug, Clone)]
pub struct RegisteredFunction {
    pub descriptor: FunctionDescriptor,
    pub implementation: Implementation,
}

impl RegisteredFunction {
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.implementation.mode()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
