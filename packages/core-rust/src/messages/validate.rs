//! Request validation.
//!
//! [`validate`] is the only way to obtain a [`ValidatedRequest`]. The
//! validated form is immutable: the URN, version constraint, arguments and
//! extension options are fixed for the rest of the call.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::base::{PROTOCOL_NAME, SUPPORTED_PROTOCOL_VERSIONS};
use super::request::RequestObject;
use crate::error::{ErrorCode, ErrorInfo};
use crate::types::Arguments;
use crate::version::VersionConstraint;

static URN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]*([.:][a-z0-9][a-z0-9_-]*)*$").expect("urn pattern is valid")
});

/// Whether `urn` is a syntactically valid function name
/// (`app.user_list`, `forrst.operation.status`).
#[must_use]
pub fn is_valid_urn(urn: &str) -> bool {
    URN_PATTERN.is_match(urn)
}

// ---------------------------------------------------------------------------
// ProtocolError
// ---------------------------------------------------------------------------

/// Envelope-level failure: the bytes are not a document, or the document is
/// not an acceptable request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Request id, when the document got far enough to carry one.
        id: Option<String>,
        /// Dotted path of the offending field, if any.
        field: Option<&'static str>,
        reason: String,
    },
}

impl ProtocolError {
    fn invalid(id: &str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            id: Some(id.to_string()),
            field: Some(field),
            reason: reason.into(),
        }
    }

    /// Request id to echo back, if known.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Parse(_) => None,
            Self::InvalidRequest { id, .. } => id.as_deref(),
        }
    }

    /// Client-visible error entry.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Parse(reason) => ErrorInfo::new(ErrorCode::ParseError, reason.clone()),
            Self::InvalidRequest { field, reason, .. } => {
                let info = ErrorInfo::new(ErrorCode::InvalidRequest, reason.clone());
                match field {
                    Some(field) => info.with_detail("field", *field),
                    None => info,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationRules
// ---------------------------------------------------------------------------

/// What the receiving side accepts.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    /// Accepted `protocol.version` values.
    pub protocol_versions: Vec<String>,
    /// Extension names allowed as keys of the `extension` block.
    pub recognized_extensions: BTreeSet<String>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| (*v).to_string())
                .collect(),
            recognized_extensions: BTreeSet::new(),
        }
    }
}

impl ValidationRules {
    #[must_use]
    pub fn with_extensions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recognized_extensions
            .extend(names.into_iter().map(Into::into));
        self
    }
}

// ---------------------------------------------------------------------------
// ValidatedRequest
// ---------------------------------------------------------------------------

/// A request that passed validation. Read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    id: String,
    function: String,
    requested_version: Option<String>,
    constraint: VersionConstraint,
    arguments: Arguments,
    extensions: Map<String, Value>,
}

impl ValidatedRequest {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target function URN.
    #[must_use]
    pub fn function(&self) -> &str {
        &self.function
    }

    /// The raw `call.version` string, as sent.
    #[must_use]
    pub fn requested_version(&self) -> Option<&str> {
        self.requested_version.as_deref()
    }

    #[must_use]
    pub fn constraint(&self) -> &VersionConstraint {
        &self.constraint
    }

    #[must_use]
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    /// Options sent for one extension under `extension.<name>`.
    #[must_use]
    pub fn extension_options(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }

    #[must_use]
    pub fn extensions(&self) -> &Map<String, Value> {
        &self.extensions
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

/// Checks a parsed request against `rules`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidRequest`] when the protocol name or
/// version is not accepted, the function URN is malformed, `arguments` is not
/// an object, the `extension` block is not an object or names an unknown
/// extension, or the version constraint does not parse.
pub fn validate(
    request: RequestObject,
    rules: &ValidationRules,
) -> Result<ValidatedRequest, ProtocolError> {
    let RequestObject {
        protocol,
        id,
        call,
        extension,
    } = request;

    if id.trim().is_empty() {
        return Err(ProtocolError::invalid(&id, "id", "request id must not be empty"));
    }
    if protocol.name != PROTOCOL_NAME {
        return Err(ProtocolError::invalid(
            &id,
            "protocol.name",
            format!("expected protocol `{PROTOCOL_NAME}`, got `{}`", protocol.name),
        ));
    }
    if !rules.protocol_versions.iter().any(|v| *v == protocol.version) {
        return Err(ProtocolError::invalid(
            &id,
            "protocol.version",
            format!("unsupported protocol version `{}`", protocol.version),
        ));
    }
    if !is_valid_urn(&call.function) {
        return Err(ProtocolError::invalid(
            &id,
            "call.function",
            format!("malformed function urn `{}`", call.function),
        ));
    }
    let Value::Object(arguments) = call.arguments else {
        return Err(ProtocolError::invalid(
            &id,
            "call.arguments",
            "arguments must be an object",
        ));
    };
    let extensions = match extension {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(block)) => block,
        Some(_) => {
            return Err(ProtocolError::invalid(
                &id,
                "extension",
                "extension options must be an object",
            ))
        }
    };
    if let Some(unknown) = extensions
        .keys()
        .find(|key| !rules.recognized_extensions.contains(key.as_str()))
    {
        return Err(ProtocolError::invalid(
            &id,
            "extension",
            format!("unrecognized extension `{unknown}`"),
        ));
    }
    let constraint = VersionConstraint::parse(call.version.as_deref())
        .map_err(|e| ProtocolError::invalid(&id, "call.version", e.to_string()))?;

    Ok(ValidatedRequest {
        id,
        function: call.function,
        requested_version: call.version,
        constraint,
        arguments,
        extensions,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
