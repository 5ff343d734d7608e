//! Error taxonomy shared by every protocol response.
//!
//! The standard codes form a closed set, each tagged as a client or server
//! failure. Any other code string is carried verbatim as [`ErrorCode::Custom`]
//! and classified as [`ErrorClass::Unclassified`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Which side of the call a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The caller sent something the server will not accept.
    Client,
    /// The server or one of its dependencies failed.
    Server,
    /// A free-form code: failed, but neither client nor server.
    Unclassified,
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Protocol error code.
///
/// Serializes to `SCREAMING_SNAKE_CASE` strings (`"FUNCTION_NOT_FOUND"`).
/// Unknown strings deserialize into [`ErrorCode::Custom`] so that a
/// serialize/parse round trip never changes the classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    FunctionNotFound,
    InvalidArguments,
    SchemaValidationFailed,
    Unauthorized,
    Forbidden,
    RateLimited,
    CancellationTokenUnknown,
    CancellationTooLate,
    InternalError,
    Unavailable,
    DependencyError,
    /// Application-defined code outside the standard taxonomy.
    Custom(String),
}

impl ErrorCode {
    /// Every standard (non-custom) code, in taxonomy order.
    pub const STANDARD: [ErrorCode; 13] = [
        ErrorCode::ParseError,
        ErrorCode::InvalidRequest,
        ErrorCode::FunctionNotFound,
        ErrorCode::InvalidArguments,
        ErrorCode::SchemaValidationFailed,
        ErrorCode::Unauthorized,
        ErrorCode::Forbidden,
        ErrorCode::RateLimited,
        ErrorCode::CancellationTokenUnknown,
        ErrorCode::CancellationTooLate,
        ErrorCode::InternalError,
        ErrorCode::Unavailable,
        ErrorCode::DependencyError,
    ];

    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::FunctionNotFound => "FUNCTION_NOT_FOUND",
            Self::InvalidArguments => "INVALID_ARGUMENTS",
            Self::SchemaValidationFailed => "SCHEMA_VALIDATION_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::CancellationTokenUnknown => "CANCELLATION_TOKEN_UNKNOWN",
            Self::CancellationTooLate => "CANCELLATION_TOO_LATE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Unavailable => "UNAVAILABLE",
            Self::DependencyError => "DEPENDENCY_ERROR",
            Self::Custom(code) => code,
        }
    }

    /// Parses a wire string. Never fails: unknown strings become `Custom`.
    #[must_use]
    pub fn from_wire(code: &str) -> Self {
        Self::STANDARD
            .iter()
            .find(|standard| standard.as_str() == code)
            .cloned()
            .unwrap_or_else(|| Self::Custom(code.to_string()))
    }

    /// Classification, determined solely by the code identity.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ParseError
            | Self::InvalidRequest
            | Self::FunctionNotFound
            | Self::InvalidArguments
            | Self::SchemaValidationFailed
            | Self::Unauthorized
            | Self::Forbidden
            | Self::RateLimited
            | Self::CancellationTokenUnknown
            | Self::CancellationTooLate => ErrorClass::Client,
            Self::InternalError | Self::Unavailable | Self::DependencyError => {
                ErrorClass::Server
            }
            Self::Custom(_) => ErrorClass::Unclassified,
        }
    }

    #[must_use]
    pub fn is_client(&self) -> bool {
        self.class() == ErrorClass::Client
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        self.class() == ErrorClass::Server
    }

    /// HTTP-style status for transports that have one.
    ///
    /// Custom codes map to 500: the call failed and nothing more is known.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ParseError
            | Self::InvalidRequest
            | Self::InvalidArguments
            | Self::SchemaValidationFailed => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::FunctionNotFound | Self::CancellationTokenUnknown => 404,
            Self::CancellationTooLate => 409,
            Self::RateLimited => 429,
            Self::InternalError | Self::Custom(_) => 500,
            Self::DependencyError => 502,
            Self::Unavailable => 503,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// One failure entry in a response's `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<Value>,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured details, replacing any already present.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Adds a single key to the details object, creating it if needed.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        let mut map = match self.details.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert(key.to_string(), value.into());
        self.details = Some(Value::Object(map));
        self
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    #[must_use]
    pub fn internal() -> Self {
        Self::new(ErrorCode::InternalError, "Internal error")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
