//! Response envelope.
//!
//! A response carries either a `result` or a non-empty `errors` array, never
//! both. The protocol block has the same shape in both cases. Fields are
//! private so the invariant can only be established through
//! [`ResponseObject::success`] and [`ResponseObject::failure`]; decoding goes
//! through [`RawResponse`] and rejects documents that break it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::base::ProtocolInfo;
use crate::error::{ErrorClass, ErrorInfo};

// ---------------------------------------------------------------------------
// ResponseObject
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Result(Value),
    Errors(Vec<ErrorInfo>),
}

/// One call result: `result` XOR `errors`, plus optional `meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct ResponseObject {
    protocol: ProtocolInfo,
    id: Option<String>,
    body: Body,
    meta: Option<Map<String, Value>>,
}

impl ResponseObject {
    /// Success response. `id` is `None` only when the request id is unknown.
    #[must_use]
    pub fn success(id: Option<String>, result: Value) -> Self {
        Self {
            protocol: ProtocolInfo::current(),
            id,
            body: Body::Result(result),
            meta: None,
        }
    }

    /// Failure response with a single error.
    #[must_use]
    pub fn failure(id: Option<String>, error: ErrorInfo) -> Self {
        Self::failure_many(id, vec![error])
    }

    /// Failure response with several errors. The first is the primary error.
    ///
    /// An empty list is replaced by a single `INTERNAL_ERROR` so the response
    /// still carries at least one entry.
    #[must_use]
    pub fn failure_many(id: Option<String>, mut errors: Vec<ErrorInfo>) -> Self {
        if errors.is_empty() {
            errors.push(ErrorInfo::internal());
        }
        Self {
            protocol: ProtocolInfo::current(),
            id,
            body: Body::Errors(errors),
            meta: None,
        }
    }

    /// Replaces the whole `meta` object.
    #[must_use]
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Adds one `meta` entry, creating the object if needed.
    #[must_use]
    pub fn with_meta_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn protocol(&self) -> &ProtocolInfo {
        &self.protocol
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The result value, `None` for failures.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match &self.body {
            Body::Result(value) => Some(value),
            Body::Errors(_) => None,
        }
    }

    /// The error list; empty for successes.
    #[must_use]
    pub fn errors(&self) -> &[ErrorInfo] {
        match &self.body {
            Body::Result(_) => &[],
            Body::Errors(errors) => errors,
        }
    }

    #[must_use]
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.meta.as_ref()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.body, Body::Result(_))
    }

    /// The first error, which drives transport status mapping.
    #[must_use]
    pub fn primary_error(&self) -> Option<&ErrorInfo> {
        self.errors().first()
    }

    /// Classification of the primary error, `None` on success.
    #[must_use]
    pub fn error_class(&self) -> Option<ErrorClass> {
        self.primary_error().map(ErrorInfo::class)
    }
}

// ---------------------------------------------------------------------------
// RawResponse (wire shape)
// ---------------------------------------------------------------------------

/// Unchecked wire shape. `result` is always written, as `null` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResponse {
    pub protocol: ProtocolInfo,
    pub id: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub errors: Option<Vec<ErrorInfo>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<Map<String, Value>>,
}

/// A decoded response breaks the result-XOR-errors rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseShapeError {
    #[error("response carries an empty errors array")]
    EmptyErrors,
    #[error("response carries both a result and errors")]
    ResultWithErrors,
}

impl TryFrom<RawResponse> for ResponseObject {
    type Error = ResponseShapeError;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let body = match raw.errors {
            Some(errors) if errors.is_empty() => return Err(ResponseShapeError::EmptyErrors),
            Some(_) if !raw.result.is_null() => return Err(ResponseShapeError::ResultWithErrors),
            Some(errors) => Body::Errors(errors),
            None => Body::Result(raw.result),
        };
        Ok(Self {
            protocol: raw.protocol,
            id: raw.id,
            body,
            meta: raw.meta,
        })
    }
}

impl From<ResponseObject> for RawResponse {
    fn from(response: ResponseObject) -> Self {
        let (result, errors) = match response.body {
            Body::Result(value) => (value, None),
            Body::Errors(errors) => (Value::Null, Some(errors)),
        };
        Self {
            protocol: response.protocol,
            id: response.id,
            result,
            errors,
            meta: response.meta,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn success_omits_errors() {
        let resp = ResponseObject::success(Some("req_001".into()), json!({"users": []}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["result"], json!({"users": []}));
        assert!(json.get("errors").is_none());
        assert!(json.get("meta").is_none());
        assert_eq!(json["protocol"]["name"], "forrst");
    }

    #[test]
    fn failure_sets_result_null() {
        let resp = ResponseObject::failure(
            Some("req_001".into()),
            ErrorInfo::new(ErrorCode::FunctionNotFound, "no such function"),
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["result"].is_null());
        assert!(json.as_object().unwrap().contains_key("result"));
        assert_eq!(json["errors"][0]["code"], "FUNCTION_NOT_FOUND");
    }

    #[test]
    fn protocol_block_identical_on_success_and_failure() {
        let ok = ResponseObject::success(None, json!(1));
        let err = ResponseObject::failure(None, ErrorInfo::internal());
        assert_eq!(ok.protocol(), err.protocol());
    }

    #[test]
    fn empty_failure_list_gets_internal_error() {
        let resp = ResponseObject::failure_many(None, Vec::new());
        assert_eq!(resp.errors().len(), 1);
        assert_eq!(resp.errors()[0].code, ErrorCode::InternalError);
    }

    #[test]
    fn decode_rejects_result_with_errors() {
        let raw = json!({
            "protocol": {"name": "forrst", "version": "0.1.0"},
            "id": "x",
            "result": 5,
            "errors": [{"code": "INTERNAL_ERROR", "message": "boom"}],
        });
        assert!(serde_json::from_value::<ResponseObject>(raw).is_err());
    }

    #[test]
    fn decode_rejects_empty_errors() {
        let raw = json!({
            "protocol": {"name": "forrst", "version": "0.1.0"},
            "id": "x",
            "result": null,
            "errors": [],
        });
        assert!(serde_json::from_value::<ResponseObject>(raw).is_err());
    }

    #[test]
    fn roundtrip_preserves_error_classification() {
        let original = ResponseObject::failure_many(
            Some("r".into()),
            vec![
                ErrorInfo::new(ErrorCode::RateLimited, "slow down"),
                ErrorInfo::new(ErrorCode::Custom("QUOTA".into()), "quota"),
            ],
        );
        let bytes = serde_json::to_vec(&original).unwrap();
        let parsed: ResponseObject = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.error_class(), Some(ErrorClass::Client));
        assert_eq!(parsed.errors()[1].class(), ErrorClass::Unclassified);
    }

    #[test]
    fn meta_entries_accumulate() {
        let resp = ResponseObject::success(None, json!(true))
            .with_meta_entry("duration_ms", json!(3))
            .with_meta_entry("node", json!("n1"));
        let meta = resp.meta().unwrap();
        assert_eq!(meta["duration_ms"], 3);
        assert_eq!(meta["node"], "n1");
    }
}
