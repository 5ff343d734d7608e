//! Envelope encoding.
//!
//! JSON is the reference encoding. `MsgPack` uses named maps
//! (`rmp_serde::to_vec_named`) so that both encodings share one document
//! model.

use serde::Serialize;
use serde_json::Value;

use crate::messages::{ProtocolError, RequestObject, ResponseObject};

/// Wire encoding of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    MsgPack,
}

/// Encoding or decoding a response failed.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl Codec {
    /// Picks a codec from a `Content-Type` value. Unknown types fall back to
    /// JSON.
    #[must_use]
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type.map(|ct| ct.split(';').next().unwrap_or("").trim()) {
            Some("application/msgpack" | "application/x-msgpack" | "application/vnd.msgpack") => {
                Self::MsgPack
            }
            _ => Self::Json,
        }
    }

    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::MsgPack => "application/msgpack",
        }
    }

    /// Decodes raw bytes into a request envelope.
    ///
    /// # Errors
    ///
    /// Bytes that are not a document at all yield [`ProtocolError::Parse`].
    /// A document that does not have the request shape yields
    /// [`ProtocolError::InvalidRequest`], echoing its `id` when one is
    /// readable.
    pub fn parse_request(self, raw: &[u8]) -> Result<RequestObject, ProtocolError> {
        let document: Value = match self {
            Self::Json => serde_json::from_slice(raw).map_err(|e| ProtocolError::Parse(e.to_string()))?,
            Self::MsgPack => {
                rmp_serde::from_slice(raw).map_err(|e| ProtocolError::Parse(e.to_string()))?
            }
        };
        if !document.is_object() {
            return Err(ProtocolError::InvalidRequest {
                id: None,
                field: None,
                reason: "request must be an object".to_string(),
            });
        }
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        serde_json::from_value(document).map_err(|e| ProtocolError::InvalidRequest {
            id,
            field: None,
            reason: e.to_string(),
        })
    }

    /// Encodes a request envelope (client side and tests).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if serialization fails.
    pub fn encode_request(self, request: &RequestObject) -> Result<Vec<u8>, CodecError> {
        self.encode(request)
    }

    /// Encodes a response envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if serialization fails.
    pub fn encode_response(self, response: &ResponseObject) -> Result<Vec<u8>, CodecError> {
        self.encode(response)
    }

    /// Decodes a response envelope, enforcing the result-XOR-errors rule.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input.
    pub fn decode_response(self, raw: &[u8]) -> Result<ResponseObject, CodecError> {
        Ok(match self {
            Self::Json => serde_json::from_slice(raw)?,
            Self::MsgPack => rmp_serde::from_slice(raw)?,
        })
    }

    /// Encodes any serializable value (used for stream chunks).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if serialization fails.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            Self::Json => serde_json::to_vec(value)?,
            Self::MsgPack => rmp_serde::to_vec_named(value)?,
        })
    }
}
