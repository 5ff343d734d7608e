//! Request envelope as it arrives on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::base::ProtocolInfo;

/// One call request.
///
/// `call.arguments` and `extension` are kept as raw JSON values here so that
/// shape errors (an array instead of an object, for instance) surface as
/// typed validation failures instead of decode failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestObject {
    pub protocol: ProtocolInfo,
    pub id: String,
    pub call: CallData,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub extension: Option<Value>,
}

/// The `call` block: target function, optional version, arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallData {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
    #[serde(default = "empty_arguments")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(Map::new())
}

impl RequestObject {
    /// Builds a request for the current protocol version.
    #[must_use]
    pub fn new(id: impl Into<String>, function: impl Into<String>, arguments: Value) -> Self {
        Self {
            protocol: ProtocolInfo::current(),
            id: id.into(),
            call: CallData {
                function: function.into(),
                version: None,
                arguments,
            },
            extension: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.call.version = Some(version.into());
        self
    }

    /// Adds options for one extension under `extension.<name>`.
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, options: Value) -> Self {
        let mut block = match self.extension.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        block.insert(name.into(), options);
        self.extension = Some(Value::Object(block));
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_spec_shaped_envelope() {
        let raw = json!({
            "protocol": {"name": "forrst", "version": "0.1.0"},
            "id": "req_001",
            "call": {"function": "app.user_list", "version": "1.0.0", "arguments": {}},
        });
        let req: RequestObject = serde_json::from_value(raw).unwrap();
        assert_eq!(req.id, "req_001");
        assert_eq!(req.call.function, "app.user_list");
        assert_eq!(req.call.version.as_deref(), Some("1.0.0"));
        assert!(req.extension.is_none());
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let raw = json!({
            "protocol": {"name": "forrst", "version": "0.1.0"},
            "id": "r",
            "call": {"function": "forrst.ping"},
        });
        let req: RequestObject = serde_json::from_value(raw).unwrap();
        assert_eq!(req.call.arguments, json!({}));
    }

    #[test]
    fn builder_sets_extension_options() {
        let req = RequestObject::new("r1", "app.x", json!({}))
            .with_version("^1")
            .with_extension("rate_limit", json!({"scope": "function"}));
        assert_eq!(req.call.version.as_deref(), Some("^1"));
        assert_eq!(req.extension.unwrap()["rate_limit"]["scope"], "function");
    }
}
