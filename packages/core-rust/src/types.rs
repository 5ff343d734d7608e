use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named arguments of a call. Always a JSON object on the wire.
pub type Arguments = Map<String, Value>;

/// Authenticated principal making a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier of the caller; operations are scoped to it.
    pub id: String,
    /// Roles assigned to this principal for authorization checks.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }
}
