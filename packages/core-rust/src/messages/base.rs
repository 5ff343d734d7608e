//! Protocol identification block.

use serde::{Deserialize, Serialize};

/// Protocol name every envelope must carry.
pub const PROTOCOL_NAME: &str = "forrst";

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Protocol versions accepted on inbound requests.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION];

/// The `protocol` block: `{"name": "forrst", "version": "0.1.0"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub name: String,
    pub version: String,
}

impl ProtocolInfo {
    /// The block this implementation stamps on every response.
    #[must_use]
    pub fn current() -> Self {
        Self {
            name: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl Default for ProtocolInfo {
    fn default() -> Self {
        Self::current()
    }
}
