//! Wire-level envelope types for the Forrst protocol.
//!
//! - [`base`]: protocol identification block shared by requests and responses
//! - [`request`]: the call envelope as received
//! - [`response`]: the result-or-errors envelope as returned
//! - [`validate`]: turns a parsed request into an immutable [`ValidatedRequest`]

pub mod base;
pub mod request;
pub mod response;
pub mod validate;

pub use base::{ProtocolInfo, PROTOCOL_NAME, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
pub use request::{CallData, RequestObject};
pub use response::{ResponseObject, ResponseShapeError};
pub use validate::{is_valid_urn, validate, ProtocolError, ValidatedRequest, ValidationRules};
