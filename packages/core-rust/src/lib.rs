//! Forrst Core — envelope model, error taxonomy, version constraints, and the
//! operation lifecycle state machine.

pub mod codec;
pub mod context;
pub mod error;
pub mod messages;
pub mod operation;
pub mod schema;
pub mod stream;
pub mod types;
pub mod version;

pub use codec::{Codec, CodecError};
pub use context::{CallContext, Caller, OwnerScope};
pub use error::{ErrorClass, ErrorCode, ErrorInfo};
pub use messages::{
    validate, CallData, ProtocolError, ProtocolInfo, RequestObject, ResponseObject,
    ValidatedRequest, ValidationRules,
};
pub use operation::{Operation, OperationError, OperationHandle, OperationId, OperationStatus};
pub use schema::{ArgumentSchema, FieldDef, FieldKind, ValidationResult};
pub use stream::StreamChunk;
pub use types::{Arguments, Principal};
pub use version::{VersionConstraint, VersionConstraintError};

/// Parses and validates raw bytes in one step.
///
/// # Errors
///
/// Returns the first [`ProtocolError`] from decoding or validation.
pub fn parse(
    raw: &[u8],
    codec: Codec,
    rules: &ValidationRules,
) -> Result<ValidatedRequest, ProtocolError> {
    codec.parse_request(raw).and_then(|request| validate(request, rules))
}
