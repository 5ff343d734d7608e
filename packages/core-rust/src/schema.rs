use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Arguments;

/// Declared argument shape of a function.
///
/// Deliberately shallow: top-level field presence and JSON kind. Unknown
/// fields are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSchema {
    /// Field definitions, in declaration order.
    pub fields: Vec<FieldDef>,
}

/// Single argument definition within a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Name of the argument.
    pub name: String,
    /// Expected JSON kind.
    pub kind: FieldKind,
    /// Whether the argument must be present (and non-null).
    pub required: bool,
}

/// JSON kind of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// Any JSON value.
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// Result of validating arguments against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The arguments conform to the schema.
    Valid,
    /// The arguments violate one or more constraints.
    Invalid {
        /// Human-readable descriptions of each violation.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl ArgumentSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Adds an optional field. `null` counts as absent.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Checks presence and kind of every declared field.
    #[must_use]
    pub fn validate(&self, arguments: &Arguments) -> ValidationResult {
        let mut errors = Vec::new();
        for field in &self.fields {
            match arguments.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(format!("`{}` is required", field.name));
                    }
                }
                Some(value) if !field.kind.matches(value) => {
                    errors.push(format!(
                        "`{}` must be of type {}",
                        field.name,
                        serde_json::to_value(field.kind)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_owned))
                            .unwrap_or_default()
                    ));
                }
                Some(_) => {}
            }
        }
        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_schema_accepts_anything() {
        let schema = ArgumentSchema::new();
        assert!(schema.validate(&args(json!({"x": 1}))).is_valid());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let schema = ArgumentSchema::new().required("operation_id", FieldKind::String);
        let result = schema.validate(&args(json!({})));
        assert_eq!(
            result,
            ValidationResult::Invalid {
                errors: vec!["`operation_id` is required".to_string()],
            }
        );
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let schema = ArgumentSchema::new()
            .optional("limit", FieldKind::Integer)
            .optional("status", FieldKind::String);
        let result = schema.validate(&args(json!({"limit": "ten", "status": "queued"})));
        assert_eq!(
            result,
            ValidationResult::Invalid {
                errors: vec!["`limit` must be of type integer".to_string()],
            }
        );
    }

    #[test]
    fn null_optional_field_is_absent() {
        let schema = ArgumentSchema::new().optional("cursor", FieldKind::String);
        assert!(schema.validate(&args(json!({"cursor": null}))).is_valid());
    }

    #[test]
    fn float_is_not_integer() {
        let schema = ArgumentSchema::new().required("n", FieldKind::Integer);
        assert!(!schema.validate(&args(json!({"n": 1.5}))).is_valid());
        let schema = ArgumentSchema::new().required("n", FieldKind::Number);
        assert!(schema.validate(&args(json!({"n": 1.5}))).is_valid());
    }
}
