//! Declarative data transforms.
//!
//! Three modes:
//! - `map`: build a new object from field mappings (source paths resolve
//!   against the node scope)
//! - `apply`: run one operation on every string field, or on the listed
//!   fields, of the input object
//! - `expression`: evaluate an expression and use its value as output

use crate::error::TransformError;
use crate::expression::Expression;
use copper_relay_core::path::{lookup, to_text};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// A field-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOperation {
    Uppercase,
    Lowercase,
    Trim,
    ToString,
    ToNumber,
    /// Length of a string, array or object.
    Length,
}

impl fmt::Display for TransformOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uppercase => "uppercase",
            Self::Lowercase => "lowercase",
            Self::Trim => "trim",
            Self::ToString => "to_string",
            Self::ToNumber => "to_number",
            Self::Length => "length",
        };
        f.write_str(name)
    }
}

impl TransformOperation {
    /// Applies the operation to one value. `field` is only used in errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the value has the wrong shape for the operation.
    pub fn apply(self, field: &str, value: &JsonValue) -> Result<JsonValue, TransformError> {
        let failed = |reason: String| TransformError::OperationFailed {
            field: field.to_string(),
            operation: self.to_string(),
            reason,
        };
        match self {
            Self::Uppercase | Self::Lowercase | Self::Trim => {
                let JsonValue::String(text) = value else {
                    return Err(failed(format!("expected a string, got {}", kind(value))));
                };
                Ok(JsonValue::String(match self {
                    Self::Uppercase => text.to_uppercase(),
                    Self::Lowercase => text.to_lowercase(),
                    _ => text.trim().to_string(),
                }))
            }
            Self::ToString => Ok(JsonValue::String(match value {
                JsonValue::Array(_) | JsonValue::Object(_) => value.to_string(),
                scalar => to_text(scalar),
            })),
            Self::ToNumber => match value {
                JsonValue::Number(_) => Ok(value.clone()),
                JsonValue::Bool(b) => Ok(JsonValue::from(u8::from(*b))),
                JsonValue::String(text) => {
                    let text = text.trim();
                    if let Ok(int) = text.parse::<i64>() {
                        return Ok(JsonValue::from(int));
                    }
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(JsonValue::Number)
                        .ok_or_else(|| failed(format!("'{text}' is not a number")))
                }
                other => Err(failed(format!("cannot convert {} to a number", kind(other)))),
            },
            Self::Length => match value {
                JsonValue::String(text) => Ok(JsonValue::from(text.chars().count())),
                JsonValue::Array(items) => Ok(JsonValue::from(items.len())),
                JsonValue::Object(map) => Ok(JsonValue::from(map.len())),
                other => Err(failed(format!("{} has no length", kind(other)))),
            },
        }
    }
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// One output field of a `map` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Output field name.
    pub target: String,
    /// Path resolved against the node scope.
    pub source: String,
    /// Operation applied to the resolved value.
    #[serde(default)]
    pub operation: Option<TransformOperation>,
    /// Used when the source path does not resolve.
    #[serde(default)]
    pub default: Option<JsonValue>,
}

impl FieldMapping {
    #[must_use]
    pub fn new(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            operation: None,
            default: None,
        }
    }

    #[must_use]
    pub fn with_operation(mut self, operation: TransformOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Configuration of a transform node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Builds an object from mappings.
    Map {
        mappings: Vec<FieldMapping>,
        /// Copy input fields that no mapping targets.
        #[serde(default)]
        keep_unmapped: bool,
    },
    /// Applies one operation across the input object.
    Apply {
        operation: TransformOperation,
        /// Fields to touch; every string field when absent.
        #[serde(default)]
        fields: Option<Vec<String>>,
    },
    /// Evaluates an expression against the node scope.
    Expression { expression: String },
}

impl TransformConfig {
    /// Runs the transform. `input` is the node input, `scope` the node scope.
    ///
    /// # Errors
    ///
    /// Returns an error if an operation does not apply or the expression is
    /// malformed.
    pub fn apply(&self, input: &JsonValue, scope: &JsonValue) -> Result<JsonValue, TransformError> {
        match self {
            Self::Map {
                mappings,
                keep_unmapped,
            } => {
                let mut output = Map::new();
                if *keep_unmapped && let JsonValue::Object(fields) = input {
                    output.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                for mapping in mappings {
                    let value = lookup(scope, &mapping.source)
                        .cloned()
                        .or_else(|| mapping.default.clone())
                        .unwrap_or(JsonValue::Null);
                    let value = match mapping.operation {
                        Some(operation) if !value.is_null() => {
                            operation.apply(&mapping.target, &value)?
                        }
                        _ => value,
                    };
                    output.insert(mapping.target.clone(), value);
                }
                Ok(JsonValue::Object(output))
            }
            Self::Apply { operation, fields } => {
                let JsonValue::Object(input) = input else {
                    return Err(TransformError::NotAnObject);
                };
                let mut output = input.clone();
                match fields {
                    Some(fields) => {
                        for field in fields {
                            if let Some(value) = output.get_mut(field) {
                                *value = operation.apply(field, value)?;
                            }
                        }
                    }
                    None => {
                        for (field, value) in &mut output {
                            if value.is_string() {
                                *value = operation.apply(field, value)?;
                            }
                        }
                    }
                }
                Ok(JsonValue::Object(output))
            }
            Self::Expression { expression } => Ok(Expression::parse(expression)?.evaluate(scope)),
        }
    }

    /// Checks the parts of the transform that do not depend on data.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is malformed.
    pub fn validate(&self) -> Result<(), TransformError> {
        match self {
            Self::Expression { expression } => Expression::parse(expression)
                .map(|_| ())
                .map_err(TransformError::from),
            Self::Map { .. } | Self::Apply { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_uppercases_every_string_field() {
        let transform = TransformConfig::Apply {
            operation: TransformOperation::Uppercase,
            fields: None,
        };
        let input = json!({"text": "hi", "count": 2});

        let output = transform.apply(&input, &input).expect("applies");
        assert_eq!(output, json!({"text": "HI", "count": 2}));
    }

    #[test]
    fn apply_to_listed_fields_only() {
        let transform = TransformConfig::Apply {
            operation: TransformOperation::Trim,
            fields: Some(vec!["name".to_string(), "missing".to_string()]),
        };
        let input = json!({"name": "  Ada ", "note": "  keep  "});

        let output = transform.apply(&input, &input).expect("applies");
        assert_eq!(output, json!({"name": "Ada", "note": "  keep  "}));
    }

    #[test]
    fn apply_rejects_non_object_input() {
        let transform = TransformConfig::Apply {
            operation: TransformOperation::Lowercase,
            fields: None,
        };
        assert_eq!(
            transform.apply(&json!("HI"), &json!({})),
            Err(TransformError::NotAnObject)
        );
    }

    #[test]
    fn map_resolves_paths_with_defaults_and_operations() {
        let transform = TransformConfig::Map {
            mappings: vec![
                FieldMapping::new("email", "user.email").with_operation(TransformOperation::Lowercase),
                FieldMapping::new("tier", "user.tier").with_default(json!("free")),
                FieldMapping::new("tags", "user.tags").with_operation(TransformOperation::Length),
            ],
            keep_unmapped: false,
        };
        let scope = json!({"user": {"email": "Ada@Example.COM", "tags": ["a", "b"]}});

        let output = transform.apply(&json!({}), &scope).expect("applies");
        assert_eq!(
            output,
            json!({"email": "ada@example.com", "tier": "free", "tags": 2})
        );
    }

    #[test]
    fn map_keeps_unmapped_input_fields() {
        let transform = TransformConfig::Map {
            mappings: vec![FieldMapping::new("id", "input_id")],
            keep_unmapped: true,
        };
        let input = json!({"input_id": 7, "extra": true});

        let output = transform.apply(&input, &input).expect("applies");
        assert_eq!(output, json!({"input_id": 7, "extra": true, "id": 7}));
    }

    #[test]
    fn to_number_parses_strings() {
        let op = TransformOperation::ToNumber;
        assert_eq!(op.apply("n", &json!("42")).expect("int"), json!(42));
        assert_eq!(op.apply("n", &json!(" 2.5 ")).expect("float"), json!(2.5));
        assert!(op.apply("n", &json!("forty")).is_err());
    }

    #[test]
    fn expression_mode_uses_scope() {
        let transform = TransformConfig::Expression {
            expression: "score >= 50".to_string(),
        };
        assert_eq!(
            transform.apply(&json!({}), &json!({"score": 64})).expect("applies"),
            json!(true)
        );
        assert!(TransformConfig::Expression {
            expression: "score >=".to_string()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn operation_error_names_the_field() {
        let err = TransformOperation::Uppercase
            .apply("age", &json!(3))
            .unwrap_err();
        assert_eq!(err.to_string(), "uppercase failed on 'age': expected a string, got a number");
    }
}
