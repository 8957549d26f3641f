//! Response schemas for structured LLM output.
//!
//! Every structured LLM call declares a [`ResponseSchema`] describing the
//! JSON object the model must return. The gateway validates model output
//! against the schema before handing it to the caller, and feeds validation
//! errors back into repair retries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Specification for a field in a response schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name (matches the JSON key)
    pub name: String,
    /// Field type for validation
    pub field_type: FieldType,
    /// Human-readable description (rendered into the prompt)
    pub description: String,
    /// Whether the field is required
    pub required: bool,
    /// Default value applied when an optional field is missing
    pub default: Option<Value>,
}

impl FieldSpec {
    /// Create a new required field specification.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: String::new(),
            required: true,
            default: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the field as optional.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set a default value; implies optional.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self.required = false;
        self
    }

    /// Format the field as a prompt line, e.g. `action (EXECUTE|DECOMPOSE): ...`.
    pub fn to_prompt_line(&self) -> String {
        let type_hint = self.field_type.to_prompt_hint();
        let required_marker = if self.required { "" } else { " (optional)" };
        if self.description.is_empty() {
            format!("- {} ({type_hint}){required_marker}", self.name)
        } else {
            format!(
                "- {} ({type_hint}){required_marker}: {}",
                self.name, self.description
            )
        }
    }
}

/// Type of a field for validation and prompt generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldType {
    /// String value
    String,
    /// Integer value (any size)
    Integer,
    /// Floating point value
    Float,
    /// Boolean value
    Boolean,
    /// List of items of a specific type
    List(Box<FieldType>),
    /// Nested object with fields
    Object(Vec<FieldSpec>),
    /// Enumeration with allowed string values
    Enum(Vec<String>),
}

impl FieldType {
    /// Create a list type.
    pub fn list(inner: FieldType) -> Self {
        Self::List(Box::new(inner))
    }

    /// Create an object type with fields.
    pub fn object(fields: Vec<FieldSpec>) -> Self {
        Self::Object(fields)
    }

    /// Create an enum type with allowed values.
    pub fn enum_of(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Enum(values.into_iter().map(|v| v.into()).collect())
    }

    /// Get a hint string for prompts (e.g., "string", "list[string]").
    pub fn to_prompt_hint(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Integer => "integer".to_string(),
            Self::Float => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::List(inner) => format!("list[{}]", inner.to_prompt_hint()),
            Self::Object(_) => "object".to_string(),
            Self::Enum(values) => values.join("|"),
        }
    }
}

/// Error that occurs during response validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ValidationError {
    /// A required field is missing.
    MissingField { field: String, expected: String },
    /// Field value has the wrong type.
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },
    /// Enum field has an invalid value.
    EnumInvalid {
        field: String,
        value: String,
        allowed: Vec<String>,
    },
    /// Custom validation error.
    Custom(String),
}

impl ValidationError {
    fn missing(field: &str, field_type: &FieldType) -> Self {
        Self::MissingField {
            field: field.to_string(),
            expected: field_type.to_prompt_hint(),
        }
    }

    fn mismatch(field: &str, field_type: &FieldType, value: &Value) -> Self {
        Self::TypeMismatch {
            field: field.to_string(),
            expected: field_type.to_prompt_hint(),
            got: value_type_name(value),
        }
    }

    /// Human-readable message suitable for feeding back into a repair prompt.
    pub fn to_user_message(&self) -> String {
        match self {
            Self::MissingField { field, expected } => {
                format!("Missing required field '{field}' (expected {expected})")
            }
            Self::TypeMismatch {
                field,
                expected,
                got,
            } => {
                format!("Field '{field}' has wrong type: expected {expected}, got {got}")
            }
            Self::EnumInvalid {
                field,
                value,
                allowed,
            } => {
                format!(
                    "Field '{field}' has invalid value '{value}'. Allowed values: {}",
                    allowed.join(", ")
                )
            }
            Self::Custom(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_user_message())
    }
}

impl std::error::Error for ValidationError {}

/// A named schema the model's JSON output must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    /// Schema name, used in logs and repair prompts
    pub name: String,
    /// Top-level object fields
    pub fields: Vec<FieldSpec>,
}

impl ResponseSchema {
    /// Create a schema from its fields.
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Validate a JSON value against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<ValidationError>> {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                return Err(vec![ValidationError::Custom(
                    "Expected a JSON object".to_string(),
                )]);
            }
        };

        let mut errors = Vec::new();
        for field in &self.fields {
            match obj.get(&field.name) {
                Some(field_value) => {
                    validate_value(field_value, &field.field_type, &field.name, &mut errors);
                }
                None => {
                    if field.required {
                        errors.push(ValidationError::missing(&field.name, &field.field_type));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Apply defaults to missing optional fields, returning the filled object.
    pub fn apply_defaults(&self, value: &Value) -> Value {
        let mut obj = match value.as_object() {
            Some(obj) => obj.clone(),
            None => return value.clone(),
        };
        for field in &self.fields {
            if !obj.contains_key(&field.name) {
                if let Some(default) = &field.default {
                    obj.insert(field.name.clone(), default.clone());
                }
            }
        }
        Value::Object(obj)
    }

    /// Render the schema as a prompt block instructing the model.
    pub fn to_prompt_block(&self) -> String {
        let mut block = String::from(
            "Respond with a single JSON object (no prose, no code fences) with these fields:\n",
        );
        for field in &self.fields {
            block.push_str(&field.to_prompt_line());
            block.push('\n');
        }
        block
    }
}

fn validate_value(
    value: &Value,
    field_type: &FieldType,
    field_name: &str,
    errors: &mut Vec<ValidationError>,
) {
    match field_type {
        FieldType::String => {
            if !value.is_string() {
                errors.push(ValidationError::mismatch(field_name, field_type, value));
            }
        }
        FieldType::Integer => {
            let ok = value
                .as_number()
                .map(|n| n.is_i64() || n.is_u64())
                .unwrap_or(false);
            if !ok {
                errors.push(ValidationError::mismatch(field_name, field_type, value));
            }
        }
        FieldType::Float => {
            if !value.is_number() {
                errors.push(ValidationError::mismatch(field_name, field_type, value));
            }
        }
        FieldType::Boolean => {
            if !value.is_boolean() {
                errors.push(ValidationError::mismatch(field_name, field_type, value));
            }
        }
        FieldType::List(inner) => {
            if let Some(arr) = value.as_array() {
                for (i, item) in arr.iter().enumerate() {
                    let item_path = format!("{field_name}[{i}]");
                    validate_value(item, inner, &item_path, errors);
                }
            } else {
                errors.push(ValidationError::mismatch(field_name, field_type, value));
            }
        }
        FieldType::Object(fields) => {
            if let Some(obj) = value.as_object() {
                for field in fields {
                    let path = format!("{field_name}.{}", field.name);
                    match obj.get(&field.name) {
                        Some(v) => validate_value(v, &field.field_type, &path, errors),
                        None => {
                            if field.required {
                                errors.push(ValidationError::missing(&path, &field.field_type));
                            }
                        }
                    }
                }
            } else {
                errors.push(ValidationError::mismatch(field_name, field_type, value));
            }
        }
        FieldType::Enum(allowed) => {
            if let Some(s) = value.as_str() {
                if !allowed.iter().any(|a| a == s) {
                    errors.push(ValidationError::EnumInvalid {
                        field: field_name.to_string(),
                        value: s.to_string(),
                        allowed: allowed.clone(),
                    });
                }
            } else {
                errors.push(ValidationError::mismatch(field_name, field_type, value));
            }
        }
    }
}

fn value_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn goal_schema() -> ResponseSchema {
        ResponseSchema::new(
            "assessment",
            vec![
                FieldSpec::new("action", FieldType::enum_of(["EXECUTE", "DECOMPOSE", "ANALYZE"])),
                FieldSpec::new("rationale", FieldType::String),
                FieldSpec::new("suggested_sources", FieldType::list(FieldType::String))
                    .with_default(json!([])),
            ],
        )
    }

    #[test]
    fn test_validate_success() {
        let schema = goal_schema();
        let value = json!({"action": "EXECUTE", "rationale": "direct factual question"});
        assert!(schema.validate(&value).is_ok());
    }

    #[test]
    fn test_validate_missing_required() {
        let schema = goal_schema();
        let value = json!({"action": "EXECUTE"});
        let errors = schema.validate(&value).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::MissingField { .. }));
    }

    #[test]
    fn test_validate_enum_invalid() {
        let schema = goal_schema();
        let value = json!({"action": "PONDER", "rationale": "hm"});
        let errors = schema.validate(&value).unwrap_err();
        assert!(matches!(errors[0], ValidationError::EnumInvalid { .. }));
        assert!(errors[0].to_user_message().contains("PONDER"));
    }

    #[test]
    fn test_validate_list_items() {
        let schema = ResponseSchema::new(
            "facts",
            vec![FieldSpec::new("facts", FieldType::list(FieldType::String))],
        );
        assert!(schema.validate(&json!({"facts": ["a", "b"]})).is_ok());
        assert!(schema.validate(&json!({"facts": ["a", 3]})).is_err());
    }

    #[test]
    fn test_validate_nested_object() {
        let schema = ResponseSchema::new(
            "entities",
            vec![FieldSpec::new(
                "entities",
                FieldType::list(FieldType::object(vec![
                    FieldSpec::new("name", FieldType::String),
                    FieldSpec::new("type", FieldType::String),
                ])),
            )],
        );
        let valid = json!({"entities": [{"name": "Acme Corp", "type": "organization"}]});
        assert!(schema.validate(&valid).is_ok());

        let invalid = json!({"entities": [{"name": "Acme Corp"}]});
        let errors = schema.validate(&invalid).unwrap_err();
        assert!(errors[0].to_user_message().contains("entities[0].type"));
    }

    #[test]
    fn test_apply_defaults() {
        let schema = goal_schema();
        let value = json!({"action": "EXECUTE", "rationale": "x"});
        let filled = schema.apply_defaults(&value);
        assert_eq!(filled["suggested_sources"], json!([]));
    }

    #[test]
    fn test_prompt_block_mentions_fields() {
        let block = goal_schema().to_prompt_block();
        assert!(block.contains("action"));
        assert!(block.contains("EXECUTE|DECOMPOSE|ANALYZE"));
        assert!(block.contains("(optional)"));
    }

    #[test]
    fn test_non_object_rejected() {
        let schema = goal_schema();
        let errors = schema.validate(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(errors[0], ValidationError::Custom(_)));
    }
}
