use rill_config::{Constraint, FieldType, PropertyRule, ValidateSpec, ValidationAction};
use rill_lang::FieldPath;
use serde_json::Value;

use crate::document::Document;

// ---------------------------------------------------------------------------
// ValidationResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid,
    Invalid(ValidationError),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// The first failed check for a document. Every variant names the field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("required field '{field}' is missing")]
    MissingRequired { field: FieldPath },
    #[error("field '{field}' must be of type {expected}, found {found}")]
    WrongType {
        field: FieldPath,
        expected: FieldType,
        found: &'static str,
    },
    #[error("field '{field}' is below minimum {minimum}")]
    BelowMinimum { field: FieldPath, minimum: f64 },
    #[error("field '{field}' is above maximum {maximum}")]
    AboveMaximum { field: FieldPath, maximum: f64 },
    #[error("field '{field}' is shorter than {min_length}")]
    TooShort { field: FieldPath, min_length: usize },
    #[error("field '{field}' is longer than {max_length}")]
    TooLong { field: FieldPath, max_length: usize },
}

impl ValidationError {
    pub fn field(&self) -> &FieldPath {
        match self {
            Self::MissingRequired { field }
            | Self::WrongType { field, .. }
            | Self::BelowMinimum { field, .. }
            | Self::AboveMaximum { field, .. }
            | Self::TooShort { field, .. }
            | Self::TooLong { field, .. } => field,
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Applies a schema contract to documents. Stateless; one instance is shared
/// by the ingest task.
#[derive(Debug, Clone)]
pub struct Validator {
    required: Vec<FieldPath>,
    properties: Vec<PropertyRule>,
    action: ValidationAction,
}

impl Validator {
    pub fn new(spec: &ValidateSpec) -> Self {
        Self {
            required: spec.required.clone(),
            properties: spec.properties.clone(),
            action: spec.action,
        }
    }

    pub fn action(&self) -> ValidationAction {
        self.action
    }

    /// Required fields are checked first in listed order, then property
    /// constraints in declaration order. The first failure wins.
    pub fn validate(&self, doc: &Document) -> ValidationResult {
        match self.check(doc) {
            Ok(()) => ValidationResult::Valid,
            Err(e) => ValidationResult::Invalid(e),
        }
    }

    fn check(&self, doc: &Document) -> Result<(), ValidationError> {
        let body = doc.body();
        for field in &self.required {
            if field.lookup_in(body).is_none() {
                return Err(ValidationError::MissingRequired {
                    field: field.clone(),
                });
            }
        }
        for rule in &self.properties {
            // Absent and not required: nothing to check.
            let Some(value) = rule.field.lookup_in(body) else {
                continue;
            };
            for c in &rule.constraints {
                check_constraint(&rule.field, c, value)?;
            }
        }
        Ok(())
    }
}

fn check_constraint(
    field: &FieldPath,
    constraint: &Constraint,
    value: &Value,
) -> Result<(), ValidationError> {
    match *constraint {
        Constraint::Type(expected) => {
            if !matches_type(expected, value) {
                return Err(ValidationError::WrongType {
                    field: field.clone(),
                    expected,
                    found: type_name(value),
                });
            }
        }
        Constraint::Minimum(minimum) => {
            if let Some(n) = value.as_f64()
                && n < minimum
            {
                return Err(ValidationError::BelowMinimum {
                    field: field.clone(),
                    minimum,
                });
            }
        }
        Constraint::Maximum(maximum) => {
            if let Some(n) = value.as_f64()
                && n > maximum
            {
                return Err(ValidationError::AboveMaximum {
                    field: field.clone(),
                    maximum,
                });
            }
        }
        Constraint::MinLength(min_length) => {
            if let Some(len) = length_of(value)
                && len < min_length
            {
                return Err(ValidationError::TooShort {
                    field: field.clone(),
                    min_length,
                });
            }
        }
        Constraint::MaxLength(max_length) => {
            if let Some(len) = length_of(value)
                && len > max_length
            {
                return Err(ValidationError::TooLong {
                    field: field.clone(),
                    max_length,
                });
            }
        }
    }
    Ok(())
}

fn matches_type(expected: FieldType, value: &Value) -> bool {
    match expected {
        FieldType::Int => value
            .as_i64()
            .is_some_and(|n| i32::try_from(n).is_ok()),
        FieldType::Long => value.as_i64().is_some(),
        FieldType::Double => value.is_f64(),
        FieldType::Number => value.is_number(),
        FieldType::String => value.is_string(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::Null => value.is_null(),
    }
}

/// Characters for strings, elements for arrays.
fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Name of a value's JSON type, using the narrowest integer type.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_ok() => "int",
            Some(_) => "long",
            None => "double",
        },
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
