//! Schema gate for decoded frames and configuration objects.
//!
//! Epistemic foundation:
//! - K_i: Every payload is checked against a typed schema before use
//! - B_i: Vendor frames match the content schema (often they do not:
//!   structural events legitimately fail it)
//! - K_i: A failed check is a value, never a panic or an aborted stream

mod rules;

pub use rules::*;

use serde::de::DeserializeOwned;
use std::fmt;

/// Why a payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueCode {
    /// Not parseable as JSON at all
    InvalidJson,
    /// JSON, but not the expected shape
    SchemaMismatch,
    /// Right shape, value out of bounds
    ConstraintViolation,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueCode::InvalidJson => write!(f, "invalid_json"),
            IssueCode::SchemaMismatch => write!(f, "schema_mismatch"),
            IssueCode::ConstraintViolation => write!(f, "constraint_violation"),
        }
    }
}

/// A rejected validation, with enough context to log or report it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    /// Field path or offending value, when known
    pub details: Option<serde_json::Value>,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Constraint violation on a named field.
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            code: IssueCode::ConstraintViolation,
            message: message.into(),
            details: Some(serde_json::json!({ "field": field })),
        }
    }

    /// Field name recorded in `details`, if any.
    pub fn field_name(&self) -> Option<&str> {
        self.details.as_ref()?.get("field")?.as_str()
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationIssue {}

/// Typed schema with optional semantic checks beyond its shape.
pub trait Schema: DeserializeOwned {
    /// Checks that serde cannot express. Default accepts everything.
    fn check(&self) -> Result<(), ValidationIssue> {
        Ok(())
    }
}

/// Validate a raw JSON payload against schema `T`.
pub fn validate_json<T: Schema>(payload: &str) -> Result<T, ValidationIssue> {
    let value: serde_json::Value = serde_json::from_str(payload.trim()).map_err(|e| {
        ValidationIssue {
            code: IssueCode::InvalidJson,
            message: e.to_string(),
            details: Some(serde_json::json!({ "line": e.line(), "column": e.column() })),
        }
    })?;
    validate_value(value)
}

/// Validate an already-parsed JSON value against schema `T`.
pub fn validate_value<T: Schema>(value: serde_json::Value) -> Result<T, ValidationIssue> {
    let data: T = serde_json::from_value(value)
        .map_err(|e| ValidationIssue::new(IssueCode::SchemaMismatch, e.to_string()))?;
    data.check()?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Delta {
        text: String,
        index: u32,
    }

    impl Schema for Delta {
        fn check(&self) -> Result<(), ValidationIssue> {
            if self.index > 16 {
                return Err(ValidationIssue::field("index", "index out of range"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_valid_payload() {
        let delta: Delta = validate_json(r#"{"text":"hi","index":0}"#).unwrap();
        assert_eq!(delta.text, "hi");
    }

    #[test]
    fn test_invalid_json() {
        let issue = validate_json::<Delta>("{not json").unwrap_err();
        assert_eq!(issue.code, IssueCode::InvalidJson);
        assert!(issue.details.is_some());
    }

    #[test]
    fn test_wrong_shape() {
        // A structural event with no content fails the content schema.
        let issue = validate_json::<Delta>(r#"{"type":"message_start"}"#).unwrap_err();
        assert_eq!(issue.code, IssueCode::SchemaMismatch);
    }

    #[test]
    fn test_semantic_check() {
        let issue = validate_json::<Delta>(r#"{"text":"x","index":99}"#).unwrap_err();
        assert_eq!(issue.code, IssueCode::ConstraintViolation);
        assert_eq!(issue.field_name(), Some("index"));
    }
}
