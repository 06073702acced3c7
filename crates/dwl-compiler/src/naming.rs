//! Identifier rules for schema, table and column names: non-empty, only
//! `[A-Za-z0-9_]`, first character not a digit, no whitespace.

use crate::errors::{codes, ValidationError};

pub fn check_identifier(
    procedure: &str,
    field: &str,
    value: &str,
) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(
            codes::NULL_FIELD,
            procedure,
            [field.to_string()],
            format!("{field} cannot be null"),
        ));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ValidationError::new(
            codes::SPACE_NOT_ALLOWED,
            procedure,
            [field.to_string(), value.to_string()],
            format!("Space(s) not allowed in {field}"),
        ));
    }
    let mut chars = value.chars();
    let first = chars.next().expect("non-empty checked above");
    if first.is_ascii_digit() {
        return Err(ValidationError::new(
            codes::INVALID_CHARACTER,
            procedure,
            [field.to_string(), value.to_string()],
            format!("{field} must not start with a digit"),
        ));
    }
    if !(first.is_ascii_alphanumeric() || first == '_')
        || chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_'))
    {
        return Err(ValidationError::new(
            codes::INVALID_CHARACTER,
            procedure,
            [field.to_string(), value.to_string()],
            format!("Invalid character(s) in {field}"),
        ));
    }
    Ok(())
}

/// Same rules, but an empty value is allowed (optional schema prefix).
pub fn check_identifier_opt(
    procedure: &str,
    field: &str,
    value: &str,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    check_identifier(procedure, field, value)
}
