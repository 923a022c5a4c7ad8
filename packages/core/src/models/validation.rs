//! Identifier validation shared by every public entry point
//!
//! Namespaces and object ids end up in file names (embedded stores), bucket
//! keys and URL path segments, so they are restricted to an unreserved ASCII
//! alphabet. File names are free-form apart from path separators.

use crate::error::{Result, StoreError};
use regex::Regex;
use std::sync::OnceLock;

const MAX_IDENTIFIER_LEN: usize = 255;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._~-]+$").expect("valid identifier regex"))
}

fn validate_identifier(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StoreError::bad_parameter(format!("{} must not be empty", what)));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::bad_parameter(format!(
            "{} exceeds {} bytes",
            what, MAX_IDENTIFIER_LEN
        )));
    }
    if value == "." || value == ".." || !identifier_pattern().is_match(value) {
        return Err(StoreError::bad_parameter(format!(
            "{} '{}' contains characters outside [A-Za-z0-9._~-]",
            what, value
        )));
    }
    Ok(())
}

pub fn validate_namespace(namespace: &str) -> Result<()> {
    validate_identifier("namespace", namespace)
}

pub fn validate_object_id(id: &str) -> Result<()> {
    validate_identifier("object id", id)
}

pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::bad_parameter("file name must not be empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::bad_parameter(format!(
            "file name exceeds {} bytes",
            MAX_IDENTIFIER_LEN
        )));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(StoreError::bad_parameter(format!(
            "file name '{}' is not a plain name",
            name
        )));
    }
    Ok(())
}

/// A vtag must be present on every write after create
pub fn validate_vtag(vtag: &str) -> Result<()> {
    if vtag.is_empty() {
        return Err(StoreError::bad_parameter(
            "vtag is required; read the object before writing it",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(validate_object_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_object_id("report_2024.v1~draft").is_ok());
        assert!(validate_object_id("").is_err());
        assert!(validate_object_id("a/b").is_err());
        assert!(validate_object_id("..").is_err());
        assert!(validate_namespace("has space").is_err());
        assert!(validate_namespace(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_file_names() {
        assert!(validate_file_name("photo (1).jpg").is_ok());
        assert!(validate_file_name("metadata.json").is_ok());
        assert!(validate_file_name("dir/file").is_err());
        assert!(validate_file_name("..").is_err());
    }
}
