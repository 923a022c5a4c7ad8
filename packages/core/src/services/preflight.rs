//! Parameter checks run before any I/O
//!
//! Shared by the in-process core and the proxy client so both reject the
//! same input with the same `BadParameter` failure.

use super::reader::resolve_namespace;
use crate::error::{Result, StoreError};
use crate::models::validation::{
    validate_file_name, validate_namespace, validate_object_id, validate_vtag,
};
use crate::models::{Blob, Fields, Object, ObjectKey};

pub(crate) fn validate_blobs(files: &[Blob]) -> Result<()> {
    for blob in files {
        validate_file_name(&blob.name)?;
    }
    Ok(())
}

pub(crate) fn validate_fields(fields: &Fields) -> Result<()> {
    if fields.keys().any(|name| name.is_empty()) {
        return Err(StoreError::bad_parameter("field names must not be empty"));
    }
    Ok(())
}

/// Namespace and id of an object being read
pub(crate) fn read_target(namespace: &str, id: &str) -> Result<ObjectKey> {
    let namespace = resolve_namespace(namespace);
    validate_namespace(namespace)?;
    validate_object_id(id)?;
    Ok(ObjectKey::new(namespace, id))
}

/// Key of a stored object about to be written; its vtag must be present
pub(crate) fn write_target(object: &Object) -> Result<ObjectKey> {
    let key = read_target(&object.namespace, &object.id)?;
    validate_vtag(&object.vtag)?;
    Ok(key)
}

/// Checks for an object about to be created; an empty id is allowed
pub(crate) fn create_target(object: &Object) -> Result<()> {
    validate_namespace(resolve_namespace(&object.namespace))?;
    if !object.id.is_empty() {
        validate_object_id(&object.id)?;
    }
    if let Some(fields) = &object.fields {
        validate_fields(fields)?;
    }
    if let Some(files) = &object.files {
        validate_blobs(files)?;
    }
    Ok(())
}

/// Checks for a file rename, before the object itself is looked at
pub(crate) fn rename_names(old_name: &str, new_name: &str) -> Result<()> {
    validate_file_name(old_name)?;
    validate_file_name(new_name)?;
    if old_name == new_name {
        return Err(StoreError::bad_parameter(format!(
            "old and new file name are both '{}'",
            old_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_write_target_requires_vtag() {
        let object = Object::with_id("docs", "a");
        assert_eq!(
            write_target(&object).unwrap_err().kind(),
            ErrorKind::BadParameter
        );
    }

    #[test]
    fn test_read_target_defaults_namespace() {
        let key = read_target("", "a").unwrap();
        assert_eq!(key.namespace, crate::models::DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_create_target_checks_file_names() {
        let mut object = Object::new("docs");
        object.add_file(Blob::new("../escape", "text/plain", Vec::new()));
        assert_eq!(
            create_target(&object).unwrap_err().kind(),
            ErrorKind::BadParameter
        );
    }

    #[test]
    fn test_rename_to_same_name_is_rejected() {
        assert!(rename_names("a.txt", "a.txt").is_err());
        assert!(rename_names("a.txt", "b.txt").is_ok());
    }
}
