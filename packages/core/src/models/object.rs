//! Object Data Structures
//!
//! An [`Object`] is the unit of storage: a base record identified by
//! `(namespace, id)` that optionally carries three components.
//!
//! - **Fields**: string→string attributes, the only searchable component
//! - **Metadata**: at most one opaque payload
//! - **Files**: ordered list of named blobs
//!
//! # Examples
//!
//! ```rust
//! use easystore_core::models::{Blob, Object};
//!
//! let mut object = Object::new("invoices");
//! object.set_field("customer", "acme");
//! object.add_file(Blob::new("scan.pdf", "application/pdf", b"%PDF-1.7".to_vec()));
//!
//! assert_eq!(object.namespace, "invoices");
//! assert!(!object.id.is_empty());
//! assert!(object.vtag.is_empty());
//! ```

use super::{Blob, Metadata};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Namespace used when the caller does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Attribute map; ordered so encodings and comparisons are deterministic
pub type Fields = BTreeMap<String, String>;

/// Generate a fresh object id
pub fn new_object_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a fresh version tag
///
/// VTags are opaque to callers; only equality is meaningful.
pub fn new_vtag() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Identity of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub id: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Stored object with its optional components
///
/// A component that is `None` was either not requested or not stored; an
/// object with no components at all is valid.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub namespace: String,
    pub id: String,
    /// Opaque version tag; empty until the object has been stored
    pub vtag: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub fields: Option<Fields>,
    pub metadata: Option<Metadata>,
    pub files: Option<Vec<Blob>>,
}

impl Object {
    /// Create an unsaved object with a fresh id
    ///
    /// An empty namespace falls back to [`DEFAULT_NAMESPACE`].
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_id(namespace, new_object_id())
    }

    /// Create an unsaved object with a caller-chosen id
    pub fn with_id(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        if namespace.is_empty() {
            namespace = DEFAULT_NAMESPACE.to_string();
        }
        let mut id = id.into();
        if id.is_empty() {
            id = new_object_id();
        }
        let now = Utc::now();
        Self {
            namespace,
            id,
            vtag: String::new(),
            created: now,
            modified: now,
            fields: None,
            metadata: None,
            files: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.id.clone())
    }

    /// Replace the whole Fields component
    pub fn set_fields(&mut self, fields: Fields) -> &mut Self {
        self.fields = Some(fields);
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.fields
            .get_or_insert_with(Fields::new)
            .insert(name.into(), value.into());
        self
    }

    /// Replace the Metadata component
    pub fn set_metadata(&mut self, metadata: Metadata) -> &mut Self {
        self.metadata = Some(metadata);
        self
    }

    /// Replace the whole Files component
    pub fn set_files(&mut self, files: Vec<Blob>) -> &mut Self {
        self.files = Some(files);
        self
    }

    pub fn add_file(&mut self, blob: Blob) -> &mut Self {
        self.files.get_or_insert_with(Vec::new).push(blob);
        self
    }

    pub fn file(&self, name: &str) -> Option<&Blob> {
        self.files.as_ref()?.iter().find(|blob| blob.name == name)
    }

    pub fn has_fields(&self) -> bool {
        self.fields.as_ref().is_some_and(|fields| !fields.is_empty())
    }

    pub fn has_files(&self) -> bool {
        self.files.as_ref().is_some_and(|files| !files.is_empty())
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Copy of the base record without any component
    pub fn base(&self) -> Object {
        Object {
            fields: None,
            metadata: None,
            files: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_synthesizes_namespace_and_id() {
        let object = Object::new("");
        assert_eq!(object.namespace, DEFAULT_NAMESPACE);
        assert!(!object.id.is_empty());
        assert!(object.vtag.is_empty());
        assert!(!object.has_fields() && !object.has_files() && !object.has_metadata());
    }

    #[test]
    fn test_setters_replace_components_wholesale() {
        let mut object = Object::with_id("docs", "a");
        object.set_field("color", "red").set_field("size", "l");

        let mut replacement = Fields::new();
        replacement.insert("shape".to_string(), "round".to_string());
        object.set_fields(replacement.clone());

        assert_eq!(object.fields, Some(replacement));
    }

    #[test]
    fn test_empty_components_are_not_values() {
        let mut object = Object::with_id("docs", "a");
        object.set_fields(Fields::new()).set_files(Vec::new());
        assert!(!object.has_fields());
        assert!(!object.has_files());
    }

    #[test]
    fn test_vtags_are_unique() {
        assert_ne!(new_vtag(), new_vtag());
    }
}
