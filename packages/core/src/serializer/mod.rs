//! Serializer
//!
//! Encodes objects for the wire and for import/export. Each component has a
//! dedicated document type ([`MetadataDoc`], [`BlobDoc`]); nothing is decoded
//! through a generic map.
//!
//! # Examples
//!
//! ```rust
//! use easystore_core::models::{ComponentSelector, Object};
//! use easystore_core::serializer::{decode_component, encode_component};
//!
//! let mut source = Object::with_id("docs", "a");
//! source.set_field("color", "red");
//!
//! let value = encode_component(&source, ComponentSelector::FIELDS).unwrap();
//! let mut target = Object::with_id("docs", "a");
//! decode_component(&mut target, ComponentSelector::FIELDS, value).unwrap();
//!
//! assert_eq!(target.fields, source.fields);
//! ```

mod docs;
pub mod jsonl;

pub use docs::{BlobDoc, MetadataDoc, ObjectDoc};
pub use jsonl::{export_namespace, import_objects};

use crate::error::{Result, StoreError};
use crate::models::{Blob, ComponentSelector, Fields, Metadata, Object};
use serde_json::Value;

fn single_component(component: ComponentSelector) -> Result<ComponentSelector> {
    match component {
        ComponentSelector::FIELDS | ComponentSelector::FILES | ComponentSelector::METADATA => {
            Ok(component)
        }
        other => Err(StoreError::bad_parameter(format!(
            "expected exactly one component, got '{}'",
            other
        ))),
    }
}

fn to_value<T: serde::Serialize>(what: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialize(format!("{}: {}", what, e)))
}

fn from_value<T: serde::de::DeserializeOwned>(what: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Deserialize(format!("{}: {}", what, e)))
}

/// Encode one component of `object`; an absent component encodes as `null`
pub fn encode_component(object: &Object, component: ComponentSelector) -> Result<Value> {
    match single_component(component)? {
        ComponentSelector::FIELDS => match &object.fields {
            Some(fields) => to_value("fields", fields),
            None => Ok(Value::Null),
        },
        ComponentSelector::METADATA => match &object.metadata {
            Some(metadata) => to_value("metadata", &MetadataDoc::from(metadata)),
            None => Ok(Value::Null),
        },
        _ => match &object.files {
            Some(files) => {
                let docs: Vec<BlobDoc> = files.iter().map(BlobDoc::from).collect();
                to_value("files", &docs)
            }
            None => Ok(Value::Null),
        },
    }
}

/// Decode `value` into one component of `object`, replacing it wholesale
pub fn decode_component(
    object: &mut Object,
    component: ComponentSelector,
    value: Value,
) -> Result<()> {
    let component = single_component(component)?;
    if value.is_null() {
        match component {
            ComponentSelector::FIELDS => object.fields = None,
            ComponentSelector::METADATA => object.metadata = None,
            _ => object.files = None,
        }
        return Ok(());
    }

    match component {
        ComponentSelector::FIELDS => {
            object.fields = Some(from_value::<Fields>("fields", value)?);
        }
        ComponentSelector::METADATA => {
            let doc: MetadataDoc = from_value("metadata", value)?;
            object.metadata = Some(Metadata::try_from(doc)?);
        }
        _ => {
            let docs: Vec<BlobDoc> = from_value("files", value)?;
            object.files = Some(
                docs.into_iter()
                    .map(Blob::try_from)
                    .collect::<Result<Vec<_>>>()?,
            );
        }
    }
    Ok(())
}

pub fn encode_object(object: &Object) -> Result<Vec<u8>> {
    serde_json::to_vec(&ObjectDoc::from(object))
        .map_err(|e| StoreError::Serialize(format!("object {}: {}", object.key(), e)))
}

pub fn decode_object(bytes: &[u8]) -> Result<Object> {
    let doc: ObjectDoc = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Deserialize(format!("object document: {}", e)))?;
    Object::try_from(doc)
}
