//! Wire documents for objects and their components
//!
//! Payloads travel as standard base64, timestamps as RFC 3339. Conversions
//! from documents are fallible (`Deserialize`); conversions to documents are
//! not.

use crate::error::{Result, StoreError};
use crate::models::{Blob, BlobContent, Fields, Metadata, Object};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn decode_payload(what: &str, encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Deserialize(format!("{} payload is not base64: {}", what, e)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDoc {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub vtag: String,
    pub mime_type: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified: DateTime<Utc>,
    pub payload: String,
}

impl From<&Metadata> for MetadataDoc {
    fn from(metadata: &Metadata) -> Self {
        Self {
            id: metadata.id.clone(),
            vtag: metadata.vtag.clone(),
            mime_type: metadata.mime_type.clone(),
            created: metadata.created,
            modified: metadata.modified,
            payload: STANDARD.encode(&metadata.payload),
        }
    }
}

impl TryFrom<MetadataDoc> for Metadata {
    type Error = StoreError;

    fn try_from(doc: MetadataDoc) -> Result<Self> {
        let payload = decode_payload("metadata", &doc.payload)?;
        let mut metadata = Metadata::new(doc.mime_type, payload);
        if !doc.id.is_empty() {
            metadata.id = doc.id;
        }
        if !doc.vtag.is_empty() {
            metadata.vtag = doc.vtag;
        }
        metadata.created = doc.created;
        metadata.modified = doc.modified;
        Ok(metadata)
    }
}

/// A file carries exactly one of `payload` or `reference`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDoc {
    pub name: String,
    pub mime_type: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl From<&Blob> for BlobDoc {
    fn from(blob: &Blob) -> Self {
        let (payload, reference) = match &blob.content {
            BlobContent::Inline(bytes) => (Some(STANDARD.encode(bytes)), None),
            BlobContent::Reference { url } => (None, Some(url.clone())),
        };
        Self {
            name: blob.name.clone(),
            mime_type: blob.mime_type.clone(),
            created: blob.created,
            modified: blob.modified,
            payload,
            reference,
        }
    }
}

impl TryFrom<BlobDoc> for Blob {
    type Error = StoreError;

    fn try_from(doc: BlobDoc) -> Result<Self> {
        let content = match (doc.payload, doc.reference) {
            (Some(payload), None) => {
                BlobContent::Inline(decode_payload(&format!("file '{}'", doc.name), &payload)?)
            }
            (None, Some(url)) => BlobContent::Reference { url },
            _ => {
                return Err(StoreError::Deserialize(format!(
                    "file '{}' must carry exactly one of payload or reference",
                    doc.name
                )))
            }
        };
        Ok(Blob {
            name: doc.name,
            mime_type: doc.mime_type,
            created: doc.created,
            modified: doc.modified,
            content,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDoc {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub vtag: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<BlobDoc>>,
}

impl From<&Object> for ObjectDoc {
    fn from(object: &Object) -> Self {
        Self {
            namespace: object.namespace.clone(),
            id: object.id.clone(),
            vtag: object.vtag.clone(),
            created: object.created,
            modified: object.modified,
            fields: object.fields.clone(),
            metadata: object.metadata.as_ref().map(MetadataDoc::from),
            files: object
                .files
                .as_ref()
                .map(|files| files.iter().map(BlobDoc::from).collect()),
        }
    }
}

impl TryFrom<ObjectDoc> for Object {
    type Error = StoreError;

    fn try_from(doc: ObjectDoc) -> Result<Self> {
        let mut object = Object::with_id(doc.namespace, doc.id);
        object.vtag = doc.vtag;
        object.created = doc.created;
        object.modified = doc.modified;
        object.fields = doc.fields;
        object.metadata = doc.metadata.map(Metadata::try_from).transpose()?;
        object.files = doc
            .files
            .map(|files| files.into_iter().map(Blob::try_from).collect::<Result<Vec<_>>>())
            .transpose()?;
        Ok(object)
    }
}
