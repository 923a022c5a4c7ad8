//! Blob (file) value type

use chrono::{DateTime, Utc};

/// Where a blob's bytes live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobContent {
    /// Bytes carried with the blob
    Inline(Vec<u8>),
    /// Expiring URL the bytes can be fetched from
    Reference { url: String },
}

/// Named binary payload belonging to an object
///
/// Names are unique within one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub name: String,
    pub mime_type: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub content: BlobContent,
}

impl Blob {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            created: now,
            modified: now,
            content: BlobContent::Inline(payload),
        }
    }

    /// Inline bytes, if this blob carries them
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.content {
            BlobContent::Inline(bytes) => Some(bytes),
            BlobContent::Reference { .. } => None,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match &self.content {
            BlobContent::Reference { url } => Some(url),
            BlobContent::Inline(_) => None,
        }
    }

    /// Same blob under another name, stamped as modified now
    pub fn renamed(&self, name: impl Into<String>) -> Blob {
        Blob {
            name: name.into(),
            modified: Utc::now(),
            ..self.clone()
        }
    }
}
