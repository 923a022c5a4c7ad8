//! Metadata value type
//!
//! Metadata is a single opaque payload per object. It is stored next to the
//! object's files but always under its own component kind, so no file name
//! can ever shadow it.

use super::object::new_vtag;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Access id of this payload, independent of the owning object's id
    pub id: String,
    pub vtag: String,
    pub mime_type: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl Metadata {
    pub fn new(mime_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            vtag: new_vtag(),
            mime_type: mime_type.into(),
            created: now,
            modified: now,
            payload,
        }
    }

    /// Metadata holding a JSON document
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new("application/json", value.to_string().into_bytes())
    }
}
