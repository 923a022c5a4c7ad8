//! Event records stored in the outbox
//!
//! A record is appended inside the same write batch as the change it
//! describes, so an event exists if and only if the change was committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "object:created")]
    ObjectCreated,
    #[serde(rename = "object:updated")]
    ObjectUpdated,
    #[serde(rename = "object:deleted")]
    ObjectDeleted,
    #[serde(rename = "metadata:updated")]
    MetadataUpdated,
    #[serde(rename = "files:updated")]
    FilesUpdated,
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::ObjectCreated => "object:created",
            EventKind::ObjectUpdated => "object:updated",
            EventKind::ObjectDeleted => "object:deleted",
            EventKind::MetadataUpdated => "metadata:updated",
            EventKind::FilesUpdated => "files:updated",
        }
    }
}

/// One notification destined for the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub kind: EventKind,
    pub namespace: String,
    pub object_id: String,
    /// VTag installed by the change; empty for whole-object deletes
    pub vtag: String,
    pub bus: String,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
}

/// Outbox row awaiting publication
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Monotonic sequence within the owning store
    pub seq: i64,
    pub record: EventRecord,
    pub attempts: u32,
}

/// Bus and source names stamped on every record of one store handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStamp {
    pub bus: String,
    pub source: String,
}

impl EventStamp {
    pub fn new(bus: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            bus: bus.into(),
            source: source.into(),
        }
    }

    pub fn record(
        &self,
        kind: EventKind,
        namespace: &str,
        object_id: &str,
        vtag: &str,
    ) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            vtag: vtag.to_string(),
            bus: self.bus.clone(),
            source: self.source.clone(),
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The JSON format is consumed by external subscribers and must stay stable
    #[test]
    fn test_event_record_serialization_contract() {
        let stamp = EventStamp::new("objects-bus", "easystore");
        let record = stamp.record(EventKind::FilesUpdated, "docs", "obj-1", "v2");

        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json.get("kind").unwrap(), "files:updated");
        assert_eq!(json.get("objectId").unwrap(), "obj-1");
        assert_eq!(json.get("bus").unwrap(), "objects-bus");
        assert_eq!(json.get("source").unwrap(), "easystore");
        assert!(json.get("occurredAt").is_some());

        let back: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
