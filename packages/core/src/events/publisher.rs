//! Event publishers
//!
//! The event bus is an external collaborator; only its publish contract is
//! modelled here.

use super::EventRecord;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the in-process broadcast channel
const BROADCAST_CHANNEL_CAPACITY: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The bus refused this record; retrying the same record may succeed later
    #[error("Event rejected by bus: {0}")]
    Rejected(String),

    #[error("Event bus unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, record: &EventRecord) -> Result<(), PublishError>;
}

/// In-process fan-out over a tokio broadcast channel
///
/// Publishing with no subscriber succeeds: there is nobody to deliver to.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<EventRecord>,
}

impl BroadcastPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, record: &EventRecord) -> Result<(), PublishError> {
        let _ = self.tx.send(record.clone());
        Ok(())
    }
}

/// Writes every record to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, record: &EventRecord) -> Result<(), PublishError> {
        tracing::info!(
            event_type = record.kind.event_type(),
            bus = %record.bus,
            source = %record.source,
            namespace = %record.namespace,
            object_id = %record.object_id,
            vtag = %record.vtag,
            "object event"
        );
        Ok(())
    }
}
