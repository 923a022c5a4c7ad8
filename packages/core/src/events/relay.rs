//! Outbox relay
//!
//! Drains undelivered outbox records through an [`EventPublisher`]. A record
//! that fails to publish stays pending with its attempt count bumped and is
//! retried on the next poll, until `max_attempts` failures dead-letter it. A
//! publish failure never reaches the writer that produced the record.
//!
//! Delivered records are purged once they are older than the retention
//! window.

use super::{EventPublisher, OutboxEntry};
use crate::config::{DEFAULT_EVENT_RETENTION_HOURS, DEFAULT_MAX_EVENT_ATTEMPTS};
use crate::db::Datastore;
use crate::error::{Result, StoreError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum time between two purges of delivered records
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub delivered: usize,
    /// Failed and still pending
    pub failed: usize,
    /// Failed for the last allowed time
    pub dead: usize,
}

pub struct OutboxRelay {
    datastore: Arc<dyn Datastore>,
    publisher: Arc<dyn EventPublisher>,
    batch_size: usize,
    poll_interval: Duration,
    max_attempts: u32,
    retention: Duration,
}

impl OutboxRelay {
    pub fn new(datastore: Arc<dyn Datastore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            datastore,
            publisher,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_EVENT_ATTEMPTS,
            retention: Duration::from_secs(DEFAULT_EVENT_RETENTION_HOURS * 3600),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Failed publishes before a record is dead-lettered
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// How long delivered records are kept
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Publish up to one batch of pending records
    pub async fn drain_once(&self) -> Result<RelayStats> {
        let entries = self.datastore.pending_events(self.batch_size).await?;
        let mut stats = RelayStats::default();
        let mut delivered: BTreeMap<String, Vec<i64>> = BTreeMap::new();

        for OutboxEntry {
            seq,
            record,
            attempts,
        } in entries
        {
            match self.publisher.publish(&record).await {
                Ok(()) => {
                    delivered.entry(record.namespace).or_default().push(seq);
                    stats.delivered += 1;
                }
                Err(err) if attempts + 1 >= self.max_attempts => {
                    tracing::error!(
                        seq,
                        attempts = attempts + 1,
                        event_type = record.kind.event_type(),
                        namespace = %record.namespace,
                        object_id = %record.object_id,
                        error = %err,
                        "event publish failed for the last time; dead-lettered"
                    );
                    self.datastore
                        .mark_event_dead(&record.namespace, seq, &err.to_string())
                        .await?;
                    stats.dead += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        seq,
                        attempts = attempts + 1,
                        event_type = record.kind.event_type(),
                        error = %err,
                        "event publish failed; will retry"
                    );
                    self.datastore
                        .record_event_failure(&record.namespace, seq, &err.to_string())
                        .await?;
                    stats.failed += 1;
                }
            }
        }

        for (namespace, seqs) in &delivered {
            self.datastore.mark_events_delivered(namespace, seqs).await?;
        }

        if stats.delivered + stats.failed + stats.dead > 0 {
            tracing::debug!(
                delivered = stats.delivered,
                failed = stats.failed,
                dead = stats.dead,
                "outbox drain pass"
            );
        }
        Ok(stats)
    }

    /// Delete delivered records older than the retention window
    pub async fn purge_delivered(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|_| StoreError::bad_parameter("event retention is out of range"))?;
        let purged = self
            .datastore
            .purge_delivered_events(Utc::now() - retention)
            .await?;
        if purged > 0 {
            tracing::debug!(purged, "purged delivered outbox records");
        }
        Ok(purged)
    }

    /// Poll in a background task until the handle is shut down
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut last_purge: Option<Instant> = None;
            loop {
                if let Err(err) = self.drain_once().await {
                    tracing::warn!(error = %err, "outbox drain failed");
                }
                if last_purge.map_or(true, |at| at.elapsed() >= PURGE_INTERVAL) {
                    if let Err(err) = self.purge_delivered().await {
                        tracing::warn!(error = %err, "outbox purge failed");
                    }
                    last_purge = Some(Instant::now());
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            tracing::debug!("outbox relay stopped");
        });
        RelayHandle { shutdown_tx, task }
    }
}

pub struct RelayHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop polling and wait for the in-flight pass to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "outbox relay task panicked");
        }
    }
}
