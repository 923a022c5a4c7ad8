//! Datastore Trait - Backend Abstraction Layer
//!
//! This module defines the [`Datastore`] trait that every backend implements
//! (embedded libsql, PostgreSQL, object storage). The read/write core only
//! ever talks to `Arc<dyn Datastore>`.
//!
//! # Design Decisions
//!
//! 1. **Component granularity**: reads, inserts and deletes address one
//!    component of one object, keyed by `(namespace, id)`.
//! 2. **Atomic batches**: every write goes through [`Datastore::apply`], which
//!    runs an ordered [`WriteBatch`] for a single object as one unit. The
//!    single-component insert/delete methods are one-op batches.
//! 3. **Version tags**: [`WriteOp::SwapVtag`] and a guarded
//!    [`WriteOp::DeleteObject`] compare the stored vtag inside the batch, so a
//!    stale writer fails before anything else in the batch takes effect.
//! 4. **Outbox**: event records are batch operations too; relaying them is a
//!    separate, asynchronous concern.

use crate::error::{Result, StoreError};
use crate::events::{EventRecord, OutboxEntry};
use crate::models::{Blob, Fields, Metadata, Object, ObjectKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One step of a write batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert the base row (components ignored); fails `AlreadyExists`
    AddObject(Object),
    /// Compare the stored vtag with `expected` and install `new`
    ///
    /// Fails `StaleObject` on mismatch and `NotFound` when the object is absent.
    SwapVtag {
        key: ObjectKey,
        expected: String,
        new: String,
        modified: DateTime<Utc>,
    },
    /// Delete the base row; when `expected_vtag` is set the delete is
    /// conditional and fails like [`WriteOp::SwapVtag`], otherwise idempotent
    DeleteObject {
        key: ObjectKey,
        expected_vtag: Option<String>,
    },
    AddFields {
        key: ObjectKey,
        fields: Fields,
        modified: DateTime<Utc>,
    },
    DeleteFields {
        key: ObjectKey,
    },
    AddMetadata {
        key: ObjectKey,
        metadata: Metadata,
    },
    DeleteMetadata {
        key: ObjectKey,
    },
    AddBlob {
        key: ObjectKey,
        blob: Blob,
    },
    DeleteBlob {
        key: ObjectKey,
        name: String,
    },
    DeleteBlobs {
        key: ObjectKey,
    },
    /// Move file `from` to `to`, keeping its payload; fails `NotFound` when
    /// `from` is absent and `AlreadyExists` when `to` is taken
    RenameBlob {
        key: ObjectKey,
        from: String,
        to: String,
        modified: DateTime<Utc>,
    },
    AppendEvent(EventRecord),
}

impl WriteOp {
    /// Namespace the operation writes into
    pub fn namespace(&self) -> &str {
        match self {
            WriteOp::AddObject(object) => &object.namespace,
            WriteOp::SwapVtag { key, .. }
            | WriteOp::DeleteObject { key, .. }
            | WriteOp::AddFields { key, .. }
            | WriteOp::DeleteFields { key }
            | WriteOp::AddMetadata { key, .. }
            | WriteOp::DeleteMetadata { key }
            | WriteOp::AddBlob { key, .. }
            | WriteOp::DeleteBlob { key, .. }
            | WriteOp::DeleteBlobs { key }
            | WriteOp::RenameBlob { key, .. } => &key.namespace,
            WriteOp::AppendEvent(record) => &record.namespace,
        }
    }
}

/// Ordered operations applied atomically to one object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The single namespace every operation targets
    ///
    /// Embedded stores keep one file per namespace, so a batch spanning two
    /// namespaces could not be atomic; it is rejected as `BadParameter`.
    pub fn namespace(&self) -> Result<&str> {
        let first = self
            .ops
            .first()
            .ok_or_else(|| StoreError::bad_parameter("empty write batch"))?
            .namespace();
        if self.ops.iter().any(|op| op.namespace() != first) {
            return Err(StoreError::bad_parameter(
                "write batch spans more than one namespace",
            ));
        }
        Ok(first)
    }
}

/// Abstraction layer for object persistence
///
/// Implementations must be `Send + Sync`; one handle is shared by every task
/// that uses the store.
///
/// # Read semantics
///
/// - `get_*_by_key` fail `NotFound` when no row exists.
/// - Blob and field sets are complete and ordered oldest-modified first,
///   ties broken by name.
///
/// # Delete semantics
///
/// The `delete_*_by_key` methods are idempotent: deleting something absent
/// succeeds.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    /// Liveness probe; fails when the backend is unreachable
    async fn check(&self) -> Result<()>;

    //
    // READS
    //

    async fn get_object_by_key(&self, key: &ObjectKey) -> Result<Object>;

    async fn get_fields_by_key(&self, key: &ObjectKey) -> Result<Fields>;

    async fn get_metadata_by_key(&self, key: &ObjectKey) -> Result<Metadata>;

    async fn get_blobs_by_key(&self, key: &ObjectKey) -> Result<Vec<Blob>>;

    /// Every key whose fields match ALL predicates
    ///
    /// Empty `fields` selects every key of `namespace`, or of every namespace
    /// when `namespace` is empty too. Fails `NotFound` on an empty result.
    async fn get_keys_by_fields(&self, namespace: &str, fields: &Fields)
        -> Result<Vec<ObjectKey>>;

    //
    // WRITES
    //

    /// Apply `batch` atomically: either every operation takes effect or none
    async fn apply(&self, batch: WriteBatch) -> Result<()>;

    async fn add_object(&self, object: &Object) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::AddObject(object.base())))
            .await
    }

    async fn add_fields(&self, key: &ObjectKey, fields: &Fields) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::AddFields {
            key: key.clone(),
            fields: fields.clone(),
            modified: Utc::now(),
        }))
        .await
    }

    async fn add_metadata(&self, key: &ObjectKey, metadata: &Metadata) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::AddMetadata {
            key: key.clone(),
            metadata: metadata.clone(),
        }))
        .await
    }

    async fn add_blob(&self, key: &ObjectKey, blob: &Blob) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::AddBlob {
            key: key.clone(),
            blob: blob.clone(),
        }))
        .await
    }

    async fn delete_object_by_key(&self, key: &ObjectKey) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::DeleteObject {
            key: key.clone(),
            expected_vtag: None,
        }))
        .await
    }

    async fn delete_fields_by_key(&self, key: &ObjectKey) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::DeleteFields { key: key.clone() }))
            .await
    }

    async fn delete_metadata_by_key(&self, key: &ObjectKey) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::DeleteMetadata { key: key.clone() }))
            .await
    }

    async fn delete_blobs_by_key(&self, key: &ObjectKey) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::DeleteBlobs { key: key.clone() }))
            .await
    }

    async fn delete_blob_by_name(&self, key: &ObjectKey, name: &str) -> Result<()> {
        self.apply(WriteBatch::single(WriteOp::DeleteBlob {
            key: key.clone(),
            name: name.to_string(),
        }))
        .await
    }

    //
    // OUTBOX
    //

    /// Oldest events that are neither delivered nor dead, at most `limit`
    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Mark events delivered; `namespace` scopes `seq` on stores that keep
    /// one outbox per namespace
    async fn mark_events_delivered(&self, namespace: &str, seqs: &[i64]) -> Result<()>;

    /// Count a failed publish; the event stays pending
    async fn record_event_failure(&self, namespace: &str, seq: i64, error: &str) -> Result<()>;

    /// Count a failed publish and dead-letter the event so it is never
    /// returned by [`Datastore::pending_events`] again
    async fn mark_event_dead(&self, namespace: &str, seq: i64, error: &str) -> Result<()>;

    /// Delete events delivered at or before `cutoff`; returns how many
    async fn purge_delivered_events(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Release pooled connections
    async fn close(&self) -> Result<()>;
}

/// Backend-specific administration, kept off the data path
///
/// Returned next to the datastore by [`crate::db::open_datastore`] for the
/// backends that support it, so callers never downcast a `dyn Datastore`.
#[async_trait]
pub trait NamespaceAdmin: Send + Sync {
    /// Create the backing store for `namespace`; fails `AlreadyExists` when
    /// it is already there
    async fn create_namespace(&self, namespace: &str) -> Result<()>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_namespace_must_be_uniform() {
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::DeleteFields {
                key: ObjectKey::new("a", "1"),
            })
            .push(WriteOp::DeleteBlobs {
                key: ObjectKey::new("a", "1"),
            });
        assert_eq!(batch.namespace().unwrap(), "a");

        batch.push(WriteOp::DeleteMetadata {
            key: ObjectKey::new("b", "1"),
        });
        assert!(batch.namespace().is_err());
        assert!(WriteBatch::new().namespace().is_err());
    }
}
