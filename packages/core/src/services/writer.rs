//! Read-write Core
//!
//! Maps create/update/delete onto one atomic [`WriteBatch`] per call.
//!
//! # Batch layout
//!
//! | Operation    | Batch                                                        |
//! |--------------|--------------------------------------------------------------|
//! | create       | object, metadata, fields, files, `object:created`            |
//! | update       | vtag swap, per selected component delete (+ add), events      |
//! | delete BASE  | guarded object delete, every component, `object:deleted`     |
//! | delete other | vtag swap, selected component deletes, events                |
//! | rename_file  | vtag swap, file rename, events                               |
//!
//! The vtag check is always the first step, so a stale writer changes
//! nothing. Event records are appended only when a bus is configured.
//!
//! # Examples
//!
//! ```rust,no_run
//! use easystore_core::db::EmbeddedStore;
//! use easystore_core::models::{ComponentSelector, Object};
//! use easystore_core::services::{EasyStore, ObjectService};
//! use std::sync::Arc;
//!
//! # async fn example() -> easystore_core::Result<()> {
//! let datastore = Arc::new(EmbeddedStore::open("/var/lib/easystore").await?);
//! let service = ObjectService::new(datastore);
//!
//! let mut draft = Object::new("invoices");
//! draft.set_field("customer", "acme");
//! let mut stored = service.create(&draft).await?;
//!
//! stored.set_field("status", "paid");
//! let updated = service.update(&stored, ComponentSelector::FIELDS).await?;
//! assert_ne!(updated.vtag, stored.vtag);
//! # Ok(())
//! # }
//! ```

use super::preflight::{
    create_target, rename_names, validate_blobs, validate_fields, write_target,
};
use super::reader::resolve_namespace;
use super::{EasyStore, ObjectReader, ReadStore, ResultSet};
use crate::db::{Datastore, DatastoreHandle, NamespaceAdmin, WriteBatch, WriteOp};
use crate::error::{optional, Result, StoreError};
use crate::events::{EventKind, EventStamp};
use crate::models::validation::validate_file_name;
use crate::models::{new_object_id, new_vtag, Blob, ComponentSelector, Fields, Object, ObjectKey};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Read-write core over a datastore
#[derive(Clone)]
pub struct ObjectService {
    reader: ObjectReader,
    admin: Option<Arc<dyn NamespaceAdmin>>,
    events: Option<EventStamp>,
}

impl std::fmt::Debug for ObjectService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectService")
            .field("reader", &self.reader)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl ObjectService {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            reader: ObjectReader::new(datastore),
            admin: None,
            events: None,
        }
    }

    pub fn from_handle(handle: DatastoreHandle) -> Self {
        Self {
            reader: ObjectReader::new(handle.datastore),
            admin: handle.admin,
            events: None,
        }
    }

    /// Stamp outbox records with the given bus and source
    pub fn with_events(mut self, stamp: EventStamp) -> Self {
        self.events = Some(stamp);
        self
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        self.reader.datastore()
    }

    /// Backend administration, when the backend has any
    pub fn admin(&self) -> Option<&Arc<dyn NamespaceAdmin>> {
        self.admin.as_ref()
    }

    /// Read-only view sharing this service's datastore
    pub fn reader(&self) -> &ObjectReader {
        &self.reader
    }

    fn push_event(&self, batch: &mut WriteBatch, kind: EventKind, key: &ObjectKey, vtag: &str) {
        if let Some(stamp) = &self.events {
            batch.push(WriteOp::AppendEvent(stamp.record(
                kind,
                &key.namespace,
                &key.id,
                vtag,
            )));
        }
    }

    /// `object:updated` plus the component-specific events of `selector`
    fn push_update_events(
        &self,
        batch: &mut WriteBatch,
        selector: ComponentSelector,
        key: &ObjectKey,
        vtag: &str,
    ) {
        self.push_event(batch, EventKind::ObjectUpdated, key, vtag);
        if selector.contains(ComponentSelector::METADATA) {
            self.push_event(batch, EventKind::MetadataUpdated, key, vtag);
        }
        if selector.contains(ComponentSelector::FILES) {
            self.push_event(batch, EventKind::FilesUpdated, key, vtag);
        }
    }

    fn swap(key: &ObjectKey, expected: &str) -> (WriteOp, String) {
        let vtag = new_vtag();
        let op = WriteOp::SwapVtag {
            key: key.clone(),
            expected: expected.to_string(),
            new: vtag.clone(),
            modified: Utc::now(),
        };
        (op, vtag)
    }

    async fn refetch(&self, key: &ObjectKey) -> Result<Object> {
        self.reader
            .get_by_key(&key.namespace, &key.id, ComponentSelector::ALL)
            .await
    }

    /// Stored file named `name`; `NotFound` when there is none
    async fn stored_file(&self, key: &ObjectKey, name: &str) -> Result<Option<Blob>> {
        let files = optional(self.datastore().get_blobs_by_key(key).await)?;
        Ok(files
            .unwrap_or_default()
            .into_iter()
            .find(|blob| blob.name == name))
    }

    async fn apply(&self, batch: WriteBatch, operation: &str, key: &ObjectKey) -> Result<()> {
        self.datastore().apply(batch).await.map_err(|err| {
            tracing::debug!(operation, key = %key, error = %err, "write rejected");
            err
        })
    }
}

#[async_trait]
impl ReadStore for ObjectService {
    async fn check(&self) -> Result<()> {
        self.reader.check().await
    }

    async fn get_by_key(
        &self,
        namespace: &str,
        id: &str,
        selector: ComponentSelector,
    ) -> Result<Object> {
        self.reader.get_by_key(namespace, id, selector).await
    }

    async fn get_by_keys(
        &self,
        namespace: &str,
        ids: &[String],
        selector: ComponentSelector,
    ) -> Result<ResultSet> {
        self.reader.get_by_keys(namespace, ids, selector).await
    }

    async fn get_by_fields(
        &self,
        namespace: &str,
        fields: &Fields,
        selector: ComponentSelector,
    ) -> Result<ResultSet> {
        self.reader.get_by_fields(namespace, fields, selector).await
    }

    async fn close(&self) -> Result<()> {
        self.reader.close().await
    }
}

#[async_trait]
impl EasyStore for ObjectService {
    async fn create(&self, object: &Object) -> Result<Object> {
        create_target(object)?;
        let mut object = object.clone();
        object.namespace = resolve_namespace(&object.namespace).to_string();
        if object.id.is_empty() {
            object.id = new_object_id();
        }

        let now = Utc::now();
        object.vtag = new_vtag();
        object.created = now;
        object.modified = now;
        let key = object.key();

        let mut batch = WriteBatch::single(WriteOp::AddObject(object.base()));
        if let Some(mut metadata) = object.metadata.clone() {
            if metadata.vtag.is_empty() {
                metadata.vtag = new_vtag();
            }
            batch.push(WriteOp::AddMetadata {
                key: key.clone(),
                metadata,
            });
        }
        if let Some(fields) = object.fields.as_ref().filter(|fields| !fields.is_empty()) {
            batch.push(WriteOp::AddFields {
                key: key.clone(),
                fields: fields.clone(),
                modified: now,
            });
        }
        for blob in object.files.iter().flatten() {
            batch.push(WriteOp::AddBlob {
                key: key.clone(),
                blob: blob.clone(),
            });
        }
        self.push_event(&mut batch, EventKind::ObjectCreated, &key, &object.vtag);

        self.apply(batch, "create", &key).await?;
        tracing::debug!(key = %key, "created object");
        self.refetch(&key).await
    }

    async fn update(&self, object: &Object, selector: ComponentSelector) -> Result<Object> {
        let selector = selector.validate()?;
        let key = write_target(object)?;
        if selector.contains(ComponentSelector::FIELDS) {
            if let Some(fields) = &object.fields {
                validate_fields(fields)?;
            }
        }
        if selector.contains(ComponentSelector::FILES) {
            if let Some(files) = &object.files {
                validate_blobs(files)?;
            }
        }

        let (swap, vtag) = Self::swap(&key, &object.vtag);
        let mut batch = WriteBatch::single(swap);

        if selector.contains(ComponentSelector::METADATA) {
            batch.push(WriteOp::DeleteMetadata { key: key.clone() });
            if let Some(metadata) = &object.metadata {
                let mut metadata = metadata.clone();
                metadata.vtag = new_vtag();
                metadata.modified = Utc::now();
                batch.push(WriteOp::AddMetadata {
                    key: key.clone(),
                    metadata,
                });
            }
        }
        if selector.contains(ComponentSelector::FIELDS) {
            batch.push(WriteOp::DeleteFields { key: key.clone() });
            if let Some(fields) = object.fields.as_ref().filter(|fields| !fields.is_empty()) {
                batch.push(WriteOp::AddFields {
                    key: key.clone(),
                    fields: fields.clone(),
                    modified: Utc::now(),
                });
            }
        }
        if selector.contains(ComponentSelector::FILES) {
            batch.push(WriteOp::DeleteBlobs { key: key.clone() });
            for blob in object.files.iter().flatten() {
                batch.push(WriteOp::AddBlob {
                    key: key.clone(),
                    blob: blob.clone(),
                });
            }
        }
        self.push_update_events(&mut batch, selector, &key, &vtag);

        self.apply(batch, "update", &key).await?;
        tracing::debug!(key = %key, selector = %selector, "updated object");
        self.refetch(&key).await
    }

    async fn delete(&self, object: &Object, selector: ComponentSelector) -> Result<Object> {
        let selector = selector.validate()?;
        let key = write_target(object)?;

        let mut batch = WriteBatch::new();
        if selector.is_base() {
            batch
                .push(WriteOp::DeleteObject {
                    key: key.clone(),
                    expected_vtag: Some(object.vtag.clone()),
                })
                .push(WriteOp::DeleteMetadata { key: key.clone() })
                .push(WriteOp::DeleteFields { key: key.clone() })
                .push(WriteOp::DeleteBlobs { key: key.clone() });
            self.push_event(&mut batch, EventKind::ObjectDeleted, &key, "");
        } else {
            let (swap, vtag) = Self::swap(&key, &object.vtag);
            batch.push(swap);
            if selector.contains(ComponentSelector::METADATA) {
                batch.push(WriteOp::DeleteMetadata { key: key.clone() });
            }
            if selector.contains(ComponentSelector::FIELDS) {
                batch.push(WriteOp::DeleteFields { key: key.clone() });
            }
            if selector.contains(ComponentSelector::FILES) {
                batch.push(WriteOp::DeleteBlobs { key: key.clone() });
            }
            self.push_update_events(&mut batch, selector, &key, &vtag);
        }

        self.apply(batch, "delete", &key).await?;
        tracing::debug!(key = %key, selector = %selector, "deleted object");
        Ok(object.clone())
    }

    async fn rename_file(
        &self,
        object: &Object,
        selector: ComponentSelector,
        old_name: &str,
        new_name: &str,
    ) -> Result<Object> {
        let selector = selector.validate()?;
        if !selector.contains(ComponentSelector::FILES) {
            return Err(StoreError::bad_parameter(
                "rename_file needs a selector that includes files",
            ));
        }
        rename_names(old_name, new_name)?;
        let key = write_target(object)?;

        let files = optional(self.datastore().get_blobs_by_key(&key).await)?.unwrap_or_default();
        if !files.iter().any(|blob| blob.name == old_name) {
            return Err(StoreError::not_found(format!("file '{}' of {}", old_name, key)));
        }
        if files.iter().any(|blob| blob.name == new_name) {
            return Err(StoreError::already_exists(format!("file '{}' of {}", new_name, key)));
        }

        let (swap, vtag) = Self::swap(&key, &object.vtag);
        let mut batch = WriteBatch::single(swap);
        batch.push(WriteOp::RenameBlob {
            key: key.clone(),
            from: old_name.to_string(),
            to: new_name.to_string(),
            modified: Utc::now(),
        });
        self.push_update_events(&mut batch, ComponentSelector::FILES, &key, &vtag);

        self.apply(batch, "rename_file", &key).await?;
        tracing::debug!(key = %key, from = old_name, to = new_name, "renamed file");
        self.refetch(&key).await
    }

    async fn add_file(&self, object: &Object, blob: &Blob) -> Result<Object> {
        validate_file_name(&blob.name)?;
        let key = write_target(object)?;

        let (swap, vtag) = Self::swap(&key, &object.vtag);
        let mut batch = WriteBatch::single(swap);
        batch.push(WriteOp::AddBlob {
            key: key.clone(),
            blob: blob.clone(),
        });
        self.push_update_events(&mut batch, ComponentSelector::FILES, &key, &vtag);

        self.apply(batch, "add_file", &key).await?;
        self.refetch(&key).await
    }

    async fn update_file(&self, object: &Object, blob: &Blob) -> Result<Object> {
        validate_file_name(&blob.name)?;
        let key = write_target(object)?;
        let stored = self
            .stored_file(&key, &blob.name)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("file '{}' of {}", blob.name, key)))?;

        let mut replacement = blob.clone();
        replacement.created = stored.created;
        replacement.modified = Utc::now();

        let (swap, vtag) = Self::swap(&key, &object.vtag);
        let mut batch = WriteBatch::single(swap);
        batch
            .push(WriteOp::DeleteBlob {
                key: key.clone(),
                name: blob.name.clone(),
            })
            .push(WriteOp::AddBlob {
                key: key.clone(),
                blob: replacement,
            });
        self.push_update_events(&mut batch, ComponentSelector::FILES, &key, &vtag);

        self.apply(batch, "update_file", &key).await?;
        self.refetch(&key).await
    }

    async fn delete_file(&self, object: &Object, name: &str) -> Result<Object> {
        validate_file_name(name)?;
        let key = write_target(object)?;
        if self.stored_file(&key, name).await?.is_none() {
            return Err(StoreError::not_found(format!("file '{}' of {}", name, key)));
        }

        let (swap, vtag) = Self::swap(&key, &object.vtag);
        let mut batch = WriteBatch::single(swap);
        batch.push(WriteOp::DeleteBlob {
            key: key.clone(),
            name: name.to_string(),
        });
        self.push_update_events(&mut batch, ComponentSelector::FILES, &key, &vtag);

        self.apply(batch, "delete_file", &key).await?;
        self.refetch(&key).await
    }
}
