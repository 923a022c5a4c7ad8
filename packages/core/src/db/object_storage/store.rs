//! Object storage backend
//!
//! # Architecture
//!
//! ```text
//! bucket/
//!   {namespace}/{id}/object.json      base record (mirror)
//!   {namespace}/{id}/fields.json      fields (mirror)
//!   {namespace}/{id}/metadata.json    metadata document
//!   {namespace}/{id}/files/{name}     raw file bytes
//! ```
//!
//! A SQL index holds the object rows, field rows and the outbox. It is the
//! authority for version tags and for search; `object.json` and
//! `fields.json` mirror it so a bucket is readable on its own.
//!
//! # Write Saga
//!
//! A batch runs in three steps:
//!
//! 1. Index operations commit as one SQL transaction. The vtag swap lives
//!    here, so a stale writer fails before touching the bucket.
//! 2. Asset operations run against the bucket in batch order.
//! 3. Event records are appended to the index outbox.
//!
//! Before step 1 the assets the batch names are snapshotted; when step 2
//! fails they are put back, together with the index rows. The index restore
//! is conditional on the vtag step 1 installed, so a failed write never
//! overwrites a newer write that committed in between.
//!
//! File references handed out by the signer are resolved back to bucket
//! bytes before step 1, so a fetched object can be written back as is.

use super::bucket::{Bucket, BucketError, ObjectMeta, PutOptions};
use super::signer::ReferenceSigner;
use crate::db::datastore::{Datastore, WriteBatch, WriteOp};
use crate::db::embedded_store::inline_payload;
use crate::error::{optional, ErrorKind, Result, StoreError};
use crate::events::OutboxEntry;
use crate::models::{Blob, BlobContent, Fields, Metadata, Object, ObjectKey};
use crate::serializer::{MetadataDoc, ObjectDoc};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const OBJECT_ASSET: &str = "object.json";
const FIELDS_ASSET: &str = "fields.json";
const METADATA_ASSET: &str = "metadata.json";
const FILES_PREFIX: &str = "files/";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Bucket attributes carrying a file's timestamps
const CREATED_ATTRIBUTE: &str = "created";
const MODIFIED_ATTRIBUTE: &str = "modified";

fn object_prefix(key: &ObjectKey) -> String {
    format!("{}/{}/", key.namespace, key.id)
}

fn asset_key(key: &ObjectKey, asset: &str) -> String {
    format!("{}{}", object_prefix(key), asset)
}

fn file_key(key: &ObjectKey, name: &str) -> String {
    format!("{}{}{}", object_prefix(key), FILES_PREFIX, name)
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialize(format!("{}: {}", what, e)))
}

fn timestamp_attribute(meta: &ObjectMeta, name: &str) -> DateTime<Utc> {
    meta.options
        .attributes
        .get(name)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(meta.last_modified)
}

/// Index state a batch leaves one object in
#[derive(Debug, Clone, PartialEq, Eq)]
enum IndexOutcome {
    /// The base row carries this vtag
    Installed(String),
    Removed,
    /// Only field rows changed; nothing guards them
    FieldsOnly,
}

/// Bucket keys a batch writes for one object
#[derive(Debug, Default)]
struct AssetScope {
    assets: BTreeSet<String>,
    /// Every file of the object, whatever its name
    all_files: bool,
}

/// Pre-write state of one object, used to undo a failed saga
struct Snapshot {
    key: ObjectKey,
    object: Option<Object>,
    fields: Option<Fields>,
    /// Touched asset keys with their prior content; `None` when absent
    assets: Vec<(String, Option<(ObjectMeta, Vec<u8>)>)>,
}

fn asset_scopes(ops: &[WriteOp]) -> BTreeMap<ObjectKey, AssetScope> {
    let mut scopes: BTreeMap<ObjectKey, AssetScope> = BTreeMap::new();
    for op in ops {
        match op {
            WriteOp::AddObject(object) => {
                let key = object.key();
                let asset = asset_key(&key, OBJECT_ASSET);
                scopes.entry(key).or_default().assets.insert(asset);
            }
            WriteOp::SwapVtag { key, .. } | WriteOp::DeleteObject { key, .. } => {
                let scope = scopes.entry(key.clone()).or_default();
                scope.assets.insert(asset_key(key, OBJECT_ASSET));
            }
            WriteOp::AddFields { key, .. } | WriteOp::DeleteFields { key } => {
                let scope = scopes.entry(key.clone()).or_default();
                scope.assets.insert(asset_key(key, FIELDS_ASSET));
            }
            WriteOp::AddMetadata { key, .. } | WriteOp::DeleteMetadata { key } => {
                let scope = scopes.entry(key.clone()).or_default();
                scope.assets.insert(asset_key(key, METADATA_ASSET));
            }
            WriteOp::AddBlob { key, blob } => {
                let scope = scopes.entry(key.clone()).or_default();
                scope.assets.insert(file_key(key, &blob.name));
            }
            WriteOp::DeleteBlob { key, name } => {
                let scope = scopes.entry(key.clone()).or_default();
                scope.assets.insert(file_key(key, name));
            }
            WriteOp::DeleteBlobs { key } => {
                scopes.entry(key.clone()).or_default().all_files = true;
            }
            WriteOp::RenameBlob { key, from, to, .. } => {
                let scope = scopes.entry(key.clone()).or_default();
                scope.assets.insert(file_key(key, from));
                scope.assets.insert(file_key(key, to));
            }
            WriteOp::AppendEvent(_) => {}
        }
    }
    scopes
}

fn index_outcomes(ops: &[WriteOp]) -> BTreeMap<ObjectKey, IndexOutcome> {
    let mut outcomes = BTreeMap::new();
    for op in ops {
        match op {
            WriteOp::AddObject(object) => {
                outcomes.insert(object.key(), IndexOutcome::Installed(object.vtag.clone()));
            }
            WriteOp::SwapVtag { key, new, .. } => {
                outcomes.insert(key.clone(), IndexOutcome::Installed(new.clone()));
            }
            WriteOp::DeleteObject { key, .. } => {
                outcomes.insert(key.clone(), IndexOutcome::Removed);
            }
            WriteOp::AddFields { key, .. } | WriteOp::DeleteFields { key } => {
                outcomes
                    .entry(key.clone())
                    .or_insert(IndexOutcome::FieldsOnly);
            }
            _ => {}
        }
    }
    outcomes
}

/// [`Datastore`] over a [`Bucket`] plus a SQL index
pub struct ObjectStorageStore {
    bucket: Arc<dyn Bucket>,
    index: Arc<dyn Datastore>,
    signer: Option<ReferenceSigner>,
}

impl ObjectStorageStore {
    pub fn new(
        bucket: Arc<dyn Bucket>,
        index: Arc<dyn Datastore>,
        signer: Option<ReferenceSigner>,
    ) -> Self {
        Self {
            bucket,
            index,
            signer,
        }
    }

    async fn snapshot(&self, key: &ObjectKey, scope: &AssetScope) -> Result<Snapshot> {
        let object = optional(self.index.get_object_by_key(key).await)?;
        let fields = optional(self.index.get_fields_by_key(key).await)?;

        let mut asset_keys = scope.assets.clone();
        if scope.all_files {
            let prefix = format!("{}{}", object_prefix(key), FILES_PREFIX);
            for meta in self.bucket.list(&prefix).await? {
                asset_keys.insert(meta.key);
            }
        }

        let mut assets = Vec::with_capacity(asset_keys.len());
        for asset in asset_keys {
            let prior = match self.bucket.get(&asset).await {
                Ok(content) => Some(content),
                Err(BucketError::NotFound(_)) => None,
                Err(err) => return Err(err.into()),
            };
            assets.push((asset, prior));
        }

        Ok(Snapshot {
            key: key.clone(),
            object,
            fields,
            assets,
        })
    }

    /// Undo a failed saga for one object
    ///
    /// With `outcome` set the index rows are restored first, conditional on
    /// the index still holding what the failed batch left there. When it
    /// does not, another writer has moved on and nothing is restored.
    async fn restore(&self, snapshot: &Snapshot, outcome: Option<&IndexOutcome>) -> Result<()> {
        if let Some(outcome) = outcome {
            let key = &snapshot.key;
            let mut batch = WriteBatch::new();
            if let IndexOutcome::Installed(vtag) = outcome {
                batch.push(WriteOp::DeleteObject {
                    key: key.clone(),
                    expected_vtag: Some(vtag.clone()),
                });
            }
            batch.push(WriteOp::DeleteFields { key: key.clone() });
            if *outcome != IndexOutcome::FieldsOnly {
                if let Some(object) = &snapshot.object {
                    batch.push(WriteOp::AddObject(object.clone()));
                }
            }
            if let Some(fields) = &snapshot.fields {
                batch.push(WriteOp::AddFields {
                    key: key.clone(),
                    fields: fields.clone(),
                    modified: snapshot
                        .object
                        .as_ref()
                        .map(|object| object.modified)
                        .unwrap_or_else(Utc::now),
                });
            }

            match self.index.apply(batch).await {
                Ok(()) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::StaleObject | ErrorKind::NotFound | ErrorKind::AlreadyExists
                    ) =>
                {
                    tracing::warn!(
                        key = %key,
                        error = %err,
                        "object changed after the failed write; compensation skipped"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        for (asset, prior) in &snapshot.assets {
            match prior {
                Some((meta, body)) => {
                    self.bucket
                        .put(asset, body.clone(), meta.options.clone())
                        .await?
                }
                None => self.bucket.delete(asset).await?,
            }
        }
        Ok(())
    }

    /// Swap file references signed by this store for the bytes they name
    async fn resolve_references(&self, batch: WriteBatch) -> Result<WriteBatch> {
        let has_reference = batch
            .ops()
            .iter()
            .any(|op| matches!(op, WriteOp::AddBlob { blob, .. } if blob.reference().is_some()));
        if !has_reference {
            return Ok(batch);
        }

        let now = Utc::now();
        let mut resolved = WriteBatch::new();
        for mut op in batch.into_ops() {
            if let WriteOp::AddBlob { blob, .. } = &mut op {
                if let BlobContent::Reference { url } = &blob.content {
                    let body = self.referenced_bytes(&blob.name, url, now).await?;
                    blob.content = BlobContent::Inline(body);
                }
            }
            resolved.push(op);
        }
        Ok(resolved)
    }

    async fn referenced_bytes(
        &self,
        name: &str,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let invalid = || {
            StoreError::bad_parameter(format!(
                "file '{}' carries a reference this store cannot resolve",
                name
            ))
        };
        let signer = self.signer.as_ref().ok_or_else(invalid)?;
        if !signer.verify(reference, now) {
            return Err(StoreError::bad_parameter(format!(
                "file '{}' carries an invalid or expired reference",
                name
            )));
        }

        let mut unsigned = url::Url::parse(reference).map_err(|_| invalid())?;
        unsigned.set_query(None);
        let asset = self
            .bucket
            .key_for_url(unsigned.as_str())
            .ok_or_else(invalid)?;
        match self.bucket.get(&asset).await {
            Ok((_, body)) => Ok(body),
            Err(BucketError::NotFound(_)) => Err(StoreError::not_found(format!(
                "file referenced by '{}'",
                name
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn put_object_mirror(&self, key: &ObjectKey) -> Result<()> {
        let object = self.index.get_object_by_key(key).await?;
        let body = to_json("object document", &ObjectDoc::from(&object))?;
        self.bucket
            .put(&asset_key(key, OBJECT_ASSET), body, PutOptions::new(JSON_CONTENT_TYPE))
            .await?;
        Ok(())
    }

    async fn apply_asset_op(&self, op: &WriteOp, mirrors: &mut BTreeSet<ObjectKey>) -> Result<()> {
        match op {
            WriteOp::AddObject(object) => {
                mirrors.insert(object.key());
            }
            WriteOp::SwapVtag { key, .. } => {
                mirrors.insert(key.clone());
            }
            WriteOp::DeleteObject { key, .. } => {
                mirrors.remove(key);
                self.bucket.delete(&asset_key(key, OBJECT_ASSET)).await?;
            }
            WriteOp::AddFields { key, fields, .. } => {
                self.bucket
                    .put(
                        &asset_key(key, FIELDS_ASSET),
                        to_json("fields", fields)?,
                        PutOptions::new(JSON_CONTENT_TYPE),
                    )
                    .await?;
            }
            WriteOp::DeleteFields { key } => {
                self.bucket.delete(&asset_key(key, FIELDS_ASSET)).await?;
            }
            WriteOp::AddMetadata { key, metadata } => {
                let asset = asset_key(key, METADATA_ASSET);
                if self.bucket.exists(&asset).await? {
                    return Err(StoreError::already_exists(format!("metadata of {}", key)));
                }
                self.bucket
                    .put(
                        &asset,
                        to_json("metadata document", &MetadataDoc::from(metadata))?,
                        PutOptions::new(JSON_CONTENT_TYPE),
                    )
                    .await?;
            }
            WriteOp::DeleteMetadata { key } => {
                self.bucket.delete(&asset_key(key, METADATA_ASSET)).await?;
            }
            WriteOp::AddBlob { key, blob } => {
                let asset = file_key(key, &blob.name);
                if self.bucket.exists(&asset).await? {
                    return Err(StoreError::already_exists(format!(
                        "file '{}' of {}",
                        blob.name, key
                    )));
                }
                let options = PutOptions::new(blob.mime_type.clone())
                    .attribute(CREATED_ATTRIBUTE, blob.created.to_rfc3339())
                    .attribute(MODIFIED_ATTRIBUTE, blob.modified.to_rfc3339());
                self.bucket.put(&asset, inline_payload(blob)?, options).await?;
            }
            WriteOp::DeleteBlob { key, name } => {
                self.bucket.delete(&file_key(key, name)).await?;
            }
            WriteOp::DeleteBlobs { key } => {
                let prefix = format!("{}{}", object_prefix(key), FILES_PREFIX);
                for meta in self.bucket.list(&prefix).await? {
                    self.bucket.delete(&meta.key).await?;
                }
            }
            WriteOp::RenameBlob {
                key,
                from,
                to,
                modified,
            } => {
                let target = file_key(key, to);
                if self.bucket.exists(&target).await? {
                    return Err(StoreError::already_exists(format!("file '{}' of {}", to, key)));
                }
                let source = file_key(key, from);
                let (meta, body) = self.bucket.get(&source).await.map_err(|e| match e {
                    BucketError::NotFound(_) => {
                        StoreError::not_found(format!("file '{}' of {}", from, key))
                    }
                    other => other.into(),
                })?;
                let mut options = meta.options;
                options
                    .attributes
                    .insert(MODIFIED_ATTRIBUTE.to_string(), modified.to_rfc3339());
                self.bucket.put(&target, body, options).await?;
                self.bucket.delete(&source).await?;
            }
            WriteOp::AppendEvent(_) => {}
        }
        Ok(())
    }

    async fn apply_assets(&self, ops: &[WriteOp]) -> Result<()> {
        let mut mirrors = BTreeSet::new();
        for op in ops {
            self.apply_asset_op(op, &mut mirrors).await?;
        }
        for key in &mirrors {
            self.put_object_mirror(key).await?;
        }
        Ok(())
    }

    fn file_name(meta: &ObjectMeta, prefix: &str) -> String {
        meta.key
            .strip_prefix(prefix)
            .unwrap_or(&meta.key)
            .to_string()
    }
}

#[async_trait]
impl Datastore for ObjectStorageStore {
    fn backend_name(&self) -> &'static str {
        "object-storage"
    }

    async fn check(&self) -> Result<()> {
        self.bucket.check().await?;
        self.index.check().await
    }

    async fn get_object_by_key(&self, key: &ObjectKey) -> Result<Object> {
        self.index.get_object_by_key(key).await
    }

    async fn get_fields_by_key(&self, key: &ObjectKey) -> Result<Fields> {
        self.index.get_fields_by_key(key).await
    }

    async fn get_metadata_by_key(&self, key: &ObjectKey) -> Result<Metadata> {
        let (_, body) = self
            .bucket
            .get(&asset_key(key, METADATA_ASSET))
            .await
            .map_err(|e| match e {
                BucketError::NotFound(_) => {
                    StoreError::not_found(format!("metadata of {}", key))
                }
                other => other.into(),
            })?;
        let doc: MetadataDoc = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Deserialize(format!("metadata of {}: {}", key, e)))?;
        Metadata::try_from(doc)
    }

    async fn get_blobs_by_key(&self, key: &ObjectKey) -> Result<Vec<Blob>> {
        let prefix = format!("{}{}", object_prefix(key), FILES_PREFIX);
        let now = Utc::now();

        let mut blobs = Vec::new();
        for meta in self.bucket.list(&prefix).await? {
            let content = match &self.signer {
                Some(signer) => BlobContent::Reference {
                    url: signer.sign(&self.bucket.object_url(&meta.key), now)?,
                },
                None => BlobContent::Inline(self.bucket.get(&meta.key).await?.1),
            };
            blobs.push(Blob {
                name: Self::file_name(&meta, &prefix),
                mime_type: meta.options.content_type.clone(),
                created: timestamp_attribute(&meta, CREATED_ATTRIBUTE),
                modified: timestamp_attribute(&meta, MODIFIED_ATTRIBUTE),
                content,
            });
        }

        if blobs.is_empty() {
            return Err(StoreError::not_found(format!("files of {}", key)));
        }
        blobs.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
        Ok(blobs)
    }

    async fn get_keys_by_fields(
        &self,
        namespace: &str,
        fields: &Fields,
    ) -> Result<Vec<ObjectKey>> {
        self.index.get_keys_by_fields(namespace, fields).await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let namespace = batch.namespace()?.to_string();
        let batch = self.resolve_references(batch).await?;

        let mut index_batch = WriteBatch::new();
        let mut event_batch = WriteBatch::new();
        for op in batch.ops() {
            match op {
                WriteOp::AppendEvent(_) => {
                    event_batch.push(op.clone());
                }
                WriteOp::AddObject(_)
                | WriteOp::SwapVtag { .. }
                | WriteOp::DeleteObject { .. }
                | WriteOp::AddFields { .. }
                | WriteOp::DeleteFields { .. } => {
                    index_batch.push(op.clone());
                }
                _ => {}
            }
        }

        let mut snapshots = Vec::new();
        for (key, scope) in asset_scopes(batch.ops()) {
            snapshots.push(self.snapshot(&key, &scope).await?);
        }

        let outcomes = index_outcomes(batch.ops());
        if !index_batch.is_empty() {
            self.index.apply(index_batch).await?;
        }

        if let Err(err) = self.apply_assets(batch.ops()).await {
            for snapshot in &snapshots {
                if let Err(restore) = self.restore(snapshot, outcomes.get(&snapshot.key)).await {
                    tracing::warn!(
                        key = %snapshot.key,
                        error = %restore,
                        "failed to compensate object storage write"
                    );
                }
            }
            return Err(err);
        }

        if !event_batch.is_empty() {
            if let Err(err) = self.index.apply(event_batch).await {
                tracing::warn!(namespace, error = %err, "failed to append events after write");
            }
        }

        tracing::debug!(namespace, ops = batch.len(), "applied object storage batch");
        Ok(())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.index.pending_events(limit).await
    }

    async fn mark_events_delivered(&self, namespace: &str, seqs: &[i64]) -> Result<()> {
        self.index.mark_events_delivered(namespace, seqs).await
    }

    async fn record_event_failure(&self, namespace: &str, seq: i64, error: &str) -> Result<()> {
        self.index.record_event_failure(namespace, seq, error).await
    }

    async fn mark_event_dead(&self, namespace: &str, seq: i64, error: &str) -> Result<()> {
        self.index.mark_event_dead(namespace, seq, error).await
    }

    async fn purge_delivered_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.index.purge_delivered_events(cutoff).await
    }

    async fn close(&self) -> Result<()> {
        self.index.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::bucket::LocalBucket;
    use super::*;
    use crate::config::SignerConfig;
    use crate::db::datastore::NamespaceAdmin;
    use crate::db::embedded_store::EmbeddedStore;
    use crate::models::new_vtag;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    /// Put that fails once, optionally pausing until released
    struct FailPoint {
        key: String,
        reached: Option<oneshot::Sender<()>>,
        release: Option<oneshot::Receiver<()>>,
    }

    /// [`LocalBucket`] that records reads and fails puts on demand
    struct ScriptedBucket {
        inner: LocalBucket,
        reads: Mutex<Vec<String>>,
        fail: Mutex<Option<FailPoint>>,
    }

    impl ScriptedBucket {
        fn fail_once(&self, key: &str) {
            *self.fail.lock().unwrap() = Some(FailPoint {
                key: key.to_string(),
                reached: None,
                release: None,
            });
        }

        /// Fail the put of `key` once it is released; returns the signal that
        /// the put was reached and the release switch
        fn pause_then_fail(&self, key: &str) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (reached_tx, reached_rx) = oneshot::channel();
            let (release_tx, release_rx) = oneshot::channel();
            *self.fail.lock().unwrap() = Some(FailPoint {
                key: key.to_string(),
                reached: Some(reached_tx),
                release: Some(release_rx),
            });
            (reached_rx, release_tx)
        }

        fn take_reads(&self) -> Vec<String> {
            std::mem::take(&mut *self.reads.lock().unwrap())
        }
    }

    #[async_trait]
    impl Bucket for ScriptedBucket {
        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            options: PutOptions,
        ) -> Result<(), BucketError> {
            let armed = {
                let mut fail = self.fail.lock().unwrap();
                match fail.as_ref() {
                    Some(point) if point.key == key => fail.take(),
                    _ => None,
                }
            };
            if let Some(point) = armed {
                if let Some(reached) = point.reached {
                    let _ = reached.send(());
                }
                if let Some(release) = point.release {
                    let _ = release.await;
                }
                return Err(BucketError::Io {
                    key: key.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "injected"),
                });
            }
            self.inner.put(key, body, options).await
        }

        async fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>), BucketError> {
            self.reads.lock().unwrap().push(key.to_string());
            self.inner.get(key).await
        }

        async fn head(&self, key: &str) -> Result<ObjectMeta, BucketError> {
            self.inner.head(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), BucketError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
            self.inner.list(prefix).await
        }

        fn object_url(&self, key: &str) -> String {
            self.inner.object_url(key)
        }

        fn key_for_url(&self, url: &str) -> Option<String> {
            self.inner.key_for_url(url)
        }

        async fn check(&self) -> Result<(), BucketError> {
            self.inner.check().await
        }
    }

    struct Scripted {
        store: Arc<ObjectStorageStore>,
        index: Arc<EmbeddedStore>,
        bucket: Arc<ScriptedBucket>,
        _temp_dir: TempDir,
    }

    async fn create_scripted_store() -> Scripted {
        let temp_dir = TempDir::new().unwrap();
        let index_dir = temp_dir.path().join("index");
        std::fs::create_dir_all(&index_dir).unwrap();

        let index = Arc::new(EmbeddedStore::open(&index_dir).await.unwrap());
        index.create_namespace("docs").await.unwrap();
        let bucket = Arc::new(ScriptedBucket {
            inner: LocalBucket::open(temp_dir.path().join("bucket")).await.unwrap(),
            reads: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
        });

        let store = Arc::new(ObjectStorageStore::new(bucket.clone(), index.clone(), None));
        Scripted {
            store,
            index,
            bucket,
            _temp_dir: temp_dir,
        }
    }

    fn swap(object: &Object, new: &str) -> WriteOp {
        WriteOp::SwapVtag {
            key: object.key(),
            expected: object.vtag.clone(),
            new: new.to_string(),
            modified: Utc::now(),
        }
    }

    async fn create_test_store(signer: Option<ReferenceSigner>) -> (ObjectStorageStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let index_dir = temp_dir.path().join("index");
        std::fs::create_dir_all(&index_dir).unwrap();

        let index = EmbeddedStore::open(&index_dir).await.unwrap();
        index.create_namespace("docs").await.unwrap();
        let bucket = LocalBucket::open(temp_dir.path().join("bucket")).await.unwrap();

        let store = ObjectStorageStore::new(Arc::new(bucket), Arc::new(index), signer);
        (store, temp_dir)
    }

    fn create_batch(object: &Object, blobs: &[Blob]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::AddObject(object.base()));
        for blob in blobs {
            batch.push(WriteOp::AddBlob {
                key: object.key(),
                blob: blob.clone(),
            });
        }
        batch
    }

    #[tokio::test]
    async fn test_assets_follow_bucket_layout() {
        let (store, temp_dir) = create_test_store(None).await;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();

        let mut batch = create_batch(&object, &[Blob::new("x.txt", "text/plain", b"x".to_vec())]);
        batch.push(WriteOp::AddMetadata {
            key: object.key(),
            metadata: Metadata::new("text/plain", b"m".to_vec()),
        });
        store.apply(batch).await.unwrap();

        let bucket_root = temp_dir.path().join("bucket");
        assert!(bucket_root.join("docs/a/object.json").is_file());
        assert!(bucket_root.join("docs/a/metadata.json").is_file());
        assert!(bucket_root.join("docs/a/files/x.txt").is_file());

        let blobs = store.get_blobs_by_key(&object.key()).await.unwrap();
        assert_eq!(blobs[0].payload(), Some(&b"x"[..]));
        assert_eq!(blobs[0].mime_type, "text/plain");
        assert_eq!(
            store.get_metadata_by_key(&object.key()).await.unwrap().payload,
            b"m"
        );
    }

    #[tokio::test]
    async fn test_failed_assets_roll_back_index_and_bucket() {
        let (store, temp_dir) = create_test_store(None).await;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();

        let duplicate = Blob::new("dup.bin", "application/octet-stream", vec![1]);
        let err = store
            .apply(create_batch(&object, &[duplicate.clone(), duplicate]))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(store
            .get_object_by_key(&object.key())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!temp_dir.path().join("bucket/docs/a/files/dup.bin").exists());
    }

    #[tokio::test]
    async fn test_stale_writer_never_touches_bucket() {
        let (store, _temp_dir) = create_test_store(None).await;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();
        store.apply(create_batch(&object, &[])).await.unwrap();

        let mut batch = WriteBatch::single(WriteOp::SwapVtag {
            key: object.key(),
            expected: "stale".to_string(),
            new: new_vtag(),
            modified: Utc::now(),
        });
        batch.push(WriteOp::AddBlob {
            key: object.key(),
            blob: Blob::new("late.bin", "application/octet-stream", vec![9]),
        });

        let err = store.apply(batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleObject);
        assert!(store
            .get_blobs_by_key(&object.key())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_signer_turns_files_into_references() {
        let signer = ReferenceSigner::new(&SignerConfig {
            access_key: "AK".to_string(),
            secret_key: "SK".to_string(),
            expiry_minutes: 5,
        });
        let (store, _temp_dir) = create_test_store(Some(signer.clone())).await;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();
        store
            .apply(create_batch(
                &object,
                &[Blob::new("x.bin", "application/octet-stream", vec![1, 2])],
            ))
            .await
            .unwrap();

        let blobs = store.get_blobs_by_key(&object.key()).await.unwrap();
        let reference = blobs[0].reference().unwrap();
        assert!(reference.contains("/docs/a/files/x.bin?"));
        assert!(signer.verify(reference, Utc::now()));
    }

    #[tokio::test]
    async fn test_failed_update_restores_prior_version() {
        let scripted = create_scripted_store().await;
        let store = &scripted.store;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();
        let first = Blob::new("first.bin", "application/octet-stream", vec![1]);
        store.apply(create_batch(&object, &[first])).await.unwrap();

        scripted.bucket.fail_once("docs/a/files/second.bin");
        let mut batch = WriteBatch::single(swap(&object, &new_vtag()));
        batch
            .push(WriteOp::DeleteBlobs { key: object.key() })
            .push(WriteOp::AddBlob {
                key: object.key(),
                blob: Blob::new("first.bin", "application/octet-stream", vec![9]),
            })
            .push(WriteOp::AddBlob {
                key: object.key(),
                blob: Blob::new("second.bin", "application/octet-stream", vec![2]),
            });
        let err = store.apply(batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);

        assert_eq!(store.get_object_by_key(&object.key()).await.unwrap().vtag, object.vtag);
        let blobs = store.get_blobs_by_key(&object.key()).await.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].name, "first.bin");
        assert_eq!(blobs[0].payload(), Some(&[1u8][..]));
    }

    #[tokio::test]
    async fn test_compensation_never_overwrites_a_newer_write() {
        let scripted = create_scripted_store().await;
        let store = scripted.store.clone();
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();
        store.apply(create_batch(&object, &[])).await.unwrap();

        let (reached, release) = scripted.bucket.pause_then_fail("docs/a/files/late.bin");
        let first_vtag = new_vtag();
        let mut batch = WriteBatch::single(swap(&object, &first_vtag));
        batch.push(WriteOp::AddBlob {
            key: object.key(),
            blob: Blob::new("late.bin", "application/octet-stream", vec![1]),
        });
        let writer = tokio::spawn({
            let store = store.clone();
            async move { store.apply(batch).await }
        });

        // a second writer commits on top of the first writer's vtag
        reached.await.unwrap();
        let mut committed = object.clone();
        committed.vtag = first_vtag;
        let second_vtag = new_vtag();
        scripted
            .index
            .apply(WriteBatch::single(swap(&committed, &second_vtag)))
            .await
            .unwrap();
        release.send(()).unwrap();

        assert!(writer.await.unwrap().is_err());
        assert_eq!(
            store.get_object_by_key(&object.key()).await.unwrap().vtag,
            second_vtag
        );
    }

    #[tokio::test]
    async fn test_snapshot_reads_only_touched_assets() {
        let scripted = create_scripted_store().await;
        let store = &scripted.store;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();
        store
            .apply(create_batch(
                &object,
                &[
                    Blob::new("big.bin", "application/octet-stream", vec![0; 4096]),
                    Blob::new("small.txt", "text/plain", b"s".to_vec()),
                ],
            ))
            .await
            .unwrap();
        scripted.bucket.take_reads();

        let mut fields = Fields::new();
        fields.insert("status".to_string(), "new".to_string());
        let next = new_vtag();
        let mut batch = WriteBatch::single(swap(&object, &next));
        batch
            .push(WriteOp::DeleteFields { key: object.key() })
            .push(WriteOp::AddFields {
                key: object.key(),
                fields,
                modified: Utc::now(),
            });
        store.apply(batch).await.unwrap();
        let reads = scripted.bucket.take_reads();
        assert!(reads.iter().all(|key| !key.contains("/files/")), "{:?}", reads);

        object.vtag = next;
        let mut batch = WriteBatch::single(swap(&object, &new_vtag()));
        batch.push(WriteOp::RenameBlob {
            key: object.key(),
            from: "small.txt".to_string(),
            to: "renamed.txt".to_string(),
            modified: Utc::now(),
        });
        store.apply(batch).await.unwrap();
        let reads = scripted.bucket.take_reads();
        assert!(!reads.iter().any(|key| key.ends_with("big.bin")), "{:?}", reads);
    }

    #[tokio::test]
    async fn test_signed_references_write_back_as_bytes() {
        let signer = ReferenceSigner::new(&SignerConfig {
            access_key: "AK".to_string(),
            secret_key: "SK".to_string(),
            expiry_minutes: 5,
        });
        let (store, temp_dir) = create_test_store(Some(signer)).await;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();
        store
            .apply(create_batch(
                &object,
                &[Blob::new("x.bin", "application/octet-stream", vec![1, 2])],
            ))
            .await
            .unwrap();

        let fetched = store.get_blobs_by_key(&object.key()).await.unwrap();
        assert!(fetched[0].reference().is_some());

        let next = new_vtag();
        let mut batch = WriteBatch::single(swap(&object, &next));
        batch
            .push(WriteOp::DeleteBlobs { key: object.key() })
            .push(WriteOp::AddBlob {
                key: object.key(),
                blob: fetched[0].clone(),
            });
        store.apply(batch).await.unwrap();
        assert_eq!(
            std::fs::read(temp_dir.path().join("bucket/docs/a/files/x.bin")).unwrap(),
            vec![1, 2]
        );

        let mut forged = fetched[0].clone();
        forged.content = BlobContent::Reference {
            url: format!("{}0", fetched[0].reference().unwrap()),
        };
        object.vtag = next;
        let mut batch = WriteBatch::single(swap(&object, &new_vtag()));
        batch.push(WriteOp::AddBlob {
            key: object.key(),
            blob: forged,
        });
        let err = store.apply(batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[tokio::test]
    async fn test_references_need_a_signer() {
        let (store, _temp_dir) = create_test_store(None).await;
        let mut object = Object::with_id("docs", "a");
        object.vtag = new_vtag();
        let mut blob = Blob::new("x.bin", "application/octet-stream", Vec::new());
        blob.content = BlobContent::Reference {
            url: "file:///bucket/docs/a/files/x.bin?X-Signature=00".to_string(),
        };

        let err = store.apply(create_batch(&object, &[blob])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }
}
