//! Embedded Store - libsql backend
//!
//! One SQLite-compatible store file per namespace, all under a single data
//! source directory:
//!
//! ```text
//! {data_source}/
//!   invoices.db
//!   customers.db
//! ```
//!
//! # Namespace Lifecycle
//!
//! The data path never creates a store file. Reading or writing a namespace
//! whose file is missing fails `NamespaceNotFound`; files are created only
//! through [`NamespaceAdmin::create_namespace`].
//!
//! # Connection Pattern
//!
//! Every operation opens a fresh connection with a 5-second busy timeout so
//! concurrent writers wait for the lock instead of failing with
//! `SQLITE_BUSY`. Opened databases are cached per namespace for the lifetime
//! of the handle.

use crate::db::datastore::{Datastore, NamespaceAdmin, WriteBatch, WriteOp};
use crate::db::sql::{
    classify_driver_error, format_timestamp, keys_by_fields, parse_timestamp, Dialect, KIND_FILE,
    KIND_METADATA,
};
use crate::error::{Result, StoreError};
use crate::events::{EventRecord, OutboxEntry};
use crate::models::validation::validate_namespace;
use crate::models::{Blob, BlobContent, Fields, Metadata, Object, ObjectKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// File extension of namespace store files
const STORE_EXTENSION: &str = "db";

/// Busy timeout applied to every connection
const BUSY_TIMEOUT_PRAGMA: &str = "PRAGMA busy_timeout = 5000";

/// libsql-backed [`Datastore`] with one store file per namespace
pub struct EmbeddedStore {
    data_source: PathBuf,
    databases: Mutex<HashMap<String, Arc<Database>>>,
}

impl std::fmt::Debug for EmbeddedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedStore")
            .field("data_source", &self.data_source)
            .finish_non_exhaustive()
    }
}

fn libsql_err(context: impl AsRef<str>) -> impl FnOnce(libsql::Error) -> StoreError {
    move |e| classify_driver_error(context.as_ref(), &e.to_string())
}

impl EmbeddedStore {
    /// Open the data source directory
    ///
    /// The directory must already exist; no namespace file is opened until
    /// first use.
    pub async fn open(data_source: impl Into<PathBuf>) -> Result<Self> {
        let data_source = data_source.into();
        let is_dir = tokio::fs::metadata(&data_source)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(StoreError::bad_parameter(format!(
                "dataSource {} is not an existing directory",
                data_source.display()
            )));
        }

        tracing::info!(data_source = %data_source.display(), "opened embedded store");

        Ok(Self {
            data_source,
            databases: Mutex::new(HashMap::new()),
        })
    }

    fn store_path(&self, namespace: &str) -> PathBuf {
        self.data_source
            .join(format!("{}.{}", namespace, STORE_EXTENSION))
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements return rows, so they go through `query()` rather
    /// than `execute()`.
    async fn execute_pragma(conn: &Connection, pragma: &str) -> Result<()> {
        conn.query(pragma, ())
            .await
            .map_err(libsql_err(format!("failed to execute '{}'", pragma)))?;
        Ok(())
    }

    async fn initialize_schema(db: &Database) -> Result<()> {
        let conn = db.connect().map_err(libsql_err("connect"))?;
        Self::execute_pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        Self::execute_pragma(&conn, BUSY_TIMEOUT_PRAGMA).await?;

        for statement in Dialect::Sqlite.schema() {
            conn.execute(statement, ())
                .await
                .map_err(libsql_err("failed to initialize schema"))?;
        }
        Ok(())
    }

    async fn build_database(path: &Path) -> Result<Database> {
        Builder::new_local(path)
            .build()
            .await
            .map_err(libsql_err(format!("failed to open {}", path.display())))
    }

    /// Cached database for `namespace`, opening it on first use
    async fn database(&self, namespace: &str) -> Result<Arc<Database>> {
        validate_namespace(namespace)?;

        let mut databases = self.databases.lock().await;
        if let Some(db) = databases.get(namespace) {
            return Ok(db.clone());
        }

        let path = self.store_path(namespace);
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(StoreError::namespace_not_found(namespace));
        }

        let db = Self::build_database(&path).await.map_err(|e| {
            tracing::warn!(namespace, error = %e, "namespace store is not openable");
            StoreError::namespace_not_found(namespace)
        })?;
        Self::initialize_schema(&db).await?;

        let db = Arc::new(db);
        databases.insert(namespace.to_string(), db.clone());
        tracing::debug!(namespace, "opened namespace store");
        Ok(db)
    }

    /// Connection with busy timeout configured
    async fn connect(&self, namespace: &str) -> Result<Connection> {
        let db = self.database(namespace).await?;
        let conn = db.connect().map_err(libsql_err("connect"))?;
        Self::execute_pragma(&conn, BUSY_TIMEOUT_PRAGMA).await?;
        Ok(conn)
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.data_source)
            .await
            .map_err(|e| StoreError::backend(format!("failed to list data source: {}", e)))?;

        let mut namespaces = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::backend(format!("failed to list data source: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            let is_file = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_namespace(stem).is_ok() {
                    namespaces.push(stem.to_string());
                }
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }

    async fn keys_in_namespace(&self, namespace: &str, fields: &Fields) -> Result<Vec<ObjectKey>> {
        let conn = self.connect(namespace).await?;
        let query = keys_by_fields(Dialect::Sqlite, namespace, fields);
        let params: Vec<libsql::Value> = query.params.into_iter().map(libsql::Value::Text).collect();

        let mut rows = conn
            .query(&query.sql, libsql::params::Params::Positional(params))
            .await
            .map_err(libsql_err("failed to search keys by fields"))?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(libsql_err("failed to read key"))? {
            let namespace: String = row.get(0).map_err(libsql_err("namespace column"))?;
            let id: String = row.get(1).map_err(libsql_err("oid column"))?;
            keys.push(ObjectKey::new(namespace, id));
        }
        Ok(keys)
    }
}

/// Stored vtag of `key`, if the object exists
async fn stored_vtag(conn: &Connection, key: &ObjectKey) -> Result<Option<String>> {
    let mut rows = conn
        .query(
            "SELECT vtag FROM objects WHERE namespace = ?1 AND oid = ?2",
            (key.namespace.as_str(), key.id.as_str()),
        )
        .await
        .map_err(libsql_err("failed to read vtag"))?;

    match rows.next().await.map_err(libsql_err("failed to read vtag"))? {
        Some(row) => Ok(Some(row.get(0).map_err(libsql_err("vtag column"))?)),
        None => Ok(None),
    }
}

/// Turn a zero-row conditional write into `NotFound` or `StaleObject`
async fn conditional_write_failure(conn: &Connection, key: &ObjectKey, expected: &str) -> StoreError {
    match stored_vtag(conn, key).await {
        Ok(Some(actual)) => StoreError::stale_object(&key.namespace, &key.id, expected, actual),
        Ok(None) => StoreError::not_found(format!("object {}", key)),
        Err(e) => e,
    }
}

async fn apply_op(conn: &Connection, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::AddObject(object) => {
            conn.execute(
                "INSERT INTO objects (namespace, oid, vtag, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    object.namespace.as_str(),
                    object.id.as_str(),
                    object.vtag.as_str(),
                    format_timestamp(&object.created),
                    format_timestamp(&object.modified),
                ),
            )
            .await
            .map_err(libsql_err(format!("object {}", object.key())))?;
        }
        WriteOp::SwapVtag {
            key,
            expected,
            new,
            modified,
        } => {
            let rows = conn
                .execute(
                    "UPDATE objects SET vtag = ?1, updated_at = ?2
                     WHERE namespace = ?3 AND oid = ?4 AND vtag = ?5",
                    (
                        new.as_str(),
                        format_timestamp(modified),
                        key.namespace.as_str(),
                        key.id.as_str(),
                        expected.as_str(),
                    ),
                )
                .await
                .map_err(libsql_err(format!("failed to swap vtag of {}", key)))?;
            if rows == 0 {
                return Err(conditional_write_failure(conn, key, expected).await);
            }
        }
        WriteOp::DeleteObject { key, expected_vtag } => match expected_vtag {
            Some(expected) => {
                let rows = conn
                    .execute(
                        "DELETE FROM objects WHERE namespace = ?1 AND oid = ?2 AND vtag = ?3",
                        (key.namespace.as_str(), key.id.as_str(), expected.as_str()),
                    )
                    .await
                    .map_err(libsql_err(format!("failed to delete {}", key)))?;
                if rows == 0 {
                    return Err(conditional_write_failure(conn, key, expected).await);
                }
            }
            None => {
                conn.execute(
                    "DELETE FROM objects WHERE namespace = ?1 AND oid = ?2",
                    (key.namespace.as_str(), key.id.as_str()),
                )
                .await
                .map_err(libsql_err(format!("failed to delete {}", key)))?;
            }
        },
        WriteOp::AddFields {
            key,
            fields,
            modified,
        } => {
            let modified = format_timestamp(modified);
            for (name, value) in fields {
                conn.execute(
                    "INSERT INTO fields (namespace, oid, name, value, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    (
                        key.namespace.as_str(),
                        key.id.as_str(),
                        name.as_str(),
                        value.as_str(),
                        modified.as_str(),
                    ),
                )
                .await
                .map_err(libsql_err(format!("field '{}' of {}", name, key)))?;
            }
        }
        WriteOp::DeleteFields { key } => {
            conn.execute(
                "DELETE FROM fields WHERE namespace = ?1 AND oid = ?2",
                (key.namespace.as_str(), key.id.as_str()),
            )
            .await
            .map_err(libsql_err(format!("failed to delete fields of {}", key)))?;
        }
        WriteOp::AddMetadata { key, metadata } => {
            conn.execute(
                "INSERT INTO blobs (namespace, oid, kind, name, mimetype, payload, vtag, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                (
                    key.namespace.as_str(),
                    key.id.as_str(),
                    KIND_METADATA,
                    metadata.id.as_str(),
                    metadata.mime_type.as_str(),
                    metadata.payload.clone(),
                    metadata.vtag.as_str(),
                    format_timestamp(&metadata.created),
                    format_timestamp(&metadata.modified),
                ),
            )
            .await
            .map_err(libsql_err(format!("metadata of {}", key)))?;
        }
        WriteOp::DeleteMetadata { key } => {
            conn.execute(
                "DELETE FROM blobs WHERE namespace = ?1 AND oid = ?2 AND kind = ?3",
                (key.namespace.as_str(), key.id.as_str(), KIND_METADATA),
            )
            .await
            .map_err(libsql_err(format!("failed to delete metadata of {}", key)))?;
        }
        WriteOp::AddBlob { key, blob } => {
            let payload = inline_payload(blob)?;
            conn.execute(
                "INSERT INTO blobs (namespace, oid, kind, name, mimetype, payload, vtag, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, '', ?7, ?8)",
                (
                    key.namespace.as_str(),
                    key.id.as_str(),
                    KIND_FILE,
                    blob.name.as_str(),
                    blob.mime_type.as_str(),
                    payload,
                    format_timestamp(&blob.created),
                    format_timestamp(&blob.modified),
                ),
            )
            .await
            .map_err(libsql_err(format!("file '{}' of {}", blob.name, key)))?;
        }
        WriteOp::DeleteBlob { key, name } => {
            conn.execute(
                "DELETE FROM blobs WHERE namespace = ?1 AND oid = ?2 AND kind = ?3 AND name = ?4",
                (key.namespace.as_str(), key.id.as_str(), KIND_FILE, name.as_str()),
            )
            .await
            .map_err(libsql_err(format!("failed to delete file '{}' of {}", name, key)))?;
        }
        WriteOp::DeleteBlobs { key } => {
            conn.execute(
                "DELETE FROM blobs WHERE namespace = ?1 AND oid = ?2 AND kind = ?3",
                (key.namespace.as_str(), key.id.as_str(), KIND_FILE),
            )
            .await
            .map_err(libsql_err(format!("failed to delete files of {}", key)))?;
        }
        WriteOp::RenameBlob {
            key,
            from,
            to,
            modified,
        } => {
            let rows = conn
                .execute(
                    "UPDATE blobs SET name = ?1, updated_at = ?2
                     WHERE namespace = ?3 AND oid = ?4 AND kind = ?5 AND name = ?6",
                    (
                        to.as_str(),
                        format_timestamp(modified),
                        key.namespace.as_str(),
                        key.id.as_str(),
                        KIND_FILE,
                        from.as_str(),
                    ),
                )
                .await
                .map_err(libsql_err(format!("file '{}' of {}", to, key)))?;
            if rows == 0 {
                return Err(StoreError::not_found(format!("file '{}' of {}", from, key)));
            }
        }
        WriteOp::AppendEvent(record) => {
            let payload = serde_json::to_string(record)
                .map_err(|e| StoreError::Serialize(format!("event record: {}", e)))?;
            conn.execute(
                "INSERT INTO outbox (namespace, payload, created_at) VALUES (?1, ?2, ?3)",
                (
                    record.namespace.as_str(),
                    payload,
                    format_timestamp(&record.occurred_at),
                ),
            )
            .await
            .map_err(libsql_err("failed to append event"))?;
        }
    }
    Ok(())
}

/// Only inline payloads can be persisted in a SQL row
pub(crate) fn inline_payload(blob: &Blob) -> Result<Vec<u8>> {
    match &blob.content {
        BlobContent::Inline(bytes) => Ok(bytes.clone()),
        BlobContent::Reference { .. } => Err(StoreError::bad_parameter(format!(
            "file '{}' carries a reference; only inline payloads can be stored",
            blob.name
        ))),
    }
}

#[async_trait]
impl Datastore for EmbeddedStore {
    fn backend_name(&self) -> &'static str {
        "embedded"
    }

    async fn check(&self) -> Result<()> {
        let is_dir = tokio::fs::metadata(&self.data_source)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(StoreError::backend(format!(
                "data source {} is gone",
                self.data_source.display()
            )));
        }

        let databases: Vec<Arc<Database>> =
            self.databases.lock().await.values().cloned().collect();
        for db in databases {
            let conn = db.connect().map_err(libsql_err("connect"))?;
            conn.query("SELECT 1", ())
                .await
                .map_err(libsql_err("liveness probe"))?;
        }
        Ok(())
    }

    async fn get_object_by_key(&self, key: &ObjectKey) -> Result<Object> {
        let conn = self.connect(&key.namespace).await?;
        let mut rows = conn
            .query(
                "SELECT vtag, created_at, updated_at FROM objects WHERE namespace = ?1 AND oid = ?2",
                (key.namespace.as_str(), key.id.as_str()),
            )
            .await
            .map_err(libsql_err(format!("failed to get object {}", key)))?;

        let row = rows
            .next()
            .await
            .map_err(libsql_err(format!("failed to get object {}", key)))?
            .ok_or_else(|| StoreError::not_found(format!("object {}", key)))?;

        let vtag: String = row.get(0).map_err(libsql_err("vtag column"))?;
        let created: String = row.get(1).map_err(libsql_err("created_at column"))?;
        let modified: String = row.get(2).map_err(libsql_err("updated_at column"))?;

        let mut object = Object::with_id(key.namespace.clone(), key.id.clone());
        object.vtag = vtag;
        object.created = parse_timestamp(&created)?;
        object.modified = parse_timestamp(&modified)?;
        Ok(object)
    }

    async fn get_fields_by_key(&self, key: &ObjectKey) -> Result<Fields> {
        let conn = self.connect(&key.namespace).await?;
        let mut rows = conn
            .query(
                "SELECT name, value FROM fields WHERE namespace = ?1 AND oid = ?2
                 ORDER BY updated_at, name",
                (key.namespace.as_str(), key.id.as_str()),
            )
            .await
            .map_err(libsql_err(format!("failed to get fields of {}", key)))?;

        let mut fields = Fields::new();
        while let Some(row) = rows.next().await.map_err(libsql_err("failed to read field"))? {
            let name: String = row.get(0).map_err(libsql_err("name column"))?;
            let value: String = row.get(1).map_err(libsql_err("value column"))?;
            fields.insert(name, value);
        }

        if fields.is_empty() {
            return Err(StoreError::not_found(format!("fields of {}", key)));
        }
        Ok(fields)
    }

    async fn get_metadata_by_key(&self, key: &ObjectKey) -> Result<Metadata> {
        let conn = self.connect(&key.namespace).await?;
        let mut rows = conn
            .query(
                "SELECT name, vtag, mimetype, payload, created_at, updated_at FROM blobs
                 WHERE namespace = ?1 AND oid = ?2 AND kind = ?3",
                (key.namespace.as_str(), key.id.as_str(), KIND_METADATA),
            )
            .await
            .map_err(libsql_err(format!("failed to get metadata of {}", key)))?;

        let row = rows
            .next()
            .await
            .map_err(libsql_err(format!("failed to get metadata of {}", key)))?
            .ok_or_else(|| StoreError::not_found(format!("metadata of {}", key)))?;

        let created: String = row.get(4).map_err(libsql_err("created_at column"))?;
        let modified: String = row.get(5).map_err(libsql_err("updated_at column"))?;
        Ok(Metadata {
            id: row.get(0).map_err(libsql_err("name column"))?,
            vtag: row.get(1).map_err(libsql_err("vtag column"))?,
            mime_type: row.get(2).map_err(libsql_err("mimetype column"))?,
            payload: row.get(3).map_err(libsql_err("payload column"))?,
            created: parse_timestamp(&created)?,
            modified: parse_timestamp(&modified)?,
        })
    }

    async fn get_blobs_by_key(&self, key: &ObjectKey) -> Result<Vec<Blob>> {
        let conn = self.connect(&key.namespace).await?;
        let mut rows = conn
            .query(
                "SELECT name, mimetype, payload, created_at, updated_at FROM blobs
                 WHERE namespace = ?1 AND oid = ?2 AND kind = ?3
                 ORDER BY updated_at, name",
                (key.namespace.as_str(), key.id.as_str(), KIND_FILE),
            )
            .await
            .map_err(libsql_err(format!("failed to get files of {}", key)))?;

        let mut blobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(libsql_err("failed to read file"))? {
            let created: String = row.get(3).map_err(libsql_err("created_at column"))?;
            let modified: String = row.get(4).map_err(libsql_err("updated_at column"))?;
            blobs.push(Blob {
                name: row.get(0).map_err(libsql_err("name column"))?,
                mime_type: row.get(1).map_err(libsql_err("mimetype column"))?,
                content: BlobContent::Inline(row.get(2).map_err(libsql_err("payload column"))?),
                created: parse_timestamp(&created)?,
                modified: parse_timestamp(&modified)?,
            });
        }

        if blobs.is_empty() {
            return Err(StoreError::not_found(format!("files of {}", key)));
        }
        Ok(blobs)
    }

    async fn get_keys_by_fields(
        &self,
        namespace: &str,
        fields: &Fields,
    ) -> Result<Vec<ObjectKey>> {
        let keys = if namespace.is_empty() {
            let mut keys = Vec::new();
            for namespace in self.namespaces().await? {
                keys.extend(self.keys_in_namespace(&namespace, fields).await?);
            }
            keys
        } else {
            self.keys_in_namespace(namespace, fields).await?
        };

        if keys.is_empty() {
            return Err(StoreError::not_found("no object matches the field predicates"));
        }
        Ok(keys)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let namespace = batch.namespace()?.to_string();
        let conn = self.connect(&namespace).await?;
        let tx = conn
            .transaction()
            .await
            .map_err(libsql_err("failed to begin transaction"))?;

        for op in batch.ops() {
            if let Err(err) = apply_op(&tx, op).await {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(namespace, error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        }

        tx.commit()
            .await
            .map_err(libsql_err("failed to commit transaction"))?;
        tracing::debug!(namespace, ops = batch.len(), "applied write batch");
        Ok(())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let mut entries = Vec::new();
        for namespace in self.namespaces().await? {
            if entries.len() >= limit {
                break;
            }
            let conn = self.connect(&namespace).await?;
            let mut rows = conn
                .query(
                    "SELECT seq, payload, attempts FROM outbox
                     WHERE delivered_at IS NULL AND dead_at IS NULL
                     ORDER BY seq LIMIT ?1",
                    [(limit - entries.len()) as i64],
                )
                .await
                .map_err(libsql_err("failed to read outbox"))?;

            while let Some(row) = rows.next().await.map_err(libsql_err("failed to read outbox"))? {
                let seq: i64 = row.get(0).map_err(libsql_err("seq column"))?;
                let payload: String = row.get(1).map_err(libsql_err("payload column"))?;
                let attempts: i64 = row.get(2).map_err(libsql_err("attempts column"))?;
                let record: EventRecord = serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Deserialize(format!("outbox row {}: {}", seq, e)))?;
                entries.push(OutboxEntry {
                    seq,
                    record,
                    attempts: attempts as u32,
                });
            }
        }
        Ok(entries)
    }

    async fn mark_events_delivered(&self, namespace: &str, seqs: &[i64]) -> Result<()> {
        let conn = self.connect(namespace).await?;
        let delivered_at = format_timestamp(&Utc::now());
        for seq in seqs {
            conn.execute(
                "UPDATE outbox SET delivered_at = ?1 WHERE seq = ?2",
                (delivered_at.as_str(), *seq),
            )
            .await
            .map_err(libsql_err("failed to mark event delivered"))?;
        }
        Ok(())
    }

    async fn record_event_failure(&self, namespace: &str, seq: i64, error: &str) -> Result<()> {
        let conn = self.connect(namespace).await?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?1 WHERE seq = ?2",
            (error, seq),
        )
        .await
        .map_err(libsql_err("failed to record event failure"))?;
        Ok(())
    }

    async fn mark_event_dead(&self, namespace: &str, seq: i64, error: &str) -> Result<()> {
        let conn = self.connect(namespace).await?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?1, dead_at = ?2
             WHERE seq = ?3",
            (error, format_timestamp(&Utc::now()), seq),
        )
        .await
        .map_err(libsql_err("failed to dead-letter event"))?;
        Ok(())
    }

    async fn purge_delivered_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = format_timestamp(&cutoff);
        let mut purged = 0;
        for namespace in self.namespaces().await? {
            let conn = self.connect(&namespace).await?;
            purged += conn
                .execute(
                    "DELETE FROM outbox WHERE delivered_at IS NOT NULL AND delivered_at <= ?1",
                    [cutoff.as_str()],
                )
                .await
                .map_err(libsql_err("failed to purge delivered events"))?;
        }
        Ok(purged)
    }

    async fn close(&self) -> Result<()> {
        let mut databases = self.databases.lock().await;
        let count = databases.len();
        databases.clear();
        tracing::info!(namespaces = count, "closed embedded store");
        Ok(())
    }
}

#[async_trait]
impl NamespaceAdmin for EmbeddedStore {
    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        validate_namespace(namespace)?;

        let mut databases = self.databases.lock().await;
        let path = self.store_path(namespace);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::already_exists(format!("namespace {}", namespace)));
        }

        let db = Self::build_database(&path).await?;
        Self::initialize_schema(&db).await?;
        databases.insert(namespace.to_string(), Arc::new(db));

        tracing::info!(namespace, path = %path.display(), "created namespace store");
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.namespaces().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::new_vtag;
    use tempfile::TempDir;

    async fn create_test_store() -> (EmbeddedStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = EmbeddedStore::open(temp_dir.path()).await.unwrap();
        store.create_namespace("docs").await.unwrap();
        (store, temp_dir)
    }

    fn stored_object(id: &str) -> Object {
        let mut object = Object::with_id("docs", id);
        object.vtag = new_vtag();
        object
    }

    #[tokio::test]
    async fn test_missing_namespace_is_never_created() {
        let (store, temp_dir) = create_test_store().await;

        let err = store
            .get_object_by_key(&ObjectKey::new("ghost", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NamespaceNotFound);
        assert!(!temp_dir.path().join("ghost.db").exists());
    }

    #[tokio::test]
    async fn test_directory_named_like_a_store_is_not_a_namespace() {
        let (store, temp_dir) = create_test_store().await;
        std::fs::create_dir(temp_dir.path().join("shadow.db")).unwrap();

        let err = store
            .get_object_by_key(&ObjectKey::new("shadow", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NamespaceNotFound);
        assert_eq!(store.list_namespaces().await.unwrap(), vec!["docs".to_string()]);
    }

    #[tokio::test]
    async fn test_open_requires_existing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let err = EmbeddedStore::open(temp_dir.path().join("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[tokio::test]
    async fn test_create_namespace_twice_fails() {
        let (store, _temp_dir) = create_test_store().await;
        let err = store.create_namespace("docs").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(store.list_namespaces().await.unwrap(), vec!["docs".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_object_maps_to_already_exists() {
        let (store, _temp_dir) = create_test_store().await;
        let object = stored_object("a");

        store.add_object(&object).await.unwrap();
        let err = store.add_object(&object).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_component_reads_fail_not_found_when_empty() {
        let (store, _temp_dir) = create_test_store().await;
        let object = stored_object("a");
        store.add_object(&object).await.unwrap();

        let key = object.key();
        assert!(store.get_fields_by_key(&key).await.unwrap_err().is_not_found());
        assert!(store.get_blobs_by_key(&key).await.unwrap_err().is_not_found());
        assert!(store.get_metadata_by_key(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_deletes_are_idempotent() {
        let (store, _temp_dir) = create_test_store().await;
        let key = ObjectKey::new("docs", "never-stored");

        store.delete_object_by_key(&key).await.unwrap();
        store.delete_fields_by_key(&key).await.unwrap();
        store.delete_metadata_by_key(&key).await.unwrap();
        store.delete_blobs_by_key(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_and_file_never_collide() {
        let (store, _temp_dir) = create_test_store().await;
        let object = stored_object("a");
        store.add_object(&object).await.unwrap();
        let key = object.key();

        let mut metadata = Metadata::new("text/plain", b"meta".to_vec());
        metadata.id = "shared-name".to_string();
        store.add_metadata(&key, &metadata).await.unwrap();
        store
            .add_blob(&key, &Blob::new("shared-name", "text/plain", b"file".to_vec()))
            .await
            .unwrap();

        assert_eq!(store.get_metadata_by_key(&key).await.unwrap().payload, b"meta");
        let blobs = store.get_blobs_by_key(&key).await.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].payload(), Some(&b"file"[..]));

        let err = store
            .add_metadata(&key, &Metadata::new("text/plain", b"second".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let (store, _temp_dir) = create_test_store().await;
        let object = stored_object("a");
        let key = object.key();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::AddObject(object.clone()))
            .push(WriteOp::AddBlob {
                key: key.clone(),
                blob: Blob::new("same.bin", "application/octet-stream", vec![1]),
            })
            .push(WriteOp::AddBlob {
                key: key.clone(),
                blob: Blob::new("same.bin", "application/octet-stream", vec![2]),
            });

        let err = store.apply(batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(store.get_object_by_key(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_swap_vtag_detects_stale_writer() {
        let (store, _temp_dir) = create_test_store().await;
        let object = stored_object("a");
        store.add_object(&object).await.unwrap();

        let swap = |expected: &str| {
            WriteBatch::single(WriteOp::SwapVtag {
                key: object.key(),
                expected: expected.to_string(),
                new: new_vtag(),
                modified: Utc::now(),
            })
        };

        store.apply(swap(&object.vtag)).await.unwrap();
        let err = store.apply(swap(&object.vtag)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleObject);

        let missing = WriteBatch::single(WriteOp::SwapVtag {
            key: ObjectKey::new("docs", "missing"),
            expected: "v".to_string(),
            new: new_vtag(),
            modified: Utc::now(),
        });
        assert!(store.apply(missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_keys_by_fields_requires_every_predicate() {
        let (store, _temp_dir) = create_test_store().await;
        for (id, color, size) in [("a", "red", "l"), ("b", "red", "s"), ("c", "blue", "l")] {
            let object = stored_object(id);
            store.add_object(&object).await.unwrap();
            let mut fields = Fields::new();
            fields.insert("color".to_string(), color.to_string());
            fields.insert("size".to_string(), size.to_string());
            store.add_fields(&object.key(), &fields).await.unwrap();
        }

        let mut query = Fields::new();
        query.insert("color".to_string(), "red".to_string());
        query.insert("size".to_string(), "l".to_string());
        let keys = store.get_keys_by_fields("docs", &query).await.unwrap();
        assert_eq!(keys, vec![ObjectKey::new("docs", "a")]);

        let all = store.get_keys_by_fields("", &Fields::new()).await.unwrap();
        assert_eq!(all.len(), 3);

        query.insert("size".to_string(), "xxl".to_string());
        assert!(store
            .get_keys_by_fields("docs", &query)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
