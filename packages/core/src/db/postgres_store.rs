//! PostgreSQL backend using sqlx.
//!
//! All namespaces share one database; the namespace is a key column. The
//! schema is ensured with `CREATE TABLE IF NOT EXISTS` when the pool is
//! opened.

use crate::config::PostgresConfig;
use crate::db::datastore::{Datastore, WriteBatch, WriteOp};
use crate::db::embedded_store::inline_payload;
use crate::db::sql::{classify_driver_error, keys_by_fields, Dialect, KIND_FILE, KIND_METADATA};
use crate::error::{Result, StoreError};
use crate::events::{EventRecord, OutboxEntry};
use crate::models::validation::validate_namespace;
use crate::models::{Blob, BlobContent, Fields, Metadata, Object, ObjectKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};

/// Default maximum connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

fn pg_err(context: impl AsRef<str>) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| classify_driver_error(context.as_ref(), &e.to_string())
}

/// Shared-pool [`Datastore`] over PostgreSQL
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connect and ensure the schema
    ///
    /// `connectTimeout` bounds both the initial connect and every later
    /// pool acquire.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.db_name)
            .username(&config.user)
            .password(&config.password);

        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(pg_err(format!(
                "failed to connect to {}:{}/{}",
                config.host, config.port, config.db_name
            )))?;

        for statement in Dialect::Postgres.schema() {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(pg_err("failed to initialize schema"))?;
        }

        tracing::info!(host = %config.host, db = %config.db_name, "connected to postgres");
        Ok(Self { pool })
    }

    #[inline]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn stored_vtag(conn: &mut PgConnection, key: &ObjectKey) -> Result<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT vtag FROM objects WHERE namespace = $1 AND oid = $2")
        .bind(&key.namespace)
        .bind(&key.id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(pg_err("failed to read vtag"))
}

async fn conditional_write_failure(
    conn: &mut PgConnection,
    key: &ObjectKey,
    expected: &str,
) -> StoreError {
    match stored_vtag(conn, key).await {
        Ok(Some(actual)) => StoreError::stale_object(&key.namespace, &key.id, expected, actual),
        Ok(None) => StoreError::not_found(format!("object {}", key)),
        Err(e) => e,
    }
}

async fn apply_op(conn: &mut PgConnection, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::AddObject(object) => {
            sqlx::query(
                "INSERT INTO objects (namespace, oid, vtag, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&object.namespace)
            .bind(&object.id)
            .bind(&object.vtag)
            .bind(object.created)
            .bind(object.modified)
            .execute(&mut *conn)
            .await
            .map_err(pg_err(format!("object {}", object.key())))?;
        }
        WriteOp::SwapVtag {
            key,
            expected,
            new,
            modified,
        } => {
            let result = sqlx::query(
                "UPDATE objects SET vtag = $1, updated_at = $2
                 WHERE namespace = $3 AND oid = $4 AND vtag = $5",
            )
            .bind(new)
            .bind(modified)
            .bind(&key.namespace)
            .bind(&key.id)
            .bind(expected)
            .execute(&mut *conn)
            .await
            .map_err(pg_err(format!("failed to swap vtag of {}", key)))?;
            if result.rows_affected() == 0 {
                return Err(conditional_write_failure(conn, key, expected).await);
            }
        }
        WriteOp::DeleteObject { key, expected_vtag } => match expected_vtag {
            Some(expected) => {
                let result = sqlx::query(
                    "DELETE FROM objects WHERE namespace = $1 AND oid = $2 AND vtag = $3",
                )
                .bind(&key.namespace)
                .bind(&key.id)
                .bind(expected)
                .execute(&mut *conn)
                .await
                .map_err(pg_err(format!("failed to delete {}", key)))?;
                if result.rows_affected() == 0 {
                    return Err(conditional_write_failure(conn, key, expected).await);
                }
            }
            None => {
                sqlx::query("DELETE FROM objects WHERE namespace = $1 AND oid = $2")
                    .bind(&key.namespace)
                    .bind(&key.id)
                    .execute(&mut *conn)
                    .await
                    .map_err(pg_err(format!("failed to delete {}", key)))?;
            }
        },
        WriteOp::AddFields {
            key,
            fields,
            modified,
        } => {
            for (name, value) in fields {
                sqlx::query(
                    "INSERT INTO fields (namespace, oid, name, value, updated_at)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&key.namespace)
                .bind(&key.id)
                .bind(name)
                .bind(value)
                .bind(modified)
                .execute(&mut *conn)
                .await
                .map_err(pg_err(format!("field '{}' of {}", name, key)))?;
            }
        }
        WriteOp::DeleteFields { key } => {
            sqlx::query("DELETE FROM fields WHERE namespace = $1 AND oid = $2")
                .bind(&key.namespace)
                .bind(&key.id)
                .execute(&mut *conn)
                .await
                .map_err(pg_err(format!("failed to delete fields of {}", key)))?;
        }
        WriteOp::AddMetadata { key, metadata } => {
            sqlx::query(
                "INSERT INTO blobs (namespace, oid, kind, name, mimetype, payload, vtag, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&key.namespace)
            .bind(&key.id)
            .bind(KIND_METADATA)
            .bind(&metadata.id)
            .bind(&metadata.mime_type)
            .bind(&metadata.payload)
            .bind(&metadata.vtag)
            .bind(metadata.created)
            .bind(metadata.modified)
            .execute(&mut *conn)
            .await
            .map_err(pg_err(format!("metadata of {}", key)))?;
        }
        WriteOp::DeleteMetadata { key } => {
            sqlx::query("DELETE FROM blobs WHERE namespace = $1 AND oid = $2 AND kind = $3")
                .bind(&key.namespace)
                .bind(&key.id)
                .bind(KIND_METADATA)
                .execute(&mut *conn)
                .await
                .map_err(pg_err(format!("failed to delete metadata of {}", key)))?;
        }
        WriteOp::AddBlob { key, blob } => {
            let payload = inline_payload(blob)?;
            sqlx::query(
                "INSERT INTO blobs (namespace, oid, kind, name, mimetype, payload, vtag, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, '', $7, $8)",
            )
            .bind(&key.namespace)
            .bind(&key.id)
            .bind(KIND_FILE)
            .bind(&blob.name)
            .bind(&blob.mime_type)
            .bind(payload)
            .bind(blob.created)
            .bind(blob.modified)
            .execute(&mut *conn)
            .await
            .map_err(pg_err(format!("file '{}' of {}", blob.name, key)))?;
        }
        WriteOp::DeleteBlob { key, name } => {
            sqlx::query(
                "DELETE FROM blobs WHERE namespace = $1 AND oid = $2 AND kind = $3 AND name = $4",
            )
            .bind(&key.namespace)
            .bind(&key.id)
            .bind(KIND_FILE)
            .bind(name)
            .execute(&mut *conn)
            .await
            .map_err(pg_err(format!("failed to delete file '{}' of {}", name, key)))?;
        }
        WriteOp::DeleteBlobs { key } => {
            sqlx::query("DELETE FROM blobs WHERE namespace = $1 AND oid = $2 AND kind = $3")
                .bind(&key.namespace)
                .bind(&key.id)
                .bind(KIND_FILE)
                .execute(&mut *conn)
                .await
                .map_err(pg_err(format!("failed to delete files of {}", key)))?;
        }
        WriteOp::RenameBlob {
            key,
            from,
            to,
            modified,
        } => {
            let result = sqlx::query(
                "UPDATE blobs SET name = $1, updated_at = $2
                 WHERE namespace = $3 AND oid = $4 AND kind = $5 AND name = $6",
            )
            .bind(to)
            .bind(modified)
            .bind(&key.namespace)
            .bind(&key.id)
            .bind(KIND_FILE)
            .bind(from)
            .execute(&mut *conn)
            .await
            .map_err(pg_err(format!("file '{}' of {}", to, key)))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::not_found(format!("file '{}' of {}", from, key)));
            }
        }
        WriteOp::AppendEvent(record) => {
            let payload = serde_json::to_string(record)
                .map_err(|e| StoreError::Serialize(format!("event record: {}", e)))?;
            sqlx::query("INSERT INTO outbox (namespace, payload, created_at) VALUES ($1, $2, $3)")
                .bind(&record.namespace)
                .bind(payload)
                .bind(record.occurred_at)
                .execute(&mut *conn)
                .await
                .map_err(pg_err("failed to append event"))?;
        }
    }
    Ok(())
}

#[async_trait]
impl Datastore for PostgresStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(pg_err("liveness probe"))?;
        Ok(())
    }

    async fn get_object_by_key(&self, key: &ObjectKey) -> Result<Object> {
        validate_namespace(&key.namespace)?;
        let row = sqlx::query_as::<_, (String, DateTime<Utc>, DateTime<Utc>)>(
            "SELECT vtag, created_at, updated_at FROM objects WHERE namespace = $1 AND oid = $2",
        )
        .bind(&key.namespace)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err(format!("failed to get object {}", key)))?
        .ok_or_else(|| StoreError::not_found(format!("object {}", key)))?;

        let mut object = Object::with_id(key.namespace.clone(), key.id.clone());
        object.vtag = row.0;
        object.created = row.1;
        object.modified = row.2;
        Ok(object)
    }

    async fn get_fields_by_key(&self, key: &ObjectKey) -> Result<Fields> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT name, value FROM fields WHERE namespace = $1 AND oid = $2
             ORDER BY updated_at, name",
        )
        .bind(&key.namespace)
        .bind(&key.id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err(format!("failed to get fields of {}", key)))?;

        if rows.is_empty() {
            return Err(StoreError::not_found(format!("fields of {}", key)));
        }
        Ok(rows.into_iter().collect())
    }

    async fn get_metadata_by_key(&self, key: &ObjectKey) -> Result<Metadata> {
        let row = sqlx::query_as::<_, (String, String, String, Vec<u8>, DateTime<Utc>, DateTime<Utc>)>(
            "SELECT name, vtag, mimetype, payload, created_at, updated_at FROM blobs
             WHERE namespace = $1 AND oid = $2 AND kind = $3",
        )
        .bind(&key.namespace)
        .bind(&key.id)
        .bind(KIND_METADATA)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err(format!("failed to get metadata of {}", key)))?
        .ok_or_else(|| StoreError::not_found(format!("metadata of {}", key)))?;

        Ok(Metadata {
            id: row.0,
            vtag: row.1,
            mime_type: row.2,
            payload: row.3,
            created: row.4,
            modified: row.5,
        })
    }

    async fn get_blobs_by_key(&self, key: &ObjectKey) -> Result<Vec<Blob>> {
        let rows = sqlx::query_as::<_, (String, String, Vec<u8>, DateTime<Utc>, DateTime<Utc>)>(
            "SELECT name, mimetype, payload, created_at, updated_at FROM blobs
             WHERE namespace = $1 AND oid = $2 AND kind = $3
             ORDER BY updated_at, name",
        )
        .bind(&key.namespace)
        .bind(&key.id)
        .bind(KIND_FILE)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err(format!("failed to get files of {}", key)))?;

        if rows.is_empty() {
            return Err(StoreError::not_found(format!("files of {}", key)));
        }
        Ok(rows
            .into_iter()
            .map(|(name, mime_type, payload, created, modified)| Blob {
                name,
                mime_type,
                created,
                modified,
                content: BlobContent::Inline(payload),
            })
            .collect())
    }

    async fn get_keys_by_fields(
        &self,
        namespace: &str,
        fields: &Fields,
    ) -> Result<Vec<ObjectKey>> {
        if !namespace.is_empty() {
            validate_namespace(namespace)?;
        }
        let bound = keys_by_fields(Dialect::Postgres, namespace, fields);
        let mut query = sqlx::query_as::<_, (String, String)>(&bound.sql);
        for param in &bound.params {
            query = query.bind(param);
        }

        let keys: Vec<ObjectKey> = query
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err("failed to search keys by fields"))?
            .into_iter()
            .map(|(namespace, id)| ObjectKey::new(namespace, id))
            .collect();

        if keys.is_empty() {
            return Err(StoreError::not_found("no object matches the field predicates"));
        }
        Ok(keys)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let namespace = batch.namespace()?.to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(pg_err("failed to begin transaction"))?;

        for op in batch.ops() {
            if let Err(err) = apply_op(&mut tx, op).await {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(namespace, error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        }

        tx.commit()
            .await
            .map_err(pg_err("failed to commit transaction"))?;
        tracing::debug!(namespace, ops = batch.len(), "applied write batch");
        Ok(())
    }

    async fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query_as::<_, (i64, String, i32)>(
            "SELECT seq, payload, attempts FROM outbox
             WHERE delivered_at IS NULL AND dead_at IS NULL
             ORDER BY seq LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err("failed to read outbox"))?;

        rows.into_iter()
            .map(|(seq, payload, attempts)| {
                let record: EventRecord = serde_json::from_str(&payload)
                    .map_err(|e| StoreError::Deserialize(format!("outbox row {}: {}", seq, e)))?;
                Ok(OutboxEntry {
                    seq,
                    record,
                    attempts: attempts.max(0) as u32,
                })
            })
            .collect()
    }

    async fn mark_events_delivered(&self, _namespace: &str, seqs: &[i64]) -> Result<()> {
        sqlx::query("UPDATE outbox SET delivered_at = $1 WHERE seq = ANY($2)")
            .bind(Utc::now())
            .bind(seqs)
            .execute(&self.pool)
            .await
            .map_err(pg_err("failed to mark events delivered"))?;
        Ok(())
    }

    async fn record_event_failure(&self, _namespace: &str, seq: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = $1 WHERE seq = $2")
            .bind(error)
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(pg_err("failed to record event failure"))?;
        Ok(())
    }

    async fn mark_event_dead(&self, _namespace: &str, seq: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET attempts = attempts + 1, last_error = $1, dead_at = $2
             WHERE seq = $3",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(seq)
        .execute(&self.pool)
        .await
        .map_err(pg_err("failed to dead-letter event"))?;
        Ok(())
    }

    async fn purge_delivered_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox WHERE delivered_at IS NOT NULL AND delivered_at <= $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(pg_err("failed to purge delivered events"))?;
        Ok(result.rows_affected())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        tracing::info!("closed postgres pool");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::new_vtag;

    /// Runs only against a live server: `EASYSTORE_TEST_PG_HOST` plus the
    /// optional `EASYSTORE_TEST_PG_{PORT,DB,USER,PASSWORD}`.
    fn test_config() -> Option<PostgresConfig> {
        let host = std::env::var("EASYSTORE_TEST_PG_HOST").ok()?;
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        Some(PostgresConfig {
            host,
            port: var("EASYSTORE_TEST_PG_PORT", "5432").parse().ok()?,
            db_name: var("EASYSTORE_TEST_PG_DB", "easystore"),
            user: var("EASYSTORE_TEST_PG_USER", "postgres"),
            password: var("EASYSTORE_TEST_PG_PASSWORD", "postgres"),
            connect_timeout: 5,
        })
    }

    #[tokio::test]
    async fn test_postgres_conditional_writes() {
        let Some(config) = test_config() else {
            return;
        };
        let store = PostgresStore::connect(&config).await.unwrap();
        store.check().await.unwrap();

        let mut object = Object::new("pgtest");
        object.vtag = new_vtag();
        store.add_object(&object).await.unwrap();
        assert_eq!(
            store.add_object(&object).await.unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );

        let stale = WriteBatch::single(WriteOp::SwapVtag {
            key: object.key(),
            expected: "not-the-vtag".to_string(),
            new: new_vtag(),
            modified: Utc::now(),
        });
        assert_eq!(store.apply(stale).await.unwrap_err().kind(), ErrorKind::StaleObject);

        store.delete_object_by_key(&object.key()).await.unwrap();
        assert!(store
            .get_object_by_key(&object.key())
            .await
            .unwrap_err()
            .is_not_found());
        store.close().await.unwrap();
    }
}
