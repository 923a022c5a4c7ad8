//! SQL shared by the libsql and PostgreSQL backends
//!
//! Both SQL backends persist the same layout:
//!
//! - `objects(namespace, oid, vtag, created_at, updated_at)`
//! - `fields(namespace, oid, name, value, updated_at)`
//! - `blobs(namespace, oid, kind, name, mimetype, payload, vtag, created_at, updated_at)`
//! - `outbox(seq, namespace, payload, created_at, delivered_at, dead_at, attempts, last_error)`
//!
//! `blobs.kind` discriminates files from metadata. A partial unique index
//! allows at most one metadata row per object. An outbox row is pending
//! while both `delivered_at` and `dead_at` are NULL.

use crate::error::StoreError;
use crate::models::Fields;
use chrono::{DateTime, SecondsFormat, Utc};

/// `blobs.kind` for files
pub const KIND_FILE: &str = "file";

/// `blobs.kind` for the metadata payload
pub const KIND_METADATA: &str = "metadata";

/// Driver messages that mean a unique constraint rejected an insert
///
/// Matched on the message text so every backend remaps the same way.
const UNIQUE_VIOLATION_PATTERNS: [&str; 4] = [
    "UNIQUE constraint failed",
    "duplicate key value violates unique constraint",
    "Duplicate entry",
    "PRIMARY KEY constraint",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Positional placeholder for the 1-based parameter `n`
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", n),
            Dialect::Postgres => format!("${}", n),
        }
    }

    pub fn schema(&self) -> &'static [&'static str] {
        match self {
            Dialect::Sqlite => SQLITE_SCHEMA,
            Dialect::Postgres => POSTGRES_SCHEMA,
        }
    }
}

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS objects (
        namespace TEXT NOT NULL,
        oid TEXT NOT NULL,
        vtag TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (namespace, oid)
    )",
    "CREATE TABLE IF NOT EXISTS fields (
        namespace TEXT NOT NULL,
        oid TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (namespace, oid, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_fields_name_value ON fields(name, value)",
    "CREATE TABLE IF NOT EXISTS blobs (
        namespace TEXT NOT NULL,
        oid TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('file', 'metadata')),
        name TEXT NOT NULL,
        mimetype TEXT NOT NULL,
        payload BLOB NOT NULL,
        vtag TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (namespace, oid, kind, name)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_blobs_one_metadata
        ON blobs(namespace, oid) WHERE kind = 'metadata'",
    "CREATE TABLE IF NOT EXISTS outbox (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        namespace TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        delivered_at TEXT,
        dead_at TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(delivered_at, dead_at, seq)",
];

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS objects (
        namespace TEXT NOT NULL,
        oid TEXT NOT NULL,
        vtag TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (namespace, oid)
    )",
    "CREATE TABLE IF NOT EXISTS fields (
        namespace TEXT NOT NULL,
        oid TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (namespace, oid, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_fields_name_value ON fields(name, value)",
    "CREATE TABLE IF NOT EXISTS blobs (
        namespace TEXT NOT NULL,
        oid TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('file', 'metadata')),
        name TEXT NOT NULL,
        mimetype TEXT NOT NULL,
        payload BYTEA NOT NULL,
        vtag TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (namespace, oid, kind, name)
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_blobs_one_metadata
        ON blobs(namespace, oid) WHERE kind = 'metadata'",
    "CREATE TABLE IF NOT EXISTS outbox (
        seq BIGSERIAL PRIMARY KEY,
        namespace TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        delivered_at TIMESTAMPTZ,
        dead_at TIMESTAMPTZ,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(delivered_at, dead_at, seq)",
];

/// Query text plus its positional string parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<String>,
}

/// Build the key search for [`crate::db::Datastore::get_keys_by_fields`]
///
/// Each predicate contributes one `(name = ? AND value = ?)` pair; rows are
/// grouped per key and `HAVING COUNT(DISTINCT name) = N` drops keys that
/// matched only some of the predicates.
pub fn keys_by_fields(dialect: Dialect, namespace: &str, fields: &Fields) -> BoundQuery {
    let mut params = Vec::new();
    let next = |value: &str, params: &mut Vec<String>| {
        params.push(value.to_string());
        dialect.placeholder(params.len())
    };

    if fields.is_empty() {
        let sql = if namespace.is_empty() {
            "SELECT namespace, oid FROM objects ORDER BY namespace, oid".to_string()
        } else {
            format!(
                "SELECT namespace, oid FROM objects WHERE namespace = {} ORDER BY namespace, oid",
                next(namespace, &mut params)
            )
        };
        return BoundQuery { sql, params };
    }

    let mut sql = String::from("SELECT namespace, oid FROM fields WHERE ");
    if !namespace.is_empty() {
        sql.push_str(&format!("namespace = {} AND ", next(namespace, &mut params)));
    }

    let pairs: Vec<String> = fields
        .iter()
        .map(|(name, value)| {
            let name_ph = next(name, &mut params);
            let value_ph = next(value, &mut params);
            format!("(name = {} AND value = {})", name_ph, value_ph)
        })
        .collect();
    sql.push('(');
    sql.push_str(&pairs.join(" OR "));
    sql.push(')');
    sql.push_str(&format!(
        " GROUP BY namespace, oid HAVING COUNT(DISTINCT name) = {} ORDER BY namespace, oid",
        fields.len()
    ));

    BoundQuery { sql, params }
}

/// Map a driver failure onto a canonical error
///
/// Unique-constraint violations become `AlreadyExists`; anything else is a
/// `Backend` failure carrying `context`.
pub fn classify_driver_error(context: &str, message: &str) -> StoreError {
    if UNIQUE_VIOLATION_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
    {
        return StoreError::already_exists(context.to_string());
    }
    StoreError::backend(format!("{}: {}", context, message))
}

/// Fixed-width RFC 3339 so text timestamps sort chronologically
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Deserialize(format!("invalid timestamp '{}': {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_keys_by_fields_without_predicates() {
        let global = keys_by_fields(Dialect::Sqlite, "", &Fields::new());
        assert!(global.params.is_empty());
        assert!(!global.sql.contains("WHERE"));

        let scoped = keys_by_fields(Dialect::Postgres, "docs", &Fields::new());
        assert_eq!(scoped.params, vec!["docs".to_string()]);
        assert!(scoped.sql.contains("namespace = $1"));
    }

    #[test]
    fn test_keys_by_fields_counts_every_predicate() {
        let query = keys_by_fields(
            Dialect::Postgres,
            "docs",
            &fields(&[("color", "red"), ("size", "xl")]),
        );
        assert_eq!(query.params, vec!["docs", "color", "red", "size", "xl"]);
        assert!(query.sql.contains("(name = $2 AND value = $3) OR (name = $4 AND value = $5)"));
        assert!(query.sql.contains("HAVING COUNT(DISTINCT name) = 2"));
    }

    #[test]
    fn test_sqlite_placeholders_are_numbered() {
        let query = keys_by_fields(Dialect::Sqlite, "", &fields(&[("a", "1")]));
        assert!(query.sql.contains("(name = ?1 AND value = ?2)"));
        assert_eq!(query.params.len(), 2);
    }

    #[test]
    fn test_classify_driver_error() {
        let err = classify_driver_error(
            "insert object docs/1",
            "SQLite failure: `UNIQUE constraint failed: objects.namespace, objects.oid`",
        );
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);

        let err = classify_driver_error(
            "insert blob",
            "error returned from database: duplicate key value violates unique constraint \"blobs_pkey\"",
        );
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);

        let err = classify_driver_error("insert", "disk I/O error");
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(parse_timestamp(&format_timestamp(&late)).unwrap(), late);
    }
}
