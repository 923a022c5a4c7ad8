//! Namespace export and import as JSON Lines
//!
//! One [`ObjectDoc`] per line, every component included.

use super::{decode_object, ObjectDoc};
use crate::error::{Result, StoreError};
use crate::models::{ComponentSelector, Fields};
use crate::services::{EasyStore, ReadStore};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Write every object of `namespace` to `writer`; returns the object count
///
/// An empty namespace exports nothing rather than failing.
pub async fn export_namespace<W>(
    store: &dyn ReadStore,
    namespace: &str,
    writer: &mut W,
) -> Result<usize>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut results = match store
        .get_by_fields(namespace, &Fields::new(), ComponentSelector::ALL)
        .await
    {
        Ok(results) => results,
        Err(err) if err.is_not_found() => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut exported = 0;
    while let Some(object) = results.next().await? {
        let mut line = serde_json::to_vec(&ObjectDoc::from(&object))
            .map_err(|e| StoreError::Serialize(format!("object {}: {}", object.key(), e)))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| StoreError::Serialize(format!("export write failed: {}", e)))?;
        exported += 1;
    }
    writer
        .flush()
        .await
        .map_err(|e| StoreError::Serialize(format!("export flush failed: {}", e)))?;

    tracing::info!(namespace, exported, "exported namespace");
    Ok(exported)
}

/// Create every object read from `reader`; returns the object count
///
/// Blank lines are skipped. Stored vtags are discarded because `create`
/// always assigns a fresh one. With `namespace` set, every object is
/// imported into that namespace instead of its own.
pub async fn import_objects<R>(
    store: &dyn EasyStore,
    reader: R,
    namespace: Option<&str>,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut lines = reader.lines();
    let mut imported = 0;
    let mut line_number = 0;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| StoreError::Deserialize(format!("import read failed: {}", e)))?
    {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut object = decode_object(line.as_bytes()).map_err(|e| {
            StoreError::Deserialize(format!("line {}: {}", line_number, e))
        })?;
        object.vtag.clear();
        if let Some(namespace) = namespace {
            object.namespace = namespace.to_string();
        }
        store.create(&object).await?;
        imported += 1;
    }

    tracing::info!(imported, "imported objects");
    Ok(imported)
}
