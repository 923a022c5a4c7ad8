//! Bucket contract and the local-filesystem bucket
//!
//! A bucket is a flat key→bytes map with `/`-separated keys, per-object
//! content type and string attributes, and prefix listing. Cloud SDKs can
//! implement [`Bucket`] directly; [`LocalBucket`] keeps everything under one
//! directory.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory under the bucket root holding per-object sidecars
const SIDECAR_DIR: &str = ".meta";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("Bucket object not found: {0}")]
    NotFound(String),

    #[error("Invalid bucket key '{0}'")]
    InvalidKey(String),

    #[error("Bucket I/O failed for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt bucket sidecar for '{key}': {reason}")]
    Sidecar { key: String, reason: String },
}

impl From<BucketError> for StoreError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::NotFound(key) => StoreError::not_found(key),
            BucketError::InvalidKey(_) => StoreError::bad_parameter(err.to_string()),
            BucketError::Io { .. } | BucketError::Sidecar { .. } => {
                StoreError::backend(err.to_string())
            }
        }
    }
}

/// Properties stored alongside an object's bytes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutOptions {
    pub content_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Listing entry / head result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub options: PutOptions,
}

#[async_trait]
pub trait Bucket: Send + Sync {
    /// Create or overwrite `key`
    async fn put(&self, key: &str, body: Vec<u8>, options: PutOptions) -> Result<(), BucketError>;

    async fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>), BucketError>;

    async fn head(&self, key: &str) -> Result<ObjectMeta, BucketError>;

    /// Idempotent
    async fn delete(&self, key: &str) -> Result<(), BucketError>;

    /// Every object whose key starts with `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError>;

    /// Unsigned location of `key`, the base of a signed reference
    fn object_url(&self, key: &str) -> String;

    /// Inverse of [`Bucket::object_url`]; `None` for a URL outside the bucket
    fn key_for_url(&self, url: &str) -> Option<String>;

    async fn check(&self) -> Result<(), BucketError>;

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(BucketError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// [`Bucket`] backed by a local directory
///
/// Object bytes live at `{root}/{key}`; content type and attributes live in
/// a JSON sidecar at `{root}/.meta/{key}.json`.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
}

fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> BucketError + '_ {
    move |source| {
        if source.kind() == IoErrorKind::NotFound {
            BucketError::NotFound(key.to_string())
        } else {
            BucketError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

impl LocalBucket {
    /// Open the bucket, creating its root directory when missing
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BucketError> {
        let root = root.into();
        let label = root.display().to_string();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(io_err(&label))?;
        let root = tokio::fs::canonicalize(&root)
            .await
            .map_err(io_err(&label))?;
        tracing::info!(root = %root.display(), "opened local bucket");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_key(key: &str) -> Result<(), BucketError> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && !key.ends_with('/')
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
            && key.split('/').next() != Some(SIDECAR_DIR);
        if valid {
            Ok(())
        } else {
            Err(BucketError::InvalidKey(key.to_string()))
        }
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(SIDECAR_DIR).join(format!("{}.json", key))
    }

    async fn write_file(path: &Path, key: &str, bytes: &[u8]) -> Result<(), BucketError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(key))?;
        }
        tokio::fs::write(path, bytes).await.map_err(io_err(key))
    }

    async fn read_options(&self, key: &str) -> Result<PutOptions, BucketError> {
        match tokio::fs::read(self.sidecar_path(key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| BucketError::Sidecar {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Ok(PutOptions::new(DEFAULT_CONTENT_TYPE))
            }
            Err(source) => Err(BucketError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn meta(&self, key: &str) -> Result<ObjectMeta, BucketError> {
        let fs_meta = tokio::fs::metadata(self.data_path(key))
            .await
            .map_err(io_err(key))?;
        if !fs_meta.is_file() {
            return Err(BucketError::NotFound(key.to_string()));
        }
        let last_modified = fs_meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(ObjectMeta {
            key: key.to_string(),
            size: fs_meta.len(),
            last_modified,
            options: self.read_options(key).await?,
        })
    }

    /// Keys of every data file below `start`, skipping sidecars
    async fn walk(&self, start: PathBuf) -> Result<Vec<String>, BucketError> {
        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let label = dir.display().to_string();
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(source) => return Err(BucketError::Io { key: label, source }),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_err(&label))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_err(&label))?;
                if file_type.is_dir() {
                    if dir == self.root && entry.file_name() == SIDECAR_DIR {
                        continue;
                    }
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    async fn put(&self, key: &str, body: Vec<u8>, options: PutOptions) -> Result<(), BucketError> {
        Self::validate_key(key)?;
        let sidecar = serde_json::to_vec(&options).map_err(|e| BucketError::Sidecar {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Self::write_file(&self.sidecar_path(key), key, &sidecar).await?;
        Self::write_file(&self.data_path(key), key, &body).await?;
        tracing::debug!(key, bytes = body.len(), "put bucket object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>), BucketError> {
        Self::validate_key(key)?;
        let meta = self.meta(key).await?;
        let body = tokio::fs::read(self.data_path(key))
            .await
            .map_err(io_err(key))?;
        Ok((meta, body))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta, BucketError> {
        Self::validate_key(key)?;
        self.meta(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        Self::validate_key(key)?;
        for path in [self.data_path(key), self.sidecar_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(source) => {
                    return Err(BucketError::Io {
                        key: key.to_string(),
                        source,
                    })
                }
            }
        }
        tracing::debug!(key, "deleted bucket object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        // only the directory the prefix names is walked
        let dir = prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("");
        let start = if dir.is_empty() {
            self.root.clone()
        } else {
            Self::validate_key(dir)?;
            self.data_path(dir)
        };

        let mut objects = Vec::new();
        for key in self.walk(start).await? {
            if !key.starts_with(prefix) {
                continue;
            }
            match self.meta(&key).await {
                Ok(meta) => objects.push(meta),
                // deleted between walk and head
                Err(BucketError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(objects)
    }

    fn object_url(&self, key: &str) -> String {
        url::Url::from_file_path(self.data_path(key))
            .map(|url| url.to_string())
            .unwrap_or_else(|_| format!("file://{}", self.data_path(key).display()))
    }

    fn key_for_url(&self, url: &str) -> Option<String> {
        let path = url::Url::parse(url).ok()?.to_file_path().ok()?;
        let relative = path.strip_prefix(&self.root).ok()?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Self::validate_key(&key).ok()?;
        Some(key)
    }

    async fn check(&self) -> Result<(), BucketError> {
        let label = self.root.display().to_string();
        let meta = tokio::fs::metadata(&self.root).await.map_err(io_err(&label))?;
        if !meta.is_dir() {
            return Err(BucketError::NotFound(label));
        }
        Ok(())
    }
}
