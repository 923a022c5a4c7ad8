//! Shared fixtures for the integration tests

#![allow(dead_code)]

use easystore_core::config::{
    BackendConfig, BucketConfig, EmbeddedConfig, IndexConfig, ObjectStorageConfig, StoreConfig,
};
use easystore_core::models::{Blob, Metadata, Object};
use easystore_core::services::{open_service, ObjectService};
use std::path::Path;
use tempfile::TempDir;

pub const NAMESPACES: [&str; 2] = ["docs", "archive"];

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Embedded,
    ObjectStorage,
}

pub const BACKENDS: [Backend; 2] = [Backend::Embedded, Backend::ObjectStorage];

pub fn backend_config(backend: Backend, root: &Path) -> anyhow::Result<BackendConfig> {
    let data_source = root.join("index");
    std::fs::create_dir_all(&data_source)?;
    let embedded = EmbeddedConfig { data_source };

    Ok(match backend {
        Backend::Embedded => BackendConfig::Embedded(embedded),
        Backend::ObjectStorage => BackendConfig::ObjectStorage(ObjectStorageConfig {
            bucket: BucketConfig {
                root: root.join("bucket"),
            },
            index: IndexConfig::Embedded(embedded),
            signer: None,
        }),
    })
}

/// Service over a fresh backend with [`NAMESPACES`] created
pub async fn open_backend(
    backend: Backend,
    config_fn: impl FnOnce(StoreConfig) -> StoreConfig,
) -> anyhow::Result<(ObjectService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let config = config_fn(StoreConfig::new(backend_config(backend, temp_dir.path())?));
    let service = open_service(&config).await?;

    let admin = service
        .admin()
        .ok_or_else(|| anyhow::anyhow!("embedded index has namespace admin"))?;
    for namespace in NAMESPACES {
        admin.create_namespace(namespace).await?;
    }
    Ok((service, temp_dir))
}

pub async fn open(backend: Backend) -> anyhow::Result<(ObjectService, TempDir)> {
    open_backend(backend, |config| config).await
}

/// Object with every component populated
pub fn sample_object(namespace: &str, id: &str) -> Object {
    let mut object = Object::with_id(namespace, id);
    object
        .set_field("color", "red")
        .set_field("size", "large")
        .set_metadata(Metadata::json(&serde_json::json!({ "owner": "ops" })))
        .add_file(Blob::new("notes.txt", "text/plain", b"first draft".to_vec()))
        .add_file(Blob::new("logo.png", "image/png", vec![0x89, 0x50, 0x4e, 0x47]));
    object
}

pub fn file_names(object: &Object) -> Vec<String> {
    let mut names: Vec<String> = object
        .files
        .iter()
        .flatten()
        .map(|blob| blob.name.clone())
        .collect();
    names.sort();
    names
}
