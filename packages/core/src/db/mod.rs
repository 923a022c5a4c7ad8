//! Datastore Layer
//!
//! Every backend implements [`Datastore`]:
//!
//! - [`EmbeddedStore`] - libsql, one store file per namespace
//! - [`PostgresStore`] - sqlx pool over a shared PostgreSQL database
//! - [`ObjectStorageStore`] - bucket assets plus a SQL index
//!
//! # Architecture
//!
//! The backend is chosen once, by [`open_datastore`], from the shape of the
//! configuration. Nothing above this layer knows which one is in use.

mod datastore;
mod embedded_store;
pub mod object_storage;
mod postgres_store;
pub(crate) mod sql;

pub use datastore::{Datastore, NamespaceAdmin, WriteBatch, WriteOp};
pub use embedded_store::EmbeddedStore;
pub use object_storage::ObjectStorageStore;
pub use postgres_store::PostgresStore;

use crate::config::{BackendConfig, IndexConfig, ObjectStorageConfig};
use crate::error::{Result, StoreError};
use object_storage::{LocalBucket, ReferenceSigner};
use std::sync::Arc;

/// An opened backend plus its administration interface, when it has one
#[derive(Clone)]
pub struct DatastoreHandle {
    pub datastore: Arc<dyn Datastore>,
    pub admin: Option<Arc<dyn NamespaceAdmin>>,
}

impl std::fmt::Debug for DatastoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatastoreHandle")
            .field("backend", &self.datastore.backend_name())
            .field("admin", &self.admin.is_some())
            .finish()
    }
}

async fn open_index(index: &IndexConfig) -> Result<DatastoreHandle> {
    match index {
        IndexConfig::Embedded(config) => {
            let store = Arc::new(EmbeddedStore::open(&config.data_source).await?);
            Ok(DatastoreHandle {
                datastore: store.clone(),
                admin: Some(store),
            })
        }
        IndexConfig::Postgres(config) => Ok(DatastoreHandle {
            datastore: Arc::new(PostgresStore::connect(config).await?),
            admin: None,
        }),
    }
}

async fn open_object_storage(config: &ObjectStorageConfig) -> Result<DatastoreHandle> {
    let index = open_index(&config.index).await?;
    let bucket = LocalBucket::open(&config.bucket.root).await?;
    let signer = config.signer.as_ref().map(ReferenceSigner::new);

    Ok(DatastoreHandle {
        datastore: Arc::new(ObjectStorageStore::new(
            Arc::new(bucket),
            index.datastore,
            signer,
        )),
        admin: index.admin,
    })
}

/// Open the datastore a configuration shape selects
///
/// The proxy shape is not a datastore; open it through
/// [`crate::services::open_store`].
pub async fn open_datastore(backend: &BackendConfig) -> Result<DatastoreHandle> {
    let handle = match backend {
        BackendConfig::Embedded(config) => {
            open_index(&IndexConfig::Embedded(config.clone())).await?
        }
        BackendConfig::Postgres(config) => {
            open_index(&IndexConfig::Postgres(config.clone())).await?
        }
        BackendConfig::ObjectStorage(config) => open_object_storage(config).await?,
        BackendConfig::Proxy(_) => {
            return Err(StoreError::bad_parameter(
                "a proxy configuration does not open a datastore",
            ))
        }
    };
    tracing::info!(backend = handle.datastore.backend_name(), "opened datastore");
    Ok(handle)
}
