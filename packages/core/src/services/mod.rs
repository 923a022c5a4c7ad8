//! Store Services
//!
//! - [`ObjectReader`] - read-only core
//! - [`ObjectService`] - read-write core with optimistic concurrency
//! - [`ResultSet`] - lazily hydrating multi-object result
//!
//! [`open_store`] turns a [`StoreConfig`] into a ready [`EasyStore`],
//! either the core over a local backend or the HTTP proxy client.

pub(crate) mod preflight;
mod reader;
mod result_set;
mod store;
mod writer;

pub use reader::ObjectReader;
pub(crate) use reader::resolve_namespace;
pub use result_set::ResultSet;
pub use store::{EasyStore, ReadStore};
pub use writer::ObjectService;

use crate::config::{BackendConfig, StoreConfig};
use crate::db::open_datastore;
use crate::error::Result;
use crate::events::EventStamp;
use crate::proxy::ProxyClient;
use std::sync::Arc;

/// Open the read-write core over the backend `config` selects
///
/// Fails `BadParameter` for a proxy configuration, which has no local
/// backend.
pub async fn open_service(config: &StoreConfig) -> Result<ObjectService> {
    let handle = open_datastore(&config.backend).await?;
    let mut service = ObjectService::from_handle(handle);
    if let Some((bus, source)) = config.event_names() {
        service = service.with_events(EventStamp::new(bus, source));
    }
    Ok(service)
}

/// Open whatever store `config` describes
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn EasyStore>> {
    config.validate()?;
    match &config.backend {
        BackendConfig::Proxy(proxy) => Ok(Arc::new(ProxyClient::new(proxy)?)),
        _ => Ok(Arc::new(open_service(config).await?)),
    }
}
