//! Public store contract
//!
//! [`ReadStore`] and [`EasyStore`] are implemented by the in-process core
//! ([`super::ObjectReader`], [`super::ObjectService`]) and by the HTTP
//! [`crate::proxy::ProxyClient`], so callers are indifferent to where the
//! store runs.

use super::ResultSet;
use crate::error::Result;
use crate::models::{Blob, ComponentSelector, Fields, Object};
use async_trait::async_trait;

#[async_trait]
pub trait ReadStore: Send + Sync {
    /// Liveness probe of the underlying backend or service
    async fn check(&self) -> Result<()>;

    /// Fetch one object with the selected components
    ///
    /// Fails `NotFound` when the object is absent; an absent component is
    /// left empty.
    async fn get_by_key(
        &self,
        namespace: &str,
        id: &str,
        selector: ComponentSelector,
    ) -> Result<Object>;

    /// Fetch many objects; missing ids are dropped
    ///
    /// Fails `NotFound` only when none of `ids` exists.
    async fn get_by_keys(
        &self,
        namespace: &str,
        ids: &[String],
        selector: ComponentSelector,
    ) -> Result<ResultSet>;

    /// Fetch every object whose fields match ALL of `fields`
    ///
    /// An empty `namespace` searches every namespace.
    async fn get_by_fields(
        &self,
        namespace: &str,
        fields: &Fields,
        selector: ComponentSelector,
    ) -> Result<ResultSet>;

    async fn close(&self) -> Result<()>;
}

/// Full read/write contract
///
/// Every mutation after `create` needs the vtag of a prior read; a
/// mismatch fails `StaleObject` and changes nothing.
#[async_trait]
pub trait EasyStore: ReadStore {
    /// Store a new object, assigning an id when it has none
    async fn create(&self, object: &Object) -> Result<Object>;

    /// Replace the selected components wholesale
    async fn update(&self, object: &Object, selector: ComponentSelector) -> Result<Object>;

    /// Delete the whole object (`BASE`) or only the selected components
    ///
    /// Returns `object` as passed in.
    async fn delete(&self, object: &Object, selector: ComponentSelector) -> Result<Object>;

    async fn rename_file(
        &self,
        object: &Object,
        selector: ComponentSelector,
        old_name: &str,
        new_name: &str,
    ) -> Result<Object>;

    async fn add_file(&self, object: &Object, blob: &Blob) -> Result<Object>;

    async fn update_file(&self, object: &Object, blob: &Blob) -> Result<Object>;

    async fn delete_file(&self, object: &Object, name: &str) -> Result<Object>;
}
