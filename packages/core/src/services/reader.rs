//! Read-only Core
//!
//! Turns the public read contract into datastore calls: validate, fetch the
//! base record, then hydrate only the requested components.
//!
//! # Not-found semantics
//!
//! - A missing base record is fatal to the read (`NotFound`).
//! - A missing component is not an error; it is left empty.
//! - Any other component failure is propagated.

use super::{ReadStore, ResultSet};
use crate::db::Datastore;
use crate::error::{optional, Result, StoreError};
use crate::models::validation::{validate_namespace, validate_object_id};
use crate::models::{ComponentSelector, Fields, Object, ObjectKey, DEFAULT_NAMESPACE};
use async_trait::async_trait;
use std::sync::Arc;

/// Namespace to use when the caller passed none
pub(crate) fn resolve_namespace(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

/// Load the selected components of `object` in place
pub(crate) async fn hydrate(
    datastore: &dyn Datastore,
    object: &mut Object,
    selector: ComponentSelector,
) -> Result<()> {
    let key = object.key();
    if selector.contains(ComponentSelector::FIELDS) {
        object.fields = optional(datastore.get_fields_by_key(&key).await)?;
    }
    if selector.contains(ComponentSelector::METADATA) {
        object.metadata = optional(datastore.get_metadata_by_key(&key).await)?;
    }
    if selector.contains(ComponentSelector::FILES) {
        object.files = optional(datastore.get_blobs_by_key(&key).await)?;
    }
    Ok(())
}

/// Read-only view over a datastore
#[derive(Clone)]
pub struct ObjectReader {
    datastore: Arc<dyn Datastore>,
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("backend", &self.datastore.backend_name())
            .finish()
    }
}

impl ObjectReader {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    async fn fetch_bases(&self, keys: Vec<ObjectKey>) -> Result<Vec<Object>> {
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(object) = optional(self.datastore.get_object_by_key(&key).await)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl ReadStore for ObjectReader {
    async fn check(&self) -> Result<()> {
        self.datastore.check().await
    }

    async fn get_by_key(
        &self,
        namespace: &str,
        id: &str,
        selector: ComponentSelector,
    ) -> Result<Object> {
        let namespace = resolve_namespace(namespace);
        validate_namespace(namespace)?;
        validate_object_id(id)?;
        let selector = selector.validate()?;

        let mut object = self
            .datastore
            .get_object_by_key(&ObjectKey::new(namespace, id))
            .await?;
        hydrate(self.datastore.as_ref(), &mut object, selector).await?;
        Ok(object)
    }

    async fn get_by_keys(
        &self,
        namespace: &str,
        ids: &[String],
        selector: ComponentSelector,
    ) -> Result<ResultSet> {
        let namespace = resolve_namespace(namespace);
        validate_namespace(namespace)?;
        let selector = selector.validate()?;
        for id in ids {
            validate_object_id(id)?;
        }

        let keys = ids.iter().map(|id| ObjectKey::new(namespace, id.clone())).collect();
        let objects = self.fetch_bases(keys).await?;
        if objects.is_empty() {
            return Err(StoreError::not_found(format!(
                "none of {} ids in namespace {}",
                ids.len(),
                namespace
            )));
        }

        tracing::debug!(namespace, requested = ids.len(), found = objects.len(), "get_by_keys");
        Ok(ResultSet::lazy(objects, selector, self.datastore.clone()))
    }

    async fn get_by_fields(
        &self,
        namespace: &str,
        fields: &Fields,
        selector: ComponentSelector,
    ) -> Result<ResultSet> {
        if !namespace.is_empty() {
            validate_namespace(namespace)?;
        }
        let selector = selector.validate()?;
        if fields.keys().any(|name| name.is_empty()) {
            return Err(StoreError::bad_parameter("field names must not be empty"));
        }

        let keys = self.datastore.get_keys_by_fields(namespace, fields).await?;
        let objects = self.fetch_bases(keys).await?;
        if objects.is_empty() {
            return Err(StoreError::not_found("no object matches the field predicates"));
        }

        tracing::debug!(namespace, predicates = fields.len(), found = objects.len(), "get_by_fields");
        Ok(ResultSet::lazy(objects, selector, self.datastore.clone()))
    }

    async fn close(&self) -> Result<()> {
        self.datastore.close().await
    }
}
