//! File endpoints
//!
//! - `POST /:namespace/:id/file?vtag=` - add, body is a blob document
//! - `PUT /:namespace/:id/file?vtag=` - replace an existing file
//! - `DELETE /:namespace/:id/file/:name?vtag=` - delete
//! - `POST /:namespace/:id/file/:name?new=&vtag=` - rename

use super::{decode_json, AppState, HttpError};
use crate::error::StoreError;
use crate::models::{Blob, ComponentSelector, Object};
use crate::proxy::wire::StoreParams;
use crate::serializer::{BlobDoc, ObjectDoc};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::Json,
    routing::post,
    Router,
};

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/:namespace/:id/file", post(add_file).put(update_file))
        .route("/:namespace/:id/file/:name", post(rename_file).delete(delete_file))
        .with_state(state)
}

/// Object reference built from the path and the `vtag` parameter
fn target(namespace: String, id: String, params: &StoreParams) -> Object {
    let mut object = Object::with_id(namespace, id);
    object.vtag = params.vtag.clone().unwrap_or_default();
    object
}

fn decode_blob(body: &[u8]) -> Result<Blob, HttpError> {
    let doc: BlobDoc = decode_json("file", body)?;
    Ok(Blob::try_from(doc)?)
}

async fn add_file(
    State(state): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
    Query(params): Query<StoreParams>,
    body: Bytes,
) -> Result<Json<ObjectDoc>, HttpError> {
    let blob = decode_blob(&body)?;
    let object = target(namespace, id, &params);
    let updated = state.store.add_file(&object, &blob).await?;
    Ok(Json(ObjectDoc::from(&updated)))
}

async fn update_file(
    State(state): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
    Query(params): Query<StoreParams>,
    body: Bytes,
) -> Result<Json<ObjectDoc>, HttpError> {
    let blob = decode_blob(&body)?;
    let object = target(namespace, id, &params);
    let updated = state.store.update_file(&object, &blob).await?;
    Ok(Json(ObjectDoc::from(&updated)))
}

async fn delete_file(
    State(state): State<AppState>,
    Path((namespace, id, name)): Path<(String, String, String)>,
    Query(params): Query<StoreParams>,
) -> Result<Json<ObjectDoc>, HttpError> {
    let object = target(namespace, id, &params);
    let updated = state.store.delete_file(&object, &name).await?;
    Ok(Json(ObjectDoc::from(&updated)))
}

/// Without `attribs`, the rename selector defaults to files
async fn rename_file(
    State(state): State<AppState>,
    Path((namespace, id, name)): Path<(String, String, String)>,
    Query(params): Query<StoreParams>,
) -> Result<Json<ObjectDoc>, HttpError> {
    let new_name = params
        .new
        .clone()
        .ok_or_else(|| StoreError::bad_parameter("rename needs a 'new' file name"))?;
    let selector = match params.attribs.as_deref() {
        None => ComponentSelector::FILES,
        Some(attribs) => ComponentSelector::from_wire(Some(attribs))?,
    };
    let object = target(namespace, id, &params);
    let updated = state
        .store
        .rename_file(&object, selector, &name, &new_name)
        .await?;
    Ok(Json(ObjectDoc::from(&updated)))
}
