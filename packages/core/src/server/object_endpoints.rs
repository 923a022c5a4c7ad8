//! Object endpoints
//!
//! - `GET /healthcheck` - liveness of the underlying store
//! - `POST /:namespace` - create
//! - `PUT /:namespace?attribs=` - fetch many, body `{ids}`
//! - `PUT /:namespace/search?attribs=` - search, body is the field map
//! - `GET /:namespace/:id?attribs=` - fetch one
//! - `PUT /:namespace/:id?attribs=&vtag=` - update
//! - `DELETE /:namespace/:id?vtag=&attribs=` - delete

use super::{decode_json, selector_param, AppState, HttpError};
use crate::models::{Fields, Object};
use crate::proxy::wire::{IdsRequest, ResultsResponse, StoreParams, ALL_NAMESPACES_SEGMENT};
use crate::serializer::{decode_object, ObjectDoc};
use crate::services::ResultSet;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/:namespace", post(create_object).put(fetch_many))
        .route("/:namespace/search", put(search))
        .route(
            "/:namespace/:id",
            get(get_object).put(update_object).delete(delete_object),
        )
        .with_state(state)
}

async fn results(set: ResultSet) -> Result<Json<ResultsResponse>, HttpError> {
    let objects = set.collect_all().await?;
    Ok(Json(ResultsResponse {
        results: objects.iter().map(ObjectDoc::from).collect(),
    }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthStatus>, HttpError> {
    state.store.check().await?;
    Ok(Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// The path namespace overrides whatever the body carries
async fn create_object(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<ObjectDoc>), HttpError> {
    let mut object = decode_object(&body)?;
    object.namespace = namespace;
    let created = state.store.create(&object).await?;
    Ok((StatusCode::CREATED, Json(ObjectDoc::from(&created))))
}

async fn fetch_many(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<StoreParams>,
    body: Bytes,
) -> Result<Json<ResultsResponse>, HttpError> {
    let selector = selector_param(&params)?;
    let request: IdsRequest = decode_json("ids", &body)?;
    let set = state
        .store
        .get_by_keys(&namespace, &request.ids, selector)
        .await?;
    results(set).await
}

async fn search(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<StoreParams>,
    body: Bytes,
) -> Result<Json<ResultsResponse>, HttpError> {
    let selector = selector_param(&params)?;
    let fields: Fields = decode_json("fields", &body)?;
    let namespace = if namespace == ALL_NAMESPACES_SEGMENT {
        ""
    } else {
        namespace.as_str()
    };
    let set = state.store.get_by_fields(namespace, &fields, selector).await?;
    results(set).await
}

async fn get_object(
    State(state): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
    Query(params): Query<StoreParams>,
) -> Result<Json<ObjectDoc>, HttpError> {
    let selector = selector_param(&params)?;
    let object = state.store.get_by_key(&namespace, &id, selector).await?;
    Ok(Json(ObjectDoc::from(&object)))
}

/// A `vtag` query parameter takes precedence over the body's vtag
async fn update_object(
    State(state): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
    Query(params): Query<StoreParams>,
    body: Bytes,
) -> Result<Json<ObjectDoc>, HttpError> {
    let selector = selector_param(&params)?;
    let mut object = decode_object(&body)?;
    object.namespace = namespace;
    object.id = id;
    if let Some(vtag) = params.vtag {
        object.vtag = vtag;
    }
    let updated = state.store.update(&object, selector).await?;
    Ok(Json(ObjectDoc::from(&updated)))
}

async fn delete_object(
    State(state): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
    Query(params): Query<StoreParams>,
) -> Result<Json<ObjectDoc>, HttpError> {
    let selector = selector_param(&params)?;
    let mut object = Object::with_id(namespace, id);
    object.vtag = params.vtag.unwrap_or_default();
    let deleted = state.store.delete(&object, selector).await?;
    Ok(Json(ObjectDoc::from(&deleted)))
}
