//! HTTP Proxy Service
//!
//! Serves any [`EasyStore`] over the wire protocol that
//! [`crate::proxy::ProxyClient`] speaks.
//!
//! # Architecture
//!
//! Endpoints are grouped by resource and merged into one router:
//! - `object_endpoints`: health, create, fetch, search, update, delete
//! - `file_endpoints`: add, replace, delete and rename single files
//!
//! Every failure is rendered by [`HttpError`] as `{message, code}`. Request
//! tracing comes from `tower-http`.
//!
//! Static segments win over namespace and id parameters, so a namespace
//! named `healthcheck` or an object id `search` is not reachable over HTTP.
//!
//! # Examples
//!
//! ```rust,no_run
//! use easystore_core::config::StoreConfig;
//! use easystore_core::server;
//! use easystore_core::services::open_service;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = StoreConfig::load("easystore.toml").await?;
//! let service = Arc::new(open_service(&config).await?);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! server::serve(listener, service).await?;
//! # Ok(())
//! # }
//! ```

mod file_endpoints;
mod http_error;
mod object_endpoints;

pub use http_error::HttpError;

use crate::error::Result;
use crate::models::ComponentSelector;
use crate::proxy::wire::StoreParams;
use crate::services::EasyStore;
use axum::Router;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State shared by every endpoint
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EasyStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn EasyStore>) -> Self {
        Self { store }
    }
}

/// Router with every endpoint module merged in
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(object_endpoints::routes(state.clone()))
        .merge(file_endpoints::routes(state))
        .layer(TraceLayer::new_for_http())
}

/// Serve `store` on `listener` until the process ends
pub async fn serve(listener: TcpListener, store: Arc<dyn EasyStore>) -> std::io::Result<()> {
    serve_with_shutdown(listener, store, std::future::pending()).await
}

/// Serve `store` on `listener` until `shutdown` resolves
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    store: Arc<dyn EasyStore>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "proxy service listening");
    axum::serve(listener, create_router(AppState::new(store)))
        .with_graceful_shutdown(shutdown)
        .await
}

fn decode_json<T: DeserializeOwned>(what: &str, body: &[u8]) -> Result<T, HttpError> {
    serde_json::from_slice(body).map_err(|e| HttpError::malformed_body(what, e))
}

fn selector_param(params: &StoreParams) -> Result<ComponentSelector> {
    ComponentSelector::from_wire(params.attribs.as_deref())
}
