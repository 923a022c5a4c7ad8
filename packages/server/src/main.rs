//! EasyStore proxy service
//!
//! Serves a locally configured store over HTTP for `ProxyClient` callers.
//!
//! # Usage
//!
//! ```bash
//! easystore-server /etc/easystore/easystore.toml
//! ```
//!
//! Environment:
//! - `EASYSTORE_CONFIG` - configuration file when no argument is given
//!   (default `easystore.toml`)
//! - `EASYSTORE_ADDR` - listen address (default `127.0.0.1:8080`)
//! - `EASYSTORE_NAMESPACES` - comma-separated namespaces created at startup
//!   when the backend manages namespaces
//! - `RUST_LOG` - overrides the configured log filter

use anyhow::Context;
use easystore_core::config::{init_logging, StoreConfig};
use easystore_core::events::{OutboxRelay, TracingPublisher};
use easystore_core::services::{open_service, ObjectService, ReadStore};
use easystore_core::{server, ErrorKind};
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "easystore.toml";
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EASYSTORE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

async fn ensure_namespaces(service: &ObjectService) -> anyhow::Result<()> {
    let Ok(list) = std::env::var("EASYSTORE_NAMESPACES") else {
        return Ok(());
    };
    let Some(admin) = service.admin() else {
        tracing::warn!("backend does not manage namespaces; ignoring EASYSTORE_NAMESPACES");
        return Ok(());
    };

    for namespace in list.split(',').map(str::trim).filter(|ns| !ns.is_empty()) {
        match admin.create_namespace(namespace).await {
            Ok(()) => tracing::info!(namespace, "created namespace"),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err).with_context(|| format!("creating namespace {}", namespace))
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = StoreConfig::load(&path)
        .await
        .with_context(|| format!("loading {}", path))?;
    init_logging(config.logging.as_ref());
    config.validate()?;

    let service = open_service(&config)
        .await
        .context("opening the configured backend")?;
    service.check().await.context("backend health check")?;
    ensure_namespaces(&service).await?;

    let relay = config
        .event_names()
        .zip(config.events.as_ref())
        .map(|((bus, source), events)| {
            tracing::info!(
                bus,
                source,
                max_attempts = events.max_attempts,
                retention_hours = events.retention_hours,
                "relaying outbox events"
            );
            OutboxRelay::new(service.datastore().clone(), Arc::new(TracingPublisher))
                .with_max_attempts(events.max_attempts)
                .with_retention(events.retention())
                .spawn()
        });

    let addr = std::env::var("EASYSTORE_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let store = Arc::new(service);
    server::serve_with_shutdown(listener, store.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await?;

    if let Some(relay) = relay {
        relay.shutdown().await;
    }
    store.close().await?;
    Ok(())
}
