//! HTTP Proxy Client
//!
//! [`ProxyClient`] speaks the wire protocol served by [`crate::server`] and
//! implements the same [`crate::services::EasyStore`] contract as the core.
//!
//! # Examples
//!
//! ```rust,no_run
//! use easystore_core::config::ProxyConfig;
//! use easystore_core::models::ComponentSelector;
//! use easystore_core::proxy::ProxyClient;
//! use easystore_core::services::ReadStore;
//!
//! # async fn example() -> easystore_core::Result<()> {
//! let client = ProxyClient::new(&ProxyConfig {
//!     service_endpoint: "http://localhost:8080".to_string(),
//!     request_timeout: 30,
//! })?;
//! client.check().await?;
//! let object = client.get_by_key("invoices", "inv-1", ComponentSelector::ALL).await?;
//! # let _ = object;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod wire;

pub use client::ProxyClient;
