//! EasyStore Core
//!
//! A document store for objects made of a base record plus three optional
//! components (fields, files and metadata), with the same contract over
//! several storage backends and over HTTP.
//!
//! # Architecture
//!
//! - **One contract**: [`services::EasyStore`] is implemented by the
//!   in-process core and by the HTTP [`proxy::ProxyClient`]
//! - **Pluggable backends**: embedded libsql stores, PostgreSQL, or object
//!   storage with a SQL index, selected by configuration shape
//! - **Atomic writes**: every call is one [`db::WriteBatch`], applied in a
//!   transaction (SQL) or a compensating saga (object storage)
//! - **Optimistic concurrency**: every write after create carries the vtag of
//!   a prior read and fails `StaleObject` on mismatch
//! - **Durable events**: change records go to an outbox in the same batch and
//!   are relayed asynchronously
//!
//! # Modules
//!
//! - [`models`] - Object, Blob, Metadata and the component selector
//! - [`db`] - Datastore trait and backends
//! - [`services`] - Read-only and read-write core, result sets
//! - [`serializer`] - Wire documents, component codecs, JSON Lines export
//! - [`events`] - Outbox records, publishers and the relay
//! - [`proxy`] - HTTP client
//! - [`server`] - HTTP service
//! - [`config`] - Configuration files and logging setup

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod proxy;
pub mod serializer;
pub mod server;
pub mod services;

// Re-export commonly used types
pub use config::StoreConfig;
pub use error::{ErrorKind, Result, StoreError};
pub use models::{Blob, ComponentSelector, Fields, Metadata, Object};
pub use services::{open_service, open_store, EasyStore, ReadStore, ResultSet};
