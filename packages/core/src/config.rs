//! Store Configuration
//!
//! The backend is selected by the *shape* of the `backend` table, decided
//! once when the store is opened:
//!
//! | Keys                                   | Backend              |
//! |----------------------------------------|----------------------|
//! | `serviceEndpoint`                      | HTTP proxy client    |
//! | `bucket`, `index`                      | object storage       |
//! | `host`, `dbName`, `user`, `password`   | PostgreSQL           |
//! | `dataSource`                           | embedded libsql      |
//!
//! # Examples
//!
//! ```rust
//! use easystore_core::config::{BackendConfig, StoreConfig};
//!
//! let config = StoreConfig::from_toml_str(
//!     r#"
//!     [backend]
//!     dataSource = "/var/lib/easystore"
//!
//!     [events]
//!     eventBusName = "objects"
//!     eventSourceName = "easystore"
//!     "#,
//! )
//! .unwrap();
//!
//! assert!(matches!(config.backend, BackendConfig::Embedded(_)));
//! ```

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default PostgreSQL acquire timeout and proxy request timeout, in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DEFAULT_PG_PORT: u16 = 5432;

const DEFAULT_SIGNER_EXPIRY_MINUTES: u64 = 15;

/// Publish attempts before an outbox record is dead-lettered
pub const DEFAULT_MAX_EVENT_ATTEMPTS: u32 = 10;

/// How long delivered outbox records are kept, in hours
pub const DEFAULT_EVENT_RETENTION_HOURS: u64 = 168;

/// Default tracing filter when neither `logging.filter` nor `RUST_LOG` is set
pub const DEFAULT_LOG_FILTER: &str = "info";

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_pg_port() -> u16 {
    DEFAULT_PG_PORT
}

fn default_expiry_minutes() -> u64 {
    DEFAULT_SIGNER_EXPIRY_MINUTES
}

fn default_max_event_attempts() -> u32 {
    DEFAULT_MAX_EVENT_ATTEMPTS
}

fn default_event_retention_hours() -> u64 {
    DEFAULT_EVENT_RETENTION_HOURS
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for StoreError {
    fn from(err: ConfigError) -> Self {
        StoreError::BadParameter(err.to_string())
    }
}

/// Embedded libsql backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmbeddedConfig {
    /// Existing directory holding one `{namespace}.db` per namespace
    pub data_source: PathBuf,
}

/// PostgreSQL backend
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub db_name: String,
    pub user: String,
    pub password: String,
    /// Pool acquire timeout, seconds
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout: u64,
}

impl PostgresConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db_name", &self.db_name)
            .field("user", &self.user)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// SQL store backing the object-storage index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexConfig {
    Postgres(PostgresConfig),
    Embedded(EmbeddedConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BucketConfig {
    /// Directory the local bucket stores assets under
    pub root: PathBuf,
}

/// Credentials used to sign expiring file references
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SignerConfig {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,
}

impl std::fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerConfig")
            .field("access_key", &self.access_key)
            .field("expiry_minutes", &self.expiry_minutes)
            .finish_non_exhaustive()
    }
}

/// Object storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObjectStorageConfig {
    pub bucket: BucketConfig,
    pub index: IndexConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<SignerConfig>,
}

/// HTTP proxy client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyConfig {
    pub service_endpoint: String,
    /// Per-request timeout, seconds
    #[serde(default = "default_timeout_secs")]
    pub request_timeout: u64,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Backend selection by configuration shape
///
/// Variants are tried in declaration order; every variant denies unknown
/// keys so exactly one shape can match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackendConfig {
    Proxy(ProxyConfig),
    ObjectStorage(ObjectStorageConfig),
    Postgres(PostgresConfig),
    Embedded(EmbeddedConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Proxy(_) => "proxy",
            BackendConfig::ObjectStorage(_) => "object-storage",
            BackendConfig::Postgres(_) => "postgres",
            BackendConfig::Embedded(_) => "embedded",
        }
    }
}

/// Event bus coordinates stamped on every outbox record, plus relay limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventConfig {
    #[serde(default)]
    pub event_bus_name: String,
    #[serde(default)]
    pub event_source_name: String,
    /// Failed publishes before a record is dead-lettered
    #[serde(default = "default_max_event_attempts")]
    pub max_attempts: u32,
    /// Hours a delivered record is kept before it is purged
    #[serde(default = "default_event_retention_hours")]
    pub retention_hours: u64,
}

impl EventConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            event_bus_name: String::new(),
            event_source_name: String::new(),
            max_attempts: DEFAULT_MAX_EVENT_ATTEMPTS,
            retention_hours: DEFAULT_EVENT_RETENTION_HOURS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directives, e.g. `easystore_core=debug`
    pub filter: String,
}

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: BackendConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<EventConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LogConfig>,
}

impl StoreConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            events: None,
            logging: None,
        }
    }

    pub fn with_events(mut self, bus: impl Into<String>, source: impl Into<String>) -> Self {
        self.events = Some(EventConfig {
            event_bus_name: bus.into(),
            event_source_name: source.into(),
            ..EventConfig::default()
        });
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.json` file as JSON and anything else as TOML
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(events) = &self.events {
            if events.event_bus_name.is_empty() != events.event_source_name.is_empty() {
                return Err(ConfigError::Invalid(
                    "eventBusName and eventSourceName must be set together".to_string(),
                ));
            }
            if events.max_attempts == 0 {
                return Err(ConfigError::Invalid("maxAttempts must be positive".into()));
            }
        }

        match &self.backend {
            BackendConfig::Proxy(proxy) => {
                url::Url::parse(&proxy.service_endpoint).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "serviceEndpoint '{}' is not a URL: {}",
                        proxy.service_endpoint, e
                    ))
                })?;
                if proxy.request_timeout == 0 {
                    return Err(ConfigError::Invalid("requestTimeout must be positive".into()));
                }
            }
            BackendConfig::Postgres(pg) => validate_postgres(pg)?,
            BackendConfig::ObjectStorage(os) => {
                if let IndexConfig::Postgres(pg) = &os.index {
                    validate_postgres(pg)?;
                }
                if let Some(signer) = &os.signer {
                    if signer.access_key.is_empty() || signer.secret_key.is_empty() {
                        return Err(ConfigError::Invalid(
                            "signer needs accessKey and secretKey".to_string(),
                        ));
                    }
                }
            }
            BackendConfig::Embedded(_) => {}
        }
        Ok(())
    }

    /// Bus and source names, or `None` when events are disabled
    pub fn event_names(&self) -> Option<(&str, &str)> {
        self.events
            .as_ref()
            .filter(|events| !events.event_bus_name.is_empty())
            .map(|events| {
                (
                    events.event_bus_name.as_str(),
                    events.event_source_name.as_str(),
                )
            })
    }
}

fn validate_postgres(pg: &PostgresConfig) -> Result<(), ConfigError> {
    if pg.host.is_empty() || pg.db_name.is_empty() || pg.user.is_empty() {
        return Err(ConfigError::Invalid(
            "host, dbName and user are required".to_string(),
        ));
    }
    if pg.connect_timeout == 0 {
        return Err(ConfigError::Invalid("connectTimeout must be positive".into()));
    }
    Ok(())
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` wins over `logging.filter`; both fall back to
/// [`DEFAULT_LOG_FILTER`]. Calling this twice is harmless.
pub fn init_logging(logging: Option<&LogConfig>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = logging
            .map(|config| config.filter.as_str())
            .unwrap_or(DEFAULT_LOG_FILTER);
        tracing_subscriber::EnvFilter::try_new(directives)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER))
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_shape_selects_backend() {
        let config = StoreConfig::from_json_str(
            r#"{"backend": {"serviceEndpoint": "http://localhost:8080", "requestTimeout": 5}}"#,
        )
        .unwrap();
        match &config.backend {
            BackendConfig::Proxy(proxy) => {
                assert_eq!(proxy.request_timeout(), Duration::from_secs(5))
            }
            other => panic!("expected proxy, got {}", other.kind()),
        }

        let config = StoreConfig::from_toml_str(
            r#"
            [backend]
            host = "db.internal"
            dbName = "easystore"
            user = "store"
            password = "secret"
            "#,
        )
        .unwrap();
        match &config.backend {
            BackendConfig::Postgres(pg) => {
                assert_eq!(pg.port, 5432);
                assert_eq!(pg.connect_timeout(), Duration::from_secs(30));
            }
            other => panic!("expected postgres, got {}", other.kind()),
        }
    }

    #[test]
    fn test_object_storage_index_shape() {
        let config = StoreConfig::from_toml_str(
            r#"
            [backend.bucket]
            root = "/srv/bucket"

            [backend.index]
            dataSource = "/srv/index"

            [backend.signer]
            accessKey = "AK"
            secretKey = "SK"
            "#,
        )
        .unwrap();

        let BackendConfig::ObjectStorage(os) = config.backend else {
            panic!("expected object storage");
        };
        assert!(matches!(os.index, IndexConfig::Embedded(_)));
        assert_eq!(os.signer.unwrap().expiry_minutes, 15);
    }

    #[test]
    fn test_unknown_shape_is_rejected() {
        let err = StoreConfig::from_json_str(r#"{"backend": {"dataSource": "/x", "extra": 1}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert_eq!(StoreError::from(err).kind(), ErrorKind::BadParameter);
    }

    #[test]
    fn test_events_need_both_names() {
        let err = StoreConfig::from_json_str(
            r#"{"backend": {"dataSource": "/x"}, "events": {"eventBusName": "bus"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = StoreConfig::new(BackendConfig::Embedded(EmbeddedConfig {
            data_source: PathBuf::from("/x"),
        }))
        .with_events("bus", "src");
        assert_eq!(config.event_names(), Some(("bus", "src")));
    }

    #[test]
    fn test_event_relay_limits() {
        let config = StoreConfig::from_toml_str(
            "[backend]\ndataSource = \"/x\"\n\n[events]\neventBusName = \"bus\"\neventSourceName = \"src\"\n",
        )
        .unwrap();
        let events = config.events.as_ref().unwrap();
        assert_eq!(events.max_attempts, DEFAULT_MAX_EVENT_ATTEMPTS);
        assert_eq!(events.retention(), Duration::from_secs(168 * 3600));

        let config = StoreConfig::from_toml_str(
            "[backend]\ndataSource = \"/x\"\n\n[events]\neventBusName = \"bus\"\neventSourceName = \"src\"\nmaxAttempts = 3\nretentionHours = 1\n",
        )
        .unwrap();
        let events = config.events.as_ref().unwrap();
        assert_eq!((events.max_attempts, events.retention_hours), (3, 1));

        let err = StoreConfig::from_toml_str(
            "[backend]\ndataSource = \"/x\"\n\n[events]\nmaxAttempts = 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("maxAttempts"));
    }

    #[test]
    fn test_secrets_stay_out_of_debug_output() {
        let pg = PostgresConfig {
            host: "h".into(),
            port: 5432,
            db_name: "d".into(),
            user: "u".into(),
            password: "hunter2".into(),
            connect_timeout: 30,
        };
        assert!(!format!("{:?}", pg).contains("hunter2"));
    }
}
