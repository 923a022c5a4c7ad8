//! Store Error Types
//!
//! Every public operation in EasyStore fails with a [`StoreError`]. The
//! variants map one-to-one onto the canonical failure kinds shared by the
//! core, the backends and the HTTP proxy, so a failure keeps its kind when it
//! crosses the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical store errors
///
/// Backend drivers never leak through this type: their failures are either
/// remapped to a canonical kind (unique-constraint violations become
/// [`StoreError::AlreadyExists`]) or wrapped as [`StoreError::Backend`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// Invalid or missing input, detected before any I/O
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// The backing store for a namespace does not exist or cannot be opened
    #[error("Namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    /// Object, component or key set absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate object id or component name
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Version tag mismatch on a conditional write
    #[error("Stale object {namespace}/{id}: expected vtag {expected}, stored vtag is {actual}")]
    StaleObject {
        namespace: String,
        id: String,
        expected: String,
        actual: String,
    },

    /// Decoding stored or transmitted data failed
    #[error("Deserialize failed: {0}")]
    Deserialize(String),

    /// Encoding data for storage or transmission failed
    #[error("Serialize failed: {0}")]
    Serialize(String),

    /// Operation intentionally not supported by this backend or configuration
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Driver failure that maps to no canonical kind
    #[error("Backend operation failed: {context}")]
    Backend { context: String },

    /// Proxy transport failure that maps to no canonical kind
    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Failure kind of a [`StoreError`], used for matching and for the wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BadParameter,
    NamespaceNotFound,
    NotFound,
    AlreadyExists,
    StaleObject,
    Deserialize,
    Serialize,
    NotImplemented,
    Backend,
    Transport,
}

impl ErrorKind {
    /// Order matters: a code that contains another code must be tested first
    /// (`NAMESPACE_NOT_FOUND` before `NOT_FOUND`, `DESERIALIZE` before `SERIALIZE`).
    const MATCH_ORDER: [ErrorKind; 8] = [
        ErrorKind::NamespaceNotFound,
        ErrorKind::NotFound,
        ErrorKind::BadParameter,
        ErrorKind::AlreadyExists,
        ErrorKind::StaleObject,
        ErrorKind::Deserialize,
        ErrorKind::Serialize,
        ErrorKind::NotImplemented,
    ];

    /// Machine-readable code carried in proxy error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::BadParameter => "BAD_PARAMETER",
            ErrorKind::NamespaceNotFound => "NAMESPACE_NOT_FOUND",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::StaleObject => "STALE_OBJECT",
            ErrorKind::Deserialize => "DESERIALIZE",
            ErrorKind::Serialize => "SERIALIZE",
            ErrorKind::NotImplemented => "NOT_IMPLEMENTED",
            ErrorKind::Backend => "BACKEND",
            ErrorKind::Transport => "TRANSPORT",
        }
    }

    /// Find the canonical kind named somewhere in `text`
    ///
    /// Returns `None` when no canonical code appears; `Backend` and
    /// `Transport` are never matched because they carry no meaning across
    /// the wire.
    pub fn find_in(text: &str) -> Option<ErrorKind> {
        Self::MATCH_ORDER
            .into_iter()
            .find(|kind| text.contains(kind.code()))
    }

    /// Canonical kind whose code is exactly `code`
    pub fn from_code(code: &str) -> Option<ErrorKind> {
        Self::MATCH_ORDER
            .into_iter()
            .find(|kind| kind.code() == code)
    }
}

impl StoreError {
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    pub fn namespace_not_found(namespace: impl Into<String>) -> Self {
        Self::NamespaceNotFound {
            namespace: namespace.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn stale_object(
        namespace: impl Into<String>,
        id: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::StaleObject {
            namespace: namespace.into(),
            id: id.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into())
    }

    pub fn backend(context: impl Into<String>) -> Self {
        Self::Backend {
            context: context.into(),
        }
    }

    /// Rebuild an error of a known kind from a remote message
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::BadParameter => Self::BadParameter(message),
            ErrorKind::NamespaceNotFound => Self::NamespaceNotFound { namespace: message },
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::AlreadyExists => Self::AlreadyExists(message),
            ErrorKind::StaleObject => Self::StaleObject {
                namespace: String::new(),
                id: String::new(),
                expected: String::new(),
                actual: message,
            },
            ErrorKind::Deserialize => Self::Deserialize(message),
            ErrorKind::Serialize => Self::Serialize(message),
            ErrorKind::NotImplemented => Self::NotImplemented(message),
            ErrorKind::Backend => Self::Backend { context: message },
            ErrorKind::Transport => Self::Transport(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::BadParameter(_) => ErrorKind::BadParameter,
            StoreError::NamespaceNotFound { .. } => ErrorKind::NamespaceNotFound,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StoreError::StaleObject { .. } => ErrorKind::StaleObject,
            StoreError::Deserialize(_) => ErrorKind::Deserialize,
            StoreError::Serialize(_) => ErrorKind::Serialize,
            StoreError::NotImplemented(_) => ErrorKind::NotImplemented,
            StoreError::Backend { .. } => ErrorKind::Backend,
            StoreError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Message without the kind prefix, as carried in proxy error bodies
    pub fn detail(&self) -> String {
        match self {
            StoreError::BadParameter(message)
            | StoreError::NotFound(message)
            | StoreError::AlreadyExists(message)
            | StoreError::Deserialize(message)
            | StoreError::Serialize(message)
            | StoreError::NotImplemented(message)
            | StoreError::Transport(message) => message.clone(),
            StoreError::NamespaceNotFound { namespace } => namespace.clone(),
            StoreError::Backend { context } => context.clone(),
            StoreError::StaleObject { .. } => self.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Turn a `NotFound` failure into `Ok(None)`, keeping every other failure
pub fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
