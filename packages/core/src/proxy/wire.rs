//! HTTP wire protocol shared by the proxy client and the proxy service
//!
//! Routes are rooted at `{endpoint}/{namespace}`; see [`crate::server`] for
//! the full table. Object, blob and metadata bodies are the serializer
//! documents; the types here are the remaining envelopes.

use crate::error::{ErrorKind, StoreError};
use crate::serializer::ObjectDoc;
use serde::{Deserialize, Serialize};

pub const HEALTHCHECK_SEGMENT: &str = "healthcheck";
pub const SEARCH_SEGMENT: &str = "search";
pub const FILE_SEGMENT: &str = "file";

pub const ATTRIBS_PARAM: &str = "attribs";
pub const VTAG_PARAM: &str = "vtag";
pub const NEW_NAME_PARAM: &str = "new";

/// Namespace segment of a search across every namespace
///
/// Never a valid namespace, so it cannot shadow a real one.
pub const ALL_NAMESPACES_SEGMENT: &str = "*";

/// Body of a fetch-many request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<String>,
}

/// Body of a fetch-many or search response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub results: Vec<ObjectDoc>,
}

/// Body of every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
}

/// Query parameters accepted by the object and file routes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vtag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

/// Rebuild the canonical failure carried by an error response
///
/// A well-formed [`ErrorBody`] is trusted as is: its code must be canonical
/// or the failure is a transport failure. Only bodies that are not an
/// `ErrorBody`, such as pages from intermediaries, are searched for a code.
pub fn error_from_response(status: u16, body: &[u8]) -> StoreError {
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
        return match ErrorKind::from_code(&parsed.code) {
            Some(kind) => StoreError::from_kind(kind, parsed.message),
            None => StoreError::Transport(format!(
                "HTTP {} {}: {}",
                status, parsed.code, parsed.message
            )),
        };
    }

    let text = String::from_utf8_lossy(body);
    match ErrorKind::find_in(&text) {
        Some(kind) => StoreError::from_kind(kind, text.into_owned()),
        None => StoreError::Transport(format!("HTTP {}: {}", status, text.trim())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_code_wins() {
        let body = br#"{"message":"docs/a","code":"NOT_FOUND"}"#;
        let err = error_from_response(404, body);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "Not found: docs/a");
    }

    #[test]
    fn test_plain_body_is_searched_for_a_code() {
        let err = error_from_response(409, b"upstream said STALE_OBJECT");
        assert_eq!(err.kind(), ErrorKind::StaleObject);
    }

    #[test]
    fn test_structured_backend_failure_is_not_searched() {
        let body = br#"{"message":"index for NOT_FOUND-report failed","code":"BACKEND"}"#;
        let err = error_from_response(500, body);
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("NOT_FOUND-report"));
    }

    #[test]
    fn test_unknown_body_is_transport() {
        let err = error_from_response(502, b"<html>bad gateway</html>");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_params_omit_absent_values() {
        let params = StoreParams {
            vtag: Some("v1".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&params).unwrap(), serde_json::json!({"vtag": "v1"}));
    }
}
