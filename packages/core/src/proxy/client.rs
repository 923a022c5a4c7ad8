//! HTTP proxy client
//!
//! Implements [`EasyStore`] against a remote proxy service. Every call runs
//! the same preflight checks as the in-process core before touching the
//! network, so bad input fails `BadParameter` without a request.

use super::wire::{
    error_from_response, IdsRequest, ResultsResponse, ALL_NAMESPACES_SEGMENT, ATTRIBS_PARAM,
    FILE_SEGMENT, HEALTHCHECK_SEGMENT, NEW_NAME_PARAM, SEARCH_SEGMENT, VTAG_PARAM,
};
use crate::config::ProxyConfig;
use crate::error::{Result, StoreError};
use crate::models::validation::{validate_file_name, validate_namespace, validate_object_id};
use crate::models::{Blob, ComponentSelector, Fields, Object, ObjectKey};
use crate::serializer::{decode_object, BlobDoc, ObjectDoc};
use crate::services::preflight::{
    create_target, read_target, rename_names, validate_blobs, validate_fields, write_target,
};
use crate::services::{resolve_namespace, EasyStore, ReadStore, ResultSet};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use std::sync::RwLock;
use std::time::Duration;
use url::Url;

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Transport(format!("request timed out: {}", err))
    } else {
        StoreError::Transport(err.to_string())
    }
}

fn decode_results(bytes: &[u8]) -> Result<Vec<Object>> {
    let response: ResultsResponse = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Deserialize(format!("results document: {}", e)))?;
    response
        .results
        .into_iter()
        .map(Object::try_from)
        .collect()
}

fn encode_body<T: serde::Serialize>(what: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialize(format!("{}: {}", what, e)))
}

/// Remote [`EasyStore`] reached over HTTP
pub struct ProxyClient {
    endpoint: Url,
    timeout: Duration,
    client: RwLock<Option<Client>>,
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProxyClient {
    /// Build a client for `config.service_endpoint`
    ///
    /// No request is made; use [`ReadStore::check`] to probe the service.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.service_endpoint).map_err(|e| {
            StoreError::bad_parameter(format!(
                "invalid service endpoint '{}': {}",
                config.service_endpoint, e
            ))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(StoreError::bad_parameter(format!(
                "service endpoint '{}' cannot carry a path",
                endpoint
            )));
        }

        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport_error)?;

        tracing::debug!(endpoint = %endpoint, ?timeout, "proxy client ready");
        Ok(Self {
            endpoint,
            timeout,
            client: RwLock::new(Some(client)),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn http(&self) -> Result<Client> {
        let guard = self
            .client
            .read()
            .map_err(|_| StoreError::Transport("proxy client lock poisoned".to_string()))?;
        guard
            .clone()
            .ok_or_else(|| StoreError::bad_parameter("proxy client is closed"))
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::bad_parameter("service endpoint cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, key: &ObjectKey, rest: &[&str]) -> Result<Url> {
        let mut segments = vec![key.namespace.as_str(), key.id.as_str()];
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        Ok(self.http()?.request(method, url))
    }

    /// Send and return the body of a 2xx response
    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            let err = error_from_response(status.as_u16(), &body);
            tracing::debug!(status = status.as_u16(), error = %err, "proxy request failed");
            return Err(err);
        }
        Ok(body.to_vec())
    }

    async fn send_object(&self, request: RequestBuilder) -> Result<Object> {
        let body = self.send(request).await?;
        decode_object(&body)
    }
}

fn with_selector(mut url: Url, selector: ComponentSelector) -> Url {
    if let Some(attribs) = selector.to_wire() {
        url.query_pairs_mut().append_pair(ATTRIBS_PARAM, &attribs);
    }
    url
}

fn with_vtag(mut url: Url, vtag: &str) -> Url {
    url.query_pairs_mut().append_pair(VTAG_PARAM, vtag);
    url
}

fn json_body(request: RequestBuilder, body: Vec<u8>) -> RequestBuilder {
    request
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
}

#[async_trait]
impl ReadStore for ProxyClient {
    async fn check(&self) -> Result<()> {
        let url = self.url(&[HEALTHCHECK_SEGMENT])?;
        self.send(self.request(Method::GET, url)?).await?;
        Ok(())
    }

    async fn get_by_key(
        &self,
        namespace: &str,
        id: &str,
        selector: ComponentSelector,
    ) -> Result<Object> {
        let key = read_target(namespace, id)?;
        let selector = selector.validate()?;

        let url = with_selector(self.object_url(&key, &[])?, selector);
        self.send_object(self.request(Method::GET, url)?).await
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

        let url = with_selector(self.url(&[namespace])?, selector);
        let body = encode_body("ids", &IdsRequest { ids: ids.to_vec() })?;
        let response = self
            .send(json_body(self.request(Method::PUT, url)?, body))
            .await?;
        Ok(ResultSet::hydrated(decode_results(&response)?))
    }

    async fn get_by_fields(
        &self,
        namespace: &str,
        fields: &Fields,
        selector: ComponentSelector,
    ) -> Result<ResultSet> {
        let segment = if namespace.is_empty() {
            ALL_NAMESPACES_SEGMENT
        } else {
            validate_namespace(namespace)?;
            namespace
        };
        let selector = selector.validate()?;
        validate_fields(fields)?;

        let url = with_selector(self.url(&[segment, SEARCH_SEGMENT])?, selector);
        let body = encode_body("fields", fields)?;
        let response = self
            .send(json_body(self.request(Method::PUT, url)?, body))
            .await?;
        Ok(ResultSet::hydrated(decode_results(&response)?))
    }

    /// Drop the pooled connections; every later call fails `BadParameter`
    async fn close(&self) -> Result<()> {
        let mut guard = self
            .client
            .write()
            .map_err(|_| StoreError::Transport("proxy client lock poisoned".to_string()))?;
        if guard.take().is_some() {
            tracing::debug!(endpoint = %self.endpoint, "proxy client closed");
        }
        Ok(())
    }
}

#[async_trait]
impl EasyStore for ProxyClient {
    async fn create(&self, object: &Object) -> Result<Object> {
        create_target(object)?;
        let namespace = resolve_namespace(&object.namespace);

        let url = self.url(&[namespace])?;
        let body = encode_body("object", &ObjectDoc::from(object))?;
        self.send_object(json_body(self.request(Method::POST, url)?, body))
            .await
    }

    async fn update(&self, object: &Object, selector: ComponentSelector) -> Result<Object> {
        let selector = selector.validate()?;
        let key = write_target(object)?;
        if selector.contains(ComponentSelector::FIELDS) {
            if let Some(fields) = &object.fields {
                validate_fields(fields)?;
            }
        }
        if selector.contains(ComponentSelector::FILES) {
            if let Some(files) = &object.files {
                validate_blobs(files)?;
            }
        }

        let url = with_vtag(
            with_selector(self.object_url(&key, &[])?, selector),
            &object.vtag,
        );
        let body = encode_body("object", &ObjectDoc::from(object))?;
        self.send_object(json_body(self.request(Method::PUT, url)?, body))
            .await
    }

    async fn delete(&self, object: &Object, selector: ComponentSelector) -> Result<Object> {
        let selector = selector.validate()?;
        let key = write_target(object)?;

        let url = with_selector(
            with_vtag(self.object_url(&key, &[])?, &object.vtag),
            selector,
        );
        self.send(self.request(Method::DELETE, url)?).await?;
        Ok(object.clone())
    }

    async fn rename_file(
        &self,
        object: &Object,
        selector: ComponentSelector,
        old_name: &str,
        new_name: &str,
    ) -> Result<Object> {
        let selector = selector.validate()?;
        if !selector.contains(ComponentSelector::FILES) {
            return Err(StoreError::bad_parameter(
                "rename_file needs a selector that includes files",
            ));
        }
        rename_names(old_name, new_name)?;
        let key = write_target(object)?;

        let mut url = self.object_url(&key, &[FILE_SEGMENT, old_name])?;
        url.query_pairs_mut().append_pair(NEW_NAME_PARAM, new_name);
        let url = with_selector(with_vtag(url, &object.vtag), selector);
        self.send_object(self.request(Method::POST, url)?).await
    }

    async fn add_file(&self, object: &Object, blob: &Blob) -> Result<Object> {
        validate_file_name(&blob.name)?;
        let key = write_target(object)?;

        let url = with_vtag(self.object_url(&key, &[FILE_SEGMENT])?, &object.vtag);
        let body = encode_body("file", &BlobDoc::from(blob))?;
        self.send_object(json_body(self.request(Method::POST, url)?, body))
            .await
    }

    async fn update_file(&self, object: &Object, blob: &Blob) -> Result<Object> {
        validate_file_name(&blob.name)?;
        let key = write_target(object)?;

        let url = with_vtag(self.object_url(&key, &[FILE_SEGMENT])?, &object.vtag);
        let body = encode_body("file", &BlobDoc::from(blob))?;
        self.send_object(json_body(self.request(Method::PUT, url)?, body))
            .await
    }

    async fn delete_file(&self, object: &Object, name: &str) -> Result<Object> {
        validate_file_name(name)?;
        let key = write_target(object)?;

        let url = with_vtag(self.object_url(&key, &[FILE_SEGMENT, name])?, &object.vtag);
        self.send_object(self.request(Method::DELETE, url)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ProxyClient {
        ProxyClient::new(&ProxyConfig {
            service_endpoint: server.uri(),
            request_timeout: 5,
        })
        .unwrap()
    }

    fn stored(namespace: &str, id: &str) -> Object {
        let mut object = Object::with_id(namespace, id);
        object.vtag = "v1".to_string();
        object
    }

    #[tokio::test]
    async fn test_get_by_key_sends_attribs() {
        let server = MockServer::start().await;
        let mut object = stored("docs", "a");
        object.set_field("color", "red");

        Mock::given(method("GET"))
            .and(path("/docs/a"))
            .and(query_param("attribs", "fields"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ObjectDoc::from(&object)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let fetched = client
            .get_by_key("docs", "a", ComponentSelector::FIELDS)
            .await
            .unwrap();
        assert_eq!(fetched.fields, object.fields);
        assert_eq!(fetched.vtag, "v1");
    }

    #[tokio::test]
    async fn test_error_body_maps_to_kind() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/docs/a"))
            .and(query_param("vtag", "v1"))
            .respond_with(ResponseTemplate::new(412).set_body_json(json!({
                "message": "Stale object docs/a",
                "code": "STALE_OBJECT"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .delete(&stored("docs", "a"), ComponentSelector::BASE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleObject);
    }

    #[tokio::test]
    async fn test_unmatched_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthcheck"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client_for(&server).check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_fetch_many_body_and_results() {
        let server = MockServer::start().await;
        let results = json!({ "results": [ObjectDoc::from(&stored("docs", "a"))] });
        Mock::given(method("PUT"))
            .and(path("/docs"))
            .and(body_json(json!({ "ids": ["a", "missing"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(results))
            .mount(&server)
            .await;

        let set = client_for(&server)
            .get_by_keys(
                "docs",
                &["a".to_string(), "missing".to_string()],
                ComponentSelector::BASE,
            )
            .await
            .unwrap();
        assert_eq!(set.count(), 1);
    }

    #[tokio::test]
    async fn test_global_search_uses_wildcard_segment() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/*/search"))
            .and(query_param("attribs", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let mut predicates = Fields::new();
        predicates.insert("color".to_string(), "red".to_string());
        let set = client_for(&server)
            .get_by_fields("", &predicates, ComponentSelector::ALL)
            .await
            .unwrap();
        assert_eq!(set.count(), 0);
    }

    #[tokio::test]
    async fn test_rename_sends_new_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/docs/a/file/old.txt"))
            .and(query_param("new", "new.txt"))
            .and(query_param("vtag", "v1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(ObjectDoc::from(&stored("docs", "a"))),
            )
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .rename_file(
                &stored("docs", "a"),
                ComponentSelector::FILES,
                "old.txt",
                "new.txt",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_preflight_rejects_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let missing_vtag = Object::with_id("docs", "a");
        let err = client
            .update(&missing_vtag, ComponentSelector::FIELDS)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);

        let err = client
            .get_by_key("docs", "a", ComponentSelector(9))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[tokio::test]
    async fn test_closed_client_fails_bad_parameter() {
        let server = MockServer::start().await;
        let client = client_for(&server);
        client.close().await.unwrap();
        client.close().await.unwrap();

        let err = client.check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }

    #[test]
    fn test_endpoint_must_be_a_url() {
        let err = ProxyClient::new(&ProxyConfig {
            service_endpoint: "not a url".to_string(),
            request_timeout: 30,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
    }
}
