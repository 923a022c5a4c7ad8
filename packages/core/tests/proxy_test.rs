//! Proxy client against a live proxy service
//!
//! The service runs on an ephemeral port over the embedded backend; the
//! client must be indistinguishable from the in-process core.

mod common;

#[cfg(test)]
mod proxy_tests {
    use crate::common::{file_names, open, sample_object, Backend};
    use anyhow::Result;
    use easystore_core::config::ProxyConfig;
    use easystore_core::models::{Blob, ComponentSelector, Fields, Object};
    use easystore_core::proxy::ProxyClient;
    use easystore_core::serializer::ObjectDoc;
    use easystore_core::server;
    use easystore_core::services::{EasyStore, ObjectService, ReadStore};
    use easystore_core::ErrorKind;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    struct Harness {
        direct: Arc<ObjectService>,
        client: ProxyClient,
        stop: Option<oneshot::Sender<()>>,
        _temp_dir: TempDir,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    async fn start() -> Result<Harness> {
        let (service, temp_dir) = open(Backend::Embedded).await?;
        let direct = Arc::new(service);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server::serve_with_shutdown(listener, direct.clone(), async {
            let _ = stopped.await;
        }));

        let client = ProxyClient::new(&ProxyConfig {
            service_endpoint: endpoint,
            request_timeout: 5,
        })?;
        Ok(Harness {
            direct,
            client,
            stop: Some(stop),
            _temp_dir: temp_dir,
        })
    }

    /// Document JSON without the per-call identity of the object
    fn shape(object: &Object) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(ObjectDoc::from(object))?;
        if let Some(map) = value.as_object_mut() {
            for key in ["id", "vtag", "created", "modified"] {
                map.remove(key);
            }
        }
        if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for key in ["id", "vtag", "created", "modified"] {
                metadata.remove(key);
            }
        }
        if let Some(files) = value.get_mut("files").and_then(|f| f.as_array_mut()) {
            files.sort_by_key(|file| file["name"].as_str().unwrap_or_default().to_string());
            for file in files {
                if let Some(file) = file.as_object_mut() {
                    file.remove("created");
                    file.remove("modified");
                }
            }
        }
        Ok(value)
    }

    #[tokio::test]
    async fn test_proxy_create_matches_direct_create() -> Result<()> {
        let harness = start().await?;
        harness.client.check().await?;

        let via_proxy = harness.client.create(&sample_object("docs", "p")).await?;
        let direct = harness.direct.create(&sample_object("docs", "d")).await?;

        assert_eq!(shape(&via_proxy)?, shape(&direct)?);

        let stored = harness
            .direct
            .get_by_key("docs", "p", ComponentSelector::ALL)
            .await?;
        assert_eq!(stored.vtag, via_proxy.vtag);
        assert_eq!(shape(&stored)?, shape(&via_proxy)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_kinds_cross_the_wire() -> Result<()> {
        let harness = start().await?;
        let client = &harness.client;
        let stored = client.create(&sample_object("docs", "a")).await?;

        let err = client.create(&sample_object("docs", "a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = client
            .get_by_key("docs", "missing", ComponentSelector::BASE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = client
            .get_by_key("nowhere", "a", ComponentSelector::BASE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NamespaceNotFound);

        let mut stale = stored.clone();
        stale.vtag = "0000".to_string();
        let err = client
            .update(&stale, ComponentSelector::FIELDS)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleObject);
        Ok(())
    }

    #[tokio::test]
    async fn test_full_lifecycle_over_http() -> Result<()> {
        let harness = start().await?;
        let client = &harness.client;

        let mut stored = client.create(&sample_object("docs", "a")).await?;
        stored.set_field("status", "reviewed");
        let stored = client.update(&stored, ComponentSelector::FIELDS).await?;
        assert_eq!(stored.fields.as_ref().unwrap()["status"], "reviewed");

        let stored = client
            .add_file(&stored, &Blob::new("extra name.txt", "text/plain", b"x".to_vec()))
            .await?;
        let stored = client
            .rename_file(&stored, ComponentSelector::FILES, "extra name.txt", "kept.txt")
            .await?;
        let stored = client.delete_file(&stored, "logo.png").await?;
        assert_eq!(file_names(&stored), vec!["kept.txt", "notes.txt"]);

        let mut predicates = Fields::new();
        predicates.insert("status".to_string(), "reviewed".to_string());
        let found = client
            .get_by_fields("", &predicates, ComponentSelector::FILES)
            .await?
            .collect_all()
            .await?;
        assert_eq!(found.len(), 1);
        assert_eq!(file_names(&found[0]), vec!["kept.txt", "notes.txt"]);

        let returned = client.delete(&stored, ComponentSelector::BASE).await?;
        assert_eq!(returned.vtag, stored.vtag);
        let err = harness
            .direct
            .get_by_key("docs", "a", ComponentSelector::BASE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() -> Result<()> {
        let harness = start().await?;
        harness.client.close().await?;

        let err = harness
            .client
            .get_by_key("docs", "a", ComponentSelector::BASE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("http://{}", listener.local_addr()?);
        drop(listener);

        let client = ProxyClient::new(&ProxyConfig {
            service_endpoint: endpoint,
            request_timeout: 2,
        })?;
        let err = client.check().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        Ok(())
    }
}
