use crate::secrets::{SecretRepository, NETLIFY_CREDENTIALS_NAME};
use anyhow::{anyhow, bail, Context};
use async_once_cell::OnceCell;
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

/// A durable store of string values, grouped into namespaces.
///
/// There are no transactions: each call reads or writes exactly one key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()>;

    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>>;

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()>;

    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Deserialize)]
pub(crate) struct NetlifyCredentials {
    #[serde(rename = "NETLIFY_ACCESS_TOKEN")]
    pub(crate) access_token: String,
}

/// Netlify Blobs, addressed as `{blobs_url}/{site_id}/{namespace}/{key}`.
pub struct NetlifyBlobsStore<SecretRepositoryT: SecretRepository> {
    client: reqwest::Client,
    blobs_url: String,
    site_id: String,
    secrets_repository: SecretRepositoryT,
    credentials: OnceCell<NetlifyCredentials>,
}

impl<SecretRepositoryT: SecretRepository> NetlifyBlobsStore<SecretRepositoryT> {
    pub fn new(
        client: reqwest::Client,
        blobs_url: impl Into<String>,
        site_id: impl Into<String>,
        secrets_repository: SecretRepositoryT,
    ) -> Self {
        Self {
            client,
            blobs_url: blobs_url.into(),
            site_id: site_id.into(),
            secrets_repository,
            credentials: Default::default(),
        }
    }

    fn namespace_url(&self, namespace: &str) -> String {
        format!(
            "{}/{}/{}",
            self.blobs_url.trim_end_matches('/'),
            urlencoding::encode(&self.site_id),
            urlencoding::encode(namespace)
        )
    }

    fn key_url(&self, namespace: &str, key: &str) -> String {
        format!(
            "{}/{}",
            self.namespace_url(namespace),
            urlencoding::encode(key)
        )
    }

    async fn authorized(&self, request: RequestBuilder) -> anyhow::Result<RequestBuilder> {
        let credentials = self
            .credentials
            .get_or_try_init(self.secrets_repository.get_secret(NETLIFY_CREDENTIALS_NAME))
            .await
            .map_err(|error| anyhow!("Could not retrieve {NETLIFY_CREDENTIALS_NAME}: {error}"))?;
        Ok(request.bearer_auth(&credentials.access_token))
    }
}

async fn check_status(response: Response, action: &str) -> anyhow::Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        bail!("Blob store {action} failed with status {status}: {body}")
    }
}

#[async_trait]
impl<SecretRepositoryT: SecretRepository> KeyValueStore for NetlifyBlobsStore<SecretRepositoryT> {
    async fn set(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let request = self
            .authorized(self.client.put(self.key_url(namespace, key)))
            .await?
            .body(value.to_string());
        let response = request.send().await.context("Error writing blob")?;
        check_status(response, "write").await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>> {
        let request = self
            .authorized(self.client.get(self.key_url(namespace, key)))
            .await?;
        let response = request.send().await.context("Error reading blob")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "read").await?;
        Ok(Some(response.text().await.context("Error reading blob")?))
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        let request = self
            .authorized(self.client.delete(self.key_url(namespace, key)))
            .await?;
        let response = request.send().await.context("Error deleting blob")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete").await?;
        Ok(())
    }

    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
        let request = self
            .authorized(self.client.get(self.namespace_url(namespace)))
            .await?;
        let response = request.send().await.context("Error listing blobs")?;
        let listing: BlobListing = check_status(response, "list")
            .await?
            .json()
            .await
            .context("Error decoding blob listing")?;
        Ok(listing.blobs.into_iter().map(|blob| blob.key).collect())
    }
}

#[derive(Deserialize)]
struct BlobListing {
    #[serde(default)]
    blobs: Vec<BlobEntry>,
}

#[derive(Deserialize)]
struct BlobEntry {
    key: String,
}

#[cfg(test)]
pub mod test_support {
    use super::KeyValueStore;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    #[derive(Default)]
    pub struct InMemoryKeyValueStore {
        entries: Mutex<BTreeMap<(String, String), String>>,
        unavailable: AtomicBool,
    }

    impl InMemoryKeyValueStore {
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        pub fn keys(&self, namespace: &str) -> Vec<String> {
            self.entries
                .lock()
                .unwrap()
                .keys()
                .filter(|(n, _)| n == namespace)
                .map(|(_, key)| key.clone())
                .collect()
        }

        pub fn value(&self, namespace: &str, key: &str) -> Option<String> {
            self.entries
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), key.to_string()))
                .cloned()
        }

        fn check_available(&self) -> anyhow::Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                bail!("In-memory store is unavailable");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStore for InMemoryKeyValueStore {
        async fn set(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
            self.check_available()?;
            self.entries
                .lock()
                .unwrap()
                .insert((namespace.into(), key.into()), value.into());
            Ok(())
        }

        async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>> {
            self.check_available()?;
            Ok(self.value(namespace, key))
        }

        async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
            self.check_available()?;
            self.entries
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), key.to_string()));
            Ok(())
        }

        async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
            self.check_available()?;
            Ok(self.keys(namespace))
        }
    }
}
