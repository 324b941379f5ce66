use crate::{
    key_value::NetlifyCredentials,
    secrets::{SecretRepository, NETLIFY_CREDENTIALS_NAME},
};
use anyhow::{anyhow, bail, Context};
use async_once_cell::OnceCell;
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};

const VARIABLE_SCOPES: [&str; 4] = ["builds", "functions", "runtime", "post_processing"];

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    #[serde(default)]
    pub values: Vec<EnvVarValue>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnvVarValue {
    pub value: String,
    #[serde(default)]
    pub context: Option<String>,
}

impl EnvVar {
    pub fn first_value(&self) -> Option<&str> {
        self.values.first().map(|value| value.value.as_str())
    }
}

/// Site configuration variables held by the deployment platform.
#[async_trait]
pub trait RemoteConfigApi: Send + Sync {
    async fn get(&self, site_id: &str) -> anyhow::Result<Vec<EnvVar>>;

    async fn patch(&self, site_id: &str, key: &str, value: &str) -> anyhow::Result<()>;
}

pub struct NetlifyEnvApi<SecretRepositoryT: SecretRepository> {
    client: reqwest::Client,
    api_url: String,
    secrets_repository: SecretRepositoryT,
    credentials: OnceCell<NetlifyCredentials>,
}

impl<SecretRepositoryT: SecretRepository> NetlifyEnvApi<SecretRepositoryT> {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        secrets_repository: SecretRepositoryT,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            secrets_repository,
            credentials: Default::default(),
        }
    }

    fn env_url(&self) -> String {
        format!("{}/accounts/-/env", self.api_url.trim_end_matches('/'))
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
        bail!("Netlify {action} failed with status {status}: {body}")
    }
}

#[derive(Serialize)]
struct PatchPayload<'a> {
    key: &'a str,
    scopes: [&'static str; 4],
    values: [EnvVarValue; 1],
}

#[async_trait]
impl<SecretRepositoryT: SecretRepository> RemoteConfigApi for NetlifyEnvApi<SecretRepositoryT> {
    async fn get(&self, site_id: &str) -> anyhow::Result<Vec<EnvVar>> {
        let request = self
            .authorized(self.client.get(self.env_url()).query(&[("site_id", site_id)]))
            .await?;
        let response = request
            .send()
            .await
            .context("Error fetching environment variables")?;
        check_status(response, "environment variable fetch")
            .await?
            .json()
            .await
            .context("Error decoding environment variables")
    }

    async fn patch(&self, site_id: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let payload = PatchPayload {
            key,
            scopes: VARIABLE_SCOPES,
            values: [EnvVarValue {
                value: value.into(),
                context: Some("all".into()),
            }],
        };
        let url = format!("{}/{}", self.env_url(), urlencoding::encode(key));
        let request = self
            .authorized(
                self.client
                    .patch(url)
                    .query(&[("site_id", site_id)])
                    .json(&payload),
            )
            .await?;
        let response = request
            .send()
            .await
            .with_context(|| format!("Error updating {key}"))?;
        check_status(response, "environment variable update").await?;
        Ok(())
    }
}
