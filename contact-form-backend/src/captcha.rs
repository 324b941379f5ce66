use crate::secrets::{SecretRepository, RECAPTCHA_DATA_NAME};
use anyhow::{anyhow, Context};
use async_once_cell::OnceCell;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// Returns whether `token` is a valid solution. An `Err` means the verifier could not be
    /// consulted at all.
    async fn verify(&self, token: &str, remote_ip: &str) -> anyhow::Result<bool>;
}

pub struct RecaptchaVerifier<SecretRepositoryT: SecretRepository> {
    client: reqwest::Client,
    verify_url: String,
    secrets_repository: SecretRepositoryT,
    recaptcha_data: OnceCell<RecaptchaData>,
}

impl<SecretRepositoryT: SecretRepository> RecaptchaVerifier<SecretRepositoryT> {
    pub fn new(
        client: reqwest::Client,
        verify_url: impl Into<String>,
        secrets_repository: SecretRepositoryT,
    ) -> Self {
        Self {
            client,
            verify_url: verify_url.into(),
            secrets_repository,
            recaptcha_data: Default::default(),
        }
    }

    async fn secret(&self) -> anyhow::Result<&str> {
        let data = self
            .recaptcha_data
            .get_or_try_init(self.secrets_repository.get_secret(RECAPTCHA_DATA_NAME))
            .await
            .map_err(|error| anyhow!("Could not retrieve {RECAPTCHA_DATA_NAME}: {error}"))?;
        Ok(&data.secret)
    }
}

#[async_trait]
impl<SecretRepositoryT: SecretRepository> CaptchaVerifier for RecaptchaVerifier<SecretRepositoryT> {
    async fn verify(&self, token: &str, remote_ip: &str) -> anyhow::Result<bool> {
        let payload = RecaptchaVerifyPayload {
            secret: self.secret().await?,
            response: token,
            remoteip: remote_ip,
        };
        let response = self
            .client
            .post(&self.verify_url)
            .form(&payload)
            .send()
            .await
            .context("Error verifying reCAPTCHA token")?
            .error_for_status()
            .context("reCAPTCHA verification endpoint returned an error")?;
        let body: RecaptchaResponse = response
            .json()
            .await
            .context("Error decoding reCAPTCHA response")?;
        if body.success {
            info!("reCAPTCHA verified for {remote_ip}");
        } else {
            warn!(
                "reCAPTCHA rejected token from {remote_ip}: {:?}",
                body.error_codes
            );
        }
        Ok(body.success)
    }
}

#[derive(Deserialize)]
struct RecaptchaData {
    #[serde(rename = "RECAPTCHA_SECRET_KEY")]
    secret: String,
}

#[derive(Serialize)]
struct RecaptchaVerifyPayload<'a> {
    secret: &'a str,
    response: &'a str,
    remoteip: &'a str,
}

#[derive(Deserialize)]
struct RecaptchaResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}
