use crate::EnvironmentError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use serde::de::DeserializeOwned;

pub const ADMIN_CREDENTIALS_NAME: &str = "contact-form-admin";
pub const BREVO_CREDENTIALS_NAME: &str = "brevo-credentials";
pub const NETLIFY_CREDENTIALS_NAME: &str = "netlify-credentials";
pub const RECAPTCHA_DATA_NAME: &str = "recaptcha-data";
pub const SMTP_CREDENTIALS_NAME: &str = "smtp-credentials";

#[async_trait]
pub trait SecretRepository: Clone + Send + Sync + 'static {
    async fn open() -> Self;

    async fn get_secret<T: DeserializeOwned>(
        &self,
        name: &'static str,
    ) -> Result<T, lambda_http::Error>;
}

#[derive(Clone)]
pub struct AwsSecretsManagerSecretRepository(aws_sdk_secretsmanager::Client);

#[async_trait]
impl SecretRepository for AwsSecretsManagerSecretRepository {
    async fn open() -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(url) = std::env::var("AWS_ENDPOINT_URL") {
            loader = loader.endpoint_url(url);
        }
        let config = loader.load().await;
        let secrets_client = aws_sdk_secretsmanager::Client::new(&config);
        Self(secrets_client)
    }

    async fn get_secret<T: DeserializeOwned>(
        &self,
        name: &'static str,
    ) -> Result<T, lambda_http::Error> {
        let secret = self.0.get_secret_value().secret_id(name).send().await?;
        let Some(secret_value) = secret.secret_string() else {
            return Err(Box::new(EnvironmentError::MissingSecret(name)));
        };
        Ok(serde_json::from_str(secret_value)?)
    }
}
