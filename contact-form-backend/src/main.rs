mod admin;
mod blocklist;
mod captcha;
mod config;
mod geolocation;
mod key_value;
mod mailer;
mod redeploy;
mod remote_config;
mod secrets;
mod submission;
mod submission_log;
mod templates;

use admin::{AdminConsole, AdminRoute};
use blocklist::{
    BlocklistManager, BlocklistStore, KeyValueBlocklistStore, RemoteConfigBlocklistStore,
};
use captcha::RecaptchaVerifier;
use config::{BlocklistBackend, Config, ConfigError, EmailTransport};
use geolocation::IpApiLocator;
use key_value::{KeyValueStore, NetlifyBlobsStore};
use lambda_http::{http::StatusCode, run, service_fn, Body, Error, Request, Response};
use mailer::{BrevoEmailSender, EmailSender, SmtpEmailSender};
use redeploy::BuildHookTrigger;
use remote_config::NetlifyEnvApi;
use secrets::{AwsSecretsManagerSecretRepository, SecretRepository};
use std::{fmt::Display, sync::Arc};
use submission::{MessageSettings, SubmissionGate};
use submission_log::SubmissionLog;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let config = Config::from_env()?;
    let secrets_repository = AwsSecretsManagerSecretRepository::open().await;
    let handler = ContactFormBackend::new(&config, secrets_repository)?;
    run(service_fn(|event| handler.handle(event))).await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    SendEmail,
    Admin(AdminRoute),
}

impl Route {
    /// Matches on the path suffix so that the function works behind any prefix, such as
    /// `/.netlify/functions`.
    fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        [
            ("/send-email", Route::SendEmail),
            ("/admin/block", Route::Admin(AdminRoute::Block)),
            ("/admin/unblock", Route::Admin(AdminRoute::Unblock)),
            ("/admin/logs", Route::Admin(AdminRoute::Logs)),
            ("/admin", Route::Admin(AdminRoute::Dashboard)),
        ]
        .into_iter()
        .find_map(|(suffix, route)| path.ends_with(suffix).then_some(route))
    }
}

struct ContactFormBackend<SecretRepositoryT: SecretRepository> {
    submissions: SubmissionGate,
    admin: AdminConsole<SecretRepositoryT>,
}

impl<SecretRepositoryT: SecretRepository> ContactFormBackend<SecretRepositoryT> {
    fn new(config: &Config, secrets_repository: SecretRepositoryT) -> Result<Self, ConfigError> {
        let client = config.http_client()?;

        let key_value: Arc<dyn KeyValueStore> = Arc::new(NetlifyBlobsStore::new(
            client.clone(),
            &config.netlify_blobs_url,
            &config.netlify_site_id,
            secrets_repository.clone(),
        ));
        let blocklist_store: Arc<dyn BlocklistStore> = match config.blocklist_backend {
            BlocklistBackend::KeyValue => Arc::new(KeyValueBlocklistStore::new(key_value.clone())),
            BlocklistBackend::RemoteConfig => Arc::new(
                RemoteConfigBlocklistStore::new(
                    Arc::new(NetlifyEnvApi::new(
                        client.clone(),
                        &config.netlify_api_url,
                        secrets_repository.clone(),
                    )),
                    &config.netlify_site_id,
                )
                .with_deployed(&config.blocked_ips, &config.blocked_emails),
            ),
        };
        let mailer: Arc<dyn EmailSender> = match config.email_transport {
            EmailTransport::Brevo => Arc::new(BrevoEmailSender::new(
                client.clone(),
                &config.brevo_api_url,
                secrets_repository.clone(),
            )),
            EmailTransport::Smtp => Arc::new(SmtpEmailSender::new(
                &config.smtp_url,
                secrets_repository.clone(),
            )),
        };
        info!(
            "Using {:?} blocklist backend and {:?} email transport",
            config.blocklist_backend, config.email_transport
        );

        let blocklist = BlocklistManager::new(blocklist_store);
        let log = SubmissionLog::new(key_value);
        let submissions = SubmissionGate::new(
            blocklist.clone(),
            Arc::new(RecaptchaVerifier::new(
                client.clone(),
                &config.recaptcha_verify_url,
                secrets_repository.clone(),
            )),
            mailer,
            Arc::new(IpApiLocator::new(client.clone(), &config.ip_api_url)),
            log.clone(),
            MessageSettings::from(config),
        );
        let admin = AdminConsole::new(
            secrets_repository,
            blocklist,
            log,
            Arc::new(BuildHookTrigger::new(
                client,
                &config.build_hooks_url,
                config.build_hook_id.as_deref(),
            )),
            &config.admin_url,
        );
        Ok(Self { submissions, admin })
    }

    async fn handle(&self, event: Request) -> Result<Response<Body>, Error> {
        let response = match Route::from_path(event.uri().path()) {
            Some(Route::SendEmail) => self.submissions.handle(event).await,
            Some(Route::Admin(route)) => self.admin.handle(route, event).await,
            None => {
                warn!("No route for {}", event.uri().path());
                Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body("Not Found".into())
                    .unwrap()
            }
        };
        Ok(response)
    }
}

#[derive(Debug)]
enum EnvironmentError {
    MissingSecret(&'static str),
}

impl Display for EnvironmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentError::MissingSecret(key) => write!(f, "Missing secret {key}"),
        }
    }
}

impl std::error::Error for EnvironmentError {}
