use crate::secrets::{SecretRepository, BREVO_CREDENTIALS_NAME, SMTP_CREDENTIALS_NAME};
use anyhow::{anyhow, bail, Context};
use async_once_cell::OnceCell;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::{Credentials, Mechanism},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Contact {
    pub fn new(email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email: email.into(),
            name,
        }
    }

    fn to_mailbox(&self) -> anyhow::Result<Mailbox> {
        Ok(Mailbox::new(
            self.name.clone(),
            self.email
                .parse()
                .with_context(|| format!("Invalid email address {}", self.email))?,
        ))
    }
}

/// Parses `Name <address>` or a bare address.
impl FromStr for Contact {
    type Err = lettre::address::AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mailbox: Mailbox = s.trim().parse()?;
        Ok(Self {
            email: mailbox.email.to_string(),
            name: mailbox.name,
        })
    }
}

#[derive(Clone, Debug)]
pub struct OutgoingEmail {
    pub sender: Contact,
    pub recipients: Vec<Contact>,
    pub reply_to: Contact,
    pub subject: String,
    pub html_body: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentEmail {
    pub message_id: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> anyhow::Result<SentEmail>;
}

pub struct BrevoEmailSender<SecretRepositoryT: SecretRepository> {
    client: reqwest::Client,
    api_url: String,
    secrets_repository: SecretRepositoryT,
    credentials: OnceCell<BrevoCredentials>,
}

impl<SecretRepositoryT: SecretRepository> BrevoEmailSender<SecretRepositoryT> {
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
}

#[async_trait]
impl<SecretRepositoryT: SecretRepository> EmailSender for BrevoEmailSender<SecretRepositoryT> {
    async fn send(&self, email: &OutgoingEmail) -> anyhow::Result<SentEmail> {
        let credentials = self
            .credentials
            .get_or_try_init(self.secrets_repository.get_secret(BREVO_CREDENTIALS_NAME))
            .await
            .map_err(|error| anyhow!("Could not retrieve {BREVO_CREDENTIALS_NAME}: {error}"))?;
        let payload = BrevoPayload {
            sender: &email.sender,
            to: &email.recipients,
            reply_to: &email.reply_to,
            subject: &email.subject,
            html_content: &email.html_body,
        };
        let response = self
            .client
            .post(&self.api_url)
            .header("api-key", &credentials.api_key)
            .header("accept", "application/json")
            .json(&payload)
            .send()
            .await
            .context("Error sending message to Brevo")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Brevo rejected message with status {status}: {body}");
        }
        let body: BrevoResponse = response
            .json()
            .await
            .context("Error decoding Brevo response")?;
        info!("Sent message {} via Brevo", body.message_id);
        Ok(SentEmail {
            message_id: body.message_id,
        })
    }
}

#[derive(Deserialize)]
struct BrevoCredentials {
    #[serde(rename = "BREVO_API_KEY")]
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BrevoPayload<'a> {
    sender: &'a Contact,
    to: &'a [Contact],
    reply_to: &'a Contact,
    subject: &'a str,
    html_content: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrevoResponse {
    message_id: String,
}

pub struct SmtpEmailSender<SecretRepositoryT: SecretRepository> {
    smtp_url: String,
    secrets_repository: SecretRepositoryT,
    mailer: OnceCell<AsyncSmtpTransport<Tokio1Executor>>,
}

impl<SecretRepositoryT: SecretRepository> SmtpEmailSender<SecretRepositoryT> {
    pub fn new(smtp_url: impl Into<String>, secrets_repository: SecretRepositoryT) -> Self {
        Self {
            smtp_url: smtp_url.into(),
            secrets_repository,
            mailer: Default::default(),
        }
    }

    async fn initialise_mailer(&self) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
        info!("initialise_mailer: Connecting to {}", self.smtp_url);
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::from_url(&self.smtp_url)?
            .authentication(vec![Mechanism::Plain]);

        // Credentials only travel over TLS. A misconfigured plain URL gets rejected by the server
        // instead.
        if self.smtp_url.starts_with("smtps://") {
            let parsed_credentials: SmtpCredentials = self
                .secrets_repository
                .get_secret(SMTP_CREDENTIALS_NAME)
                .await
                .map_err(|error| anyhow!("Could not retrieve {SMTP_CREDENTIALS_NAME}: {error}"))?;
            builder = builder.credentials(Credentials::new(
                parsed_credentials.username,
                parsed_credentials.password,
            ));
        }

        Ok(builder.build())
    }

    fn build_message(email: &OutgoingEmail) -> anyhow::Result<Message> {
        let mut builder = Message::builder()
            .from(email.sender.to_mailbox()?)
            .reply_to(email.reply_to.to_mailbox()?)
            .subject(email.subject.as_str())
            .message_id(None)
            .header(ContentType::TEXT_HTML);
        for recipient in &email.recipients {
            builder = builder.to(recipient.to_mailbox()?);
        }
        builder
            .body(email.html_body.clone())
            .context("Error building message")
    }
}

#[async_trait]
impl<SecretRepositoryT: SecretRepository> EmailSender for SmtpEmailSender<SecretRepositoryT> {
    async fn send(&self, email: &OutgoingEmail) -> anyhow::Result<SentEmail> {
        let message = Self::build_message(email)?;
        let message_id = message
            .headers()
            .get_raw("Message-ID")
            .unwrap_or_default()
            .to_string();
        let mailer = self
            .mailer
            .get_or_try_init(self.initialise_mailer())
            .await
            .context("Unable to connect to SMTP server")?;
        mailer
            .send(message)
            .await
            .context("Error sending message")?;
        Ok(SentEmail { message_id })
    }
}

#[derive(Deserialize)]
struct SmtpCredentials {
    #[serde(rename = "SMTP_USERNAME")]
    username: String,
    #[serde(rename = "SMTP_PASSWORD")]
    password: String,
}


#[cfg(test)]
mod tests {
    use super::{BrevoEmailSender, Contact, EmailSender, OutgoingEmail, SmtpEmailSender};
    use crate::secrets::{
        test_support::{FakeSecretRepository, FAKE_BREVO_API_KEY},
        SecretRepository, BREVO_CREDENTIALS_NAME,
    };
    use googletest::prelude::*;
    use serial_test::serial;
    use std::{sync::OnceLock, time::Duration};
    use test_support::{
        fake_brevo::FakeBrevo,
        fake_smtp::{start_poisoned_smtp_server, FakeSmtpServer, POISONED_SMTP_PORT},
    };
    use tokio::time::timeout;

    fn arbitrary_email() -> OutgoingEmail {
        OutgoingEmail {
            sender: Contact::new("website@example.com", Some("Website".into())),
            recipients: vec![
                Contact::new("first@example.com", Some("First".into())),
                Contact::new("second@example.com", None),
            ],
            reply_to: Contact::new("visitor@example.com", None),
            subject: "Test subject".into(),
            html_body: "<p>Test message</p>".into(),
        }
    }

    #[test]
    fn parses_contact_with_name() -> Result<()> {
        verify_that!(
            "Lilian Kigunda <lilian@example.com>".parse::<Contact>(),
            ok(eq(Contact::new(
                "lilian@example.com",
                Some("Lilian Kigunda".into())
            )))
        )
    }

    #[test]
    fn parses_bare_contact() -> Result<()> {
        verify_that!(
            " lilian@example.com ".parse::<Contact>(),
            ok(eq(Contact::new("lilian@example.com", None)))
        )
    }

    #[test]
    fn rejects_contact_without_at_sign() -> Result<()> {
        verify_that!("not an address".parse::<Contact>(), err(anything()))
    }

    #[googletest::test]
    #[tokio::test]
    async fn posts_message_to_brevo() {
        let fake_brevo = FakeBrevo::new(FAKE_BREVO_API_KEY);
        let base_url = test_support::serve(fake_brevo.router()).await;
        let subject = BrevoEmailSender::new(
            reqwest::Client::new(),
            format!("{base_url}/v3/smtp/email"),
            FakeSecretRepository::open().await,
        );

        let result = subject.send(&arbitrary_email()).await;

        expect_that!(result, ok(anything()));
        let received = fake_brevo.received();
        expect_that!(received.len(), eq(1));
        expect_that!(received[0]["subject"], eq("Test subject"));
        expect_that!(received[0]["htmlContent"], eq("<p>Test message</p>"));
        expect_that!(received[0]["replyTo"]["email"], eq("visitor@example.com"));
        expect_that!(received[0]["to"][1]["email"], eq("second@example.com"));
        expect_that!(received[0]["sender"]["name"], eq("Website"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn returns_message_id_from_brevo() {
        let fake_brevo = FakeBrevo::new(FAKE_BREVO_API_KEY);
        let base_url = test_support::serve(fake_brevo.router()).await;
        let subject = BrevoEmailSender::new(
            reqwest::Client::new(),
            format!("{base_url}/v3/smtp/email"),
            FakeSecretRepository::open().await,
        );

        let result = subject.send(&arbitrary_email()).await.unwrap();

        expect_that!(result.message_id, eq("<1@fake-brevo.test>"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn reports_error_when_brevo_rejects_message() {
        let fake_brevo = FakeBrevo::new(FAKE_BREVO_API_KEY).fail_with_status(400);
        let base_url = test_support::serve(fake_brevo.router()).await;
        let subject = BrevoEmailSender::new(
            reqwest::Client::new(),
            format!("{base_url}/v3/smtp/email"),
            FakeSecretRepository::open().await,
        );

        let result = subject.send(&arbitrary_email()).await;

        expect_that!(
            result,
            err(displays_as(contains_substring("Sending failed")))
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn reports_error_when_brevo_credentials_are_missing() {
        let fake_brevo = FakeBrevo::new(FAKE_BREVO_API_KEY);
        let base_url = test_support::serve(fake_brevo.router()).await;
        let secrets_repository = FakeSecretRepository::open().await;
        secrets_repository.remove_secret(BREVO_CREDENTIALS_NAME);
        let subject = BrevoEmailSender::new(
            reqwest::Client::new(),
            format!("{base_url}/v3/smtp/email"),
            secrets_repository,
        );

        let result = subject.send(&arbitrary_email()).await;

        expect_that!(result, err(anything()));
        expect_that!(fake_brevo.received(), empty());
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn sends_message_over_smtp() {
        fake_smtp().start();
        fake_smtp().flush().await;
        let subject =
            SmtpEmailSender::new(FakeSmtpServer::url(), FakeSecretRepository::open().await);

        let result = subject.send(&arbitrary_email()).await;

        expect_that!(result, ok(anything()));
        expect_that!(
            timeout(Duration::from_secs(1), fake_smtp().last_mail_content()).await,
            ok(ok(all!(
                contains_substring("From: \"Website\" <website@example.com>"),
                contains_substring("Reply-To: visitor@example.com"),
                contains_substring("Subject: Test subject"),
                contains_substring("Test message")
            )))
        );
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn reports_error_when_smtp_server_rejects_message() {
        start_poisoned_smtp_server();
        let subject = SmtpEmailSender::new(
            format!("smtp://127.0.0.1:{POISONED_SMTP_PORT}"),
            FakeSecretRepository::open().await,
        );

        let result = subject.send(&arbitrary_email()).await;

        expect_that!(result, err(anything()));
    }

    fn fake_smtp() -> &'static FakeSmtpServer {
        static FAKE_SMTP: OnceLock<FakeSmtpServer> = OnceLock::new();
        FAKE_SMTP.get_or_init(FakeSmtpServer::new)
    }
}
