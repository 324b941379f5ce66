use crate::{
    blocklist::{BlockKind, BlocklistManager},
    captcha::CaptchaVerifier,
    config::Config,
    geolocation::{GeoLocator, IpInfo},
    mailer::{Contact, EmailSender, OutgoingEmail},
    submission_log::{SubmissionLog, SubmissionStatus, SubmissionSummary},
    templates::{render, Template},
};
use chrono::{SecondsFormat, Utc};
use lambda_http::{
    http::{header::HeaderMap, Method, StatusCode},
    Body, Request, RequestPayloadExt, Response,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

const UNKNOWN_IP: &str = "Unknown";
const DEFAULT_SERVICE: &str = "Website Inquiry";
const DEFAULT_SENDER_NAME: &str = "Website Visitor";
const CONFIRMATION_SUBJECT: &str = "YOUR VISION IS NOW IN OUR HANDS | THE QUOLLECTIVE";

const CLIENT_IP_HEADERS: [&str; 2] = ["x-nf-client-connection-ip", "client-ip"];

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    full_phone: Option<String>,
    organization: Option<String>,
    service: Option<String>,
    message: Option<String>,
    recaptcha_token: Option<String>,
    #[serde(rename = "bot-field")]
    honeypot: Option<String>,
    sender: Option<NestedName>,
    reply_to: Option<NestedEmail>,
}

#[derive(Deserialize, Debug)]
struct NestedName {
    name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct NestedEmail {
    email: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Submission {
    fn name(&self) -> Option<&str> {
        self.sender
            .as_ref()
            .and_then(|sender| non_empty(&sender.name))
            .or_else(|| non_empty(&self.name))
    }

    fn email(&self) -> Option<&str> {
        self.reply_to
            .as_ref()
            .and_then(|reply_to| non_empty(&reply_to.email))
            .or_else(|| non_empty(&self.email))
    }

    fn phone(&self) -> Option<&str> {
        non_empty(&self.full_phone).or_else(|| non_empty(&self.phone))
    }

    fn is_from_bot(&self) -> bool {
        non_empty(&self.honeypot).is_some()
    }

    fn summary(&self) -> SubmissionSummary {
        SubmissionSummary {
            email: self.email(),
            name: self.name(),
            service: non_empty(&self.service),
            message: non_empty(&self.message),
        }
    }
}

/// The first of the platform's client address headers which is present.
pub fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    CLIENT_IP_HEADERS
        .iter()
        .find_map(|name| header(name))
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .unwrap_or(UNKNOWN_IP)
        .to_string()
}

/// Addresses and links used in the outgoing messages.
pub struct MessageSettings {
    pub notification_from: Contact,
    pub notification_to: Vec<Contact>,
    pub confirmation_from: Contact,
    pub confirmation_reply_to: Contact,
    pub site_url: String,
    pub admin_url: String,
}

impl From<&Config> for MessageSettings {
    fn from(config: &Config) -> Self {
        Self {
            notification_from: config.notification_from.clone(),
            notification_to: config.notification_to.clone(),
            confirmation_from: config.confirmation_from.clone(),
            confirmation_reply_to: config.confirmation_reply_to.clone(),
            site_url: config.site_url.clone(),
            admin_url: config.admin_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Decides what happens to a contact form submission.
///
/// Bots caught by the honeypot and blocklisted senders receive the same response as a
/// successful submission but nothing is relayed. Senders failing the CAPTCHA or giving an
/// invalid address receive an explicit error.
pub struct SubmissionGate {
    blocklist: BlocklistManager,
    captcha: Arc<dyn CaptchaVerifier>,
    mailer: Arc<dyn EmailSender>,
    geolocator: Arc<dyn GeoLocator>,
    log: SubmissionLog,
    settings: MessageSettings,
}

#[derive(Debug, PartialEq, Eq)]
enum Accepted {
    Relayed {
        admin_email_id: String,
        user_email_id: String,
    },
    Dropped,
}

impl SubmissionGate {
    pub fn new(
        blocklist: BlocklistManager,
        captcha: Arc<dyn CaptchaVerifier>,
        mailer: Arc<dyn EmailSender>,
        geolocator: Arc<dyn GeoLocator>,
        log: SubmissionLog,
        settings: MessageSettings,
    ) -> Self {
        Self {
            blocklist,
            captcha,
            mailer,
            geolocator,
            log,
            settings,
        }
    }

    pub async fn handle(&self, event: Request) -> Response<Body> {
        match self.process_event(event).await {
            Ok(Accepted::Relayed {
                admin_email_id,
                user_email_id,
            }) => json_response(
                StatusCode::OK,
                json!({
                    "success": true,
                    "message": "Emails sent successfully",
                    "adminEmailId": admin_email_id,
                    "userEmailId": user_email_id,
                }),
            ),
            Ok(Accepted::Dropped) => json_response(
                StatusCode::OK,
                json!({"success": true, "message": "Email sent successfully"}),
            ),
            Err(error) => {
                error.log();
                error.into_response()
            }
        }
    }

    async fn process_event(&self, event: Request) -> Result<Accepted, SubmissionError> {
        if event.method() != Method::POST {
            return Err(SubmissionError::MethodNotAllowed);
        }
        let ip = client_ip(event.headers());
        info!("Submission from IP {ip}");
        let submission: Submission = event
            .payload()
            .map_err(|error| SubmissionError::ClientError(format!("Invalid request: {error}")))?
            .ok_or_else(|| SubmissionError::ClientError("Missing event payload".into()))?;
        self.process_submission(&ip, &submission).await
    }

    async fn process_submission(
        &self,
        ip: &str,
        submission: &Submission,
    ) -> Result<Accepted, SubmissionError> {
        if submission.is_from_bot() {
            info!("Honeypot field filled in submission from {ip}, dropping");
            return Ok(Accepted::Dropped);
        }

        if self.is_blocked(ip, submission.email()).await {
            info!("Blocked sender attempted submission from {ip}");
            self.log
                .record(ip, SubmissionStatus::Blocked, submission.summary())
                .await;
            return Ok(Accepted::Dropped);
        }

        self.verify_captcha(ip, submission).await?;

        let email = submission
            .email()
            .filter(|email| email.parse::<lettre::Address>().is_ok())
            .ok_or_else(|| SubmissionError::ClientError("Valid email address is required".into()))?;

        self.log
            .record(ip, SubmissionStatus::Success, submission.summary())
            .await;
        let ip_info = self.geolocator.lookup(ip).await;

        let notification = self.notification_email(ip, email, submission, &ip_info);
        let admin_email = self.mailer.send(&notification).await.map_err(|error| {
            SubmissionError::InternalError(format!("Error sending notification: {error:#}"))
        })?;
        let confirmation = self.confirmation_email(email, submission);
        let user_email = self.mailer.send(&confirmation).await.map_err(|error| {
            SubmissionError::InternalError(format!("Error sending confirmation: {error:#}"))
        })?;

        info!("Relayed submission from {ip}");
        Ok(Accepted::Relayed {
            admin_email_id: admin_email.message_id,
            user_email_id: user_email.message_id,
        })
    }

    async fn is_blocked(&self, ip: &str, email: Option<&str>) -> bool {
        let (ip_blocked, email_blocked) = tokio::join!(
            self.blocklist.is_blocked(BlockKind::Ip, ip),
            async {
                match email {
                    Some(email) => self.blocklist.is_blocked(BlockKind::Email, email).await,
                    None => false,
                }
            }
        );
        ip_blocked || email_blocked
    }

    async fn verify_captcha(
        &self,
        ip: &str,
        submission: &Submission,
    ) -> Result<(), SubmissionError> {
        let Some(token) = non_empty(&submission.recaptcha_token) else {
            return Err(SubmissionError::ClientError(
                "reCAPTCHA verification required".into(),
            ));
        };
        let verified = match self.captcha.verify(token, ip).await {
            Ok(verified) => verified,
            Err(error) => {
                warn!("Could not verify reCAPTCHA token from {ip}: {error:#}");
                false
            }
        };
        if verified {
            return Ok(());
        }
        self.log
            .record(ip, SubmissionStatus::RecaptchaFailed, submission.summary())
            .await;
        Err(SubmissionError::ClientError(
            "reCAPTCHA verification failed. Please try again.".into(),
        ))
    }

    fn notification_email(
        &self,
        ip: &str,
        email: &str,
        submission: &Submission,
        ip_info: &IpInfo,
    ) -> OutgoingEmail {
        let service = non_empty(&submission.service).unwrap_or(DEFAULT_SERVICE);
        let admin_url = self.settings.admin_url.as_str();
        let context = NotificationContext {
            name: submission.name().unwrap_or(DEFAULT_SENDER_NAME),
            email,
            phone: submission.phone(),
            organization: non_empty(&submission.organization),
            service,
            message: non_empty(&submission.message).unwrap_or_default(),
            ip,
            location: ip_info.location(),
            isp: ip_info.isp.as_deref(),
            is_proxy: ip_info.is_proxy,
            is_hosting: ip_info.is_hosting,
            received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            block_ip_url: format!("{admin_url}/block?ip={}", urlencoding::encode(ip)),
            block_email_url: format!("{admin_url}/block?email={}", urlencoding::encode(email)),
            dashboard_url: admin_url,
        };
        OutgoingEmail {
            sender: self.settings.notification_from.clone(),
            recipients: self.settings.notification_to.clone(),
            reply_to: Contact::new(email, submission.name().map(Into::into)),
            subject: format!("New Contact Form Submission: {service} [IP: {ip}]"),
            html_body: render(Template::AdminNotification, &context),
        }
    }

    fn confirmation_email(&self, email: &str, submission: &Submission) -> OutgoingEmail {
        let name = submission.name().unwrap_or(DEFAULT_SENDER_NAME);
        let context = ConfirmationContext {
            name,
            service: non_empty(&submission.service).unwrap_or(DEFAULT_SERVICE),
            message: non_empty(&submission.message).unwrap_or_default(),
            site_url: &self.settings.site_url,
        };
        OutgoingEmail {
            sender: self.settings.confirmation_from.clone(),
            recipients: vec![Contact::new(email, Some(name.into()))],
            reply_to: self.settings.confirmation_reply_to.clone(),
            subject: CONFIRMATION_SUBJECT.into(),
            html_body: render(Template::Confirmation, &context),
        }
    }
}

#[derive(Serialize)]
struct NotificationContext<'a> {
    name: &'a str,
    email: &'a str,
    phone: Option<&'a str>,
    organization: Option<&'a str>,
    service: &'a str,
    message: &'a str,
    ip: &'a str,
    location: Option<String>,
    isp: Option<&'a str>,
    is_proxy: bool,
    is_hosting: bool,
    received_at: String,
    block_ip_url: String,
    block_email_url: String,
    dashboard_url: &'a str,
}

#[derive(Serialize)]
struct ConfirmationContext<'a> {
    name: &'a str,
    service: &'a str,
    message: &'a str,
    site_url: &'a str,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body.to_string().into())
        .unwrap()
}

#[derive(Debug)]
pub enum SubmissionError {
    MethodNotAllowed,
    ClientError(String),
    /// The description goes to the log only. The submitter sees a generic message.
    InternalError(String),
}

impl SubmissionError {
    fn log(&self) {
        match self {
            SubmissionError::MethodNotAllowed => {
                warn!("Rejected submission with unsupported method")
            }
            SubmissionError::ClientError(description) => {
                warn!("Client error processing submission: {description}")
            }
            SubmissionError::InternalError(description) => {
                error!("Internal error processing submission: {description}")
            }
        }
    }

    fn into_response(self) -> Response<Body> {
        match self {
            SubmissionError::MethodNotAllowed => json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": "Method Not Allowed"}),
            ),
            SubmissionError::ClientError(description) => json_response(
                StatusCode::BAD_REQUEST,
                json!({"success": false, "message": description}),
            ),
            SubmissionError::InternalError(_) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"success": false, "message": "Failed to send email"}),
            ),
        }
    }
}

impl std::fmt::Display for SubmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionError::MethodNotAllowed => write!(f, "Method not allowed"),
            SubmissionError::ClientError(description) => write!(f, "Client error: {description}"),
            SubmissionError::InternalError(description) => {
                write!(f, "Internal error: {description}")
            }
        }
    }
}

impl std::error::Error for SubmissionError {}
