use crate::mailer::Contact;
use std::{fmt::Display, time::Duration};

const NETLIFY_API_URL: &str = "https://api.netlify.com/api/v1";
const NETLIFY_BLOBS_URL: &str = "https://api.netlify.com/api/v1/blobs";
const BUILD_HOOKS_URL: &str = "https://api.netlify.com/build_hooks";
const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";
const BREVO_API_URL: &str = "https://api.brevo.com/v3/smtp/email";
const IP_API_URL: &str = "http://ip-api.com/json";
const SMTP_URL: &str = "smtps://smtp-relay.brevo.com";
const SITE_URL: &str = "https://thequollective.africa";

const NOTIFICATION_FROM: &str = "Quollective Website <the.emuron@thequollective.africa>";
const NOTIFICATION_TO: &str = "The Quollective <the.emuron@thequollective.africa>,\
                               Lilian Kigunda <the.kigunda@thequollective.africa>";
const CONFIRMATION_FROM: &str = "THE QUOLLECTIVE <the.emuron@thequollective.africa>";
const CONFIRMATION_REPLY_TO: &str = "the.kigunda@thequollective.africa";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlocklistBackend {
    RemoteConfig,
    KeyValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmailTransport {
    Brevo,
    Smtp,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub blocklist_backend: BlocklistBackend,
    pub email_transport: EmailTransport,
    pub netlify_site_id: String,
    pub netlify_api_url: String,
    pub netlify_blobs_url: String,
    pub build_hook_id: Option<String>,
    /// Comma-joined lists as deployed. Only read by the remote-config blocklist backend.
    pub blocked_ips: String,
    pub blocked_emails: String,
    pub build_hooks_url: String,
    pub recaptcha_verify_url: String,
    pub brevo_api_url: String,
    pub ip_api_url: String,
    pub smtp_url: String,
    pub site_url: String,
    /// Absolute URL of the admin dashboard, used for links in notification emails.
    pub admin_url: String,
    pub http_timeout: Duration,
    pub notification_from: Contact,
    pub notification_to: Vec<Contact>,
    pub confirmation_from: Contact,
    pub confirmation_reply_to: Contact,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let get_or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.into());

        let blocklist_backend = match get("BLOCKLIST_BACKEND").as_deref() {
            None | Some("key-value") => BlocklistBackend::KeyValue,
            Some("remote-config") => BlocklistBackend::RemoteConfig,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "BLOCKLIST_BACKEND",
                    value: other.into(),
                })
            }
        };
        let email_transport = match get("EMAIL_TRANSPORT").as_deref() {
            None | Some("brevo") => EmailTransport::Brevo,
            Some("smtp") => EmailTransport::Smtp,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "EMAIL_TRANSPORT",
                    value: other.into(),
                })
            }
        };
        let http_timeout = match get("HTTP_TIMEOUT_SECS") {
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            Some(value) => Duration::from_secs(value.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "HTTP_TIMEOUT_SECS",
                    value: value.clone(),
                }
            })?),
        };
        let Some(netlify_site_id) = get("NETLIFY_SITE_ID") else {
            return Err(ConfigError::Missing("NETLIFY_SITE_ID"));
        };
        let site_url = get_or("SITE_URL", SITE_URL);
        let admin_url = get("ADMIN_URL")
            .unwrap_or_else(|| format!("{}/admin", site_url.trim_end_matches('/')));

        Ok(Self {
            blocklist_backend,
            email_transport,
            netlify_site_id,
            netlify_api_url: get_or("NETLIFY_API_URL", NETLIFY_API_URL),
            netlify_blobs_url: get_or("NETLIFY_BLOBS_URL", NETLIFY_BLOBS_URL),
            build_hook_id: get("BUILD_HOOK_ID"),
            blocked_ips: get("BLOCKED_IPS").unwrap_or_default(),
            blocked_emails: get("BLOCKED_EMAILS").unwrap_or_default(),
            build_hooks_url: get_or("BUILD_HOOKS_URL", BUILD_HOOKS_URL),
            recaptcha_verify_url: get_or("RECAPTCHA_VERIFY_URL", RECAPTCHA_VERIFY_URL),
            brevo_api_url: get_or("BREVO_API_URL", BREVO_API_URL),
            ip_api_url: get_or("IP_API_URL", IP_API_URL),
            smtp_url: get_or("SMTP_URL", SMTP_URL),
            site_url,
            admin_url,
            http_timeout,
            notification_from: parse_contact(
                "NOTIFICATION_FROM",
                &get_or("NOTIFICATION_FROM", NOTIFICATION_FROM),
            )?,
            notification_to: get_or("NOTIFICATION_TO", NOTIFICATION_TO)
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_contact("NOTIFICATION_TO", s))
                .collect::<Result<_, _>>()?,
            confirmation_from: parse_contact(
                "CONFIRMATION_FROM",
                &get_or("CONFIRMATION_FROM", CONFIRMATION_FROM),
            )?,
            confirmation_reply_to: parse_contact(
                "CONFIRMATION_REPLY_TO",
                &get_or("CONFIRMATION_REPLY_TO", CONFIRMATION_REPLY_TO),
            )?,
        })
    }

    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .timeout(self.http_timeout)
            .build()
            .map_err(|error| ConfigError::HttpClient(error.to_string()))
    }
}

fn parse_contact(key: &'static str, value: &str) -> Result<Contact, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.into(),
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    InvalidValue { key: &'static str, value: String },
    HttpClient(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "Missing environment variable {key}"),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value {value:?} for environment variable {key}")
            }
            ConfigError::HttpClient(description) => {
                write!(f, "Unable to build HTTP client: {description}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}


#[cfg(test)]
mod tests {
    use super::{BlocklistBackend, Config, ConfigError, EmailTransport};
    use googletest::prelude::*;
    use serial_test::serial;
    use std::{collections::HashMap, time::Duration};

    fn from_pairs(pairs: &[(&str, &str)]) -> std::result::Result<Config, ConfigError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn uses_defaults_when_only_site_id_is_set() -> Result<()> {
        let config = from_pairs(&[("NETLIFY_SITE_ID", "site")]).unwrap();

        verify_that!(config.blocklist_backend, eq(BlocklistBackend::KeyValue))?;
        verify_that!(config.email_transport, eq(EmailTransport::Brevo))?;
        verify_that!(config.http_timeout, eq(Duration::from_secs(10)))?;
        verify_that!(config.build_hook_id, none())?;
        verify_that!(config.notification_to.len(), eq(2))
    }

    #[test]
    fn selects_remote_config_backend() -> Result<()> {
        let config = from_pairs(&[
            ("NETLIFY_SITE_ID", "site"),
            ("BLOCKLIST_BACKEND", "remote-config"),
            ("EMAIL_TRANSPORT", "smtp"),
        ])
        .unwrap();

        verify_that!(config.blocklist_backend, eq(BlocklistBackend::RemoteConfig))?;
        verify_that!(config.email_transport, eq(EmailTransport::Smtp))
    }

    #[test]
    fn rejects_unknown_backend() -> Result<()> {
        let result = from_pairs(&[("NETLIFY_SITE_ID", "site"), ("BLOCKLIST_BACKEND", "redis")]);

        verify_that!(
            result,
            err(displays_as(contains_substring("BLOCKLIST_BACKEND")))
        )
    }

    #[test]
    fn requires_site_id() -> Result<()> {
        let result = from_pairs(&[]);

        verify_that!(
            result,
            err(displays_as(eq("Missing environment variable NETLIFY_SITE_ID")))
        )
    }

    #[test]
    fn derives_admin_url_from_site_url() -> Result<()> {
        let config = from_pairs(&[
            ("NETLIFY_SITE_ID", "site"),
            ("SITE_URL", "https://example.com/"),
        ])
        .unwrap();

        verify_that!(config.admin_url, eq("https://example.com/admin"))
    }

    #[test]
    fn treats_empty_build_hook_as_unset() -> Result<()> {
        let config = from_pairs(&[("NETLIFY_SITE_ID", "site"), ("BUILD_HOOK_ID", " ")]).unwrap();

        verify_that!(config.build_hook_id, none())
    }

    #[googletest::test]
    fn reads_deployed_blocklists() {
        let config = from_pairs(&[
            ("NETLIFY_SITE_ID", "site"),
            ("BLOCKED_IPS", "192.0.2.1,192.0.2.2"),
        ])
        .unwrap();

        expect_that!(config.blocked_ips, eq("192.0.2.1,192.0.2.2"));
        expect_that!(config.blocked_emails, eq(""));
    }

    #[test]
    #[serial]
    fn reads_process_environment() -> Result<()> {
        std::env::set_var("NETLIFY_SITE_ID", "site-from-environment");
        let config = Config::from_env();
        std::env::remove_var("NETLIFY_SITE_ID");

        verify_that!(
            config.map(|config| config.netlify_site_id),
            ok(eq("site-from-environment"))
        )
    }
}
