use crate::{
    blocklist::{BlockKind, BlocklistError, BlocklistManager, Propagation},
    redeploy::{RedeployOutcome, RedeployTrigger},
    secrets::{SecretRepository, ADMIN_CREDENTIALS_NAME},
    submission_log::{LogRecord, LogStats, SubmissionLog},
    templates::{render, Template},
};
use async_once_cell::OnceCell;
use lambda_http::{
    http::{Method, StatusCode},
    Body, Request, RequestExt, Response,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, future::Future, sync::Arc};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminRoute {
    Dashboard,
    Block,
    Unblock,
    Logs,
}

impl AdminRoute {
    fn path_suffix(self) -> &'static str {
        match self {
            AdminRoute::Dashboard => "",
            AdminRoute::Block => "/block",
            AdminRoute::Unblock => "/unblock",
            AdminRoute::Logs => "/logs",
        }
    }
}

#[derive(Deserialize)]
struct AdminCredentials {
    #[serde(rename = "ADMIN_PASSWORD")]
    password: String,
}

/// Query parameters shared by all admin pages.
struct AdminQuery {
    password: Option<String>,
    ip: Option<String>,
    email: Option<String>,
}

impl AdminQuery {
    fn from_event(event: &Request) -> Self {
        let parameters = event.query_string_parameters();
        let get = |key: &str| {
            parameters
                .first(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(String::from)
        };
        Self {
            password: get("password"),
            ip: get("ip"),
            email: get("email"),
        }
    }
}

/// The password-gated blocklist administration pages.
pub struct AdminConsole<SecretRepositoryT: SecretRepository> {
    secrets_repository: SecretRepositoryT,
    credentials: OnceCell<AdminCredentials>,
    blocklist: BlocklistManager,
    log: SubmissionLog,
    redeploy: Arc<dyn RedeployTrigger>,
    admin_url: String,
}

impl<SecretRepositoryT: SecretRepository> AdminConsole<SecretRepositoryT> {
    pub fn new(
        secrets_repository: SecretRepositoryT,
        blocklist: BlocklistManager,
        log: SubmissionLog,
        redeploy: Arc<dyn RedeployTrigger>,
        admin_url: &str,
    ) -> Self {
        Self {
            secrets_repository,
            credentials: Default::default(),
            blocklist,
            log,
            redeploy,
            admin_url: admin_url.trim_end_matches('/').into(),
        }
    }

    pub async fn handle(&self, route: AdminRoute, event: Request) -> Response<Body> {
        match self.process(route, &event).await {
            Ok(page) => html_response(StatusCode::OK, page),
            Err(error) => {
                error.log();
                error.into_response()
            }
        }
    }

    async fn process(&self, route: AdminRoute, event: &Request) -> Result<String, AdminError> {
        if event.method() != Method::GET {
            return Err(AdminError::MethodNotAllowed);
        }
        let query = AdminQuery::from_event(event);
        self.authorize(route, &query).await?;
        let password = query.password.as_deref().unwrap_or_default();
        match route {
            AdminRoute::Dashboard => self.dashboard(password).await,
            AdminRoute::Block => self.block(password, &query).await,
            AdminRoute::Unblock => self.unblock(password, &query).await,
            AdminRoute::Logs => self.logs(password).await,
        }
    }

    async fn authorize(&self, route: AdminRoute, query: &AdminQuery) -> Result<(), AdminError> {
        let credentials = self
            .credentials
            .get_or_try_init(self.secrets_repository.get_secret(ADMIN_CREDENTIALS_NAME))
            .await
            .map_err(|error| {
                AdminError::Upstream(format!(
                    "Could not retrieve {ADMIN_CREDENTIALS_NAME}: {error}"
                ))
            })?;
        if query.password.as_deref() == Some(credentials.password.as_str()) {
            return Ok(());
        }
        Err(AdminError::Unauthorized {
            action: format!("{}{}", self.admin_url, route.path_suffix()),
            ip: query.ip.clone(),
            email: query.email.clone(),
            failed: query.password.is_some(),
        })
    }

    async fn dashboard(&self, password: &str) -> Result<String, AdminError> {
        let blocklist = self.blocklist.snapshot().await.map_err(AdminError::from)?;
        let entries = |kind: BlockKind, values: &BTreeSet<String>| {
            values
                .iter()
                .map(|value| DashboardEntry {
                    value: value.clone(),
                    unblock_url: self.url("/unblock", password, Some((kind, value))),
                })
                .collect::<Vec<_>>()
        };
        let context = DashboardContext {
            password,
            block_action: format!("{}/block", self.admin_url),
            logs_url: self.url("/logs", password, None),
            redeploy_note: (self.blocklist.propagation() == Propagation::OnRedeploy)
                .then_some("Changes take effect once the site has been redeployed."),
            ip_count: blocklist.blocked_ips.len(),
            email_count: blocklist.blocked_emails.len(),
            blocked_ips: entries(BlockKind::Ip, &blocklist.blocked_ips),
            blocked_emails: entries(BlockKind::Email, &blocklist.blocked_emails),
        };
        Ok(render(Template::Dashboard, &context))
    }

    async fn block(&self, password: &str, query: &AdminQuery) -> Result<String, AdminError> {
        let (ip, email) = require_entries(query)?;
        let (ip_outcome, email_outcome) = tokio::join!(
            apply(ip.as_deref(), |ip| self.blocklist.add(BlockKind::Ip, ip)),
            apply(email.as_deref(), |email| self.blocklist.add(BlockKind::Email, email))
        );
        let mut changes = Changes::default();
        for (kind, entry, outcome) in [
            (BlockKind::Ip, ip, ip_outcome),
            (BlockKind::Email, email, email_outcome),
        ] {
            let (Some(entry), Some(outcome)) = (entry, outcome) else {
                continue;
            };
            match outcome {
                Ok(outcome) if outcome.already_present => {
                    changes.push_unchanged(format!("{kind} {entry} already blocked"))
                }
                Ok(_) => changes.push_changed(format!("{kind} {entry} added to blocklist")),
                Err(error) => {
                    changes.push_failure(format!("Could not block {kind} {entry}: {error}"))
                }
            }
        }
        let titles = ResultTitles {
            unchanged: "Already Blocked",
            immediate: "Blocked Successfully",
            pending: "Blocking in Progress",
            partial: "Partially Blocked",
        };
        self.result_page(password, titles, changes).await
    }

    async fn unblock(&self, password: &str, query: &AdminQuery) -> Result<String, AdminError> {
        let (ip, email) = require_entries(query)?;
        let (ip_outcome, email_outcome) = tokio::join!(
            apply(ip.as_deref(), |ip| self.blocklist.remove(BlockKind::Ip, ip)),
            apply(email.as_deref(), |email| self.blocklist.remove(BlockKind::Email, email))
        );
        let mut changes = Changes::default();
        for (kind, entry, outcome) in [
            (BlockKind::Ip, ip, ip_outcome),
            (BlockKind::Email, email, email_outcome),
        ] {
            let (Some(entry), Some(outcome)) = (entry, outcome) else {
                continue;
            };
            match outcome {
                Ok(outcome) if outcome.was_present => {
                    changes.push_changed(format!("{kind} {entry} removed from blocklist"))
                }
                Ok(_) => changes.push_unchanged(format!("{kind} {entry} was not in blocklist")),
                Err(error) => {
                    changes.push_failure(format!("Could not unblock {kind} {entry}: {error}"))
                }
            }
        }
        let titles = ResultTitles {
            unchanged: "Not Found",
            immediate: "Unblocked Successfully",
            pending: "Unblocking in Progress",
            partial: "Partially Unblocked",
        };
        self.result_page(password, titles, changes).await
    }

    /// Fails only when no entry changed. Once one has, the redeploy still has to go out.
    async fn result_page(
        &self,
        password: &str,
        titles: ResultTitles,
        changes: Changes,
    ) -> Result<String, AdminError> {
        let Changes {
            mut lines,
            changed,
            failures,
        } = changes;
        if !changed && !failures.is_empty() {
            return Err(AdminError::Upstream(failures.join("; ")));
        }
        let redeploy = if changed && self.blocklist.propagation() == Propagation::OnRedeploy {
            Some(match self.redeploy.trigger().await {
                RedeployOutcome::Triggered => {
                    "Site redeployment triggered. The change takes effect once it finishes."
                }
                RedeployOutcome::NotConfigured => {
                    "No build hook is configured. The change takes effect on the next deploy."
                }
                RedeployOutcome::Failed => {
                    "Could not trigger a redeploy. The change takes effect on the next deploy."
                }
            })
        } else {
            None
        };
        let title = if !changed {
            titles.unchanged
        } else if !failures.is_empty() {
            titles.partial
        } else if redeploy.is_some() {
            titles.pending
        } else {
            titles.immediate
        };
        for failure in &failures {
            error!("{failure}");
        }
        lines.extend(failures);
        info!("{title}: {}", lines.join("; "));
        Ok(render(
            Template::BlockResult,
            &ResultContext {
                title,
                lines,
                redeploy,
                dashboard_url: self.url("", password, None),
            },
        ))
    }

    async fn logs(&self, password: &str) -> Result<String, AdminError> {
        let (records, blocklist) = tokio::join!(self.log.recent(), self.blocklist.snapshot());
        let records = records.map_err(|error| AdminError::Upstream(format!("{error:#}")))?;
        let blocklist = blocklist.map_err(AdminError::from)?;
        let stats = LogStats::from_records(&records);
        let rows = records
            .iter()
            .map(|record| LogRow {
                block_url: (!blocklist.blocked_ips.contains(&record.ip)
                    && BlockKind::Ip.normalize(&record.ip).is_some())
                .then(|| self.url("/block", password, Some((BlockKind::Ip, &record.ip)))),
                record,
            })
            .collect();
        Ok(render(
            Template::Logs,
            &LogsContext {
                dashboard_url: self.url("", password, None),
                stats,
                blocked_ips: blocklist.blocked_ips.iter().map(String::as_str).collect(),
                records: rows,
            },
        ))
    }

    fn url(&self, suffix: &str, password: &str, entry: Option<(BlockKind, &str)>) -> String {
        let mut url = format!(
            "{}{suffix}?password={}",
            self.admin_url,
            urlencoding::encode(password)
        );
        if let Some((kind, value)) = entry {
            let key = match kind {
                BlockKind::Ip => "ip",
                BlockKind::Email => "email",
            };
            url.push_str(&format!("&{key}={}", urlencoding::encode(value)));
        }
        url
    }
}

/// Both entries are normalized before anything is written, so a malformed one rejects the whole
/// request.
fn require_entries(query: &AdminQuery) -> Result<(Option<String>, Option<String>), AdminError> {
    if query.ip.is_none() && query.email.is_none() {
        return Err(AdminError::Validation(
            "Either IP or Email is required".into(),
        ));
    }
    let normalize = |kind: BlockKind, value: Option<&str>| {
        value
            .map(|value| {
                kind.normalize(value).ok_or_else(|| {
                    AdminError::from(BlocklistError::InvalidEntry {
                        kind,
                        value: value.into(),
                    })
                })
            })
            .transpose()
    };
    Ok((
        normalize(BlockKind::Ip, query.ip.as_deref())?,
        normalize(BlockKind::Email, query.email.as_deref())?,
    ))
}

async fn apply<'a, T, F, Fut>(value: Option<&'a str>, operation: F) -> Option<Fut::Output>
where
    F: FnOnce(&'a str) -> Fut,
    Fut: Future<Output = Result<T, BlocklistError>>,
{
    match value {
        Some(value) => Some(operation(value).await),
        None => None,
    }
}

#[derive(Default)]
struct Changes {
    lines: Vec<String>,
    changed: bool,
    failures: Vec<String>,
}

impl Changes {
    fn push_changed(&mut self, line: String) {
        self.lines.push(line);
        self.changed = true;
    }

    fn push_unchanged(&mut self, line: String) {
        self.lines.push(line);
    }

    fn push_failure(&mut self, line: String) {
        self.failures.push(line);
    }
}

struct ResultTitles {
    unchanged: &'static str,
    immediate: &'static str,
    pending: &'static str,
    partial: &'static str,
}

#[derive(Serialize)]
struct DashboardEntry {
    value: String,
    unblock_url: String,
}

#[derive(Serialize)]
struct DashboardContext<'a> {
    password: &'a str,
    block_action: String,
    logs_url: String,
    redeploy_note: Option<&'static str>,
    ip_count: usize,
    email_count: usize,
    blocked_ips: Vec<DashboardEntry>,
    blocked_emails: Vec<DashboardEntry>,
}

#[derive(Serialize)]
struct ResultContext {
    title: &'static str,
    lines: Vec<String>,
    redeploy: Option<&'static str>,
    dashboard_url: String,
}

#[derive(Serialize)]
struct LogRow<'a> {
    #[serde(flatten)]
    record: &'a LogRecord,
    block_url: Option<String>,
}

#[derive(Serialize)]
struct LogsContext<'a> {
    dashboard_url: String,
    stats: LogStats,
    blocked_ips: Vec<&'a str>,
    records: Vec<LogRow<'a>>,
}

#[derive(Serialize)]
struct LoginContext<'a> {
    action: &'a str,
    ip: Option<&'a str>,
    email: Option<&'a str>,
    failed: bool,
}

#[derive(Serialize)]
struct ErrorContext<'a> {
    title: &'a str,
    detail: &'a str,
}

fn html_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(body.into())
        .unwrap()
}

#[derive(Debug)]
pub enum AdminError {
    MethodNotAllowed,
    Unauthorized {
        action: String,
        ip: Option<String>,
        email: Option<String>,
        failed: bool,
    },
    Validation(String),
    /// An external service failed. The detail is shown to the operator.
    Upstream(String),
}

impl From<BlocklistError> for AdminError {
    fn from(error: BlocklistError) -> Self {
        match error {
            BlocklistError::InvalidEntry { .. } => AdminError::Validation(error.to_string()),
            BlocklistError::Store(_) => AdminError::Upstream(error.to_string()),
        }
    }
}

impl AdminError {
    fn log(&self) {
        match self {
            AdminError::MethodNotAllowed => warn!("Rejected admin request with unsupported method"),
            AdminError::Unauthorized { failed, .. } => {
                if *failed {
                    warn!("Rejected admin request with incorrect password");
                }
            }
            AdminError::Validation(description) => {
                warn!("Invalid admin request: {description}")
            }
            AdminError::Upstream(description) => error!("Admin request failed: {description}"),
        }
    }

    fn into_response(self) -> Response<Body> {
        match self {
            AdminError::MethodNotAllowed => Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body("Method Not Allowed".into())
                .unwrap(),
            AdminError::Unauthorized {
                action,
                ip,
                email,
                failed,
            } => html_response(
                StatusCode::UNAUTHORIZED,
                render(
                    Template::Login,
                    &LoginContext {
                        action: &action,
                        ip: ip.as_deref(),
                        email: email.as_deref(),
                        failed,
                    },
                ),
            ),
            AdminError::Validation(description) => html_response(
                StatusCode::BAD_REQUEST,
                render(
                    Template::AdminError,
                    &ErrorContext {
                        title: "Error",
                        detail: &description,
                    },
                ),
            ),
            AdminError::Upstream(description) => html_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                render(
                    Template::AdminError,
                    &ErrorContext {
                        title: "Something went wrong",
                        detail: &description,
                    },
                ),
            ),
        }
    }
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminError::MethodNotAllowed => write!(f, "Method not allowed"),
            AdminError::Unauthorized { .. } => write!(f, "Unauthorized"),
            AdminError::Validation(description) => write!(f, "Invalid request: {description}"),
            AdminError::Upstream(description) => write!(f, "Upstream error: {description}"),
        }
    }
}

impl std::error::Error for AdminError {}
