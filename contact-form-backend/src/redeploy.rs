//! Site redeployment after a blocklist change.
//!
//! Triggering is a side effect the admin pages report on but never depend on: every failure is
//! logged and folded into [`RedeployOutcome::Failed`].

use async_trait::async_trait;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedeployOutcome {
    Triggered,
    NotConfigured,
    Failed,
}

#[async_trait]
pub trait RedeployTrigger: Send + Sync {
    async fn trigger(&self) -> RedeployOutcome;
}

/// POSTs to a Netlify build hook.
pub struct BuildHookTrigger {
    client: reqwest::Client,
    hook_url: Option<String>,
}

impl BuildHookTrigger {
    pub fn new(client: reqwest::Client, build_hooks_url: &str, hook_id: Option<&str>) -> Self {
        Self {
            client,
            hook_url: hook_id.map(|id| {
                format!(
                    "{}/{}",
                    build_hooks_url.trim_end_matches('/'),
                    urlencoding::encode(id)
                )
            }),
        }
    }
}

#[async_trait]
impl RedeployTrigger for BuildHookTrigger {
    async fn trigger(&self) -> RedeployOutcome {
        let Some(hook_url) = &self.hook_url else {
            return RedeployOutcome::NotConfigured;
        };
        match self
            .client
            .post(hook_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
        {
            Ok(_) => {
                info!("Site redeployment triggered");
                RedeployOutcome::Triggered
            }
            Err(error) => {
                warn!("Error triggering build: {error}");
                RedeployOutcome::Failed
            }
        }
    }
}
