use super::{BlockKind, BlocklistStore, Propagation};
use crate::remote_config::RemoteConfigApi;
use anyhow::Context;
use async_trait::async_trait;
use std::{collections::BTreeSet, sync::Arc};

const BLOCKED_IPS_VARIABLE: &str = "BLOCKED_IPS";
const BLOCKED_EMAILS_VARIABLE: &str = "BLOCKED_EMAILS";

/// Each set is one comma-joined site variable.
///
/// Membership checks use the values this function was deployed with, while the dashboard and
/// mutations go through the remote API. Every mutation rewrites the whole variable, so two
/// concurrent mutations of the same set race and the last write wins. New values reach running
/// functions only after a redeploy.
pub struct RemoteConfigBlocklistStore {
    api: Arc<dyn RemoteConfigApi>,
    site_id: String,
    deployed_ips: BTreeSet<String>,
    deployed_emails: BTreeSet<String>,
}

impl RemoteConfigBlocklistStore {
    pub fn new(api: Arc<dyn RemoteConfigApi>, site_id: impl Into<String>) -> Self {
        Self {
            api,
            site_id: site_id.into(),
            deployed_ips: BTreeSet::new(),
            deployed_emails: BTreeSet::new(),
        }
    }

    /// Sets the joined lists the running deployment sees in its own environment.
    pub fn with_deployed(self, blocked_ips: &str, blocked_emails: &str) -> Self {
        Self {
            deployed_ips: parse_joined(BlockKind::Ip, blocked_ips),
            deployed_emails: parse_joined(BlockKind::Email, blocked_emails),
            ..self
        }
    }

    fn variable(kind: BlockKind) -> &'static str {
        match kind {
            BlockKind::Ip => BLOCKED_IPS_VARIABLE,
            BlockKind::Email => BLOCKED_EMAILS_VARIABLE,
        }
    }

    async fn read(&self, kind: BlockKind) -> anyhow::Result<BTreeSet<String>> {
        let variables = self
            .api
            .get(&self.site_id)
            .await
            .context("Error fetching site variables")?;
        let raw = variables
            .iter()
            .find(|variable| variable.key == Self::variable(kind))
            .and_then(|variable| variable.first_value())
            .unwrap_or_default();
        Ok(parse_joined(kind, raw))
    }

    async fn write(&self, kind: BlockKind, entries: &BTreeSet<String>) -> anyhow::Result<()> {
        let joined = entries.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        self.api
            .patch(&self.site_id, Self::variable(kind), &joined)
            .await
            .with_context(|| format!("Error updating {}", Self::variable(kind)))
    }
}

fn parse_joined(kind: BlockKind, raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match kind {
            BlockKind::Ip => entry.to_string(),
            BlockKind::Email => entry.to_lowercase(),
        })
        .collect()
}

#[async_trait]
impl BlocklistStore for RemoteConfigBlocklistStore {
    async fn load(&self, kind: BlockKind) -> anyhow::Result<BTreeSet<String>> {
        self.read(kind).await
    }

    async fn contains(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool> {
        let deployed = match kind {
            BlockKind::Ip => &self.deployed_ips,
            BlockKind::Email => &self.deployed_emails,
        };
        Ok(deployed.contains(entry))
    }

    async fn insert(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool> {
        let mut entries = self.read(kind).await?;
        if !entries.insert(entry.to_string()) {
            return Ok(false);
        }
        self.write(kind, &entries).await?;
        Ok(true)
    }

    async fn remove(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool> {
        let mut entries = self.read(kind).await?;
        if !entries.remove(entry) {
            return Ok(false);
        }
        self.write(kind, &entries).await?;
        Ok(true)
    }

    fn propagation(&self) -> Propagation {
        Propagation::OnRedeploy
    }
}
