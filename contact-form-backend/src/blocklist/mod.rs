//! The set of IP addresses and email addresses whose submissions are silently dropped.
//!
//! Entries are normalized before every lookup and mutation: surrounding whitespace is trimmed and
//! email addresses are lowercased, so that email blocking is case-insensitive. IP addresses are
//! compared exactly as written.
//!
//! Persistence is behind [`BlocklistStore`]. Lookups fail open: if the store cannot be read,
//! the submission is treated as not blocked. Mutations report store failures to the caller.

mod key_value_store;
mod remote_config_store;

pub use key_value_store::KeyValueBlocklistStore;
pub use remote_config_store::RemoteConfigBlocklistStore;

use async_trait::async_trait;
use std::{collections::BTreeSet, fmt::Display, net::IpAddr, sync::Arc};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Ip,
    Email,
}

impl BlockKind {
    pub fn label(self) -> &'static str {
        match self {
            BlockKind::Ip => "IP",
            BlockKind::Email => "Email",
        }
    }

    /// Returns the canonical form of `value`, or `None` if it cannot be a blocklist entry.
    ///
    /// Commas are rejected since some stores persist a set as a comma-joined string.
    pub fn normalize(self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.contains(',') {
            return None;
        }
        match self {
            BlockKind::Ip => trimmed.parse::<IpAddr>().ok().map(|_| trimmed.to_string()),
            BlockKind::Email => {
                let (local, domain) = trimmed.split_once('@')?;
                if local.is_empty() || domain.is_empty() || trimmed.contains(char::is_whitespace)
                {
                    return None;
                }
                Some(trimmed.to_lowercase())
            }
        }
    }
}

impl Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// When a mutation becomes visible to submissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
    Immediate,
    /// Running functions keep the old value until the site is redeployed.
    OnRedeploy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blocklist {
    pub blocked_ips: BTreeSet<String>,
    pub blocked_emails: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    pub entry: String,
    pub already_present: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub entry: String,
    pub was_present: bool,
}

/// Persistence for normalized entries. Implementations receive only values which have passed
/// [`BlockKind::normalize`].
#[async_trait]
pub trait BlocklistStore: Send + Sync {
    async fn load(&self, kind: BlockKind) -> anyhow::Result<BTreeSet<String>>;

    async fn contains(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool>;

    /// Returns `true` if the entry was not present before.
    async fn insert(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool>;

    /// Returns `true` if the entry was present before.
    async fn remove(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool>;

    fn propagation(&self) -> Propagation;
}

#[derive(Clone)]
pub struct BlocklistManager {
    store: Arc<dyn BlocklistStore>,
}

impl BlocklistManager {
    pub fn new(store: Arc<dyn BlocklistStore>) -> Self {
        Self { store }
    }

    pub fn propagation(&self) -> Propagation {
        self.store.propagation()
    }

    pub async fn is_blocked(&self, kind: BlockKind, value: &str) -> bool {
        let Some(entry) = kind.normalize(value) else {
            return false;
        };
        match self.store.contains(kind, &entry).await {
            Ok(blocked) => blocked,
            Err(error) => {
                warn!("Could not check blocklist for {kind} {entry}, allowing: {error:#}");
                false
            }
        }
    }

    pub async fn add(&self, kind: BlockKind, value: &str) -> Result<AddOutcome, BlocklistError> {
        let entry = Self::normalize(kind, value)?;
        let inserted = self
            .store
            .insert(kind, &entry)
            .await
            .map_err(BlocklistError::Store)?;
        if inserted {
            info!("Added {kind} {entry} to blocklist");
        }
        Ok(AddOutcome {
            entry,
            already_present: !inserted,
        })
    }

    pub async fn remove(
        &self,
        kind: BlockKind,
        value: &str,
    ) -> Result<RemoveOutcome, BlocklistError> {
        let entry = Self::normalize(kind, value)?;
        let was_present = self
            .store
            .remove(kind, &entry)
            .await
            .map_err(BlocklistError::Store)?;
        if was_present {
            info!("Removed {kind} {entry} from blocklist");
        }
        Ok(RemoveOutcome { entry, was_present })
    }

    pub async fn snapshot(&self) -> Result<Blocklist, BlocklistError> {
        let (blocked_ips, blocked_emails) = tokio::try_join!(
            self.store.load(BlockKind::Ip),
            self.store.load(BlockKind::Email)
        )
        .map_err(BlocklistError::Store)?;
        Ok(Blocklist {
            blocked_ips,
            blocked_emails,
        })
    }

    fn normalize(kind: BlockKind, value: &str) -> Result<String, BlocklistError> {
        kind.normalize(value)
            .ok_or_else(|| BlocklistError::InvalidEntry {
                kind,
                value: value.into(),
            })
    }
}

#[derive(Debug)]
pub enum BlocklistError {
    InvalidEntry { kind: BlockKind, value: String },
    Store(anyhow::Error),
}

impl Display for BlocklistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlocklistError::InvalidEntry { kind, value } => {
                write!(f, "Invalid {kind} entry: {value:?}")
            }
            BlocklistError::Store(error) => write!(f, "Blocklist store error: {error:#}"),
        }
    }
}

impl std::error::Error for BlocklistError {}

#[cfg(test)]
pub mod test_support {
    use super::{BlockKind, BlocklistManager, KeyValueBlocklistStore};
    use crate::key_value::test_support::InMemoryKeyValueStore;
    use std::sync::Arc;

    /// A manager over an in-memory key-value store, which is also returned so that tests can
    /// inspect or break it.
    pub async fn blocklist_with(
        ips: &[&str],
        emails: &[&str],
    ) -> (BlocklistManager, Arc<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::default());
        let manager = BlocklistManager::new(Arc::new(KeyValueBlocklistStore::new(store.clone())));
        for ip in ips {
            manager.add(BlockKind::Ip, ip).await.unwrap();
        }
        for email in emails {
            manager.add(BlockKind::Email, email).await.unwrap();
        }
        (manager, store)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        test_support::blocklist_with, AddOutcome, BlockKind, BlocklistManager,
        RemoteConfigBlocklistStore, RemoveOutcome,
    };
    use crate::remote_config::test_support::InMemoryRemoteConfig;
    use googletest::prelude::*;
    use std::sync::Arc;

    fn remote_config_manager() -> (BlocklistManager, Arc<InMemoryRemoteConfig>) {
        let api = Arc::new(InMemoryRemoteConfig::default());
        let manager = BlocklistManager::new(Arc::new(RemoteConfigBlocklistStore::new(
            api.clone(),
            "arbitrary-site",
        )));
        (manager, api)
    }

    #[test]
    fn lowercases_and_trims_email() -> Result<()> {
        verify_that!(
            BlockKind::Email.normalize("  Spam@Example.COM "),
            some(eq("spam@example.com"))
        )
    }

    #[test]
    fn keeps_ip_as_written() -> Result<()> {
        verify_that!(
            BlockKind::Ip.normalize(" 2001:DB8::1 "),
            some(eq("2001:DB8::1"))
        )
    }

    #[googletest::test]
    fn rejects_malformed_entries() {
        expect_that!(BlockKind::Ip.normalize(""), none());
        expect_that!(BlockKind::Ip.normalize("not an ip"), none());
        expect_that!(BlockKind::Ip.normalize("192.0.2.1,192.0.2.2"), none());
        expect_that!(BlockKind::Email.normalize("no-at-sign"), none());
        expect_that!(BlockKind::Email.normalize("@example.com"), none());
        expect_that!(BlockKind::Email.normalize("a,b@example.com"), none());
    }

    #[googletest::test]
    #[tokio::test]
    async fn blocks_ip_after_add_and_unblocks_after_remove() {
        let (subject, _) = blocklist_with(&[], &[]).await;

        subject.add(BlockKind::Ip, "192.0.2.1").await.unwrap();
        expect_that!(subject.is_blocked(BlockKind::Ip, "192.0.2.1").await, eq(true));

        subject.remove(BlockKind::Ip, "192.0.2.1").await.unwrap();
        expect_that!(subject.is_blocked(BlockKind::Ip, "192.0.2.1").await, eq(false));
    }

    #[googletest::test]
    #[tokio::test]
    async fn blocks_email_regardless_of_case() {
        let (subject, _) = blocklist_with(&[], &["Spam@Example.com"]).await;

        expect_that!(
            subject.is_blocked(BlockKind::Email, "spam@example.com").await,
            eq(true)
        );
        expect_that!(
            subject.is_blocked(BlockKind::Email, "SPAM@EXAMPLE.COM").await,
            eq(true)
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn reports_already_present_on_second_add() {
        let (subject, _) = blocklist_with(&[], &[]).await;

        let first = subject.add(BlockKind::Email, "spam@example.com").await;
        let second = subject.add(BlockKind::Email, "SPAM@example.com").await;

        expect_that!(
            first,
            ok(field!(AddOutcome.already_present, eq(false)))
        );
        expect_that!(
            second,
            ok(field!(AddOutcome.already_present, eq(true)))
        );
        expect_that!(
            subject.snapshot().await.unwrap().blocked_emails.len(),
            eq(1)
        );
    }

    #[tokio::test]
    async fn reports_missing_entry_on_remove() -> Result<()> {
        let (subject, _) = blocklist_with(&[], &[]).await;

        let result = subject.remove(BlockKind::Ip, "192.0.2.1").await;

        verify_that!(
            result,
            ok(field!(RemoveOutcome.was_present, eq(false)))
        )
    }

    #[tokio::test]
    async fn rejects_invalid_entry_on_add() -> Result<()> {
        let (subject, _) = blocklist_with(&[], &[]).await;

        let result = subject.add(BlockKind::Ip, "not an ip").await;

        verify_that!(
            result,
            err(displays_as(eq("Invalid IP entry: \"not an ip\"")))
        )
    }

    #[tokio::test]
    async fn does_not_block_unparseable_value() -> Result<()> {
        let (subject, _) = blocklist_with(&["192.0.2.1"], &[]).await;

        verify_that!(subject.is_blocked(BlockKind::Ip, "Unknown").await, eq(false))
    }

    #[tokio::test]
    async fn fails_open_when_store_is_unavailable() -> Result<()> {
        let (subject, store) = blocklist_with(&["192.0.2.1"], &[]).await;
        store.set_unavailable(true);

        verify_that!(subject.is_blocked(BlockKind::Ip, "192.0.2.1").await, eq(false))
    }

    #[googletest::test]
    #[tokio::test]
    async fn reports_store_failure_on_mutation() {
        let (subject, store) = blocklist_with(&[], &[]).await;
        store.set_unavailable(true);

        expect_that!(
            subject.add(BlockKind::Ip, "192.0.2.1").await,
            err(displays_as(starts_with("Blocklist store error")))
        );
        expect_that!(
            subject.remove(BlockKind::Ip, "192.0.2.1").await,
            err(displays_as(starts_with("Blocklist store error")))
        );
        expect_that!(subject.snapshot().await, err(anything()));
    }

    #[googletest::test]
    #[tokio::test]
    async fn snapshot_contains_both_sets() {
        let (subject, _) =
            blocklist_with(&["192.0.2.2", "192.0.2.1"], &["spam@example.com"]).await;

        let snapshot = subject.snapshot().await.unwrap();

        expect_that!(
            snapshot.blocked_ips,
            elements_are![eq("192.0.2.1"), eq("192.0.2.2")]
        );
        expect_that!(snapshot.blocked_emails, elements_are![eq("spam@example.com")]);
    }

    /// A manager as seen by a function deployed after the last change to `api`.
    fn redeployed(api: &Arc<InMemoryRemoteConfig>) -> BlocklistManager {
        BlocklistManager::new(Arc::new(
            RemoteConfigBlocklistStore::new(api.clone(), "arbitrary-site").with_deployed(
                &api.variable("BLOCKED_IPS").unwrap_or_default(),
                &api.variable("BLOCKED_EMAILS").unwrap_or_default(),
            ),
        ))
    }

    #[googletest::test]
    #[tokio::test]
    async fn remote_config_store_blocks_after_add_and_redeploy() {
        let (subject, api) = remote_config_manager();

        subject.add(BlockKind::Email, "Spam@Example.com").await.unwrap();
        expect_that!(api.variable("BLOCKED_EMAILS"), some(eq("spam@example.com")));
        expect_that!(
            subject.is_blocked(BlockKind::Email, "spam@example.com").await,
            eq(false)
        );
        expect_that!(
            redeployed(&api)
                .is_blocked(BlockKind::Email, "spam@example.com")
                .await,
            eq(true)
        );

        subject.remove(BlockKind::Email, "spam@EXAMPLE.com").await.unwrap();
        expect_that!(
            redeployed(&api)
                .is_blocked(BlockKind::Email, "spam@example.com")
                .await,
            eq(false)
        );
    }

    #[tokio::test]
    async fn concurrent_adds_to_remote_config_keep_at_least_one_entry() -> Result<()> {
        let (subject, _) = remote_config_manager();

        let (first, second) = tokio::join!(
            subject.add(BlockKind::Ip, "192.0.2.1"),
            subject.add(BlockKind::Ip, "192.0.2.2")
        );
        first.unwrap();
        second.unwrap();

        // Read-modify-write of the joined string means one of the two may be lost.
        let snapshot = subject.snapshot().await.unwrap();
        verify_that!(snapshot.blocked_ips.len(), ge(1))?;
        verify_that!(
            snapshot.blocked_ips.iter().all(|ip| ip == "192.0.2.1" || ip == "192.0.2.2"),
            eq(true)
        )
    }
}
