use super::{BlockKind, BlocklistStore, Propagation};
use crate::key_value::KeyValueStore;
use anyhow::Context;
use async_trait::async_trait;
use std::{collections::BTreeSet, sync::Arc};

const IP_NAMESPACE: &str = "ip-blocklist";
const EMAIL_NAMESPACE: &str = "email-blocklist";
const MARKER: &str = "true";

/// One key per entry, so that concurrent mutations of different entries never interfere.
pub struct KeyValueBlocklistStore {
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueBlocklistStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn namespace(kind: BlockKind) -> &'static str {
        match kind {
            BlockKind::Ip => IP_NAMESPACE,
            BlockKind::Email => EMAIL_NAMESPACE,
        }
    }
}

#[async_trait]
impl BlocklistStore for KeyValueBlocklistStore {
    async fn load(&self, kind: BlockKind) -> anyhow::Result<BTreeSet<String>> {
        let keys = self
            .store
            .list(Self::namespace(kind))
            .await
            .with_context(|| format!("Error listing blocked {kind} entries"))?;
        Ok(keys.into_iter().collect())
    }

    /// Only the marker value blocks. Keys holding anything else are ignored.
    async fn contains(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool> {
        let value = self.store.get(Self::namespace(kind), entry).await?;
        Ok(value.as_deref() == Some(MARKER))
    }

    async fn insert(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool> {
        if self.contains(kind, entry).await? {
            return Ok(false);
        }
        self.store
            .set(Self::namespace(kind), entry, MARKER)
            .await
            .with_context(|| format!("Error blocking {kind} {entry}"))?;
        Ok(true)
    }

    async fn remove(&self, kind: BlockKind, entry: &str) -> anyhow::Result<bool> {
        if !self.contains(kind, entry).await? {
            return Ok(false);
        }
        self.store
            .delete(Self::namespace(kind), entry)
            .await
            .with_context(|| format!("Error unblocking {kind} {entry}"))?;
        Ok(true)
    }

    fn propagation(&self) -> Propagation {
        Propagation::Immediate
    }
}
