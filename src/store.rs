//! Persisted reconciliation state, one record per declared resource.

use crate::identity::ResourceIdentity;
use crate::state::{ChangeSet, ObservedState};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default)]
    pub observed: ObservedState,
    /// Changes issued to the vendor but not yet confirmed.
    #[serde(default, skip_serializing_if = "ChangeSet::is_empty")]
    pub pending: ChangeSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new<K: Into<String>>(kind: K) -> Self {
        Self {
            kind: kind.into(),
            identity: None,
            observed: ObservedState::default(),
            pending: ChangeSet::default(),
            last_reconciled: None,
        }
    }

    pub fn identity(&self) -> crate::error::Result<Option<ResourceIdentity>> {
        self.identity.as_deref().map(str::parse::<ResourceIdentity>).transpose()
    }

    /// Forget the remote resource, it has to be created again.
    pub fn clear(&mut self) {
        self.identity = None;
        self.observed = ObservedState::default();
        self.pending = ChangeSet::default();
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, name: &str) -> anyhow::Result<Option<Record>>;

    async fn put(&self, name: &str, record: Record) -> anyhow::Result<()>;

    async fn remove(&self, name: &str) -> anyhow::Result<()>;

    async fn names(&self) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
impl<S> StateStore for Arc<S>
where
    S: StateStore + ?Sized,
{
    async fn get(&self, name: &str) -> anyhow::Result<Option<Record>> {
        self.as_ref().get(name).await
    }

    async fn put(&self, name: &str, record: Record) -> anyhow::Result<()> {
        self.as_ref().put(name, record).await
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.as_ref().remove(name).await
    }

    async fn names(&self) -> anyhow::Result<Vec<String>> {
        self.as_ref().names().await
    }
}

/// Keeps records in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<IndexMap<String, Record>>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, name: &str) -> anyhow::Result<Option<Record>> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn put(&self, name: &str, record: Record) -> anyhow::Result<()> {
        self.records.write().await.insert(name.to_string(), record);
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.records.write().await.shift_remove(name);
        Ok(())
    }

    async fn names(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }
}

/// Keeps records in a JSON document, rewritten on every change. Memory only
/// changes once the document is written.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    records: Mutex<IndexMap<String, Record>>,
}

impl FileStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content)
                .with_context(|| format!("Failed to parse state file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No state file at {}, starting empty", path.display());
                IndexMap::new()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read state file {}", path.display()))
            }
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &IndexMap<String, Record>) -> anyhow::Result<()> {
        let content = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, name: &str) -> anyhow::Result<Option<Record>> {
        Ok(self.records.lock().await.get(name).cloned())
    }

    async fn put(&self, name: &str, record: Record) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        let mut updated = records.clone();
        updated.insert(name.to_string(), record);
        self.persist(&updated).await?;
        *records = updated;
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        let mut updated = records.clone();
        if updated.shift_remove(name).is_some() {
            self.persist(&updated).await?;
            *records = updated;
        }
        Ok(())
    }

    async fn names(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.records.lock().await.keys().cloned().collect())
    }
}
