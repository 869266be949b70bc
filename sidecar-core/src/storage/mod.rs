//! Dead-letter persistence
//!
//! `DeadLetterStore` only talks to a [`DeadLetterRepository`]. Two
//! implementations ship with the crate:
//!
//! - [`MemoryRepository`]: process-local, for tests and single-node runs
//! - [`JsonlFileRepository`]: append-only JSON-lines file, survives restarts

mod jsonl;

pub use jsonl::JsonlFileRepository;

use crate::core::errors::SidecarResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A terminally failed operation waiting for re-drive or expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: String,
    /// Whatever is needed to re-run the operation
    pub original_payload: serde_json::Value,
    pub error_message: String,
    /// `SidecarError::kind()` of the last failure
    pub error_class: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Retention from `created_at`, in seconds
    pub ttl_secs: u64,
}

impl DeadLetterEntry {
    /// True once `now` is past `created_at + ttl`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = chrono::TimeDelta::try_seconds(self.ttl_secs.min(i64::MAX as u64) as i64)
        else {
            return false;
        };
        match self.created_at.checked_add_signed(ttl) {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}

/// Storage port used by `DeadLetterStore`
///
/// Implementations must be safe to share between tasks.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Insert or replace an entry by id
    async fn save(&self, entry: &DeadLetterEntry) -> SidecarResult<()>;

    async fn find_by_id(&self, id: &str) -> SidecarResult<Option<DeadLetterEntry>>;

    /// Newest entries first, at most `limit`
    async fn find_recent(&self, limit: usize) -> SidecarResult<Vec<DeadLetterEntry>>;

    /// Returns whether the entry existed
    async fn delete(&self, id: &str) -> SidecarResult<bool>;

    async fn all(&self) -> SidecarResult<Vec<DeadLetterEntry>>;

    async fn count(&self) -> SidecarResult<usize> {
        Ok(self.all().await?.len())
    }
}

/// In-memory repository for testing and single-node deployments
#[derive(Default)]
pub struct MemoryRepository {
    entries: RwLock<HashMap<String, DeadLetterEntry>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn newest_first(
    mut entries: Vec<DeadLetterEntry>,
    limit: usize,
) -> Vec<DeadLetterEntry> {
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    entries.truncate(limit);
    entries
}

#[async_trait]
impl DeadLetterRepository for MemoryRepository {
    async fn save(&self, entry: &DeadLetterEntry) -> SidecarResult<()> {
        self.entries.write().insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> SidecarResult<Option<DeadLetterEntry>> {
        Ok(self.entries.read().get(id).cloned())
    }

    async fn find_recent(&self, limit: usize) -> SidecarResult<Vec<DeadLetterEntry>> {
        let entries: Vec<_> = self.entries.read().values().cloned().collect();
        Ok(newest_first(entries, limit))
    }

    async fn delete(&self, id: &str) -> SidecarResult<bool> {
        Ok(self.entries.write().remove(id).is_some())
    }

    async fn all(&self) -> SidecarResult<Vec<DeadLetterEntry>> {
        Ok(self.entries.read().values().cloned().collect())
    }

    async fn count(&self) -> SidecarResult<usize> {
        Ok(self.entries.read().len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn entry(id: &str, created_secs: i64) -> DeadLetterEntry {
        DeadLetterEntry {
            id: id.to_string(),
            original_payload: serde_json::json!({ "method": "getSlot" }),
            error_message: "connection refused".into(),
            error_class: "connection".into(),
            metadata: BTreeMap::new(),
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
            retry_count: 0,
            last_retry_at: None,
            ttl_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_memory_save_find_delete() {
        let repo = MemoryRepository::new();
        repo.save(&entry("a", 1_000)).await.unwrap();

        assert_eq!(repo.find_by_id("a").await.unwrap().unwrap().id, "a");
        assert!(repo.find_by_id("b").await.unwrap().is_none());

        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_recent_newest_first() {
        let repo = MemoryRepository::new();
        repo.save(&entry("old", 1_000)).await.unwrap();
        repo.save(&entry("new", 3_000)).await.unwrap();
        repo.save(&entry("mid", 2_000)).await.unwrap();

        let ids: Vec<_> = repo
            .find_recent(2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn test_expiry() {
        let e = entry("a", 1_000);
        assert!(!e.is_expired(Utc.timestamp_opt(1_060, 0).unwrap()));
        assert!(e.is_expired(Utc.timestamp_opt(1_061, 0).unwrap()));
    }

    #[test]
    fn test_entry_json_is_camel_case() {
        let json = serde_json::to_value(entry("a", 1_000)).unwrap();
        assert!(json.get("originalPayload").is_some());
        assert!(json.get("retryCount").is_some());
    }
}
