//! Dead-letter store
//!
//! Holding area for operations that failed after every retry. Entries are
//! re-driven one at a time with a caller-supplied function, expire after
//! the retention TTL and can be summarised for health and metrics.

use crate::core::errors::{SidecarError, SidecarResult};
use crate::storage::{DeadLetterEntry, DeadLetterRepository};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dead-letter behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterConfig {
    /// Re-drives allowed per entry
    pub max_retries: u32,
    /// How long an entry is kept
    pub retention: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Result of a single re-drive
#[derive(Debug, Clone, PartialEq)]
pub enum RedriveOutcome {
    /// Retry succeeded; the entry was deleted
    Delivered,
    /// Retry failed; the entry was kept with the new error
    StillFailing { retry_count: u32, error: SidecarError },
}

/// Aggregate view for health and operators
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_error_class: BTreeMap<String, usize>,
    pub by_retry_count: BTreeMap<u32, usize>,
    /// Entries with no retries left
    pub exhausted: usize,
    pub oldest: Option<DateTime<Utc>>,
}

/// Summary of a bounded re-drive pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedriveReport {
    pub attempted: usize,
    pub delivered: usize,
    pub still_failing: usize,
    pub skipped_exhausted: usize,
}

/// Dead-letter store over a pluggable repository
#[derive(Clone)]
pub struct DeadLetterStore {
    repo: Arc<dyn DeadLetterRepository>,
    config: DeadLetterConfig,
    /// Serializes re-drives so an entry is never retried twice at once
    redrive_lock: Arc<Mutex<()>>,
}

impl DeadLetterStore {
    pub fn new(repo: Arc<dyn DeadLetterRepository>, config: DeadLetterConfig) -> Self {
        Self {
            repo,
            config,
            redrive_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store backed by an in-memory repository
    pub fn in_memory(config: DeadLetterConfig) -> Self {
        Self::new(Arc::new(crate::storage::MemoryRepository::new()), config)
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Record a terminal failure; returns the new entry id
    pub async fn add(
        &self,
        payload: serde_json::Value,
        error: &SidecarError,
        metadata: BTreeMap<String, String>,
    ) -> SidecarResult<String> {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4().to_string(),
            original_payload: payload,
            error_message: error.to_string(),
            error_class: error.kind().to_string(),
            metadata,
            created_at: Utc::now(),
            retry_count: 0,
            last_retry_at: None,
            ttl_secs: self.config.retention.as_secs(),
        };
        self.repo.save(&entry).await?;

        warn!(
            id = %entry.id,
            error_class = %entry.error_class,
            error = %entry.error_message,
            "operation dead-lettered"
        );
        Ok(entry.id)
    }

    pub async fn get(&self, id: &str) -> SidecarResult<Option<DeadLetterEntry>> {
        self.repo.find_by_id(id).await
    }

    pub async fn recent(&self, limit: usize) -> SidecarResult<Vec<DeadLetterEntry>> {
        self.repo.find_recent(limit).await
    }

    pub async fn count(&self) -> SidecarResult<usize> {
        self.repo.count().await
    }

    /// Re-drive one entry
    ///
    /// Fails with `MaxRetriesExceeded` without calling `retry_fn` once the
    /// entry has used all its retries.
    pub async fn retry<F, Fut>(&self, id: &str, retry_fn: F) -> SidecarResult<RedriveOutcome>
    where
        F: FnOnce(serde_json::Value) -> Fut,
        Fut: Future<Output = SidecarResult<()>>,
    {
        let _guard = self.redrive_lock.lock().await;
        self.retry_locked(id, retry_fn).await
    }

    async fn retry_locked<F, Fut>(&self, id: &str, retry_fn: F) -> SidecarResult<RedriveOutcome>
    where
        F: FnOnce(serde_json::Value) -> Fut,
        Fut: Future<Output = SidecarResult<()>>,
    {
        let mut entry = self
            .repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| SidecarError::DeadLetterNotFound(id.to_string()))?;

        if entry.retry_count >= self.config.max_retries {
            return Err(SidecarError::MaxRetriesExceeded {
                id: entry.id,
                retry_count: entry.retry_count,
            });
        }

        entry.retry_count += 1;
        entry.last_retry_at = Some(Utc::now());
        // Persist the spent retry before running, so a crash mid-retry
        // still counts it
        self.repo.save(&entry).await?;

        match retry_fn(entry.original_payload.clone()).await {
            Ok(()) => {
                self.repo.delete(&entry.id).await?;
                info!(id = %entry.id, retry_count = entry.retry_count, "dead letter re-driven");
                Ok(RedriveOutcome::Delivered)
            }
            Err(e) => {
                entry.error_message = e.to_string();
                entry.error_class = e.kind().to_string();
                self.repo.save(&entry).await?;
                debug!(
                    id = %entry.id,
                    retry_count = entry.retry_count,
                    error = %e,
                    "re-drive failed"
                );
                Ok(RedriveOutcome::StillFailing {
                    retry_count: entry.retry_count,
                    error: e,
                })
            }
        }
    }

    /// Re-drive up to `limit` of the oldest entries that still have retries
    pub async fn redrive_batch<F, Fut>(
        &self,
        limit: usize,
        retry_fn: F,
    ) -> SidecarResult<RedriveReport>
    where
        F: Fn(serde_json::Value) -> Fut,
        Fut: Future<Output = SidecarResult<()>>,
    {
        let _guard = self.redrive_lock.lock().await;
        let mut entries = self.repo.all().await?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut report = RedriveReport::default();
        for entry in entries {
            if report.attempted >= limit {
                break;
            }
            if entry.retry_count >= self.config.max_retries {
                report.skipped_exhausted += 1;
                continue;
            }
            report.attempted += 1;
            match self.retry_locked(&entry.id, &retry_fn).await? {
                RedriveOutcome::Delivered => report.delivered += 1,
                RedriveOutcome::StillFailing { .. } => report.still_failing += 1,
            }
        }
        Ok(report)
    }

    /// Delete entries past their retention; returns how many
    pub async fn cleanup(&self) -> SidecarResult<usize> {
        self.cleanup_at(Utc::now()).await
    }

    /// `cleanup` against an explicit clock
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> SidecarResult<usize> {
        let mut removed = 0;
        for entry in self.repo.all().await? {
            if entry.is_expired(now) && self.repo.delete(&entry.id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired dead letters removed");
        }
        Ok(removed)
    }

    /// Aggregate by error class and by retry count
    pub async fn stats(&self) -> SidecarResult<DeadLetterStats> {
        let entries = self.repo.all().await?;
        let mut stats = DeadLetterStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            *stats.by_error_class.entry(entry.error_class.clone()).or_default() += 1;
            *stats.by_retry_count.entry(entry.retry_count).or_default() += 1;
            if entry.retry_count >= self.config.max_retries {
                stats.exhausted += 1;
            }
            stats.oldest = match stats.oldest {
                Some(oldest) if oldest <= entry.created_at => Some(oldest),
                _ => Some(entry.created_at),
            };
        }
        Ok(stats)
    }

    /// Periodic cleanup plus bounded re-drive until `shutdown` flips to true
    pub async fn run_maintenance<F, Fut>(
        self,
        schedule: MaintenanceSchedule,
        retry_fn: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn(serde_json::Value) -> Fut,
        Fut: Future<Output = SidecarResult<()>>,
    {
        let mut cleanup = tokio::time::interval(schedule.cleanup_interval);
        let mut redrive = tokio::time::interval(schedule.redrive_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        redrive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!(error = %e, "dead-letter cleanup failed");
                    }
                }
                _ = redrive.tick() => {
                    match self.redrive_batch(schedule.redrive_batch, &retry_fn).await {
                        Ok(report) if report.attempted > 0 => {
                            info!(
                                attempted = report.attempted,
                                delivered = report.delivered,
                                still_failing = report.still_failing,
                                "dead-letter re-drive pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "dead-letter re-drive failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("dead-letter maintenance stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// Intervals for [`DeadLetterStore::run_maintenance`]
#[derive(Debug, Clone)]
pub struct MaintenanceSchedule {
    pub cleanup_interval: Duration,
    pub redrive_interval: Duration,
    pub redrive_batch: usize,
}
