//! Windowed event deduplication
//!
//! `check(key)` answers First once per window. A duplicate does not extend
//! the window: the record keeps its original `first_seen` time. Expired
//! records are treated as unseen on check and removed by `sweep()`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of [`Deduplicator::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seen {
    /// Not seen inside the window; recorded now
    First,
    /// Already seen inside the window
    Duplicate,
}

impl Seen {
    pub fn is_first(&self) -> bool {
        matches!(self, Seen::First)
    }
}

/// Time-windowed idempotency cache
pub struct Deduplicator {
    /// key -> first seen
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
    duplicates: AtomicU64,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `key` if unseen, or report it as a duplicate
    pub fn check(&self, key: &str) -> Seen {
        let now = Instant::now();
        let mut seen = self.seen.lock();

        if let Some(first_seen) = seen.get(key) {
            if now.duration_since(*first_seen) < self.window {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                return Seen::Duplicate;
            }
        }

        seen.insert(key.to_string(), now);
        Seen::First
    }

    /// Drop expired records; returns how many
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        let removed = before - seen.len();
        if removed > 0 {
            debug!(removed, remaining = seen.len(), "dedup sweep");
        }
        removed
    }

    /// Current number of tracked keys
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Duplicates reported since creation
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
