//! JSON-lines dead-letter repository
//!
//! Every mutation appends one record (`put` or `delete`) to the file. On
//! open the log is replayed into an in-memory index. Once dead records
//! outnumber live ones the file is rewritten through a temp file and an
//! atomic rename.

use super::{newest_first, DeadLetterEntry, DeadLetterRepository};
use crate::core::errors::{SidecarError, SidecarResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Minimum log length before compaction is considered
const COMPACT_MIN_RECORDS: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Record {
    Put { entry: DeadLetterEntry },
    Delete { id: String },
}

struct LogState {
    file: tokio::fs::File,
    /// Records in the file, live or superseded
    records: usize,
}

pub struct JsonlFileRepository {
    path: PathBuf,
    index: RwLock<HashMap<String, DeadLetterEntry>>,
    log: Mutex<LogState>,
}

impl JsonlFileRepository {
    /// Open (or create) the log at `path` and load it
    ///
    /// A torn trailing line from a crash is skipped with a warning.
    pub async fn open(path: impl AsRef<Path>) -> SidecarResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut index = HashMap::new();
        let mut records = 0usize;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (lineno, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    records += 1;
                    match serde_json::from_str::<Record>(line) {
                        Ok(Record::Put { entry }) => {
                            index.insert(entry.id.clone(), entry);
                        }
                        Ok(Record::Delete { id }) => {
                            index.remove(&id);
                        }
                        Err(e) => {
                            warn!(
                                path = %path.display(),
                                line = lineno + 1,
                                error = %e,
                                "skipping unreadable dead-letter record"
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), entries = index.len(), "opened dead-letter log");

        Ok(Self {
            path,
            index: RwLock::new(index),
            log: Mutex::new(LogState { file, records }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; the caller holds the log lock so that index
    /// order and file order agree
    async fn append_locked(&self, log: &mut LogState, record: &Record) -> SidecarResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        log.file.write_all(&line).await?;
        log.file.flush().await?;
        log.records += 1;

        let live = self.index.read().len();
        if log.records >= COMPACT_MIN_RECORDS && log.records > live * 2 {
            self.compact_locked(log).await?;
        }
        Ok(())
    }

    /// Rewrite the log with only live entries
    pub async fn compact(&self) -> SidecarResult<()> {
        let mut log = self.log.lock().await;
        self.compact_locked(&mut log).await
    }

    async fn compact_locked(&self, log: &mut LogState) -> SidecarResult<()> {
        let entries: Vec<DeadLetterEntry> = self.index.read().values().cloned().collect();

        let mut buf = Vec::new();
        for entry in entries.iter().cloned() {
            serde_json::to_writer(&mut buf, &Record::Put { entry })?;
            buf.push(b'\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        log.file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SidecarError::Storage(format!("reopen after compaction: {}", e)))?;
        debug!(before = log.records, after = entries.len(), "compacted dead-letter log");
        log.records = entries.len();
        Ok(())
    }
}

#[async_trait]
impl DeadLetterRepository for JsonlFileRepository {
    async fn save(&self, entry: &DeadLetterEntry) -> SidecarResult<()> {
        let mut log = self.log.lock().await;
        self.index.write().insert(entry.id.clone(), entry.clone());
        self.append_locked(
            &mut log,
            &Record::Put {
                entry: entry.clone(),
            },
        )
        .await
    }

    async fn find_by_id(&self, id: &str) -> SidecarResult<Option<DeadLetterEntry>> {
        Ok(self.index.read().get(id).cloned())
    }

    async fn find_recent(&self, limit: usize) -> SidecarResult<Vec<DeadLetterEntry>> {
        let entries: Vec<_> = self.index.read().values().cloned().collect();
        Ok(newest_first(entries, limit))
    }

    async fn delete(&self, id: &str) -> SidecarResult<bool> {
        let mut log = self.log.lock().await;
        let existed = self.index.write().remove(id).is_some();
        if existed {
            self.append_locked(&mut log, &Record::Delete { id: id.to_string() })
                .await?;
        }
        Ok(existed)
    }

    async fn all(&self) -> SidecarResult<Vec<DeadLetterEntry>> {
        Ok(self.index.read().values().cloned().collect())
    }

    async fn count(&self) -> SidecarResult<usize> {
        Ok(self.index.read().len())
    }
}
