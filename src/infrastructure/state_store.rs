//! Durable per-ID state: processed log, retry queue, run counter, checkpoint
//!
//! Everything lives under `state/`:
//! - `processed_ids.txt`: one ID per line, appended when an ID reaches a
//!   terminal state
//! - `retry_queue.json`: IDs waiting for another attempt
//! - `run_state.json`: the last run id handed out
//! - `checkpoint.json`: progress of the current run
//!
//! An ID is never in the processed set and the retry queue at once.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::domain::ItemId;

const PROCESSED_LOG: &str = "processed_ids.txt";
const RETRY_QUEUE: &str = "retry_queue.json";
const RUN_STATE: &str = "run_state.json";
const CHECKPOINT: &str = "checkpoint.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Writes `value` as pretty JSON via a temporary file and a rename
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| StoreError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body).await.map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).await.map_err(|e| StoreError::io(path, e))
}

/// Reads a JSON document, `None` when the file does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Pending retry of one ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: ItemId,
    pub reason: String,
    pub attempts: u32,
    pub next_eligible_at: DateTime<Utc>,
}

/// Attempts and back-off for retryable failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// `base * 2^(attempts-1)`, capped
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempts.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// What happened to a failed ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Queued { attempts: u32, next_eligible_at: DateTime<Utc> },
    /// Attempts used up: the ID is now terminal
    Exhausted { attempts: u32 },
}

/// Counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub files_downloaded: u64,
    pub files_failed: u64,
    pub files_skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub last_run_id: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Progress snapshot rewritten after every committed ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: u64,
    pub last_processed_id: Option<ItemId>,
    pub stats: RunStats,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    policy: RetryPolicy,
    processed: HashSet<ItemId>,
    retry_queue: BTreeMap<ItemId, RetryEntry>,
}

impl StateStore {
    /// Loads the processed log and retry queue from `dir`
    pub async fn load(dir: &Path, policy: RetryPolicy) -> StoreResult<Self> {
        fs::create_dir_all(dir).await.map_err(|e| StoreError::io(dir, e))?;

        let log_path = dir.join(PROCESSED_LOG);
        let mut processed = HashSet::new();
        match fs::read_to_string(&log_path).await {
            Ok(content) => {
                for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    match line.parse::<ItemId>() {
                        Ok(id) => {
                            processed.insert(id);
                        }
                        Err(_) => debug!("Ignoring malformed processed log line: {:?}", line),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&log_path, e)),
        }

        let mut retry_queue: BTreeMap<ItemId, RetryEntry> =
            read_json(&dir.join(RETRY_QUEUE)).await?.unwrap_or_default();
        let overlap = retry_queue.keys().filter(|id| processed.contains(id)).count();
        if overlap > 0 {
            warn!("Dropping {} retry entries for already processed IDs", overlap);
            retry_queue.retain(|id, _| !processed.contains(id));
        }

        info!(
            "📂 State loaded: {} processed, {} queued for retry",
            processed.len(),
            retry_queue.len()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
            processed,
            retry_queue,
        })
    }

    #[must_use]
    pub fn is_processed(&self, id: ItemId) -> bool {
        self.processed.contains(&id)
    }

    #[must_use]
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    #[must_use]
    pub fn retry_entry(&self, id: ItemId) -> Option<&RetryEntry> {
        self.retry_queue.get(&id)
    }

    #[must_use]
    pub fn retry_len(&self) -> usize {
        self.retry_queue.len()
    }

    /// Queued IDs whose back-off has elapsed, earliest due first
    #[must_use]
    pub fn eligible_retries(&self, now: DateTime<Utc>) -> Vec<ItemId> {
        let mut due: Vec<&RetryEntry> = self
            .retry_queue
            .values()
            .filter(|entry| entry.next_eligible_at <= now)
            .collect();
        due.sort_by_key(|entry| (entry.next_eligible_at, entry.id));
        due.into_iter().map(|entry| entry.id).collect()
    }

    /// Marks `id` terminal: appended to the log, dropped from the queue
    pub async fn mark_processed(&mut self, id: ItemId) -> StoreResult<()> {
        let was_queued = self.retry_queue.remove(&id).is_some();
        if self.processed.insert(id) {
            self.append_processed(id).await?;
        }
        if was_queued {
            self.save_retry_queue().await?;
        }
        Ok(())
    }

    /// Records a retryable failure; exhausting the attempts makes it terminal
    pub async fn record_failure(
        &mut self,
        id: ItemId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<RetryOutcome> {
        let attempts = self.retry_queue.get(&id).map_or(0, |entry| entry.attempts) + 1;

        if attempts > self.policy.max_retries {
            warn!("⛔ {} exhausted {} attempts ({}), giving up", id, attempts, reason);
            self.mark_processed(id).await?;
            return Ok(RetryOutcome::Exhausted { attempts });
        }

        let backoff = ChronoDuration::from_std(self.policy.backoff(attempts)).unwrap_or(ChronoDuration::zero());
        let next_eligible_at = now + backoff;
        self.retry_queue.insert(
            id,
            RetryEntry {
                id,
                reason: reason.to_string(),
                attempts,
                next_eligible_at,
            },
        );
        self.save_retry_queue().await?;
        debug!("🔄 {} queued for retry #{} at {}", id, attempts, next_eligible_at);
        Ok(RetryOutcome::Queued {
            attempts,
            next_eligible_at,
        })
    }

    /// Puts `id` back in the queue without spending an attempt
    pub async fn defer(&mut self, id: ItemId, reason: &str, now: DateTime<Utc>) -> StoreResult<()> {
        if self.processed.contains(&id) {
            return Ok(());
        }
        let entry = self.retry_queue.entry(id).or_insert_with(|| RetryEntry {
            id,
            reason: reason.to_string(),
            attempts: 0,
            next_eligible_at: now,
        });
        entry.reason = reason.to_string();
        entry.next_eligible_at = entry.next_eligible_at.min(now);
        self.save_retry_queue().await?;
        debug!("↩️ {} deferred to the next run ({})", id, reason);
        Ok(())
    }

    /// Clears every trace of `ids` so they are processed from scratch
    pub async fn forget(&mut self, ids: &[ItemId]) -> StoreResult<usize> {
        let mut removed = 0;
        let mut queue_changed = false;
        for id in ids {
            if self.processed.remove(id) {
                removed += 1;
            }
            queue_changed |= self.retry_queue.remove(id).is_some();
        }
        if removed > 0 {
            self.compact_processed_log().await?;
        }
        if queue_changed {
            self.save_retry_queue().await?;
        }
        if removed > 0 || queue_changed {
            info!("🧹 Forced reprocessing cleared state for {} IDs", ids.len());
        }
        Ok(removed)
    }

    pub async fn save_retry_queue(&self) -> StoreResult<()> {
        write_json_atomic(&self.dir.join(RETRY_QUEUE), &self.retry_queue).await
    }

    /// Hands out the next run id for the state directory `dir` and persists it
    pub async fn allocate_run_id(dir: &Path) -> StoreResult<u64> {
        let path = dir.join(RUN_STATE);
        let mut state: RunState = read_json(&path).await?.unwrap_or_default();
        state.last_run_id += 1;
        state.updated_at = Some(Utc::now());
        write_json_atomic(&path, &state).await?;
        Ok(state.last_run_id)
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        write_json_atomic(&self.dir.join(CHECKPOINT), checkpoint).await
    }

    pub async fn load_checkpoint(&self) -> StoreResult<Option<Checkpoint>> {
        read_json(&self.dir.join(CHECKPOINT)).await
    }

    async fn append_processed(&self, id: ItemId) -> StoreResult<()> {
        let path = self.dir.join(PROCESSED_LOG);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(format!("{id}\n").as_bytes())
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&path, e))
    }

    async fn compact_processed_log(&self) -> StoreResult<()> {
        let path = self.dir.join(PROCESSED_LOG);
        let mut ids: Vec<ItemId> = self.processed.iter().copied().collect();
        ids.sort_unstable();
        let body: String = ids.iter().map(|id| format!("{id}\n")).collect();
        let tmp = path.with_extension("txt.tmp");
        fs::write(&tmp, body).await.map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| StoreError::io(&path, e))
    }
}
