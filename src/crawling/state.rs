//! # Shared collector state
//!
//! The only resources shared between workers: output tables, schema
//! union, state store and run counters. Each sits behind its own lock and a
//! commit always takes them in the order sink → schema → store, so two
//! workers never interleave a partial record.

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{AttributeEntry, ErrorKind, FileEntry, FileStatus, ItemId, ItemRecord, ItemStatus};
use crate::infrastructure::output_sink::{MetadataRow, OutputSink, SinkError};
use crate::infrastructure::schema_union::SchemaUnion;
use crate::infrastructure::state_store::{Checkpoint, RetryOutcome, RunStats, StateStore, StoreError};

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Output sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything one worker produced for one ID
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub worker_id: usize,
    pub record: ItemRecord,
    pub attributes: Vec<AttributeEntry>,
    pub files: Vec<FileEntry>,
}

/// Where an ID ended up after its commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Terminal: success or skipped
    Completed(ItemStatus),
    Requeued { attempts: u32 },
    /// Retryable failure that ran out of attempts
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
pub struct CollectorState {
    pub run_id: u64,
    pub cancellation_token: CancellationToken,
    sink: Mutex<OutputSink>,
    schema: Mutex<SchemaUnion>,
    store: Mutex<StateStore>,
    stats: RwLock<RunStats>,
    last_processed: Mutex<Option<ItemId>>,
}

impl CollectorState {
    #[must_use]
    pub fn new(
        run_id: u64,
        store: StateStore,
        sink: OutputSink,
        schema: SchemaUnion,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            cancellation_token,
            sink: Mutex::new(sink),
            schema: Mutex::new(schema),
            store: Mutex::new(store),
            stats: RwLock::new(RunStats::default()),
            last_processed: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Persists one ID's rows and its state transition
    ///
    /// When the sink fails the store is left untouched, so the ID is simply
    /// picked up again by the next run.
    pub async fn commit(&self, outcome: &ItemOutcome) -> Result<CommitOutcome, CommitError> {
        let record = &outcome.record;
        let id = record.id;
        debug_assert_ne!(record.status, ItemStatus::Pending);

        {
            let mut sink = self.sink.lock().await;
            let metadata = MetadataRow::from_record(self.run_id, outcome.worker_id, record);
            sink.commit(&metadata, &outcome.attributes, &outcome.files).await?;
        }
        {
            let mut schema = self.schema.lock().await;
            schema.observe(&outcome.attributes);
            schema.persist().await?;
        }
        let result = {
            let mut store = self.store.lock().await;
            if record.is_retryable_failure() {
                let reason = record.error_kind.map_or("unknown", ErrorKind::as_str);
                match store.record_failure(id, reason, Utc::now()).await? {
                    RetryOutcome::Queued { attempts, next_eligible_at } => {
                        info!("🔄 {} queued for retry #{} (eligible at {})", id, attempts, next_eligible_at);
                        CommitOutcome::Requeued { attempts }
                    }
                    RetryOutcome::Exhausted { attempts } => CommitOutcome::Exhausted { attempts },
                }
            } else {
                store.mark_processed(id).await?;
                CommitOutcome::Completed(record.status)
            }
        };

        self.update_stats(outcome, result).await;
        *self.last_processed.lock().await = Some(id);
        self.save_checkpoint().await;
        Ok(result)
    }

    /// Hands an unfinished ID back to the retry queue without spending an attempt
    pub async fn defer(&self, id: ItemId, reason: &str) {
        let mut store = self.store.lock().await;
        match store.defer(id, reason, Utc::now()).await {
            Ok(()) => self.stats.write().await.requeued += 1,
            Err(e) => warn!("Failed to defer {}: {}", id, e),
        }
    }

    async fn update_stats(&self, outcome: &ItemOutcome, result: CommitOutcome) {
        let mut stats = self.stats.write().await;
        stats.processed += 1;
        match result {
            CommitOutcome::Completed(ItemStatus::Success) => stats.success += 1,
            CommitOutcome::Completed(_) => stats.skipped += 1,
            CommitOutcome::Requeued { .. } => stats.requeued += 1,
            CommitOutcome::Exhausted { .. } => stats.failed += 1,
        }
        for file in &outcome.files {
            match file.status {
                FileStatus::Downloaded => stats.files_downloaded += 1,
                FileStatus::Failed => stats.files_failed += 1,
                FileStatus::Skipped => stats.files_skipped += 1,
            }
        }
    }

    pub async fn stats(&self) -> RunStats {
        self.stats.read().await.clone()
    }

    async fn save_checkpoint(&self) {
        let checkpoint = Checkpoint {
            run_id: self.run_id,
            last_processed_id: *self.last_processed.lock().await,
            stats: self.stats().await,
            updated_at: Utc::now(),
        };
        let store = self.store.lock().await;
        if let Err(e) = store.save_checkpoint(&checkpoint).await {
            warn!("Failed to save checkpoint: {}", e);
        }
    }

    /// Final flush of schema, retry queue and checkpoint
    pub async fn persist(&self) -> Result<(), CommitError> {
        self.schema.lock().await.persist().await?;
        self.store.lock().await.save_retry_queue().await?;
        self.save_checkpoint().await;
        debug!("Final state persisted for run {}", self.run_id);
        Ok(())
    }

    pub async fn retry_queue_len(&self) -> usize {
        self.store.lock().await.retry_len()
    }

    pub async fn schema_len(&self) -> usize {
        self.schema.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PageUrls;
    use crate::infrastructure::state_store::RetryPolicy;
    use std::time::Duration;

    async fn state(dir: &std::path::Path, max_retries: u32) -> CollectorState {
        let store = StateStore::load(
            &dir.join("state"),
            RetryPolicy {
                max_retries,
                base_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(3600),
            },
        )
        .await
        .unwrap();
        let sink = OutputSink::open(&dir.join("processed")).await.unwrap();
        let schema = SchemaUnion::load(&dir.join("processed")).await.unwrap();
        CollectorState::new(1, store, sink, schema, CancellationToken::new())
    }

    fn outcome(id: u64, kind: Option<ErrorKind>) -> ItemOutcome {
        let mut record = ItemRecord::pending(
            ItemId::new(id),
            PageUrls {
                general: String::new(),
                documents: String::new(),
            },
        );
        match kind {
            Some(kind) => record.fail(kind, kind.as_str()),
            None => record.succeed(),
        }
        ItemOutcome {
            worker_id: 0,
            record,
            attributes: Vec::new(),
            files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn commit_routes_outcomes_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), 1).await;

        assert_eq!(
            state.commit(&outcome(1, None)).await.unwrap(),
            CommitOutcome::Completed(ItemStatus::Success)
        );
        assert_eq!(
            state.commit(&outcome(2, Some(ErrorKind::MissingPage))).await.unwrap(),
            CommitOutcome::Completed(ItemStatus::Skipped)
        );
        assert_eq!(
            state.commit(&outcome(3, Some(ErrorKind::FetchTimeout))).await.unwrap(),
            CommitOutcome::Requeued { attempts: 1 }
        );
        assert_eq!(
            state.commit(&outcome(3, Some(ErrorKind::FetchTimeout))).await.unwrap(),
            CommitOutcome::Exhausted { attempts: 2 }
        );

        let stats = state.stats().await;
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(state.retry_queue_len().await, 0);
    }

    #[tokio::test]
    async fn checkpoint_tracks_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), 3).await;
        state.commit(&outcome(5, None)).await.unwrap();
        state.persist().await.unwrap();

        let store = StateStore::load(
            &dir.path().join("state"),
            RetryPolicy {
                max_retries: 3,
                base_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(1),
            },
        )
        .await
        .unwrap();
        let checkpoint = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.last_processed_id, Some(ItemId::new(5)));
        assert_eq!(checkpoint.stats.success, 1);
    }
}
