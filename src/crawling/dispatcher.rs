//! # Dispatcher
//!
//! Builds the work list for a run, splits it across a fixed pool of
//! workers, respawns workers that lose their session, and persists the
//! final state once every worker has drained.

use chrono::Utc;
use indexmap::IndexSet;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawling::state::{CollectorState, CommitError};
use crate::crawling::worker::{Worker, WorkerContext, WorkerExit};
use crate::domain::{ErrorKind, ItemId};
use crate::infrastructure::config::{CollectorConfig, defaults};
use crate::infrastructure::downloader::{DownloadPolicy, Downloader};
use crate::infrastructure::html_parser::NoticeParser;
use crate::infrastructure::output_sink::{OutputSink, SinkError};
use crate::infrastructure::page_fetcher::PageFetcher;
use crate::infrastructure::parsing_error::ParsingError;
use crate::infrastructure::schema_union::SchemaUnion;
use crate::infrastructure::session::SessionFactory;
use crate::infrastructure::state_store::{RetryPolicy, RunStats, StateStore, StoreError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to prepare data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Output sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Parser setup failed: {0}")]
    Parser(#[from] ParsingError),

    #[error("Final persist failed: {0}")]
    Commit(#[from] CommitError),
}

/// What a run did, logged at the end and returned to the caller
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: u64,
    /// IDs handed to workers (retries first, then fresh IDs)
    pub planned: usize,
    pub retries_planned: usize,
    pub stats: RunStats,
    pub retry_queue_len: usize,
    pub schema_keys: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Splits `ids` into `workers` stride slices: slice `i` gets `ids[i::n]`
#[must_use]
pub fn partition(ids: &[ItemId], workers: usize) -> Vec<Vec<ItemId>> {
    let n = workers.clamp(1, ids.len().max(1));
    let mut slices = vec![Vec::with_capacity(ids.len() / n + 1); n];
    for (index, id) in ids.iter().enumerate() {
        slices[index % n].push(*id);
    }
    slices.retain(|slice| !slice.is_empty());
    slices
}

/// Retries first, then fresh IDs, each at most once
fn plan(retries: &[ItemId], fresh: &[ItemId]) -> Vec<ItemId> {
    let ordered: IndexSet<ItemId> = retries.iter().chain(fresh).copied().collect();
    ordered.into_iter().collect()
}

type WorkerResult = (usize, u32, WorkerExit);

pub struct Dispatcher {
    config: CollectorConfig,
    sessions: Arc<dyn SessionFactory>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: CollectorConfig, sessions: Arc<dyn SessionFactory>) -> Self {
        Self { config, sessions }
    }

    /// Runs one collection pass; per-ID failures never fail the run
    pub async fn run(&self, run_id: u64, token: CancellationToken) -> Result<RunSummary, DispatchError> {
        let started = Instant::now();
        let config = &self.config;
        let paths = config.paths();
        paths.ensure().await?;

        let mut store = StateStore::load(
            &paths.state,
            RetryPolicy {
                max_retries: config.max_retries,
                base_backoff: config.retry_backoff,
                max_backoff: Duration::from_secs(defaults::RETRY_BACKOFF_CAP_SECONDS),
            },
        )
        .await?;

        let domain: Vec<ItemId> = config
            .selection
            .expand(config.max_ids)
            .into_iter()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        if config.force {
            store.forget(&domain).await?;
        }

        let retries = if config.skip_retries {
            Vec::new()
        } else {
            store.eligible_retries(Utc::now())
        };
        let fresh: Vec<ItemId> = domain
            .iter()
            .copied()
            .filter(|id| !store.is_processed(*id) && store.retry_entry(*id).is_none())
            .collect();
        let held_back = domain
            .iter()
            .filter(|id| store.retry_entry(**id).is_some() && !retries.contains(id))
            .count();
        let work = plan(&retries, &fresh);

        info!(
            "📋 Run {}: {} IDs in domain, {} fresh, {} retries due, {} queued for later",
            run_id,
            domain.len(),
            fresh.len(),
            retries.len(),
            held_back
        );

        let sink = OutputSink::open(&paths.processed).await?;
        let schema = SchemaUnion::load(&paths.processed).await?;
        let state = Arc::new(CollectorState::new(run_id, store, sink, schema, token.clone()));

        let ctx = Arc::new(WorkerContext {
            urls: config.urls.clone(),
            paths: paths.clone(),
            per_id_timeout: config.per_id_timeout,
            pacing: config.effective_pacing(),
            save_html: config.save_html,
            save_html_first_n: config.save_html_first_n,
            fail_on_download_error: config.fail_on_download_error,
            fetcher: PageFetcher::new(config.mode, paths.samples.clone(), config.urls.clone()),
            parser: NoticeParser::new()?,
            downloader: Downloader::new(DownloadPolicy {
                timeout: config.download_timeout,
                stall: config.download_stall,
                overwrite: config.force,
            }),
            sessions: Arc::clone(&self.sessions),
            state: Arc::clone(&state),
        });

        let watchdog = config.run_timeout.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(limit) => {
                        warn!("⏰ Run timeout of {:?} reached, shutting down", limit);
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            })
        });

        if work.is_empty() {
            info!("✨ Nothing to do for run {}", run_id);
        } else {
            self.run_workers(&work, ctx, &state, &token).await;
        }

        if let Some(handle) = watchdog {
            handle.abort();
        }

        state.persist().await?;
        let summary = RunSummary {
            run_id,
            planned: work.len(),
            retries_planned: retries.len(),
            stats: state.stats().await,
            retry_queue_len: state.retry_queue_len().await,
            schema_keys: state.schema_len().await,
            cancelled: token.is_cancelled(),
            elapsed: started.elapsed(),
        };
        log_summary(&summary);
        Ok(summary)
    }

    async fn run_workers(
        &self,
        work: &[ItemId],
        ctx: Arc<WorkerContext>,
        state: &CollectorState,
        token: &CancellationToken,
    ) {
        let slices = partition(work, self.config.workers);
        info!("🚀 Starting {} workers for {} IDs", slices.len(), work.len());

        let mut workers = JoinSet::new();
        for (worker_id, ids) in slices.into_iter().enumerate() {
            let delay = self.config.worker_start_delay.saturating_mul(worker_id as u32);
            spawn_worker(&mut workers, worker_id, 0, ids, delay, Arc::clone(&ctx), token.clone());
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((worker_id, _, WorkerExit::Drained)) => debug!("Worker {} finished", worker_id),
                Ok((worker_id, _, WorkerExit::Cancelled { remaining })) => {
                    info!("Worker {} cancelled with {} IDs unstarted", worker_id, remaining.len());
                }
                Ok((worker_id, respawns, WorkerExit::SessionLost { remaining, error })) => {
                    if respawns < self.config.max_worker_respawns && !token.is_cancelled() {
                        warn!(
                            "♻️ Respawning worker {} ({}/{}) for {} IDs after: {}",
                            worker_id,
                            respawns + 1,
                            self.config.max_worker_respawns,
                            remaining.len(),
                            error
                        );
                        spawn_worker(
                            &mut workers,
                            worker_id,
                            respawns + 1,
                            remaining,
                            Duration::ZERO,
                            Arc::clone(&ctx),
                            token.clone(),
                        );
                    } else {
                        error!(
                            "Worker {} gave up after {} respawns, requeueing {} IDs",
                            worker_id,
                            respawns,
                            remaining.len()
                        );
                        for id in remaining {
                            state.defer(id, ErrorKind::Session.as_str()).await;
                        }
                    }
                }
                // Its IDs stay unprocessed and are picked up by the next run
                Err(e) => error!("💥 Worker task failed: {}", e),
            }
        }
    }
}

fn spawn_worker(
    workers: &mut JoinSet<WorkerResult>,
    worker_id: usize,
    respawns: u32,
    ids: Vec<ItemId>,
    delay: Duration,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
) {
    workers.spawn(async move {
        if !delay.is_zero() {
            debug!("Worker {} starts in {:?}", worker_id, delay);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {
                    return (worker_id, respawns, WorkerExit::Cancelled { remaining: ids });
                }
            }
        }
        let exit = Worker::new(worker_id, ctx).run(ids).await;
        (worker_id, respawns, exit)
    });
}

fn log_summary(summary: &RunSummary) {
    let stats = &summary.stats;
    info!("📊 Run {} summary:", summary.run_id);
    info!("   Planned: {} ({} retries)", summary.planned, summary.retries_planned);
    info!(
        "   Processed: {} (success {}, skipped {}, failed {}, requeued {})",
        stats.processed, stats.success, stats.skipped, stats.failed, stats.requeued
    );
    info!(
        "   Files: {} downloaded, {} failed, {} skipped",
        stats.files_downloaded, stats.files_failed, stats.files_skipped
    );
    info!("   Retry queue: {} | Schema keys: {}", summary.retry_queue_len, summary.schema_keys);
    info!("   Elapsed: {:.1?}{}", summary.elapsed, if summary.cancelled { " (cancelled)" } else { "" });
}
