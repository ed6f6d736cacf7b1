//! # Collection worker
//!
//! A worker owns one browser session and walks its assigned IDs strictly
//! in order, one at a time: general information page, document page,
//! attachments, commit. Faults are contained at the per-ID boundary.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::crawling::state::{CollectorState, CommitOutcome, ItemOutcome};
use crate::domain::{AttributeEntry, ErrorKind, FileEntry, FileHandle, ItemId, ItemRecord, ItemStatus, PageKind};
use crate::infrastructure::config::{DataPaths, PacingConfig, UrlTemplates};
use crate::infrastructure::downloader::{Downloader, resolve_handle};
use crate::infrastructure::html_parser::{NoticeParser, ParsedPage};
use crate::infrastructure::output_sink::write_snapshot;
use crate::infrastructure::page_fetcher::{FetchError, PageFetcher};
use crate::infrastructure::session::{BrowserSession, SessionFactory};

/// Read-only pieces every worker of a run shares
pub struct WorkerContext {
    pub urls: UrlTemplates,
    pub paths: DataPaths,
    pub per_id_timeout: Duration,
    pub pacing: PacingConfig,
    pub save_html: bool,
    pub save_html_first_n: usize,
    pub fail_on_download_error: bool,
    pub fetcher: PageFetcher,
    pub parser: NoticeParser,
    pub downloader: Downloader,
    pub sessions: Arc<dyn SessionFactory>,
    pub state: Arc<CollectorState>,
}

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every assigned ID was handled
    Drained,
    /// Shutdown was requested; `remaining` were never started
    Cancelled { remaining: Vec<ItemId> },
    /// No session could be opened; `remaining` still need an owner
    SessionLost { remaining: Vec<ItemId>, error: String },
}

/// Result of one pass of the per-ID pipeline
struct Processed {
    outcome: ItemOutcome,
    session_fault: bool,
    missing_page: bool,
}

fn error_kind(error: &FetchError) -> ErrorKind {
    match error {
        FetchError::MissingPage { .. } => ErrorKind::MissingPage,
        FetchError::NotFound(_) => ErrorKind::SampleNotFound,
        FetchError::Timeout { .. } => ErrorKind::FetchTimeout,
        FetchError::Session(_) => ErrorKind::Session,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

fn attribute_rows(run_id: u64, id: ItemId, page: &ParsedPage) -> Vec<AttributeEntry> {
    page.attributes
        .iter()
        .map(|attribute| AttributeEntry {
            run_id,
            id,
            section: attribute.section.clone(),
            key: attribute.key.clone(),
            value: attribute.value.clone(),
            document_index: attribute.document_index,
        })
        .collect()
}

/// Uniformly random duration in `[min, max]`
fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(fastrand::u64(0..=span))
}

pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    session: Option<Box<dyn BrowserSession>>,
    handled: usize,
}

impl Worker {
    #[must_use]
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self {
            id,
            ctx,
            session: None,
            handled: 0,
        }
    }

    /// Processes `ids` in order until drained, cancelled or sessionless
    pub async fn run(mut self, ids: Vec<ItemId>) -> WorkerExit {
        let token = self.ctx.state.cancellation_token.clone();
        info!("👷 Worker {} starting with {} IDs", self.id, ids.len());

        for (index, &id) in ids.iter().enumerate() {
            if token.is_cancelled() {
                info!("🛑 Worker {} stopping: {} IDs left unstarted", self.id, ids.len() - index);
                self.shutdown().await;
                return WorkerExit::Cancelled {
                    remaining: ids[index..].to_vec(),
                };
            }

            if self.session.is_none() {
                match self.ctx.sessions.open(self.id).await {
                    Ok(session) => self.session = Some(session),
                    Err(e) => {
                        error!("❌ Worker {} could not open a session: {}", self.id, e);
                        return WorkerExit::SessionLost {
                            remaining: ids[index..].to_vec(),
                            error: e.to_string(),
                        };
                    }
                }
            }

            let started = Instant::now();
            let attempt = AssertUnwindSafe(self.process(id)).catch_unwind();
            let result = tokio::select! {
                result = attempt => Some(result),
                () = token.cancelled() => None,
            };

            let missing_page = match result {
                Some(Ok(processed)) => {
                    if processed.session_fault {
                        self.restart_session().await;
                    }
                    self.commit(&processed.outcome).await;
                    processed.missing_page
                }
                Some(Err(payload)) => {
                    let message = panic_message(payload.as_ref());
                    error!("💥 Worker {} crashed on {}: {}", self.id, id, message);
                    self.restart_session().await;
                    let mut record = ItemRecord::pending(id, self.ctx.urls.for_id(id));
                    record.fail(ErrorKind::Crashed, message);
                    self.commit(&ItemOutcome {
                        worker_id: self.id,
                        record,
                        attributes: Vec::new(),
                        files: Vec::new(),
                    })
                    .await;
                    false
                }
                None => {
                    warn!("🛑 Worker {} aborted {} on shutdown", self.id, id);
                    self.ctx.state.defer(id, ErrorKind::Cancelled.as_str()).await;
                    self.shutdown().await;
                    return WorkerExit::Cancelled {
                        remaining: ids[index + 1..].to_vec(),
                    };
                }
            };
            self.handled += 1;
            debug!("Worker {} finished {} in {:?}", self.id, id, started.elapsed());

            if index + 1 < ids.len() {
                self.pace(missing_page).await;
            }
        }

        self.shutdown().await;
        info!("🏁 Worker {} drained its {} IDs", self.id, ids.len());
        WorkerExit::Drained
    }

    async fn commit(&self, outcome: &ItemOutcome) {
        let id = outcome.record.id;
        match self.ctx.state.commit(outcome).await {
            Ok(CommitOutcome::Completed(status)) => info!("✅ [worker {}] {} -> {}", self.id, id, status),
            Ok(CommitOutcome::Requeued { attempts }) => {
                warn!("🔄 [worker {}] {} failed (attempt {}): {}", self.id, id, attempts, outcome.record.error);
            }
            Ok(CommitOutcome::Exhausted { attempts }) => {
                error!("⛔ [worker {}] {} failed permanently after {} attempts", self.id, id, attempts);
            }
            Err(e) => error!("❌ [worker {}] could not persist {}: {}", self.id, id, e),
        }
    }

    async fn restart_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        match self.ctx.sessions.open(self.id).await {
            Ok(session) => {
                info!("🔁 Worker {} restarted its session", self.id);
                self.session = Some(session);
            }
            // Reopened lazily before the next ID
            Err(e) => warn!("Worker {} session restart failed: {}", self.id, e),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    /// Polite delay before the next ID; cut short by shutdown
    async fn pace(&self, missing_page: bool) {
        let pacing = &self.ctx.pacing;
        let delay = if missing_page {
            jitter(pacing.missing_min, pacing.missing_max)
        } else if pacing.long_sleep_every > 0 && self.handled % pacing.long_sleep_every == 0 {
            let pause = jitter(pacing.long_sleep_min, pacing.long_sleep_max);
            info!("☕ Worker {} taking a long pause of {:?}", self.id, pause);
            pause
        } else {
            jitter(pacing.sleep_min, pacing.sleep_max)
        };
        if delay.is_zero() {
            return;
        }
        debug!("Worker {} sleeping {:?}", self.id, delay);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = self.ctx.state.cancellation_token.cancelled() => {}
        }
    }

    fn wants_snapshot(&self, status: ItemStatus) -> bool {
        self.ctx.save_html || self.handled < self.ctx.save_html_first_n || status != ItemStatus::Success
    }

    async fn save_snapshots(&self, id: ItemId, pages: &[(PageKind, String)]) {
        for (kind, markup) in pages {
            match write_snapshot(&self.ctx.paths.raw_html, id, *kind, markup).await {
                Ok(path) => debug!("Saved snapshot {:?}", path),
                Err(e) => warn!("Failed to save {} snapshot for {}: {}", kind, id, e),
            }
        }
    }

    /// General page, document page, attachments
    async fn process(&mut self, id: ItemId) -> Processed {
        let ctx = Arc::clone(&self.ctx);
        let run_id = ctx.state.run_id;
        let page_urls = ctx.urls.for_id(id);
        let mut record = ItemRecord::pending(id, page_urls.clone());
        let deadline = Instant::now() + ctx.per_id_timeout;
        let mut attributes = Vec::new();
        let mut files: Vec<FileEntry> = Vec::new();
        let mut pages = Vec::new();
        let mut session_fault = false;
        let mut missing_page = false;

        let Some(session) = self.session.as_deref_mut() else {
            record.fail(ErrorKind::Session, "no open session");
            return Processed {
                outcome: ItemOutcome {
                    worker_id: self.id,
                    record,
                    attributes,
                    files,
                },
                session_fault: true,
                missing_page,
            };
        };

        'pipeline: {
            let general = match ctx.fetcher.fetch(session, id, PageKind::GeneralInfo, deadline).await {
                Ok(markup) => markup,
                Err(e) => {
                    missing_page = e.is_terminal();
                    session_fault = matches!(&e, FetchError::Session(inner) if inner.requires_restart());
                    record.fail(error_kind(&e), e.to_string());
                    break 'pipeline;
                }
            };
            let page = ctx.parser.parse(&general, PageKind::GeneralInfo);
            attributes.extend(attribute_rows(run_id, id, &page));
            record.warnings.extend(page.warnings.iter().map(ToString::to_string));
            pages.push((PageKind::GeneralInfo, general));

            let documents = match ctx.fetcher.fetch(session, id, PageKind::Documents, deadline).await {
                Ok(markup) => markup,
                Err(e) if e.is_terminal() => {
                    missing_page = true;
                    record.warnings.push(format!("{}: page does not exist", PageKind::Documents));
                    record.fail(ErrorKind::MissingDocumentPage, e.to_string());
                    break 'pipeline;
                }
                Err(e) => {
                    session_fault = matches!(&e, FetchError::Session(inner) if inner.requires_restart());
                    record.fail(error_kind(&e), e.to_string());
                    break 'pipeline;
                }
            };
            let mut page = ctx.parser.parse(&documents, PageKind::Documents);
            attributes.extend(attribute_rows(run_id, id, &page));
            record.warnings.extend(page.warnings.iter().map(ToString::to_string));
            pages.push((PageKind::Documents, documents));

            ctx.fetcher.localize_files(id, &mut page.files).await;
            for file in &mut page.files {
                if matches!(file.handle, FileHandle::Url(_)) {
                    file.handle = resolve_handle(&file.handle, &page_urls.documents);
                }
            }
            files = ctx
                .downloader
                .download_all(session, run_id, id, &page.files, &ctx.paths.attachment_dir(id))
                .await;

            let failed = files.iter().filter(|f| f.is_failed()).count();
            if failed > 0 && ctx.fail_on_download_error {
                record.fail(ErrorKind::Download, format!("{failed} of {} attachments failed", files.len()));
            } else {
                record.succeed();
            }
        }

        if self.wants_snapshot(record.status) {
            self.save_snapshots(id, &pages).await;
        }

        Processed {
            outcome: ItemOutcome {
                worker_id: self.id,
                record,
                attributes,
                files,
            },
            session_fault,
            missing_page,
        }
    }
}
