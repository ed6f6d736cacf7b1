//! Retrieval of the two pages of a notice
//!
//! Offline runs read pre-saved samples; live runs drive the worker's
//! browser session. Both report the registry's "page does not exist"
//! stub as `FetchError::MissingPage`, and so does a live 404 or 410.
//! The per-ID deadline is checked before every page in both modes.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{FileHandle, FileRef, ItemId, PageKind};
use crate::infrastructure::config::{RunMode, UrlTemplates};
use crate::infrastructure::html_parser::is_missing_page;
use crate::infrastructure::session::{BrowserSession, SessionError};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Page does not exist: {kind} for {id}")]
    MissingPage { id: ItemId, kind: PageKind },

    #[error("Sample not found: {0}")]
    NotFound(PathBuf),

    #[error("Page {kind} for {id} did not settle within {timeout:?}")]
    Timeout { id: ItemId, kind: PageKind, timeout: Duration },

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl FetchError {
    /// Terminal outcomes are never retried
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::MissingPage { .. })
    }
}

/// Fetches notice pages for one worker
#[derive(Debug, Clone)]
pub struct PageFetcher {
    mode: RunMode,
    samples_dir: PathBuf,
    urls: UrlTemplates,
}

impl PageFetcher {
    #[must_use]
    pub fn new(mode: RunMode, samples_dir: PathBuf, urls: UrlTemplates) -> Self {
        Self { mode, samples_dir, urls }
    }

    #[must_use]
    pub fn sample_path(&self, id: ItemId, kind: PageKind) -> PathBuf {
        self.samples_dir.join(kind.snapshot_name(id))
    }

    /// Returns the markup of `kind` for `id`, bounded by `deadline`
    pub async fn fetch(
        &self,
        session: &mut dyn BrowserSession,
        id: ItemId,
        kind: PageKind,
        deadline: Instant,
    ) -> Result<String, FetchError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FetchError::Timeout { id, kind, timeout: remaining });
        }

        let markup = match self.mode {
            RunMode::Offline => self.read_sample(id, kind).await?,
            RunMode::Live => self.fetch_live(session, id, kind, remaining).await?,
        };

        if is_missing_page(&markup) {
            debug!("🚫 {} for {} reports a missing page", kind, id);
            return Err(FetchError::MissingPage { id, kind });
        }
        Ok(markup)
    }

    async fn read_sample(&self, id: ItemId, kind: PageKind) -> Result<String, FetchError> {
        let path = self.sample_path(id, kind);
        match tokio::fs::read_to_string(&path).await {
            Ok(markup) => Ok(markup),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound(path)),
            Err(e) => {
                warn!("Failed to read sample {:?}: {}", path, e);
                Err(FetchError::Session(SessionError::Io(e)))
            }
        }
    }

    async fn fetch_live(
        &self,
        session: &mut dyn BrowserSession,
        id: ItemId,
        kind: PageKind,
        remaining: Duration,
    ) -> Result<String, FetchError> {
        let urls = self.urls.for_id(id);
        let url = urls.get(kind);
        debug!("Fetching {} for {} from {}", kind, id, url);

        match tokio::time::timeout(remaining, session.fetch(url, remaining)).await {
            Ok(Ok(markup)) => Ok(markup),
            Ok(Err(SessionError::Timeout(_))) | Err(_) => Err(FetchError::Timeout {
                id,
                kind,
                timeout: remaining,
            }),
            Ok(Err(SessionError::Status { status: 404 | 410, .. })) => {
                debug!("🚫 {} for {} answered as gone", kind, id);
                Err(FetchError::MissingPage { id, kind })
            }
            Ok(Err(e)) => Err(FetchError::Session(e)),
        }
    }

    /// Points attachments at files already stored next to the offline samples
    ///
    /// Files are looked up as `samples/attachments/<id>/<published name>`;
    /// anything not found keeps its URL handle.
    pub async fn localize_files(&self, id: ItemId, files: &mut [FileRef]) {
        if self.mode != RunMode::Offline {
            return;
        }
        let dir = self.samples_dir.join("attachments").join(id.to_string());
        for file in files.iter_mut() {
            if file.filename.is_empty() || file.filename.contains(['/', '\\']) {
                continue;
            }
            let candidate = dir.join(&file.filename);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                file.handle = FileHandle::Local(candidate);
            }
        }
    }
}
