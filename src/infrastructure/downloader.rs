//! Attachment downloader with a hard ceiling and a stall detector
//!
//! Bytes are streamed from the worker's session into
//! `<dest>/<id>_<ordinal>.<ext>.part` and renamed once complete, so a
//! crash never leaves a truncated file under the final name.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::{FileEntry, FileHandle, FileRef, FileStatus, ItemId};
use crate::infrastructure::session::{BrowserSession, DownloadStream, SessionError};

const FALLBACK_EXTENSION: &str = "bin";

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("No progress for {0:?}")]
    Stalled(Duration),

    #[error("Download exceeded {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(SessionError),

    #[error("Downloaded file is empty")]
    Empty,

    #[error("Not available in this session: {0}")]
    Unavailable(String),
}

impl From<SessionError> for DownloadError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Unsupported(handle) => Self::Unavailable(handle),
            SessionError::Io(e) => Self::Io(e),
            other => Self::Session(other),
        }
    }
}

impl DownloadError {
    /// Status recorded in the file table for this failure
    #[must_use]
    pub const fn file_status(&self) -> FileStatus {
        match self {
            Self::Unavailable(_) => FileStatus::Skipped,
            _ => FileStatus::Failed,
        }
    }
}

/// Time budget for one attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPolicy {
    pub timeout: Duration,
    pub stall: Duration,
    /// Re-download files that already exist on disk
    pub overwrite: bool,
}

/// Makes a relative attachment link absolute against the page it was found on
#[must_use]
pub fn resolve_handle(handle: &FileHandle, page_url: &str) -> FileHandle {
    match handle {
        FileHandle::Url(href) => Url::parse(page_url)
            .and_then(|base| base.join(href))
            .map(|url| FileHandle::Url(url.to_string()))
            .unwrap_or_else(|_| handle.clone()),
        FileHandle::Local(_) => handle.clone(),
    }
}

fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

fn mime_type_of(stored_filename: &str) -> String {
    mime_guess::from_path(stored_filename)
        .first()
        .map(|mime| mime.essence_str().to_owned())
        .unwrap_or_default()
}

fn is_pdf(extension: &str) -> bool {
    extension.eq_ignore_ascii_case("pdf")
}

/// Pages of a PDF document; 0 when it cannot be read
async fn pdf_page_count(bytes: Vec<u8>) -> u32 {
    let counted =
        tokio::task::spawn_blocking(move || lopdf::Document::load_mem(&bytes).map(|doc| doc.get_pages().len())).await;
    match counted {
        Ok(Ok(pages)) => pages as u32,
        Ok(Err(e)) => {
            debug!("Could not count PDF pages: {}", e);
            0
        }
        Err(e) => {
            warn!("PDF page count task failed: {}", e);
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    policy: DownloadPolicy,
}

impl Downloader {
    #[must_use]
    pub const fn new(policy: DownloadPolicy) -> Self {
        Self { policy }
    }

    /// Downloads every attachment of one notice; each outcome is independent
    pub async fn download_all(
        &self,
        session: &mut dyn BrowserSession,
        run_id: u64,
        id: ItemId,
        files: &[FileRef],
        dest_dir: &Path,
    ) -> Vec<FileEntry> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let entry = match self.download(session, run_id, id, file, dest_dir).await {
                Ok(entry) => entry,
                Err(e) => {
                    let status = e.file_status();
                    match status {
                        FileStatus::Skipped => debug!("⏭️ {} file {} skipped: {}", id, file.ordinal, e),
                        _ => warn!("❌ {} file {} failed: {}", id, file.ordinal, e),
                    }
                    FileEntry::without_file(run_id, id, file, status, e.to_string())
                }
            };
            entries.push(entry);
        }
        entries
    }

    /// Downloads one attachment into `dest_dir`
    pub async fn download(
        &self,
        session: &mut dyn BrowserSession,
        run_id: u64,
        id: ItemId,
        file: &FileRef,
        dest_dir: &Path,
    ) -> Result<FileEntry, DownloadError> {
        let deadline = Instant::now() + self.policy.timeout;
        let known_extension = (!file.extension.is_empty()).then(|| file.extension.clone());

        if let Some(extension) = &known_extension {
            if let Some(entry) = self.existing(run_id, id, file, dest_dir, extension).await? {
                return Ok(entry);
            }
        }

        let wait = self.next_wait(deadline)?;
        let stream = match tokio::time::timeout(wait, session.wait_for_download(&file.handle)).await {
            Ok(result) => result?,
            Err(_) => return Err(self.expired(wait)),
        };

        let extension = known_extension
            .or_else(|| {
                stream
                    .suggested_name
                    .as_deref()
                    .map(FileRef::extension_of)
                    .filter(|ext| !ext.is_empty())
            })
            .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
        if file.extension.is_empty() {
            if let Some(entry) = self.existing(run_id, id, file, dest_dir, &extension).await? {
                return Ok(entry);
            }
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let stored_filename = format!("{id}_{}.{extension}", file.ordinal);
        let target = dest_dir.join(&stored_filename);
        let partial = dest_dir.join(format!("{stored_filename}.part"));

        let (sha256, byte_size) = match self.stream_to(stream, &partial, deadline).await {
            Ok(done) => done,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &target).await?;
        info!("📥 {} file {} saved ({} bytes) -> {:?}", id, file.ordinal, byte_size, target);

        let page_count = if is_pdf(&extension) {
            pdf_page_count(tokio::fs::read(&target).await?).await
        } else {
            0
        };

        Ok(FileEntry {
            mime_type: mime_type_of(&stored_filename),
            page_count,
            stored_filename,
            local_path: target.display().to_string(),
            sha256: Some(sha256),
            byte_size,
            status: FileStatus::Downloaded,
            error: String::new(),
            extension,
            ..FileEntry::without_file(run_id, id, file, FileStatus::Downloaded, "")
        })
    }

    /// Waits for the next event: never past the ceiling, never longer than the stall window
    fn next_wait(&self, deadline: Instant) -> Result<Duration, DownloadError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DownloadError::Timeout(self.policy.timeout));
        }
        Ok(remaining.min(self.policy.stall))
    }

    /// A wait shorter than the stall window was cut by the ceiling
    fn expired(&self, wait: Duration) -> DownloadError {
        if wait < self.policy.stall {
            DownloadError::Timeout(self.policy.timeout)
        } else {
            DownloadError::Stalled(self.policy.stall)
        }
    }

    async fn stream_to(
        &self,
        mut stream: DownloadStream,
        partial: &Path,
        deadline: Instant,
    ) -> Result<(String, u64), DownloadError> {
        let mut out = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut byte_size = 0_u64;

        loop {
            let wait = self.next_wait(deadline)?;
            match tokio::time::timeout(wait, stream.chunks.next()).await {
                Ok(Some(Ok(chunk))) => {
                    hasher.update(&chunk);
                    out.write_all(&chunk).await?;
                    byte_size += chunk.len() as u64;
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => break,
                Err(_) => return Err(self.expired(wait)),
            }
        }
        out.flush().await?;

        if byte_size == 0 {
            return Err(DownloadError::Empty);
        }
        Ok((hex_digest(hasher), byte_size))
    }

    /// Entry for a file already stored by an earlier run, unless overwriting
    async fn existing(
        &self,
        run_id: u64,
        id: ItemId,
        file: &FileRef,
        dest_dir: &Path,
        extension: &str,
    ) -> Result<Option<FileEntry>, DownloadError> {
        if self.policy.overwrite {
            return Ok(None);
        }
        let stored_filename = format!("{id}_{}.{extension}", file.ordinal);
        let target: PathBuf = dest_dir.join(&stored_filename);
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&target).await?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let byte_size = bytes.len() as u64;
        let page_count = if is_pdf(extension) { pdf_page_count(bytes).await } else { 0 };
        debug!("{} file {} already present at {:?}", id, file.ordinal, target);

        Ok(Some(FileEntry {
            extension: extension.to_string(),
            mime_type: mime_type_of(&stored_filename),
            page_count,
            stored_filename,
            local_path: target.display().to_string(),
            sha256: Some(hex_digest(hasher)),
            byte_size,
            ..FileEntry::without_file(run_id, id, file, FileStatus::Skipped, "already exists")
        }))
    }
}
