//! Browser session capability
//!
//! The collection pipeline only talks to a `BrowserSession`: navigate to a
//! page, follow an element, receive a download stream, close. Each worker
//! owns exactly one session at a time and asks its `SessionFactory` for a
//! fresh one after a fault.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{Client, ClientBuilder, header};
use scraper::{Html, Selector};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::FileHandle;
use crate::infrastructure::config::SessionOptions;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to start session: {0}")]
    Startup(String),

    #[error("Session is closed")]
    Closed,

    #[error("Page did not settle within {0:?}")]
    Timeout(Duration),

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("No element matches {0}")]
    NoMatch(String),

    #[error("Handle cannot be served by this session: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the session itself is unusable and must be reopened
    #[must_use]
    pub const fn requires_restart(&self) -> bool {
        matches!(self, Self::Startup(_) | Self::Closed)
    }
}

/// Byte stream of one attachment as delivered by the session
pub struct DownloadStream {
    /// File name announced by the server, if any
    pub suggested_name: Option<String>,
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, SessionError>>,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("suggested_name", &self.suggested_name)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigates to `url` and returns the markup once the page settled
    async fn fetch(&mut self, url: &str, settle: Duration) -> Result<String, SessionError>;

    /// Activates the first element matching `selector` on the current page
    async fn click(&mut self, selector: &str) -> Result<String, SessionError>;

    /// Starts retrieving the attachment behind `handle`
    async fn wait_for_download(&mut self, handle: &FileHandle) -> Result<DownloadStream, SessionError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, worker_id: usize) -> Result<Box<dyn BrowserSession>, SessionError>;
}

/// Streams a file that is already on local disk
pub async fn local_download(path: &Path) -> Result<DownloadStream, SessionError> {
    let file = tokio::fs::File::open(path).await?;
    let content_length = file.metadata().await.ok().map(|m| m.len());
    let suggested_name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
    Ok(DownloadStream {
        suggested_name,
        content_length,
        chunks: ReaderStream::new(file).map_err(SessionError::from).boxed(),
    })
}

lazy_static! {
    static ref DISPOSITION_FILENAME: Option<Regex> =
        Regex::new(r#"(?i)filename\*?\s*=\s*(?:UTF-8'')?"?([^";]+)"?"#).ok();
}

/// File name from a `Content-Disposition` header value
fn disposition_filename(value: &str) -> Option<String> {
    DISPOSITION_FILENAME
        .as_ref()?
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Live session over plain HTTP with a persistent cookie jar
///
/// Pages are served fully rendered by the registry, so the session is always
/// headless and never requests images.
pub struct HttpSession {
    client: Client,
    worker_id: usize,
    current: Option<(Url, String)>,
    settle: Duration,
    closed: bool,
}

impl HttpSession {
    pub fn new(options: &SessionOptions, worker_id: usize) -> Result<Self, SessionError> {
        let client = ClientBuilder::new()
            .user_agent(&options.user_agent)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| SessionError::Startup(e.to_string()))?;

        Ok(Self {
            client,
            worker_id,
            current: None,
            settle: Duration::from_secs(crate::infrastructure::config::defaults::PER_ID_TIMEOUT_SECONDS),
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed { Err(SessionError::Closed) } else { Ok(()) }
    }

    /// Absolute URL for `href`, relative to the current page when needed
    fn absolute(&self, href: &str) -> Result<Url, SessionError> {
        let parsed = match &self.current {
            Some((base, _)) => base.join(href),
            None => Url::parse(href),
        };
        parsed.map_err(|e| SessionError::Request {
            url: href.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, SessionError> {
        debug!("🌐 [worker {}] GET {}", self.worker_id, url);
        let response = self.client.get(url.clone()).send().await.map_err(|e| SessionError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            warn!("❌ [worker {}] HTTP {} from {}", self.worker_id, status, url);
            return Err(SessionError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn load(&mut self, url: Url, settle: Duration) -> Result<String, SessionError> {
        let request = async {
            let response = self.get(url.clone()).await?;
            let final_url = response.url().clone();
            let body = response.text().await.map_err(|e| SessionError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok::<_, SessionError>((final_url, body))
        };
        let (final_url, body) = tokio::time::timeout(settle, request)
            .await
            .map_err(|_| SessionError::Timeout(settle))??;
        self.current = Some((final_url, body.clone()));
        Ok(body)
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn fetch(&mut self, url: &str, settle: Duration) -> Result<String, SessionError> {
        self.ensure_open()?;
        let url = Url::parse(url).map_err(|e| SessionError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.settle = settle;
        self.load(url, settle).await
    }

    async fn click(&mut self, selector: &str) -> Result<String, SessionError> {
        self.ensure_open()?;
        let href = {
            let (_, markup) = self.current.as_ref().ok_or_else(|| SessionError::NoMatch(selector.to_string()))?;
            let parsed = Selector::parse(selector).map_err(|_| SessionError::NoMatch(selector.to_string()))?;
            let document = Html::parse_document(markup);
            document
                .select(&parsed)
                .find_map(|el| el.value().attr("href").map(str::to_string))
                .ok_or_else(|| SessionError::NoMatch(selector.to_string()))?
        };
        let target = self.absolute(&href)?;
        self.load(target, self.settle).await
    }

    async fn wait_for_download(&mut self, handle: &FileHandle) -> Result<DownloadStream, SessionError> {
        self.ensure_open()?;
        let url = match handle {
            FileHandle::Local(path) => return local_download(path).await,
            FileHandle::Url(href) => self.absolute(href)?,
        };

        let response = self.get(url).await?;
        let suggested_name = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_filename);
        let content_length = response.content_length();
        let source = response.url().to_string();
        let chunks = response
            .bytes_stream()
            .map_err(move |e| SessionError::Request {
                url: source.clone(),
                reason: e.to_string(),
            })
            .boxed();

        Ok(DownloadStream {
            suggested_name,
            content_length,
            chunks,
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            debug!("🔒 [worker {}] Session closed", self.worker_id);
        }
        self.closed = true;
        self.current = None;
    }
}

/// Opens one `HttpSession` per worker
pub struct HttpSessionFactory {
    options: SessionOptions,
}

impl HttpSessionFactory {
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, worker_id: usize) -> Result<Box<dyn BrowserSession>, SessionError> {
        info!(
            "🚀 [worker {}] Opening HTTP session (headless={}, block_images={})",
            worker_id, self.options.headless, self.options.block_images
        );
        Ok(Box::new(HttpSession::new(&self.options, worker_id)?))
    }
}

/// Session for offline runs: serves local files only
#[derive(Debug, Default)]
pub struct OfflineSession {
    closed: bool,
}

#[async_trait]
impl BrowserSession for OfflineSession {
    async fn fetch(&mut self, url: &str, _settle: Duration) -> Result<String, SessionError> {
        Err(SessionError::Unsupported(url.to_string()))
    }

    async fn click(&mut self, selector: &str) -> Result<String, SessionError> {
        Err(SessionError::NoMatch(selector.to_string()))
    }

    async fn wait_for_download(&mut self, handle: &FileHandle) -> Result<DownloadStream, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        match handle {
            FileHandle::Local(path) => local_download(path).await,
            FileHandle::Url(url) => Err(SessionError::Unsupported(url.clone())),
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Default)]
pub struct OfflineSessionFactory;

#[async_trait]
impl SessionFactory for OfflineSessionFactory {
    async fn open(&self, worker_id: usize) -> Result<Box<dyn BrowserSession>, SessionError> {
        debug!("[worker {}] Offline session opened", worker_id);
        Ok(Box::new(OfflineSession::default()))
    }
}
