//! # Notice identity and per-ID record
//!
//! An `ItemId` names one bank-guarantee notice. Its `ItemRecord` is the
//! single logical record the owning worker mutates while processing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric notice identifier, unique across every table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ItemId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl FromStr for ItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two pages published for every notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    GeneralInfo,
    Documents,
}

impl PageKind {
    /// Stem used for sample files and html snapshots (`<stem>_<id>.html`)
    #[must_use]
    pub const fn file_stem(self) -> &'static str {
        match self {
            Self::GeneralInfo => "generalInformation",
            Self::Documents => "document-info",
        }
    }

    #[must_use]
    pub fn snapshot_name(self, id: ItemId) -> String {
        format!("{}_{id}.html", self.file_stem())
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Lifecycle of one ID inside a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl ItemStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an ID did not reach `success`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingPage,
    MissingDocumentPage,
    SampleNotFound,
    FetchTimeout,
    Session,
    Download,
    Crashed,
    Cancelled,
}

impl ErrorKind {
    /// Whether an ID failing this way goes back through the retry queue
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::MissingPage | Self::MissingDocumentPage)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingPage => "missing_page",
            Self::MissingDocumentPage => "missing_document_page",
            Self::SampleNotFound => "sample_not_found",
            Self::FetchTimeout => "fetch_timeout",
            Self::Session => "session",
            Self::Download => "download",
            Self::Crashed => "crashed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical page URLs for one ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageUrls {
    pub general: String,
    pub documents: String,
}

impl PageUrls {
    #[must_use]
    pub fn get(&self, kind: PageKind) -> &str {
        match kind {
            PageKind::GeneralInfo => &self.general,
            PageKind::Documents => &self.documents,
        }
    }
}

/// One logical record per ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub status: ItemStatus,
    pub fetched_at: DateTime<Utc>,
    pub page_urls: PageUrls,
    pub error_kind: Option<ErrorKind>,
    pub error: String,
    pub warnings: Vec<String>,
}

impl ItemRecord {
    /// Record created on the first fetch attempt
    #[must_use]
    pub fn pending(id: ItemId, page_urls: PageUrls) -> Self {
        Self {
            id,
            status: ItemStatus::Pending,
            fetched_at: Utc::now(),
            page_urls,
            error_kind: None,
            error: String::new(),
            warnings: Vec::new(),
        }
    }

    pub fn succeed(&mut self) {
        self.status = ItemStatus::Success;
        self.error_kind = None;
    }

    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.status = if kind.is_retryable() {
            ItemStatus::Failed
        } else {
            ItemStatus::Skipped
        };
        self.error_kind = Some(kind);
        self.error = message.into();
    }

    #[must_use]
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self.status, ItemStatus::Failed)
            && matches!(self.error_kind, Some(kind) if kind.is_retryable())
    }
}
