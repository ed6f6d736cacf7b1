//! Long-form rows emitted per ID and the attachment descriptors they come from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::item::ItemId;

/// One discovered attribute of one notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub run_id: u64,
    pub id: ItemId,
    pub section: String,
    pub key: String,
    pub value: String,
    pub document_index: Option<u32>,
}

/// Where the downloader can get an attachment's bytes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileHandle {
    Url(String),
    Local(PathBuf),
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Attachment descriptor produced by the parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// 1-based position among the notice's attachments
    pub ordinal: u32,
    pub filename: String,
    /// Lower-case extension without the dot; empty when the name has none
    pub extension: String,
    pub handle: FileHandle,
    pub document_index: u32,
    pub document_number: String,
}

impl FileRef {
    /// Extension of a published file name, lower-cased
    #[must_use]
    pub fn extension_of(filename: &str) -> String {
        std::path::Path::new(filename.trim())
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.len() <= 10 && ext.chars().all(char::is_alphanumeric))
            .map(str::to_lowercase)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Downloaded,
    Failed,
    Skipped,
}

/// One attachment outcome of one notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub run_id: u64,
    pub id: ItemId,
    pub ordinal: u32,
    pub filename: String,
    pub extension: String,
    pub stored_filename: String,
    pub local_path: String,
    pub download_url: String,
    pub document_index: u32,
    pub document_number: String,
    pub sha256: Option<String>,
    pub byte_size: u64,
    /// Guessed from the stored name; empty when unknown
    pub mime_type: String,
    /// Pages of a stored PDF, 0 for anything else
    pub page_count: u32,
    pub status: FileStatus,
    pub error: String,
}

impl FileEntry {
    /// Entry for an attachment that produced no file on disk
    #[must_use]
    pub fn without_file(run_id: u64, id: ItemId, file: &FileRef, status: FileStatus, error: impl Into<String>) -> Self {
        Self {
            run_id,
            id,
            ordinal: file.ordinal,
            filename: file.filename.clone(),
            extension: file.extension.clone(),
            stored_filename: String::new(),
            local_path: String::new(),
            download_url: file.handle.to_string(),
            document_index: file.document_index,
            document_number: file.document_number.clone(),
            sha256: None,
            byte_size: 0,
            mime_type: String::new(),
            page_count: 0,
            status,
            error: error.into(),
        }
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.status, FileStatus::Failed)
    }
}
