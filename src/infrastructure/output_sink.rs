//! Tabular output: metadata, long-form attributes and long-form files
//!
//! Each table is a CSV file under `processed/`. A commit for an ID first
//! drops any rows that ID already has, then appends the new ones, so a
//! reprocessed ID is replaced rather than duplicated. Every commit reaches
//! the disk before it returns.

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::domain::{AttributeEntry, ErrorKind, FileEntry, ItemId, ItemRecord, ItemStatus, PageKind};

pub const METADATA_TABLE: &str = "metadata.csv";
pub const ATTRIBUTES_TABLE: &str = "attributes.csv";
pub const FILES_TABLE: &str = "files.csv";

const METADATA_COLUMNS: &[&str] = &[
    "run_id",
    "id",
    "worker_id",
    "status",
    "fetched_at",
    "general_url",
    "documents_url",
    "error_kind",
    "error",
    "warnings",
];

const ATTRIBUTE_COLUMNS: &[&str] = &["run_id", "id", "section", "key", "value", "document_index"];

const FILE_COLUMNS: &[&str] = &[
    "run_id",
    "id",
    "ordinal",
    "filename",
    "extension",
    "stored_filename",
    "local_path",
    "download_url",
    "document_index",
    "document_number",
    "sha256",
    "byte_size",
    "mime_type",
    "page_count",
    "status",
    "error",
];

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Table {path:?} has no id column")]
    MissingIdColumn { path: PathBuf },
}

impl SinkError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: impl Into<csv::Error>) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}

pub type SinkResult<T> = Result<T, SinkError>;

/// One row of the metadata table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub run_id: u64,
    pub id: ItemId,
    pub worker_id: usize,
    pub status: ItemStatus,
    pub fetched_at: DateTime<Utc>,
    pub general_url: String,
    pub documents_url: String,
    pub error_kind: Option<ErrorKind>,
    pub error: String,
    /// JSON list of parse warnings
    pub warnings: String,
}

impl MetadataRow {
    #[must_use]
    pub fn from_record(run_id: u64, worker_id: usize, record: &ItemRecord) -> Self {
        Self {
            run_id,
            id: record.id,
            worker_id,
            status: record.status,
            fetched_at: record.fetched_at,
            general_url: record.page_urls.general.clone(),
            documents_url: record.page_urls.documents.clone(),
            error_kind: record.error_kind,
            error: record.error.clone(),
            warnings: serde_json::to_string(&record.warnings).unwrap_or_else(|_| "[]".to_string()),
        }
    }
}

#[derive(Debug)]
struct Table {
    path: PathBuf,
    ids: HashSet<ItemId>,
}

impl Table {
    async fn open(path: PathBuf, columns: &'static [&'static str]) -> SinkResult<Self> {
        let existing = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SinkError::io(&path, e)),
        };
        let ids = if existing.is_empty() {
            fs::write(&path, header_line(&path, columns)?)
                .await
                .map_err(|e| SinkError::io(&path, e))?;
            HashSet::new()
        } else {
            ids_in(&path, &existing)?
        };
        Ok(Self { path, ids })
    }

    /// Rewrites the table without the rows of `id`
    async fn remove(&mut self, id: ItemId) -> SinkResult<()> {
        if !self.ids.remove(&id) {
            return Ok(());
        }
        let bytes = fs::read(&self.path).await.map_err(|e| SinkError::io(&self.path, e))?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes.as_slice());
        let headers = reader.headers().map_err(|e| SinkError::csv(&self.path, e))?.clone();
        let id_column = id_column(&self.path, &headers)?;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        writer.write_record(&headers).map_err(|e| SinkError::csv(&self.path, e))?;
        let target = id.to_string();
        for record in reader.records() {
            let record = record.map_err(|e| SinkError::csv(&self.path, e))?;
            if record.get(id_column) != Some(target.as_str()) {
                writer.write_record(&record).map_err(|e| SinkError::csv(&self.path, e))?;
            }
        }
        let body = writer.into_inner().map_err(|e| SinkError::csv(&self.path, e.into_error()))?;

        let tmp = self.path.with_extension("csv.tmp");
        fs::write(&tmp, body).await.map_err(|e| SinkError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).await.map_err(|e| SinkError::io(&self.path, e))?;
        debug!("Replaced prior rows of {} in {:?}", id, self.path);
        Ok(())
    }

    async fn append<T: Serialize>(&mut self, id: ItemId, rows: &[T]) -> SinkResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        for row in rows {
            writer.serialize(row).map_err(|e| SinkError::csv(&self.path, e))?;
        }
        let body = writer.into_inner().map_err(|e| SinkError::csv(&self.path, e.into_error()))?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SinkError::io(&self.path, e))?;
        file.write_all(&body).await.map_err(|e| SinkError::io(&self.path, e))?;
        file.flush().await.map_err(|e| SinkError::io(&self.path, e))?;
        self.ids.insert(id);
        Ok(())
    }
}

fn header_line(path: &Path, columns: &[&str]) -> SinkResult<Vec<u8>> {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(columns).map_err(|e| SinkError::csv(path, e))?;
    writer.into_inner().map_err(|e| SinkError::csv(path, e.into_error()))
}

fn id_column(path: &Path, headers: &StringRecord) -> SinkResult<usize> {
    headers
        .iter()
        .position(|h| h == "id")
        .ok_or_else(|| SinkError::MissingIdColumn { path: path.to_path_buf() })
}

fn ids_in(path: &Path, bytes: &[u8]) -> SinkResult<HashSet<ItemId>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers = reader.headers().map_err(|e| SinkError::csv(path, e))?.clone();
    let column = id_column(path, &headers)?;
    let mut ids = HashSet::new();
    for record in reader.records() {
        let record = record.map_err(|e| SinkError::csv(path, e))?;
        if let Some(id) = record.get(column).and_then(|raw| raw.parse::<ItemId>().ok()) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Reads every row of a table written by the sink
pub async fn read_table<T: DeserializeOwned>(path: &Path) -> SinkResult<Vec<T>> {
    let bytes = fs::read(path).await.map_err(|e| SinkError::io(path, e))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes.as_slice());
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| SinkError::csv(path, e))
}

/// The three output tables
#[derive(Debug)]
pub struct OutputSink {
    metadata: Table,
    attributes: Table,
    files: Table,
}

impl OutputSink {
    /// Opens (creating when needed) the tables under `processed_dir`
    pub async fn open(processed_dir: &Path) -> SinkResult<Self> {
        fs::create_dir_all(processed_dir)
            .await
            .map_err(|e| SinkError::io(processed_dir, e))?;
        let sink = Self {
            metadata: Table::open(processed_dir.join(METADATA_TABLE), METADATA_COLUMNS).await?,
            attributes: Table::open(processed_dir.join(ATTRIBUTES_TABLE), ATTRIBUTE_COLUMNS).await?,
            files: Table::open(processed_dir.join(FILES_TABLE), FILE_COLUMNS).await?,
        };
        info!(
            "📊 Output tables ready: {} IDs with metadata in {:?}",
            sink.metadata.ids.len(),
            processed_dir
        );
        Ok(sink)
    }

    #[must_use]
    pub fn has_rows(&self, id: ItemId) -> bool {
        self.metadata.ids.contains(&id) || self.attributes.ids.contains(&id) || self.files.ids.contains(&id)
    }

    /// Replaces every row of `metadata.id` with the given rows
    ///
    /// Metadata is written first so attribute and file rows never exist
    /// without their item record.
    pub async fn commit(
        &mut self,
        metadata: &MetadataRow,
        attributes: &[AttributeEntry],
        files: &[FileEntry],
    ) -> SinkResult<()> {
        let id = metadata.id;
        self.metadata.remove(id).await?;
        self.attributes.remove(id).await?;
        self.files.remove(id).await?;

        self.metadata.append(id, std::slice::from_ref(metadata)).await?;
        self.attributes.append(id, attributes).await?;
        self.files.append(id, files).await?;
        debug!(
            "✅ {} committed: {} attributes, {} files",
            id,
            attributes.len(),
            files.len()
        );
        Ok(())
    }
}

/// Saves raw page markup as `<dir>/<stem>_<id>.html`
pub async fn write_snapshot(dir: &Path, id: ItemId, kind: PageKind, markup: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(kind.snapshot_name(id));
    fs::write(&path, markup).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FileStatus, PageUrls};
    use pretty_assertions::assert_eq;

    fn record(id: u64, status: ItemStatus) -> ItemRecord {
        let mut record = ItemRecord::pending(
            ItemId::new(id),
            PageUrls {
                general: format!("https://host/g?id={id}"),
                documents: format!("https://host/d?id={id}"),
            },
        );
        record.status = status;
        record.warnings.push("generalInformation: Section 'x' not found".to_string());
        record
    }

    fn attribute(run_id: u64, id: u64, key: &str, value: &str) -> AttributeEntry {
        AttributeEntry {
            run_id,
            id: ItemId::new(id),
            section: "Раздел, с запятой".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            document_index: None,
        }
    }

    fn file(run_id: u64, id: u64, ordinal: u32) -> FileEntry {
        FileEntry {
            run_id,
            id: ItemId::new(id),
            ordinal,
            filename: "a \"quoted\".pdf".to_string(),
            extension: "pdf".to_string(),
            stored_filename: format!("{id}_{ordinal}.pdf"),
            local_path: String::new(),
            download_url: "https://host/f".to_string(),
            document_index: 1,
            document_number: "7".to_string(),
            sha256: None,
            byte_size: 0,
            mime_type: String::new(),
            page_count: 0,
            status: FileStatus::Failed,
            error: "boom".to_string(),
        }
    }

    #[test]
    fn column_lists_match_row_layout() {
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        writer.serialize(attribute(1, 1, "k", "v")).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(text.starts_with(&ATTRIBUTE_COLUMNS.join(",")));

        let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        writer.serialize(file(1, 1, 1)).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(text.starts_with(&FILE_COLUMNS.join(",")));

        let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        writer
            .serialize(MetadataRow::from_record(1, 0, &record(1, ItemStatus::Success)))
            .unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(text.starts_with(&METADATA_COLUMNS.join(",")));
    }

    #[tokio::test]
    async fn commit_round_trips_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = OutputSink::open(dir.path()).await.unwrap();
        let meta = MetadataRow::from_record(1, 0, &record(10, ItemStatus::Success));
        sink.commit(&meta, &[attribute(1, 10, "x", "1"), attribute(1, 10, "y", "2")], &[file(1, 10, 1)])
            .await
            .unwrap();

        let metadata: Vec<MetadataRow> = read_table(&dir.path().join(METADATA_TABLE)).await.unwrap();
        assert_eq!(metadata, vec![meta]);
        let attributes: Vec<AttributeEntry> = read_table(&dir.path().join(ATTRIBUTES_TABLE)).await.unwrap();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].section, "Раздел, с запятой");
        let files: Vec<FileEntry> = read_table(&dir.path().join(FILES_TABLE)).await.unwrap();
        assert_eq!(files, vec![file(1, 10, 1)]);
    }

    #[tokio::test]
    async fn recommitting_an_id_replaces_its_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = OutputSink::open(dir.path()).await.unwrap();
        let first = MetadataRow::from_record(1, 0, &record(10, ItemStatus::Failed));
        let other = MetadataRow::from_record(1, 0, &record(11, ItemStatus::Success));
        sink.commit(&first, &[attribute(1, 10, "x", "old")], &[file(1, 10, 1)])
            .await
            .unwrap();
        sink.commit(&other, &[attribute(1, 11, "x", "keep")], &[]).await.unwrap();

        // A fresh sink sees the IDs written by the previous one
        let mut sink = OutputSink::open(dir.path()).await.unwrap();
        assert!(sink.has_rows(ItemId::new(10)));
        let second = MetadataRow::from_record(2, 1, &record(10, ItemStatus::Success));
        sink.commit(&second, &[attribute(2, 10, "x", "new")], &[]).await.unwrap();

        let metadata: Vec<MetadataRow> = read_table(&dir.path().join(METADATA_TABLE)).await.unwrap();
        assert_eq!(metadata, vec![other, second]);
        let attributes: Vec<AttributeEntry> = read_table(&dir.path().join(ATTRIBUTES_TABLE)).await.unwrap();
        let values: Vec<(u64, &str)> = attributes.iter().map(|a| (a.id.get(), a.value.as_str())).collect();
        assert_eq!(values, vec![(11, "keep"), (10, "new")]);
        let files: Vec<FileEntry> = read_table(&dir.path().join(FILES_TABLE)).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn snapshots_use_page_stems() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), ItemId::new(3), PageKind::Documents, "<html/>")
            .await
            .unwrap();
        assert!(path.ends_with("document-info_3.html"));
    }
}
