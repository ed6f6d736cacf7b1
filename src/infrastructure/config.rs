//! Configuration infrastructure
//!
//! Holds the run configuration assembled from the command line, the
//! defaults every knob falls back to, and the on-disk layout under the
//! data directory.
//!
//! Configuration is organized into three parts:
//! 1. What to collect (mode, ID selection, force/retry switches)
//! 2. How politely and how patiently (pacing, timeouts, workers)
//! 3. Where everything lands (`DataPaths`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::domain::{ItemId, PageUrls};

/// Default values for every configurable setting
pub mod defaults {
    /// Default data directory, relative to the working directory
    pub const DATA_DIR: &str = "data";

    /// Default polite delay range between IDs in seconds (live mode)
    pub const SLEEP_MIN_SECONDS: f64 = 5.0;
    pub const SLEEP_MAX_SECONDS: f64 = 15.0;

    /// Every N-th ID of a worker is followed by a long pause
    pub const LONG_SLEEP_EVERY: usize = 25;
    pub const LONG_SLEEP_MIN_SECONDS: f64 = 30.0;
    pub const LONG_SLEEP_MAX_SECONDS: f64 = 60.0;

    /// Fast-track delay after a missing page
    pub const MISSING_PAGE_SLEEP_MIN_SECONDS: f64 = 1.0;
    pub const MISSING_PAGE_SLEEP_MAX_SECONDS: f64 = 2.0;

    /// Per-ID page handling budget in seconds
    pub const PER_ID_TIMEOUT_SECONDS: u64 = 30;

    /// Download ceiling and stall window in seconds
    pub const DOWNLOAD_TIMEOUT_SECONDS: u64 = 300;
    pub const DOWNLOAD_STALL_SECONDS: u64 = 120;

    pub const WORKERS: usize = 1;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_BACKOFF_SECONDS: u64 = 60;
    pub const RETRY_BACKOFF_CAP_SECONDS: u64 = 3600;

    /// How many times the dispatcher respawns a worker that lost its session
    pub const MAX_WORKER_RESPAWNS: u32 = 2;

    /// Snapshots are always kept for the first N IDs of each worker
    pub const SAVE_HTML_FIRST_N: usize = 10;

    /// IDs collected when neither a list nor a range is given
    pub const SAMPLE_IDS: [u64; 4] = [1_962_721, 11, 1, 196_221];

    pub const GENERAL_INFO_URL: &str =
        "https://zakupki.gov.ru/epz/bankguarantee/guaranteeCard/generalInformation.html?guaranteeInfoId={id}";
    pub const DOCUMENTS_URL: &str =
        "https://zakupki.gov.ru/epz/bankguarantee/guaranteeCard/document-info.html?guaranteeInfoId={id}";

    pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

    /// Log level used unless `--verbose` or `RUST_LOG` says otherwise
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_MAX_FILES: usize = 5;
}

/// Configuration problems that prevent any work from starting
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("malformed ID '{token}' in --ids")]
    MalformedIdList { token: String },

    #[error("--ids produced an empty list")]
    EmptyIdList,

    #[error("--start-id and --end-id must be given together")]
    IncompleteRange,

    #[error("empty range: --start-id {start} is not below --end-id {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("--workers must be at least 1")]
    ZeroWorkers,

    #[error("--sleep-min ({min}) must not exceed --sleep-max ({max})")]
    InvalidSleepRange { min: f64, max: f64 },

    #[error("{field} must be a positive number of seconds")]
    InvalidDuration { field: &'static str },
}

/// Where page markup comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Offline,
    Live,
}

/// Which IDs the run is asked to cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdSelection {
    Explicit(Vec<ItemId>),
    /// Half-open `[start, end)`
    Range { start: u64, end: u64 },
    Sample,
}

impl IdSelection {
    /// Expands the selection in order, capped at `max_ids`
    #[must_use]
    pub fn expand(&self, max_ids: Option<usize>) -> Vec<ItemId> {
        let cap = max_ids.unwrap_or(usize::MAX);
        match self {
            Self::Explicit(ids) => ids.iter().copied().take(cap).collect(),
            Self::Range { start, end } => (*start..*end).take(cap).map(ItemId::new).collect(),
            Self::Sample => defaults::SAMPLE_IDS.iter().copied().take(cap).map(ItemId::new).collect(),
        }
    }
}

/// Parses a comma separated `--ids` value
pub fn parse_id_list(raw: &str) -> Result<Vec<ItemId>, ConfigError> {
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token.parse::<ItemId>().map_err(|_| ConfigError::MalformedIdList {
                token: token.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Err(ConfigError::EmptyIdList);
    }
    Ok(ids)
}

/// Canonical page URL templates; `{id}` is substituted per notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTemplates {
    pub general: String,
    pub documents: String,
}

impl UrlTemplates {
    #[must_use]
    pub fn for_id(&self, id: ItemId) -> PageUrls {
        let id = id.to_string();
        PageUrls {
            general: self.general.replace("{id}", &id),
            documents: self.documents.replace("{id}", &id),
        }
    }
}

impl Default for UrlTemplates {
    fn default() -> Self {
        Self {
            general: defaults::GENERAL_INFO_URL.to_string(),
            documents: defaults::DOCUMENTS_URL.to_string(),
        }
    }
}

/// Polite delays between IDs (live mode only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    pub sleep_min: Duration,
    pub sleep_max: Duration,
    pub long_sleep_every: usize,
    pub long_sleep_min: Duration,
    pub long_sleep_max: Duration,
    pub missing_min: Duration,
    pub missing_max: Duration,
}

impl PacingConfig {
    /// No delays at all, used for offline runs
    #[must_use]
    pub const fn none() -> Self {
        Self {
            sleep_min: Duration::ZERO,
            sleep_max: Duration::ZERO,
            long_sleep_every: 0,
            long_sleep_min: Duration::ZERO,
            long_sleep_max: Duration::ZERO,
            missing_min: Duration::ZERO,
            missing_max: Duration::ZERO,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            sleep_min: Duration::from_secs_f64(defaults::SLEEP_MIN_SECONDS),
            sleep_max: Duration::from_secs_f64(defaults::SLEEP_MAX_SECONDS),
            long_sleep_every: defaults::LONG_SLEEP_EVERY,
            long_sleep_min: Duration::from_secs_f64(defaults::LONG_SLEEP_MIN_SECONDS),
            long_sleep_max: Duration::from_secs_f64(defaults::LONG_SLEEP_MAX_SECONDS),
            missing_min: Duration::from_secs_f64(defaults::MISSING_PAGE_SLEEP_MIN_SECONDS),
            missing_max: Duration::from_secs_f64(defaults::MISSING_PAGE_SLEEP_MAX_SECONDS),
        }
    }
}

/// Options handed to every browser session a worker opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub headless: bool,
    pub block_images: bool,
    pub user_agent: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            headless: false,
            block_images: false,
            user_agent: defaults::USER_AGENT.to_string(),
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub mode: RunMode,
    pub selection: IdSelection,
    pub max_ids: Option<usize>,
    pub force: bool,
    pub skip_retries: bool,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub workers: usize,
    pub worker_start_delay: Duration,
    pub max_worker_respawns: u32,
    pub per_id_timeout: Duration,
    pub download_timeout: Duration,
    pub download_stall: Duration,
    /// Escalate any failed attachment into a retryable ID failure
    pub fail_on_download_error: bool,
    pub run_timeout: Option<Duration>,
    pub pacing: PacingConfig,
    pub save_html: bool,
    pub save_html_first_n: usize,
    pub session: SessionOptions,
    pub urls: UrlTemplates,
    pub data_dir: PathBuf,
    pub verbose: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Offline,
            selection: IdSelection::Sample,
            max_ids: None,
            force: false,
            skip_retries: false,
            max_retries: defaults::MAX_RETRIES,
            retry_backoff: Duration::from_secs(defaults::RETRY_BACKOFF_SECONDS),
            workers: defaults::WORKERS,
            worker_start_delay: Duration::ZERO,
            max_worker_respawns: defaults::MAX_WORKER_RESPAWNS,
            per_id_timeout: Duration::from_secs(defaults::PER_ID_TIMEOUT_SECONDS),
            download_timeout: Duration::from_secs(defaults::DOWNLOAD_TIMEOUT_SECONDS),
            download_stall: Duration::from_secs(defaults::DOWNLOAD_STALL_SECONDS),
            fail_on_download_error: false,
            run_timeout: None,
            pacing: PacingConfig::default(),
            save_html: false,
            save_html_first_n: defaults::SAVE_HTML_FIRST_N,
            session: SessionOptions::default(),
            urls: UrlTemplates::default(),
            data_dir: PathBuf::from(defaults::DATA_DIR),
            verbose: false,
        }
    }
}

impl CollectorConfig {
    /// Checks cross-field constraints; run before any work starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        match &self.selection {
            IdSelection::Explicit(ids) if ids.is_empty() => return Err(ConfigError::EmptyIdList),
            IdSelection::Range { start, end } if start >= end => {
                return Err(ConfigError::InvalidRange { start: *start, end: *end });
            }
            _ => {}
        }
        if self.pacing.sleep_min > self.pacing.sleep_max {
            return Err(ConfigError::InvalidSleepRange {
                min: self.pacing.sleep_min.as_secs_f64(),
                max: self.pacing.sleep_max.as_secs_f64(),
            });
        }
        if self.per_id_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration { field: "--per-id-timeout" });
        }
        if self.download_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration { field: "--download-timeout" });
        }
        if self.download_stall.is_zero() {
            return Err(ConfigError::InvalidDuration { field: "--download-stall-seconds" });
        }
        Ok(())
    }

    /// Pacing actually applied: offline runs never sleep
    #[must_use]
    pub fn effective_pacing(&self) -> PacingConfig {
        match self.mode {
            RunMode::Offline => PacingConfig::none(),
            RunMode::Live => self.pacing.clone(),
        }
    }

    #[must_use]
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_dir)
    }
}

/// On-disk layout under the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub samples: PathBuf,
    pub raw_html: PathBuf,
    pub attachments: PathBuf,
    pub processed: PathBuf,
    pub state: PathBuf,
    pub logs: PathBuf,
}

impl DataPaths {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            samples: root.join("samples"),
            raw_html: root.join("raw").join("html"),
            attachments: root.join("raw").join("attachments"),
            processed: root.join("processed"),
            state: root.join("state"),
            logs: root.join("logs"),
        }
    }

    /// Per-ID attachment directory
    #[must_use]
    pub fn attachment_dir(&self, id: ItemId) -> PathBuf {
        self.attachments.join(id.to_string())
    }

    /// Creates every directory the run writes into
    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.raw_html, &self.attachments, &self.processed, &self.state, &self.logs] {
            if !dir.exists() {
                fs::create_dir_all(dir).await?;
                info!("📁 Created directory: {:?}", dir);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn id_list_parsing_skips_blanks() {
        let ids = parse_id_list("1962721, 11,,1 ").unwrap();
        assert_eq!(ids, vec![ItemId::new(1_962_721), ItemId::new(11), ItemId::new(1)]);
    }

    #[test]
    fn malformed_id_is_a_config_error() {
        let err = parse_id_list("12,abc").unwrap_err();
        assert_eq!(err, ConfigError::MalformedIdList { token: "abc".to_string() });
        assert_eq!(parse_id_list(" , ").unwrap_err(), ConfigError::EmptyIdList);
    }

    #[test]
    fn range_is_half_open_and_capped() {
        let selection = IdSelection::Range { start: 10, end: 15 };
        let ids: Vec<u64> = selection.expand(None).into_iter().map(ItemId::get).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14]);
        assert_eq!(selection.expand(Some(2)).len(), 2);
    }

    #[test]
    fn validate_rejects_inverted_range_and_zero_workers() {
        let mut config = CollectorConfig {
            selection: IdSelection::Range { start: 5, end: 5 },
            ..CollectorConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidRange { start: 5, end: 5 }));

        config.selection = IdSelection::Sample;
        config.workers = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroWorkers));
    }

    #[test]
    fn offline_mode_never_paces() {
        let config = CollectorConfig::default();
        assert_eq!(config.effective_pacing(), PacingConfig::none());
        let live = CollectorConfig { mode: RunMode::Live, ..CollectorConfig::default() };
        assert_eq!(live.effective_pacing(), PacingConfig::default());
    }

    #[test]
    fn url_templates_substitute_the_id() {
        let urls = UrlTemplates::default().for_id(ItemId::new(42));
        assert!(urls.general.ends_with("generalInformation.html?guaranteeInfoId=42"));
        assert!(urls.documents.ends_with("document-info.html?guaranteeInfoId=42"));
    }

    #[test]
    fn data_paths_follow_the_layout() {
        let paths = DataPaths::new(Path::new("/tmp/d"));
        assert_eq!(paths.attachment_dir(ItemId::new(7)), PathBuf::from("/tmp/d/raw/attachments/7"));
        assert_eq!(paths.state, PathBuf::from("/tmp/d/state"));
    }
}
