//! Command line surface of the collector

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::infrastructure::config::{
    CollectorConfig, ConfigError, IdSelection, PacingConfig, RunMode, SessionOptions, defaults, parse_id_list,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Read pages from pre-saved samples under `<data-dir>/samples`
    Offline,
    /// Drive live sessions against the registry
    Live,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Offline => Self::Offline,
            ModeArg::Live => Self::Live,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Resumable collector for bank-guarantee notices")]
pub struct CliArgs {
    /// Where pages come from.
    #[arg(long, value_enum, default_value_t = ModeArg::Offline)]
    pub mode: ModeArg,

    /// Comma separated notice IDs to collect.
    #[arg(long, conflicts_with_all = ["start_id", "end_id"])]
    pub ids: Option<String>,

    /// First ID of a half-open range.
    #[arg(long)]
    pub start_id: Option<u64>,

    /// End of the range (exclusive).
    #[arg(long)]
    pub end_id: Option<u64>,

    /// Cap on the number of IDs taken from the list or range.
    #[arg(long)]
    pub max_ids: Option<usize>,

    /// Minimum polite delay between IDs, in seconds (live mode).
    #[arg(long, default_value_t = defaults::SLEEP_MIN_SECONDS)]
    pub sleep_min: f64,

    /// Maximum polite delay between IDs, in seconds (live mode).
    #[arg(long, default_value_t = defaults::SLEEP_MAX_SECONDS)]
    pub sleep_max: f64,

    /// Keep raw HTML snapshots of every page.
    #[arg(long, default_value_t = false)]
    pub save_html: bool,

    /// Keep snapshots for the first N IDs of each worker.
    #[arg(long, default_value_t = defaults::SAVE_HTML_FIRST_N)]
    pub save_html_first_n: usize,

    #[arg(long, default_value_t = false)]
    pub headless: bool,

    #[arg(long, default_value_t = false)]
    pub block_images: bool,

    /// Do not reprocess IDs waiting in the retry queue.
    #[arg(long, default_value_t = false)]
    pub skip_retries: bool,

    #[arg(long, default_value_t = defaults::MAX_RETRIES)]
    pub max_retries: u32,

    /// Base of the exponential retry back-off.
    #[arg(long, default_value_t = defaults::RETRY_BACKOFF_SECONDS)]
    pub retry_backoff_seconds: u64,

    /// Budget for fetching both pages of one ID, in seconds.
    #[arg(long, default_value_t = defaults::PER_ID_TIMEOUT_SECONDS as f64)]
    pub per_id_timeout: f64,

    #[arg(long, default_value_t = defaults::WORKERS)]
    pub workers: usize,

    /// Worker k starts after k times this many seconds.
    #[arg(long, default_value_t = 0.0)]
    pub worker_start_delay: f64,

    /// Hard ceiling for one attachment, in seconds.
    #[arg(long, default_value_t = defaults::DOWNLOAD_TIMEOUT_SECONDS as f64)]
    pub download_timeout: f64,

    /// Abort an attachment when no bytes arrive for this many seconds.
    #[arg(long, default_value_t = defaults::DOWNLOAD_STALL_SECONDS as f64)]
    pub download_stall_seconds: f64,

    /// Reprocess IDs already collected, replacing their rows and files.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Treat any failed attachment as a retryable failure of its ID.
    #[arg(long, default_value_t = false)]
    pub fail_on_download_error: bool,

    /// Stop the whole run after this many seconds.
    #[arg(long)]
    pub run_timeout: Option<f64>,

    #[arg(long, default_value = defaults::DATA_DIR)]
    pub data_dir: PathBuf,

    /// Debug level logging.
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { field })
}

impl CliArgs {
    fn selection(&self) -> Result<IdSelection, ConfigError> {
        if let Some(raw) = &self.ids {
            return Ok(IdSelection::Explicit(parse_id_list(raw)?));
        }
        match (self.start_id, self.end_id) {
            (Some(start), Some(end)) => Ok(IdSelection::Range { start, end }),
            (None, None) => Ok(IdSelection::Sample),
            _ => Err(ConfigError::IncompleteRange),
        }
    }

    /// Builds the run configuration; `validate` still has to be called
    pub fn into_config(self) -> Result<CollectorConfig, ConfigError> {
        let selection = self.selection()?;
        let pacing = PacingConfig {
            sleep_min: seconds("--sleep-min", self.sleep_min)?,
            sleep_max: seconds("--sleep-max", self.sleep_max)?,
            ..PacingConfig::default()
        };
        let run_timeout = self
            .run_timeout
            .map(|value| seconds("--run-timeout", value))
            .transpose()?;

        Ok(CollectorConfig {
            mode: self.mode.into(),
            selection,
            max_ids: self.max_ids,
            force: self.force,
            skip_retries: self.skip_retries,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_secs(self.retry_backoff_seconds),
            workers: self.workers,
            worker_start_delay: seconds("--worker-start-delay", self.worker_start_delay)?,
            max_worker_respawns: defaults::MAX_WORKER_RESPAWNS,
            per_id_timeout: seconds("--per-id-timeout", self.per_id_timeout)?,
            download_timeout: seconds("--download-timeout", self.download_timeout)?,
            download_stall: seconds("--download-stall-seconds", self.download_stall_seconds)?,
            fail_on_download_error: self.fail_on_download_error,
            run_timeout,
            pacing,
            save_html: self.save_html,
            save_html_first_n: self.save_html_first_n,
            session: SessionOptions {
                headless: self.headless,
                block_images: self.block_images,
                ..SessionOptions::default()
            },
            data_dir: self.data_dir,
            verbose: self.verbose,
            ..CollectorConfig::default()
        })
    }
}
