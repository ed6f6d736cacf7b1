//! Guarantee Collector - resumable collection of bank-guarantee notices
//!
//! Fetches the general information and document pages of each notice,
//! flattens them into long-form attribute rows, downloads the attachments
//! and keeps enough state on disk that any run can be interrupted and
//! resumed without duplicating work.

// Module declarations
pub mod cli;
pub mod crawling;
pub mod domain;
pub mod infrastructure;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crawling::{Dispatcher, RunSummary};
use crate::infrastructure::config::{CollectorConfig, RunMode};
use crate::infrastructure::session::{HttpSessionFactory, OfflineSessionFactory, SessionFactory};
use crate::infrastructure::state_store::StateStore;
use crate::infrastructure::{LoggingConfig, init_logging_with_config, log_system_info};

/// Runs one collection pass with an already validated configuration
///
/// Sets up the data directory and logging, wires Ctrl-C to a graceful
/// shutdown and hands over to the dispatcher.
pub async fn run(config: CollectorConfig) -> Result<RunSummary> {
    let paths = config.paths();
    paths
        .ensure()
        .await
        .with_context(|| format!("Failed to create data directories under {:?}", paths.root))?;

    let run_id = StateStore::allocate_run_id(&paths.state)
        .await
        .context("Failed to allocate a run id")?;
    init_logging_with_config(&LoggingConfig::for_run(&paths.logs, run_id, config.verbose))?;
    log_system_info();
    info!(
        "🔧 Run {} | mode={:?} workers={} force={} skip_retries={} data_dir={:?}",
        run_id, config.mode, config.workers, config.force, config.skip_retries, paths.root
    );

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, finishing in-flight IDs");
            interrupt.cancel();
        }
    });

    let sessions: Arc<dyn SessionFactory> = match config.mode {
        RunMode::Offline => Arc::new(OfflineSessionFactory),
        RunMode::Live => Arc::new(HttpSessionFactory::new(config.session.clone())),
    };

    let summary = Dispatcher::new(config, sessions).run(run_id, token).await?;
    Ok(summary)
}
