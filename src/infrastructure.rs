//! Infrastructure layer: configuration, logging, page access, parsing and
//! persistence
//!
//! Every module here is a leaf the crawling layer composes; none of them
//! knows about workers or the dispatcher.

pub mod config; // Run configuration, defaults and data layout
pub mod downloader;
pub mod html_parser;
pub mod logging;
pub mod output_sink;
pub mod page_fetcher;
pub mod parsing_error;
pub mod schema_union;
pub mod session; // Browser session capability and its implementations
pub mod state_store;

pub use config::{CollectorConfig, ConfigError, DataPaths, IdSelection, RunMode};
pub use downloader::{DownloadError, DownloadPolicy, Downloader};
pub use html_parser::{NoticeParser, ParsedAttribute, ParsedPage};
pub use logging::{LoggingConfig, init_logging_with_config, log_system_info};
pub use output_sink::{MetadataRow, OutputSink, SinkError};
pub use page_fetcher::{FetchError, PageFetcher};
pub use parsing_error::{ParseWarning, ParsingError, ParsingResult};
pub use schema_union::SchemaUnion;
pub use session::{
    BrowserSession, DownloadStream, HttpSessionFactory, OfflineSessionFactory, SessionError, SessionFactory,
};
pub use state_store::{Checkpoint, RetryOutcome, RetryPolicy, RunStats, StateStore, StoreError};
