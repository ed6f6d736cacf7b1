//! # Crawling layer
//!
//! Composes the infrastructure leaves into the collection pipeline:
//! - `state`: resources shared by all workers and the commit protocol
//! - `worker`: one session, one ID at a time
//! - `dispatcher`: work planning, the worker pool and run shutdown

pub mod dispatcher;
pub mod state;
pub mod worker;

pub use dispatcher::{DispatchError, Dispatcher, RunSummary, partition};
pub use state::{CollectorState, CommitError, CommitOutcome, ItemOutcome};
pub use worker::{Worker, WorkerContext, WorkerExit};
