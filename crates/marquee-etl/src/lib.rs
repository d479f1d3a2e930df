//! Marquee ETL
//!
//! Loads the public movie-metadata dumps (people, titles, ratings and
//! principal credits) into a relational store and publishes per-performer
//! rating statistics for actors and actresses.
//!
//! # Pipeline
//!
//! - [`fetcher`]: retrieve and verify each `.tsv.gz` dump
//! - [`parser`]: stream typed records out of a dump, counting malformed rows
//! - [`loader`]: batched, idempotent upserts by natural key
//! - [`aggregate`]: rebuild and atomically publish the statistics
//! - [`tracker`]: persisted run log and single-running-run lock
//! - [`orchestrator`]: drive one run through the stages above
//! - [`service`]: background runs, status, history and cancellation
//!
//! # Example
//!
//! ```no_run
//! use marquee_etl::{store, EtlConfig, EtlService, RunRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EtlConfig::load()?;
//!     let store = store::connect(&config).await?;
//!     let service = EtlService::new(&config, store)?;
//!
//!     let handle = service.trigger_run(RunRequest::full()).await?;
//!     let report = handle.wait().await?;
//!     println!("run {} wrote {} records", report.run_id, report.records_processed);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod aggregate;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod service;
pub mod store;
pub mod tracker;

pub use aggregate::{AggregationEngine, ScoreMode};
pub use config::{EtlConfig, StoreBackend};
pub use error::{EtlError, EtlResult};
pub use models::{
    AggregatedPersonStat, Dataset, Record, RoleCategory, RunKind, RunRecord, RunStatus,
    StatsQuery,
};
pub use orchestrator::{Orchestrator, RunReport, RunRequest};
pub use service::{EtlService, RunHandle};
pub use store::{MemoryStore, PgStore, Store};
