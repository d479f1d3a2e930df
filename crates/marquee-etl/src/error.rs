//! Error taxonomy for the ETL pipeline

use crate::models::{Dataset, RunStatus};
use crate::store::StoreError;
use thiserror::Error;

pub type EtlResult<T> = Result<T, EtlError>;

/// Failures surfaced by the pipeline stages and the run tracker.
///
/// Every variant that ends a run is recorded verbatim (via `Display`) as the
/// run's error message.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Retrieval failed after exhausting retries
    #[error("source unavailable: {dataset} could not be retrieved after {attempts} attempt(s): {reason}")]
    SourceUnavailable {
        dataset: Dataset,
        attempts: u32,
        reason: String,
    },

    /// The file is empty, not gzip, or does not start with the expected header
    #[error("corrupt source for {dataset}: {reason}")]
    CorruptSource { dataset: Dataset, reason: String },

    /// A batch could not be written after retrying
    #[error("load failed for {dataset} at record offset {offset}: {source}")]
    LoadFailure {
        dataset: Dataset,
        offset: u64,
        #[source]
        source: StoreError,
    },

    /// Recompute failed; previously published statistics are untouched
    #[error("aggregation failed: {0}")]
    AggregationFailure(#[source] StoreError),

    #[error("an ETL run is already in progress (run {run_id}); pass force to override")]
    RunAlreadyInProgress { run_id: i64 },

    #[error("run {0} not found")]
    RunNotFound(i64),

    #[error("run {run_id} is not running (status: {status})")]
    RunNotActive { run_id: i64, status: RunStatus },

    #[error("cancelled by operator")]
    Cancelled,

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl EtlError {
    pub fn corrupt(dataset: Dataset, reason: impl Into<String>) -> Self {
        Self::CorruptSource {
            dataset,
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EtlError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for EtlError {
    fn from(err: tokio::task::JoinError) -> Self {
        EtlError::Task(err.to_string())
    }
}
