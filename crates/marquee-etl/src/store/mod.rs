//! Storage seam
//!
//! [`CatalogStore`] owns the base tables and the published statistics,
//! [`RunStore`] owns the run log. Both are implemented by [`PgStore`] for
//! production and [`MemoryStore`] for local runs and tests.

use crate::aggregate::ScoreMode;
use crate::config::{EtlConfig, StoreBackend};
use crate::models::{
    AggregatedPersonStat, Dataset, Participation, Person, Rating, Record, RunKind, RunOutcome,
    RunRecord, RunStatus, StatsQuery, Title,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Error recorded on a running record displaced by a forced run
pub const SUPERSEDED_MESSAGE: &str = "superseded by forced run";

/// Storage operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// The single-running-run constraint rejected a new run
    #[error("run {0} is already running")]
    RunInProgress(i64),

    #[error("run {0} not found")]
    RunNotFound(i64),

    /// A terminal transition was attempted on a run that already ended
    #[error("run {id} is {status}, not running")]
    RunNotRunning { id: i64, status: RunStatus },

    /// A stored value could not be mapped back into a domain type
    #[error("Corrupt stored value: {0}")]
    Decode(String),

    /// Backend-specific failure without a richer type
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A homogeneous batch ready for an upsert
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBatch {
    People(Vec<Person>),
    Titles(Vec<Title>),
    Ratings(Vec<Rating>),
    Participations(Vec<Participation>),
}

/// Keep the last occurrence of each key, preserving the order of survivors
fn dedup_last_by_key<T, K, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut last_index: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        last_index.insert(key(row), i);
    }
    if last_index.len() == rows.len() {
        return rows;
    }
    rows.into_iter()
        .enumerate()
        .filter(|(i, row)| last_index.get(&key(row)) == Some(i))
        .map(|(_, row)| row)
        .collect()
}

impl RecordBatch {
    /// Build a typed batch from parsed records. Records belonging to another
    /// dataset are dropped with a warning.
    pub fn from_records(dataset: Dataset, records: Vec<Record>) -> Self {
        let mut mismatched = 0usize;
        let batch = match dataset {
            Dataset::People => RecordBatch::People(
                records
                    .into_iter()
                    .filter_map(|r| match r {
                        Record::Person(p) => Some(p),
                        _ => {
                            mismatched += 1;
                            None
                        },
                    })
                    .collect(),
            ),
            Dataset::Titles => RecordBatch::Titles(
                records
                    .into_iter()
                    .filter_map(|r| match r {
                        Record::Title(t) => Some(t),
                        _ => {
                            mismatched += 1;
                            None
                        },
                    })
                    .collect(),
            ),
            Dataset::Ratings => RecordBatch::Ratings(
                records
                    .into_iter()
                    .filter_map(|r| match r {
                        Record::Rating(r) => Some(r),
                        _ => {
                            mismatched += 1;
                            None
                        },
                    })
                    .collect(),
            ),
            Dataset::Participations => RecordBatch::Participations(
                records
                    .into_iter()
                    .filter_map(|r| match r {
                        Record::Participation(p) => Some(p),
                        _ => {
                            mismatched += 1;
                            None
                        },
                    })
                    .collect(),
            ),
        };

        if mismatched > 0 {
            warn!(dataset = %dataset, mismatched, "Dropped records of another dataset from batch");
        }
        batch
    }

    pub fn dataset(&self) -> Dataset {
        match self {
            RecordBatch::People(_) => Dataset::People,
            RecordBatch::Titles(_) => Dataset::Titles,
            RecordBatch::Ratings(_) => Dataset::Ratings,
            RecordBatch::Participations(_) => Dataset::Participations,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBatch::People(rows) => rows.len(),
            RecordBatch::Titles(rows) => rows.len(),
            RecordBatch::Ratings(rows) => rows.len(),
            RecordBatch::Participations(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collapse rows sharing a natural key, last one wins.
    ///
    /// Postgres rejects an `ON CONFLICT DO UPDATE` that touches the same row
    /// twice in one statement.
    pub fn dedup_by_key(self) -> Self {
        match self {
            RecordBatch::People(rows) => {
                RecordBatch::People(dedup_last_by_key(rows, |p| p.nconst.clone()))
            },
            RecordBatch::Titles(rows) => {
                RecordBatch::Titles(dedup_last_by_key(rows, |t| t.tconst.clone()))
            },
            RecordBatch::Ratings(rows) => {
                RecordBatch::Ratings(dedup_last_by_key(rows, |r| r.tconst.clone()))
            },
            RecordBatch::Participations(rows) => RecordBatch::Participations(dedup_last_by_key(
                rows,
                |p| (p.tconst.clone(), p.ordering),
            )),
        }
    }
}

/// Row counts of the base tables and the published statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableCounts {
    pub people: u64,
    pub titles: u64,
    pub ratings: u64,
    pub participations: u64,
    pub stats: u64,
}

/// Base tables and published statistics
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert or overwrite every row of `batch` by natural key.
    /// Returns the number of rows written.
    async fn upsert(&self, batch: &RecordBatch) -> StoreResult<u64>;

    /// Rebuild the statistics from the base tables and publish them
    /// atomically. On error the previously published rows stay visible.
    async fn recompute_stats(&self, mode: ScoreMode) -> StoreResult<u64>;

    /// Read a page of published statistics
    async fn list_stats(&self, query: &StatsQuery) -> StoreResult<Vec<AggregatedPersonStat>>;

    async fn table_counts(&self) -> StoreResult<TableCounts>;
}

/// Persisted run log, including the single-running-run lock
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new `running` record.
    ///
    /// Fails with [`StoreError::RunInProgress`] while another run is running,
    /// unless `force` is set, in which case the stale run is failed first.
    async fn insert_run(&self, kind: RunKind, force: bool) -> StoreResult<RunRecord>;

    /// Move a `running` record to its terminal state
    async fn finish_run(&self, id: i64, outcome: &RunOutcome) -> StoreResult<RunRecord>;

    async fn get_run(&self, id: i64) -> StoreResult<Option<RunRecord>>;

    async fn latest_run(&self) -> StoreResult<Option<RunRecord>>;

    /// Most recent first
    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>>;
}

/// Everything the pipeline needs from a backend
pub trait Store: CatalogStore + RunStore {}

impl<T: CatalogStore + RunStore> Store for T {}

/// Open the backend selected by `config.store`
pub async fn connect(config: &EtlConfig) -> StoreResult<Arc<dyn Store>> {
    match config.store {
        StoreBackend::Postgres => {
            let store = PgStore::connect(&config.database).await?;
            Ok(Arc::new(store))
        },
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
