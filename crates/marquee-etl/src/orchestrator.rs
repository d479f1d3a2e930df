//! Run orchestration
//!
//! One run acquires the run lock, then for each requested dataset (people,
//! titles, ratings, participations) fetches, parses and loads it, and finally
//! recomputes the statistics on full runs or when asked to. The first failing
//! stage ends the run; batches already committed stay committed.

use crate::aggregate::AggregationEngine;
use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::fetcher::{FetchOrigin, SourceFetcher};
use crate::loader::BulkLoader;
use crate::models::{Dataset, RunKind, RunStatus, RunTotals};
use crate::parser::spawn_parser;
use crate::store::Store;
use crate::tracker::RunTracker;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// What to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    pub kind: RunKind,
    /// Supersede a run that is still marked running
    pub force: bool,
    /// Recompute statistics after a partial run
    pub recompute: bool,
}

impl RunRequest {
    pub fn full() -> Self {
        Self {
            kind: RunKind::Full,
            force: false,
            recompute: false,
        }
    }

    pub fn partial(dataset: Dataset) -> Self {
        Self {
            kind: RunKind::Partial(dataset),
            force: false,
            recompute: false,
        }
    }

    pub fn recompute_only() -> Self {
        Self {
            kind: RunKind::Recompute,
            force: false,
            recompute: true,
        }
    }

    /// Full run for `None`, single-dataset run otherwise
    pub fn for_dataset(dataset: Option<Dataset>) -> Self {
        dataset.map_or_else(Self::full, Self::partial)
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_recompute(mut self, recompute: bool) -> Self {
        self.recompute = recompute;
        self
    }

    pub fn datasets(&self) -> &'static [Dataset] {
        match self.kind {
            RunKind::Full => &Dataset::ALL,
            RunKind::Partial(Dataset::People) => &[Dataset::People],
            RunKind::Partial(Dataset::Titles) => &[Dataset::Titles],
            RunKind::Partial(Dataset::Ratings) => &[Dataset::Ratings],
            RunKind::Partial(Dataset::Participations) => &[Dataset::Participations],
            RunKind::Recompute => &[],
        }
    }

    pub fn should_recompute(&self) -> bool {
        match self.kind {
            RunKind::Full | RunKind::Recompute => true,
            RunKind::Partial(_) => self.recompute,
        }
    }
}

/// Per-dataset result of a run
#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub dataset: Dataset,
    pub origin: FetchOrigin,
    pub rows_read: u64,
    pub records_written: u64,
    pub rows_skipped: u64,
    pub rows_filtered: u64,
}

/// Result of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub kind: RunKind,
    pub status: RunStatus,
    pub records_processed: i64,
    pub rows_skipped: i64,
    /// Published statistics rows, when the run recomputed
    pub stats_rows: Option<u64>,
    pub datasets: Vec<DatasetReport>,
}

/// Counters gathered while a run progresses, recorded even when it fails
#[derive(Debug, Default)]
struct Progress {
    totals: RunTotals,
    datasets: Vec<DatasetReport>,
    stats_rows: Option<u64>,
}

impl Progress {
    fn add(&mut self, report: DatasetReport) {
        self.totals.records_processed += report.records_written as i64;
        self.totals.rows_skipped += report.rows_skipped as i64;
        self.datasets.push(report);
    }
}

pub struct Orchestrator {
    fetcher: SourceFetcher,
    loader: BulkLoader,
    engine: AggregationEngine,
    tracker: RunTracker,
    parse_limit: Option<usize>,
}

impl Orchestrator {
    pub fn new(config: &EtlConfig, store: Arc<dyn Store>) -> EtlResult<Self> {
        Ok(Self {
            fetcher: SourceFetcher::new(config)?,
            loader: BulkLoader::new(store.clone(), config),
            engine: AggregationEngine::new(store.clone(), config.score_mode),
            tracker: RunTracker::new(store),
            parse_limit: config.parse_limit,
        })
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Acquire the run lock for `request`. Returns the new run id.
    pub async fn start(&self, request: &RunRequest) -> EtlResult<i64> {
        self.tracker.begin(request.kind, request.force).await
    }

    /// Start and execute in one step
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> EtlResult<RunReport> {
        let run_id = self.start(&request).await?;
        self.execute(run_id, request, cancel).await
    }

    /// Recompute statistics from the current base tables as its own run
    pub async fn recompute_only(&self, force: bool, cancel: CancellationToken) -> EtlResult<RunReport> {
        self.run(RunRequest::recompute_only().with_force(force), cancel)
            .await
    }

    /// Drive an already started run to its terminal state.
    ///
    /// On failure the run is recorded as failed with the error text and the
    /// originating error is returned.
    #[instrument(skip(self, request, cancel), fields(kind = %request.kind))]
    pub async fn execute(
        &self,
        run_id: i64,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> EtlResult<RunReport> {
        let mut progress = Progress::default();

        match self.pipeline(&request, &mut progress, &cancel).await {
            Ok(()) => {
                let record = self.tracker.complete(run_id, progress.totals).await?;
                Ok(RunReport {
                    run_id,
                    kind: request.kind,
                    status: record.status,
                    records_processed: record.records_processed,
                    rows_skipped: record.rows_skipped,
                    stats_rows: progress.stats_rows,
                    datasets: progress.datasets,
                })
            },
            Err(e) => {
                if let Err(mark_err) = self.tracker.fail(run_id, progress.totals, e.to_string()).await {
                    // Already terminal, e.g. cancelled through the run log
                    warn!(run_id, error = %mark_err, "Could not record run failure");
                }
                Err(e)
            },
        }
    }

    async fn pipeline(
        &self,
        request: &RunRequest,
        progress: &mut Progress,
        cancel: &CancellationToken,
    ) -> EtlResult<()> {
        for &dataset in request.datasets() {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            let report = self.process_dataset(dataset, cancel).await?;
            progress.add(report);
        }

        if request.should_recompute() {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }
            progress.stats_rows = Some(self.engine.recompute().await?);
        }

        Ok(())
    }

    #[instrument(skip(self, cancel))]
    async fn process_dataset(
        &self,
        dataset: Dataset,
        cancel: &CancellationToken,
    ) -> EtlResult<DatasetReport> {
        let fetched = self.fetcher.fetch(dataset, cancel).await?;

        let (records, parser) =
            spawn_parser(fetched.path.clone(), dataset, self.parse_limit, cancel.clone());
        // The stream is consumed by the loader and dropped on return, which
        // stops the parser if the load ended early.
        let loaded = self.loader.load(dataset, records, cancel).await;
        let parsed = parser.await?;

        let records_written = loaded?;
        let summary = parsed?;

        info!(
            dataset = %dataset,
            rows_read = summary.rows_read,
            records_written,
            rows_skipped = summary.rows_skipped,
            "Dataset processed"
        );

        Ok(DatasetReport {
            dataset,
            origin: fetched.origin,
            rows_read: summary.rows_read,
            records_written,
            rows_skipped: summary.rows_skipped,
            rows_filtered: summary.rows_filtered,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_datasets_in_load_order() {
        assert_eq!(RunRequest::full().datasets(), &Dataset::ALL);
        assert_eq!(
            RunRequest::partial(Dataset::Ratings).datasets(),
            &[Dataset::Ratings]
        );
        assert!(RunRequest::recompute_only().datasets().is_empty());
    }

    #[test]
    fn test_should_recompute() {
        assert!(RunRequest::full().should_recompute());
        assert!(RunRequest::recompute_only().should_recompute());
        assert!(!RunRequest::partial(Dataset::Titles).should_recompute());
        assert!(RunRequest::partial(Dataset::Titles)
            .with_recompute(true)
            .should_recompute());
    }

    #[test]
    fn test_for_dataset() {
        assert_eq!(RunRequest::for_dataset(None).kind, RunKind::Full);
        assert_eq!(
            RunRequest::for_dataset(Some(Dataset::People)).kind,
            RunKind::Partial(Dataset::People)
        );
    }
}
