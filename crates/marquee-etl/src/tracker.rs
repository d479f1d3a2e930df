//! Run lifecycle on top of the persisted run log

use crate::error::{EtlError, EtlResult};
use crate::models::{RunKind, RunOutcome, RunRecord, RunTotals};
use crate::store::{Store, StoreError};
use std::sync::Arc;
use tracing::{info, warn};

/// Bounds applied to `history(limit)`
pub const MIN_HISTORY_LIMIT: i64 = 1;
pub const MAX_HISTORY_LIMIT: i64 = 100;

fn map_store_error(err: StoreError) -> EtlError {
    match err {
        StoreError::RunInProgress(run_id) => EtlError::RunAlreadyInProgress { run_id },
        StoreError::RunNotFound(id) => EtlError::RunNotFound(id),
        StoreError::RunNotRunning { id, status } => EtlError::RunNotActive { run_id: id, status },
        other => EtlError::Store(other),
    }
}

#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn Store>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Acquire the run lock and record a new `running` run
    pub async fn begin(&self, kind: RunKind, force: bool) -> EtlResult<i64> {
        let run = self
            .store
            .insert_run(kind, force)
            .await
            .map_err(map_store_error)?;
        info!(run_id = run.id, kind = %kind, force, "Run started");
        Ok(run.id)
    }

    pub async fn complete(&self, id: i64, totals: RunTotals) -> EtlResult<RunRecord> {
        let run = self
            .store
            .finish_run(id, &RunOutcome::Succeeded(totals))
            .await
            .map_err(map_store_error)?;
        info!(
            run_id = id,
            records_processed = run.records_processed,
            rows_skipped = run.rows_skipped,
            duration_seconds = run.duration_seconds,
            "Run succeeded"
        );
        Ok(run)
    }

    pub async fn fail(
        &self,
        id: i64,
        totals: RunTotals,
        message: impl Into<String>,
    ) -> EtlResult<RunRecord> {
        let error = message.into();
        let run = self
            .store
            .finish_run(
                id,
                &RunOutcome::Failed {
                    totals,
                    error: error.clone(),
                },
            )
            .await
            .map_err(map_store_error)?;
        warn!(run_id = id, error = %error, "Run failed");
        Ok(run)
    }

    pub async fn get(&self, id: i64) -> EtlResult<RunRecord> {
        self.store
            .get_run(id)
            .await?
            .ok_or(EtlError::RunNotFound(id))
    }

    pub async fn latest(&self) -> EtlResult<Option<RunRecord>> {
        Ok(self.store.latest_run().await?)
    }

    /// Newest first, `limit` clamped to 1..=100
    pub async fn history(&self, limit: i64) -> EtlResult<Vec<RunRecord>> {
        let limit = limit.clamp(MIN_HISTORY_LIMIT, MAX_HISTORY_LIMIT);
        Ok(self.store.list_runs(limit).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{Dataset, RunStatus};
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn tracker() -> RunTracker {
        RunTracker::new(Arc::new(MemoryStore::new()))
    }

    fn totals(records_processed: i64) -> RunTotals {
        RunTotals {
            records_processed,
            rows_skipped: 0,
        }
    }

    #[tokio::test]
    async fn test_begin_rejects_second_run() {
        let tracker = tracker();
        let first = tracker.begin(RunKind::Full, false).await.unwrap();

        let err = tracker.begin(RunKind::Recompute, false).await.unwrap_err();
        assert!(matches!(err, EtlError::RunAlreadyInProgress { run_id } if run_id == first));

        tracker.complete(first, totals(1)).await.unwrap();
        assert!(tracker.begin(RunKind::Recompute, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_force_supersedes_running() {
        let tracker = tracker();
        let stale = tracker.begin(RunKind::Full, false).await.unwrap();
        let fresh = tracker
            .begin(RunKind::Partial(Dataset::Ratings), true)
            .await
            .unwrap();

        assert_ne!(stale, fresh);
        assert_eq!(tracker.get(stale).await.unwrap().status, RunStatus::Failed);
        assert_eq!(tracker.get(fresh).await.unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_once() {
        let tracker = tracker();
        let id = tracker.begin(RunKind::Full, false).await.unwrap();

        let failed = tracker.fail(id, totals(3), "source unavailable").await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("source unavailable"));
        assert_eq!(failed.records_processed, 3);

        let err = tracker.complete(id, totals(9)).await.unwrap_err();
        assert!(matches!(
            err,
            EtlError::RunNotActive {
                status: RunStatus::Failed,
                ..
            }
        ));
        assert_eq!(tracker.get(id).await.unwrap().records_processed, 3);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let tracker = tracker();
        assert!(matches!(tracker.get(42).await.unwrap_err(), EtlError::RunNotFound(42)));
        assert!(matches!(
            tracker.complete(42, totals(0)).await.unwrap_err(),
            EtlError::RunNotFound(42)
        ));
        assert!(tracker.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_newest_first_and_clamped() {
        let tracker = tracker();
        for _ in 0..3 {
            let id = tracker.begin(RunKind::Recompute, false).await.unwrap();
            tracker.complete(id, totals(0)).await.unwrap();
        }

        let history = tracker.history(10).await.unwrap();
        let ids: Vec<i64> = history.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        assert_eq!(tracker.history(0).await.unwrap().len(), 1);
        assert_eq!(tracker.latest().await.unwrap().unwrap().id, 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Begin { force: bool },
        Complete,
        Fail,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(|force| Op::Begin { force }),
            Just(Op::Complete),
            Just(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_running(ops in prop::collection::vec(arb_op(), 1..30)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let tracker = tracker();
                let mut current: Option<i64> = None;

                for op in ops {
                    match op {
                        Op::Begin { force } => {
                            if let Ok(id) = tracker.begin(RunKind::Full, force).await {
                                current = Some(id);
                            }
                        },
                        Op::Complete => {
                            if let Some(id) = current.take() {
                                let _ = tracker.complete(id, totals(1)).await;
                            }
                        },
                        Op::Fail => {
                            if let Some(id) = current.take() {
                                let _ = tracker.fail(id, totals(0), "boom").await;
                            }
                        },
                    }

                    let runs = tracker.history(100).await.unwrap();
                    let running = runs.iter().filter(|r| r.is_running()).count();
                    assert!(running <= 1);
                    for run in runs.iter().filter(|r| !r.is_running()) {
                        assert!(run.finished_at.is_some());
                        assert!(run.duration_seconds.is_some());
                    }
                }
            });
        }
    }
}
