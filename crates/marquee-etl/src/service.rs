//! Operations facade
//!
//! [`EtlService`] is what a scheduler, admin endpoint or the CLI talks to.
//! Triggered runs execute on a background task; the run lock is taken before
//! the trigger returns, so a conflicting trigger fails immediately.

use crate::config::EtlConfig;
use crate::error::{EtlError, EtlResult};
use crate::models::{AggregatedPersonStat, RunRecord, RunTotals, StatsQuery};
use crate::orchestrator::{Orchestrator, RunReport, RunRequest};
use crate::store::{Store, TableCounts};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long `cancel` waits for an in-process run to stop on its own
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Error text recorded on a cancelled run
pub const CANCELLED_MESSAGE: &str = "cancelled by operator";

struct ActiveRun {
    token: CancellationToken,
    /// Closed when the run task ends
    done: watch::Receiver<()>,
}

/// A run executing in the background
pub struct RunHandle {
    run_id: i64,
    join: JoinHandle<EtlResult<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> EtlResult<RunReport> {
        self.join.await?
    }
}

pub struct EtlService {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn Store>,
    active: Arc<Mutex<HashMap<i64, ActiveRun>>>,
}

impl EtlService {
    pub fn new(config: &EtlConfig, store: Arc<dyn Store>) -> EtlResult<Self> {
        Ok(Self {
            orchestrator: Arc::new(Orchestrator::new(config, store.clone())?),
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Acquire the run lock and execute `request` in the background
    pub async fn trigger_run(&self, request: RunRequest) -> EtlResult<RunHandle> {
        let run_id = self.orchestrator.start(&request).await?;
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(());

        self.active.lock().await.insert(
            run_id,
            ActiveRun {
                token: token.clone(),
                done: done_rx,
            },
        );

        let orchestrator = self.orchestrator.clone();
        let active = self.active.clone();
        let join = tokio::spawn(async move {
            let result = orchestrator.execute(run_id, request, token).await;
            active.lock().await.remove(&run_id);
            drop(done_tx);
            result
        });

        info!(run_id, kind = %request.kind, "Run triggered");
        Ok(RunHandle { run_id, join })
    }

    /// Trigger a recompute-only run
    pub async fn trigger_recompute(&self, force: bool) -> EtlResult<RunHandle> {
        self.trigger_run(RunRequest::recompute_only().with_force(force))
            .await
    }

    /// A specific run, or the latest one when `run_id` is `None`
    pub async fn status(&self, run_id: Option<i64>) -> EtlResult<Option<RunRecord>> {
        match run_id {
            Some(id) => self.orchestrator.tracker().get(id).await.map(Some),
            None => self.orchestrator.tracker().latest().await,
        }
    }

    pub async fn history(&self, limit: i64) -> EtlResult<Vec<RunRecord>> {
        self.orchestrator.tracker().history(limit).await
    }

    /// Stop a running run and record it as failed.
    ///
    /// A run executing in this process is signalled and given
    /// [`CANCEL_GRACE_PERIOD`] to stop. A run still marked running after that,
    /// or one owned by another process, is failed directly in the run log.
    pub async fn cancel(&self, run_id: i64) -> EtlResult<RunRecord> {
        let tracker = self.orchestrator.tracker();
        let record = tracker.get(run_id).await?;
        if !record.is_running() {
            return Err(EtlError::RunNotActive {
                run_id,
                status: record.status,
            });
        }

        let in_process = self
            .active
            .lock()
            .await
            .get(&run_id)
            .map(|run| (run.token.clone(), run.done.clone()));

        if let Some((token, mut done)) = in_process {
            info!(run_id, "Signalling run to stop");
            token.cancel();
            // Err once the run task has dropped its sender
            if tokio::time::timeout(CANCEL_GRACE_PERIOD, done.changed())
                .await
                .is_err()
            {
                warn!(run_id, "Run did not stop within the grace period");
            }
        }

        let record = tracker.get(run_id).await?;
        if !record.is_running() {
            return Ok(record);
        }

        let totals = RunTotals {
            records_processed: record.records_processed,
            rows_skipped: record.rows_skipped,
        };
        match tracker.fail(run_id, totals, CANCELLED_MESSAGE).await {
            Ok(record) => Ok(record),
            // Lost a race with the run finishing on its own
            Err(EtlError::RunNotActive { .. }) => tracker.get(run_id).await,
            Err(e) => Err(e),
        }
    }

    /// Read a page of the published statistics
    pub async fn top(&self, query: &StatsQuery) -> EtlResult<Vec<AggregatedPersonStat>> {
        Ok(self.store.list_stats(query).await?)
    }

    pub async fn table_counts(&self) -> EtlResult<TableCounts> {
        Ok(self.store.table_counts().await?)
    }

    /// Runs executing in this process
    pub async fn active_runs(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.active.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
