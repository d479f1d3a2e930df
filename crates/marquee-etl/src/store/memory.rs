//! Process-local store
//!
//! Base tables are ordered maps keyed by natural key, so upserts overwrite in
//! place. Published statistics sit behind an `Arc` that a recompute swaps in
//! one step: readers holding the old `Arc` keep a consistent view, new readers
//! get the new one.

use super::{
    CatalogStore, RecordBatch, RunStore, StoreError, StoreResult, TableCounts, SUPERSEDED_MESSAGE,
};
use crate::aggregate::{ScoreMode, StatsAccumulator};
use crate::models::{
    AggregatedPersonStat, Dataset, Participation, Person, Rating, RunKind, RunOutcome, RunRecord,
    RunStatus, RunTotals, StatsQuery, Title,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};

/// Operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Upsert(Dataset),
    Recompute,
}

/// Snapshot of the base tables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseTables {
    pub people: BTreeMap<String, Person>,
    pub titles: BTreeMap<String, Title>,
    pub ratings: BTreeMap<String, Rating>,
    pub participations: BTreeMap<(String, i32), Participation>,
}

#[derive(Default)]
struct RunLog {
    runs: Vec<RunRecord>,
    last_id: i64,
}

/// Parks the next recompute after it has computed, before it publishes
struct PublishHold {
    computed: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<BaseTables>,
    stats: RwLock<Arc<Vec<AggregatedPersonStat>>>,
    runs: Mutex<RunLog>,
    recompute_lock: Mutex<()>,
    faults: std::sync::Mutex<HashMap<FailPoint, u32>>,
    publish_hold: std::sync::Mutex<Option<PublishHold>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls at `point` fail with a backend error.
    /// Used to exercise retry and failure paths.
    pub fn inject_failures(&self, point: FailPoint, count: u32) {
        let mut faults = match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        faults.insert(point, count);
    }

    fn check_fault(&self, point: FailPoint) -> StoreResult<()> {
        let mut faults = match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match faults.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::backend(format!("injected failure at {:?}", point)))
            },
            _ => Ok(()),
        }
    }

    /// Stall the next recompute between computing and publishing.
    ///
    /// The returned receiver fires once the new statistics are computed; the
    /// recompute publishes when the sender is used or dropped.
    pub fn hold_next_publish(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (computed_tx, computed_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let mut hold = match self.publish_hold.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *hold = Some(PublishHold {
            computed: computed_tx,
            release: release_rx,
        });
        (computed_rx, release_tx)
    }

    fn take_publish_hold(&self) -> Option<PublishHold> {
        match self.publish_hold.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Copy of the current base tables
    pub async fn tables(&self) -> BaseTables {
        self.tables.read().await.clone()
    }

    /// The currently published statistics
    pub async fn stats_snapshot(&self) -> Arc<Vec<AggregatedPersonStat>> {
        self.stats.read().await.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn upsert(&self, batch: &RecordBatch) -> StoreResult<u64> {
        self.check_fault(FailPoint::Upsert(batch.dataset()))?;

        let mut tables = self.tables.write().await;
        match batch {
            RecordBatch::People(rows) => {
                for row in rows {
                    tables.people.insert(row.nconst.clone(), row.clone());
                }
            },
            RecordBatch::Titles(rows) => {
                for row in rows {
                    tables.titles.insert(row.tconst.clone(), row.clone());
                }
            },
            RecordBatch::Ratings(rows) => {
                for row in rows {
                    tables.ratings.insert(row.tconst.clone(), row.clone());
                }
            },
            RecordBatch::Participations(rows) => {
                for row in rows {
                    tables
                        .participations
                        .insert((row.tconst.clone(), row.ordering), row.clone());
                }
            },
        }

        Ok(batch.len() as u64)
    }

    async fn recompute_stats(&self, mode: ScoreMode) -> StoreResult<u64> {
        let _serialized = self.recompute_lock.lock().await;
        self.check_fault(FailPoint::Recompute)?;

        let computed = {
            let tables = self.tables.read().await;
            let mut acc = StatsAccumulator::new(mode);
            tables.people.values().for_each(|p| acc.add_person(p));
            tables.titles.values().for_each(|t| acc.add_title(t));
            tables.ratings.values().for_each(|r| acc.add_rating(r));
            tables.participations.values().for_each(|p| acc.add_participation(p));
            acc.finish()
        };

        if let Some(hold) = self.take_publish_hold() {
            let _ = hold.computed.send(());
            let _ = hold.release.await;
        }

        let rows = computed.len() as u64;
        *self.stats.write().await = Arc::new(computed);
        debug!(rows, "Published statistics snapshot");
        Ok(rows)
    }

    async fn list_stats(&self, query: &StatsQuery) -> StoreResult<Vec<AggregatedPersonStat>> {
        let query = query.normalized();
        let snapshot = self.stats_snapshot().await;

        Ok(snapshot
            .iter()
            .filter(|stat| query.matches(stat))
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn table_counts(&self) -> StoreResult<TableCounts> {
        let tables = self.tables.read().await;
        let stats = self.stats.read().await;
        Ok(TableCounts {
            people: tables.people.len() as u64,
            titles: tables.titles.len() as u64,
            ratings: tables.ratings.len() as u64,
            participations: tables.participations.len() as u64,
            stats: stats.len() as u64,
        })
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, kind: RunKind, force: bool) -> StoreResult<RunRecord> {
        let mut log = self.runs.lock().await;
        let now = Utc::now();

        for run in log.runs.iter_mut().filter(|r| r.is_running()) {
            if !force {
                return Err(StoreError::RunInProgress(run.id));
            }
            warn!(run_id = run.id, "Forcing new run, marking stale run as failed");
            let totals = RunTotals {
                records_processed: run.records_processed,
                rows_skipped: run.rows_skipped,
            };
            run.finish(
                &RunOutcome::Failed {
                    totals,
                    error: SUPERSEDED_MESSAGE.to_string(),
                },
                now,
            );
        }

        log.last_id += 1;
        let record = RunRecord {
            id: log.last_id,
            kind,
            status: RunStatus::Running,
            started_at: now,
            finished_at: None,
            records_processed: 0,
            rows_skipped: 0,
            error_message: None,
            duration_seconds: None,
        };
        log.runs.push(record.clone());
        Ok(record)
    }

    async fn finish_run(&self, id: i64, outcome: &RunOutcome) -> StoreResult<RunRecord> {
        let mut log = self.runs.lock().await;
        let run = log
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::RunNotFound(id))?;

        if !run.is_running() {
            return Err(StoreError::RunNotRunning {
                id,
                status: run.status,
            });
        }

        run.finish(outcome, Utc::now());
        Ok(run.clone())
    }

    async fn get_run(&self, id: i64) -> StoreResult<Option<RunRecord>> {
        let log = self.runs.lock().await;
        Ok(log.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn latest_run(&self) -> StoreResult<Option<RunRecord>> {
        let log = self.runs.lock().await;
        Ok(log.runs.last().cloned())
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        let log = self.runs.lock().await;
        Ok(log
            .runs
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
