//! PostgreSQL store
//!
//! Base tables are written with multi-row `INSERT .. ON CONFLICT DO UPDATE`.
//! A recompute rebuilds `actor_ratings` inside one transaction, so readers see
//! either the previous rows or the new ones. The run lock is the partial
//! unique index `idx_etl_runs_single_running`.

use super::{
    CatalogStore, RecordBatch, RunStore, StoreError, StoreResult, TableCounts, SUPERSEDED_MESSAGE,
};
use crate::aggregate::ScoreMode;
use crate::config::DatabaseConfig;
use crate::models::{
    AggregatedPersonStat, Participation, Person, Rating, RunKind, RunOutcome, RunRecord,
    RunStatus, RunTotals, StatsQuery, Title,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transaction-scoped advisory lock key serializing recomputes
const RECOMPUTE_LOCK_KEY: i64 = 0x6d61_7271;

const RUN_COLUMNS: &str = "id, kind, dataset, status, started_at, finished_at, \
                           records_processed, rows_skipped, error_message, duration_seconds";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct StatRow {
    nconst: String,
    primary_name: String,
    profession: String,
    number_of_titles: i64,
    score: f64,
    total_runtime_minutes: i64,
}

impl TryFrom<StatRow> for AggregatedPersonStat {
    type Error = StoreError;

    fn try_from(row: StatRow) -> Result<Self, Self::Error> {
        Ok(AggregatedPersonStat {
            profession: row
                .profession
                .parse()
                .map_err(|e| StoreError::decode(format!("actor_ratings.profession: {}", e)))?,
            nconst: row.nconst,
            primary_name: row.primary_name,
            number_of_titles: row.number_of_titles,
            score: row.score,
            total_runtime_minutes: row.total_runtime_minutes,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    kind: String,
    dataset: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    records_processed: i64,
    rows_skipped: i64,
    error_message: Option<String>,
    duration_seconds: Option<i64>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let kind = RunKind::from_parts(&row.kind, row.dataset.as_deref())
            .map_err(|e| StoreError::decode(format!("etl_runs.kind of run {}: {}", row.id, e)))?;
        let status = row
            .status
            .parse::<RunStatus>()
            .map_err(|e| StoreError::decode(format!("etl_runs.status of run {}: {}", row.id, e)))?;

        Ok(RunRecord {
            id: row.id,
            kind,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            records_processed: row.records_processed,
            rows_skipped: row.rows_skipped,
            error_message: row.error_message,
            duration_seconds: row.duration_seconds,
        })
    }
}

/// Escape `%`, `_` and `\` so user input matches literally inside `LIKE`
fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn score_expression(mode: ScoreMode) -> &'static str {
    match mode {
        ScoreMode::Unweighted => "ROUND(AVG(r.average_rating)::numeric, 2)::float8",
        ScoreMode::VoteWeighted => {
            "COALESCE(\
                ROUND((SUM(r.average_rating * r.num_votes) / NULLIF(SUM(r.num_votes), 0))::numeric, 2)::float8, \
                ROUND(AVG(r.average_rating)::numeric, 2)::float8\
            )"
        },
    }
}

impl PgStore {
    /// Open a connection pool
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    async fn upsert_people(&self, rows: &[Person]) -> StoreResult<u64> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO people (nconst, primary_name, birth_year, death_year, \
             primary_profession, known_for_titles) ",
        );
        qb.push_values(rows, |mut b, p| {
            b.push_bind(&p.nconst)
                .push_bind(&p.primary_name)
                .push_bind(p.birth_year)
                .push_bind(p.death_year)
                .push_bind(&p.primary_profession)
                .push_bind(&p.known_for_titles);
        });
        qb.push(
            " ON CONFLICT (nconst) DO UPDATE SET \
             primary_name = EXCLUDED.primary_name, \
             birth_year = EXCLUDED.birth_year, \
             death_year = EXCLUDED.death_year, \
             primary_profession = EXCLUDED.primary_profession, \
             known_for_titles = EXCLUDED.known_for_titles",
        );

        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_titles(&self, rows: &[Title]) -> StoreResult<u64> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO titles (tconst, title_type, primary_title, original_title, is_adult, \
             start_year, end_year, runtime_minutes, genres) ",
        );
        qb.push_values(rows, |mut b, t| {
            b.push_bind(&t.tconst)
                .push_bind(&t.title_type)
                .push_bind(&t.primary_title)
                .push_bind(&t.original_title)
                .push_bind(t.is_adult)
                .push_bind(t.start_year)
                .push_bind(t.end_year)
                .push_bind(t.runtime_minutes)
                .push_bind(&t.genres);
        });
        qb.push(
            " ON CONFLICT (tconst) DO UPDATE SET \
             title_type = EXCLUDED.title_type, \
             primary_title = EXCLUDED.primary_title, \
             original_title = EXCLUDED.original_title, \
             is_adult = EXCLUDED.is_adult, \
             start_year = EXCLUDED.start_year, \
             end_year = EXCLUDED.end_year, \
             runtime_minutes = EXCLUDED.runtime_minutes, \
             genres = EXCLUDED.genres",
        );

        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_ratings(&self, rows: &[Rating]) -> StoreResult<u64> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO ratings (tconst, average_rating, num_votes) ");
        qb.push_values(rows, |mut b, r| {
            b.push_bind(&r.tconst)
                .push_bind(r.average_rating)
                .push_bind(r.num_votes);
        });
        qb.push(
            " ON CONFLICT (tconst) DO UPDATE SET \
             average_rating = EXCLUDED.average_rating, \
             num_votes = EXCLUDED.num_votes",
        );

        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_participations(&self, rows: &[Participation]) -> StoreResult<u64> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO principals (tconst, ordering, nconst, category, job, characters) ",
        );
        qb.push_values(rows, |mut b, p| {
            b.push_bind(&p.tconst)
                .push_bind(p.ordering)
                .push_bind(&p.nconst)
                .push_bind(p.category.as_str())
                .push_bind(&p.job)
                .push_bind(&p.characters);
        });
        qb.push(
            " ON CONFLICT (tconst, ordering) DO UPDATE SET \
             nconst = EXCLUDED.nconst, \
             category = EXCLUDED.category, \
             job = EXCLUDED.job, \
             characters = EXCLUDED.characters",
        );

        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    /// Lock and load one run inside `tx`
    async fn lock_run(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM etl_runs WHERE id = $1 FOR UPDATE",
            RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    /// Persist the terminal fields of `run`
    async fn write_terminal(tx: &mut Transaction<'_, Postgres>, run: &RunRecord) -> StoreResult<()> {
        sqlx::query(
            "UPDATE etl_runs SET status = $2, finished_at = $3, records_processed = $4, \
             rows_skipped = $5, error_message = $6, duration_seconds = $7 WHERE id = $1",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(run.records_processed)
        .bind(run.rows_skipped)
        .bind(&run.error_message)
        .bind(run.duration_seconds)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn running_run_id(&self) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM etl_runs WHERE status = 'running' ORDER BY id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn upsert(&self, batch: &RecordBatch) -> StoreResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let written = match batch {
            RecordBatch::People(rows) => self.upsert_people(rows).await?,
            RecordBatch::Titles(rows) => self.upsert_titles(rows).await?,
            RecordBatch::Ratings(rows) => self.upsert_ratings(rows).await?,
            RecordBatch::Participations(rows) => self.upsert_participations(rows).await?,
        };

        debug!(dataset = %batch.dataset(), written, "Upserted batch");
        Ok(written)
    }

    async fn recompute_stats(&self, mode: ScoreMode) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(RECOMPUTE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM actor_ratings").execute(&mut *tx).await?;

        let insert = format!(
            "INSERT INTO actor_ratings \
                 (nconst, primary_name, profession, score, number_of_titles, total_runtime_minutes) \
             SELECT p.nconst, p.primary_name, pr.category, \
                 LEAST(GREATEST({score}, 0), 10), \
                 COUNT(DISTINCT pr.tconst), \
                 COALESCE(SUM(COALESCE(t.runtime_minutes, 0)), 0) \
             FROM principals pr \
             JOIN people p ON p.nconst = pr.nconst \
             JOIN titles t ON t.tconst = pr.tconst \
             JOIN ratings r ON r.tconst = pr.tconst \
             WHERE pr.category IN ('actor', 'actress') \
             GROUP BY p.nconst, p.primary_name, pr.category",
            score = score_expression(mode)
        );
        let rows = sqlx::query(&insert).execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        debug!(rows, mode = %mode, "Published statistics");
        Ok(rows)
    }

    async fn list_stats(&self, query: &StatsQuery) -> StoreResult<Vec<AggregatedPersonStat>> {
        let query = query.normalized();
        let pattern = query.name_contains.as_deref().map(escape_like);

        let rows = sqlx::query_as::<_, StatRow>(
            r#"
            SELECT nconst, primary_name, profession, number_of_titles, score, total_runtime_minutes
            FROM actor_ratings
            WHERE ($1::text IS NULL OR profession = $1)
              AND ($2::text IS NULL OR lower(primary_name) LIKE '%' || lower($2) || '%' ESCAPE '\')
            ORDER BY score DESC, primary_name COLLATE "C", nconst, profession
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(query.profession.map(|p| p.as_str()))
        .bind(pattern)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AggregatedPersonStat::try_from).collect()
    }

    async fn table_counts(&self) -> StoreResult<TableCounts> {
        let (people, titles, ratings, participations, stats): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT \
                 (SELECT COUNT(*) FROM people), \
                 (SELECT COUNT(*) FROM titles), \
                 (SELECT COUNT(*) FROM ratings), \
                 (SELECT COUNT(*) FROM principals), \
                 (SELECT COUNT(*) FROM actor_ratings)",
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(TableCounts {
            people: people as u64,
            titles: titles as u64,
            ratings: ratings as u64,
            participations: participations as u64,
            stats: stats as u64,
        })
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn insert_run(&self, kind: RunKind, force: bool) -> StoreResult<RunRecord> {
        let mut tx = self.pool.begin().await?;

        if force {
            let stale = sqlx::query_as::<_, RunRow>(&format!(
                "SELECT {} FROM etl_runs WHERE status = 'running' FOR UPDATE",
                RUN_COLUMNS
            ))
            .fetch_all(&mut *tx)
            .await?;

            for row in stale {
                let mut run = RunRecord::try_from(row)?;
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
                    Utc::now(),
                );
                Self::write_terminal(&mut tx, &run).await?;
            }
        }

        let inserted = sqlx::query_as::<_, RunRow>(&format!(
            "INSERT INTO etl_runs (kind, dataset, status, started_at) \
             VALUES ($1, $2, 'running', $3) RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(kind.dataset().map(|d| d.as_str()))
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(row) => {
                tx.commit().await?;
                RunRecord::try_from(row)
            },
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await?;
                let running = self.running_run_id().await?.unwrap_or_default();
                Err(StoreError::RunInProgress(running))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_run(&self, id: i64, outcome: &RunOutcome) -> StoreResult<RunRecord> {
        let mut tx = self.pool.begin().await?;

        let mut run = Self::lock_run(&mut tx, id)
            .await?
            .ok_or(StoreError::RunNotFound(id))?;
        if !run.is_running() {
            return Err(StoreError::RunNotRunning {
                id,
                status: run.status,
            });
        }

        run.finish(outcome, Utc::now());
        Self::write_terminal(&mut tx, &run).await?;
        tx.commit().await?;
        Ok(run)
    }

    async fn get_run(&self, id: i64) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM etl_runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn latest_run(&self) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM etl_runs ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM etl_runs ORDER BY id DESC LIMIT $1",
            RUN_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("Tom"), "Tom");
        assert_eq!(escape_like("100%_a\\b"), "100\\%\\_a\\\\b");
    }

    #[test]
    fn test_score_expression_weighted_falls_back() {
        assert!(score_expression(ScoreMode::Unweighted).starts_with("ROUND(AVG"));
        let weighted = score_expression(ScoreMode::VoteWeighted);
        assert!(weighted.starts_with("COALESCE("));
        assert!(weighted.contains("NULLIF(SUM(r.num_votes), 0)"));
    }

    #[test]
    fn test_run_row_decodes() {
        let row = RunRow {
            id: 7,
            kind: "partial".to_string(),
            dataset: Some("ratings".to_string()),
            status: "success".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            records_processed: 3,
            rows_skipped: 1,
            error_message: None,
            duration_seconds: None,
        };
        let run = RunRecord::try_from(row).unwrap();
        assert_eq!(run.kind, RunKind::Partial(crate::models::Dataset::Ratings));
        assert_eq!(run.status, RunStatus::Succeeded);
    }

    #[test]
    fn test_corrupt_run_row_is_decode_error() {
        let row = RunRow {
            id: 8,
            kind: "partial".to_string(),
            dataset: None,
            status: "running".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            records_processed: 0,
            rows_skipped: 0,
            error_message: None,
            duration_seconds: None,
        };
        assert!(matches!(RunRecord::try_from(row), Err(StoreError::Decode(_))));
    }
}
