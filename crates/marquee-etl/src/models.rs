//! Domain types shared by every stage of the pipeline
//!
//! Base records mirror the four source dumps one-to-one. Derived rows
//! ([`AggregatedPersonStat`]) and run bookkeeping ([`RunRecord`]) live here too
//! so the store implementations only depend on this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Timestamp layout used in human-readable run status messages
pub const STATUS_TIME_FORMAT: &str = "%d-%m-%Y %H:%M";

/// Default page size for stats queries
pub const DEFAULT_STATS_LIMIT: i64 = 100;

/// Upper bound for a single stats page
pub const MAX_STATS_LIMIT: i64 = 1000;

/// Returned when a string does not name a known variant
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Datasets
// ============================================================================

/// One of the four source dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    People,
    Titles,
    Ratings,
    Participations,
}

impl Dataset {
    /// Load order for a full run. Parents first so partial failures leave
    /// referenced rows in place.
    pub const ALL: [Dataset; 4] = [
        Dataset::People,
        Dataset::Titles,
        Dataset::Ratings,
        Dataset::Participations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::People => "people",
            Dataset::Titles => "titles",
            Dataset::Ratings => "ratings",
            Dataset::Participations => "participations",
        }
    }

    /// File name of the compressed dump at the source location
    pub fn file_name(&self) -> &'static str {
        match self {
            Dataset::People => "name.basics.tsv.gz",
            Dataset::Titles => "title.basics.tsv.gz",
            Dataset::Ratings => "title.ratings.tsv.gz",
            Dataset::Participations => "title.principals.tsv.gz",
        }
    }

    /// Header row every dump must start with
    pub fn expected_header(&self) -> &'static [&'static str] {
        match self {
            Dataset::People => &[
                "nconst",
                "primaryName",
                "birthYear",
                "deathYear",
                "primaryProfession",
                "knownForTitles",
            ],
            Dataset::Titles => &[
                "tconst",
                "titleType",
                "primaryTitle",
                "originalTitle",
                "isAdult",
                "startYear",
                "endYear",
                "runtimeMinutes",
                "genres",
            ],
            Dataset::Ratings => &["tconst", "averageRating", "numVotes"],
            Dataset::Participations => &[
                "tconst",
                "ordering",
                "nconst",
                "category",
                "job",
                "characters",
            ],
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "people" | "names" | "name.basics" => Ok(Dataset::People),
            "titles" | "title.basics" => Ok(Dataset::Titles),
            "ratings" | "title.ratings" => Ok(Dataset::Ratings),
            "participations" | "principals" | "title.principals" => Ok(Dataset::Participations),
            _ => Err(UnknownVariant::new("dataset", s)),
        }
    }
}

/// Role categories that contribute to statistics. Every other category in the
/// participations dump is discarded at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleCategory {
    Actor,
    Actress,
}

impl RoleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleCategory::Actor => "actor",
            RoleCategory::Actress => "actress",
        }
    }
}

impl fmt::Display for RoleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleCategory {
    type Err = UnknownVariant;

    /// Exact match on the lowercase source value
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "actor" => Ok(RoleCategory::Actor),
            "actress" => Ok(RoleCategory::Actress),
            _ => Err(UnknownVariant::new("role category", s)),
        }
    }
}

// ============================================================================
// Base records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub nconst: String,
    pub primary_name: String,
    pub birth_year: Option<i32>,
    pub death_year: Option<i32>,
    pub primary_profession: Vec<String>,
    pub known_for_titles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    pub tconst: String,
    pub title_type: String,
    pub primary_title: String,
    pub original_title: Option<String>,
    pub is_adult: bool,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub runtime_minutes: Option<i32>,
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub tconst: String,
    /// Always within [0, 10]
    pub average_rating: f64,
    pub num_votes: i64,
}

/// A performer's credit on a title. Keyed by (tconst, ordering).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub tconst: String,
    pub ordering: i32,
    pub nconst: String,
    pub category: RoleCategory,
    pub job: Option<String>,
    pub characters: Vec<String>,
}

/// A parsed row from any dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dataset", rename_all = "snake_case")]
pub enum Record {
    Person(Person),
    Title(Title),
    Rating(Rating),
    Participation(Participation),
}

impl Record {
    pub fn dataset(&self) -> Dataset {
        match self {
            Record::Person(_) => Dataset::People,
            Record::Title(_) => Dataset::Titles,
            Record::Rating(_) => Dataset::Ratings,
            Record::Participation(_) => Dataset::Participations,
        }
    }
}

// ============================================================================
// Derived statistics
// ============================================================================

/// One row of the published statistics, keyed by (nconst, profession)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPersonStat {
    pub nconst: String,
    pub primary_name: String,
    pub profession: RoleCategory,
    /// Distinct titles that have both a title row and a rating
    pub number_of_titles: i64,
    /// Mean rating rounded to two decimals
    pub score: f64,
    /// Sum of known runtimes, missing runtimes count as 0
    pub total_runtime_minutes: i64,
}

/// Filters and paging for reading published statistics.
///
/// Results are ordered by score descending, then name ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsQuery {
    pub profession: Option<RoleCategory>,
    /// Case-insensitive substring match on the primary name
    pub name_contains: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for StatsQuery {
    fn default() -> Self {
        Self {
            profession: None,
            name_contains: None,
            limit: DEFAULT_STATS_LIMIT,
            offset: 0,
        }
    }
}

impl StatsQuery {
    pub fn with_profession(mut self, profession: RoleCategory) -> Self {
        self.profession = Some(profession);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name_contains = Some(name.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Clamp paging into valid ranges and drop blank name filters
    pub fn normalized(&self) -> Self {
        Self {
            profession: self.profession,
            name_contains: self
                .name_contains
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            limit: self.limit.clamp(1, MAX_STATS_LIMIT),
            offset: self.offset.max(0),
        }
    }

    /// In-memory equivalent of the SQL filter
    pub fn matches(&self, stat: &AggregatedPersonStat) -> bool {
        if let Some(profession) = self.profession {
            if stat.profession != profession {
                return false;
            }
        }
        match self.name_contains.as_deref() {
            Some(needle) => stat
                .primary_name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

// ============================================================================
// Run bookkeeping
// ============================================================================

/// What a run was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "dataset", rename_all = "snake_case")]
pub enum RunKind {
    /// All four datasets followed by a recompute
    Full,
    /// A single dataset; statistics are left untouched
    Partial(Dataset),
    /// Recompute statistics from the current base tables only
    Recompute,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Full => "full",
            RunKind::Partial(_) => "partial",
            RunKind::Recompute => "recompute",
        }
    }

    pub fn dataset(&self) -> Option<Dataset> {
        match self {
            RunKind::Partial(dataset) => Some(*dataset),
            _ => None,
        }
    }

    /// Rebuild from the `kind` and `dataset` columns of a stored run
    pub fn from_parts(kind: &str, dataset: Option<&str>) -> Result<Self, UnknownVariant> {
        match (kind, dataset) {
            ("full", _) => Ok(RunKind::Full),
            ("recompute", _) => Ok(RunKind::Recompute),
            ("partial", Some(dataset)) => Ok(RunKind::Partial(dataset.parse()?)),
            _ => Err(UnknownVariant::new("run kind", kind)),
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Partial(dataset) => write!(f, "partial({})", dataset),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" | "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(UnknownVariant::new("run status", s)),
        }
    }
}

/// Counters recorded when a run reaches a terminal state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub records_processed: i64,
    pub rows_skipped: i64,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded(RunTotals),
    Failed { totals: RunTotals, error: String },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Succeeded(_) => RunStatus::Succeeded,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    pub fn totals(&self) -> RunTotals {
        match self {
            RunOutcome::Succeeded(totals) => *totals,
            RunOutcome::Failed { totals, .. } => *totals,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded(_) => None,
            RunOutcome::Failed { error, .. } => Some(error),
        }
    }
}

/// A single ETL run as persisted in the run log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub kind: RunKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub rows_skipped: i64,
    pub error_message: Option<String>,
    pub duration_seconds: Option<i64>,
}

impl RunRecord {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Apply a terminal outcome at `finished_at`
    pub fn finish(&mut self, outcome: &RunOutcome, finished_at: DateTime<Utc>) {
        let totals = outcome.totals();
        self.status = outcome.status();
        self.finished_at = Some(finished_at);
        self.records_processed = totals.records_processed;
        self.rows_skipped = totals.rows_skipped;
        self.error_message = outcome.error_message().map(str::to_string);
        self.duration_seconds = Some((finished_at - self.started_at).num_seconds().max(0));
    }

    /// One-line summary, e.g. "Finished running successfully at 18-01-2025 14:05"
    pub fn status_message(&self) -> String {
        match (self.status, self.finished_at) {
            (RunStatus::Succeeded, Some(at)) => format!(
                "Finished running successfully at {}",
                at.format(STATUS_TIME_FORMAT)
            ),
            (RunStatus::Failed, Some(at)) => format!(
                "Finished running unsuccessfully at {}",
                at.format(STATUS_TIME_FORMAT)
            ),
            _ => format!(
                "Started running at {}",
                self.started_at.format(STATUS_TIME_FORMAT)
            ),
        }
    }
}
