//! Per-person statistics
//!
//! Joins Person × Participation × Title × Rating (inner join, actor and
//! actress roles only), groups by (nconst, role) and computes:
//!
//! - `number_of_titles`: distinct titles in the group
//! - `score`: mean of the joined ratings rounded to two decimals
//!   ([`ScoreMode::Unweighted`], the default) or the vote-weighted mean
//! - `total_runtime_minutes`: runtime summed over joined rows, missing = 0
//!
//! Mean and runtime sum run over joined rows, so a performer credited twice on
//! one title (two orderings) contributes that title twice. This matches the
//! SQL `AVG`/`SUM` used by the Postgres store.

use crate::error::{EtlError, EtlResult};
use crate::models::{AggregatedPersonStat, Participation, Person, Rating, RoleCategory, Title, UnknownVariant};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// How `score` is derived from the joined ratings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMode {
    /// Arithmetic mean of `average_rating`
    #[default]
    Unweighted,
    /// Σ(rating × votes) / Σ votes; falls back to the plain mean when no votes
    VoteWeighted,
}

impl ScoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreMode::Unweighted => "unweighted",
            ScoreMode::VoteWeighted => "vote_weighted",
        }
    }
}

impl fmt::Display for ScoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoreMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unweighted" | "mean" => Ok(ScoreMode::Unweighted),
            "vote_weighted" | "weighted" => Ok(ScoreMode::VoteWeighted),
            _ => Err(UnknownVariant {
                kind: "score mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Round half away from zero to two decimals
pub fn round_score(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Published ordering: score descending, then name, then key
pub fn compare_stats(a: &AggregatedPersonStat, b: &AggregatedPersonStat) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.primary_name.cmp(&b.primary_name))
        .then_with(|| a.nconst.cmp(&b.nconst))
        .then_with(|| a.profession.cmp(&b.profession))
}

#[derive(Default)]
struct GroupTotals<'a> {
    titles: HashSet<&'a str>,
    rows: u64,
    rating_sum: f64,
    weighted_sum: f64,
    votes: i64,
    runtime_minutes: i64,
}

impl GroupTotals<'_> {
    fn score(&self, mode: ScoreMode) -> f64 {
        let mean = self.rating_sum / self.rows as f64;
        let raw = match mode {
            ScoreMode::VoteWeighted if self.votes > 0 => self.weighted_sum / self.votes as f64,
            _ => mean,
        };
        round_score(raw).clamp(0.0, 10.0)
    }
}

/// In-memory join and grouping over borrowed base rows.
///
/// Feed every row with the `add_*` methods in any order, then call
/// [`StatsAccumulator::finish`].
pub struct StatsAccumulator<'a> {
    mode: ScoreMode,
    names: HashMap<&'a str, &'a str>,
    runtimes: HashMap<&'a str, Option<i32>>,
    ratings: HashMap<&'a str, &'a Rating>,
    participations: Vec<&'a Participation>,
}

impl<'a> StatsAccumulator<'a> {
    pub fn new(mode: ScoreMode) -> Self {
        Self {
            mode,
            names: HashMap::new(),
            runtimes: HashMap::new(),
            ratings: HashMap::new(),
            participations: Vec::new(),
        }
    }

    pub fn add_person(&mut self, person: &'a Person) {
        self.names.insert(&person.nconst, &person.primary_name);
    }

    pub fn add_title(&mut self, title: &'a Title) {
        self.runtimes.insert(&title.tconst, title.runtime_minutes);
    }

    pub fn add_rating(&mut self, rating: &'a Rating) {
        self.ratings.insert(&rating.tconst, rating);
    }

    pub fn add_participation(&mut self, participation: &'a Participation) {
        self.participations.push(participation);
    }

    /// Join, group and score. Output is in published order.
    pub fn finish(self) -> Vec<AggregatedPersonStat> {
        let mut groups: HashMap<(&'a str, RoleCategory), GroupTotals<'a>> = HashMap::new();

        for participation in self.participations.iter().copied() {
            let tconst = participation.tconst.as_str();
            let nconst = participation.nconst.as_str();

            let (Some(runtime), Some(rating)) = (self.runtimes.get(tconst), self.ratings.get(tconst))
            else {
                continue;
            };
            if !self.names.contains_key(nconst) {
                continue;
            }

            let group = groups.entry((nconst, participation.category)).or_default();
            group.titles.insert(tconst);
            group.rows += 1;
            group.rating_sum += rating.average_rating;
            group.weighted_sum += rating.average_rating * rating.num_votes as f64;
            group.votes += rating.num_votes;
            group.runtime_minutes += i64::from(runtime.unwrap_or(0));
        }

        let mut stats: Vec<AggregatedPersonStat> = groups
            .into_iter()
            .map(|((nconst, profession), totals)| AggregatedPersonStat {
                nconst: nconst.to_string(),
                primary_name: self.names.get(nconst).copied().unwrap_or_default().to_string(),
                profession,
                number_of_titles: totals.titles.len() as i64,
                score: totals.score(self.mode),
                total_runtime_minutes: totals.runtime_minutes,
            })
            .collect();

        stats.sort_by(compare_stats);
        stats
    }
}

/// Runs the recompute against the configured store
pub struct AggregationEngine {
    store: Arc<dyn Store>,
    mode: ScoreMode,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn Store>, mode: ScoreMode) -> Self {
        Self { store, mode }
    }

    /// Rebuild and atomically publish the statistics. Returns the row count.
    #[instrument(skip(self), fields(mode = %self.mode))]
    pub async fn recompute(&self) -> EtlResult<u64> {
        let started = Instant::now();
        let rows = self
            .store
            .recompute_stats(self.mode)
            .await
            .map_err(EtlError::AggregationFailure)?;

        info!(
            rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statistics recomputed and published"
        );
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{Dataset, Record, StatsQuery};
    use crate::store::memory::{FailPoint, MemoryStore};
    use crate::store::{CatalogStore, RecordBatch};
    use proptest::prelude::*;

    fn person(nconst: &str, name: &str) -> Person {
        Person {
            nconst: nconst.to_string(),
            primary_name: name.to_string(),
            birth_year: None,
            death_year: None,
            primary_profession: vec![],
            known_for_titles: vec![],
        }
    }

    fn title(tconst: &str, runtime: Option<i32>) -> Title {
        Title {
            tconst: tconst.to_string(),
            title_type: "movie".to_string(),
            primary_title: tconst.to_uppercase(),
            original_title: None,
            is_adult: false,
            start_year: Some(2000),
            end_year: None,
            runtime_minutes: runtime,
            genres: vec![],
        }
    }

    fn rating(tconst: &str, average_rating: f64, num_votes: i64) -> Rating {
        Rating {
            tconst: tconst.to_string(),
            average_rating,
            num_votes,
        }
    }

    fn credit(tconst: &str, ordering: i32, nconst: &str, category: RoleCategory) -> Participation {
        Participation {
            tconst: tconst.to_string(),
            ordering,
            nconst: nconst.to_string(),
            category,
            job: None,
            characters: vec![],
        }
    }

    #[derive(Debug)]
    struct Fixture {
        people: Vec<Person>,
        titles: Vec<Title>,
        ratings: Vec<Rating>,
        credits: Vec<Participation>,
    }

    impl Fixture {
        fn compute(&self, mode: ScoreMode) -> Vec<AggregatedPersonStat> {
            let mut acc = StatsAccumulator::new(mode);
            self.people.iter().for_each(|p| acc.add_person(p));
            self.titles.iter().for_each(|t| acc.add_title(t));
            self.ratings.iter().for_each(|r| acc.add_rating(r));
            self.credits.iter().for_each(|c| acc.add_participation(c));
            acc.finish()
        }
    }

    #[test]
    fn test_two_titles_with_runtimes() {
        let fixture = Fixture {
            people: vec![person("nm1", "A")],
            titles: vec![title("tt1", Some(100)), title("tt2", Some(120))],
            ratings: vec![rating("tt1", 8.0, 10), rating("tt2", 6.0, 10)],
            credits: vec![
                credit("tt1", 1, "nm1", RoleCategory::Actor),
                credit("tt2", 1, "nm1", RoleCategory::Actor),
            ],
        };

        let stats = fixture.compute(ScoreMode::Unweighted);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].profession, RoleCategory::Actor);
        assert_eq!(stats[0].number_of_titles, 2);
        assert_eq!(stats[0].score, 7.0);
        assert_eq!(stats[0].total_runtime_minutes, 220);
    }

    #[test]
    fn test_missing_runtime_counts_as_zero() {
        let fixture = Fixture {
            people: vec![person("nm2", "B")],
            titles: vec![title("tt3", None)],
            ratings: vec![rating("tt3", 7.0, 3)],
            credits: vec![credit("tt3", 1, "nm2", RoleCategory::Actress)],
        };

        let stats = fixture.compute(ScoreMode::Unweighted);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].profession, RoleCategory::Actress);
        assert_eq!(stats[0].number_of_titles, 1);
        assert_eq!(stats[0].score, 7.0);
        assert_eq!(stats[0].total_runtime_minutes, 0);
    }

    #[test]
    fn test_unrated_titles_and_unknown_people_are_absent() {
        let fixture = Fixture {
            people: vec![person("nm1", "A")],
            titles: vec![title("tt1", Some(90)), title("tt2", Some(90))],
            ratings: vec![rating("tt2", 5.0, 1)],
            credits: vec![
                credit("tt1", 1, "nm1", RoleCategory::Actor),
                credit("tt2", 1, "nm9", RoleCategory::Actor),
            ],
        };

        assert!(fixture.compute(ScoreMode::Unweighted).is_empty());
    }

    #[test]
    fn test_rating_without_title_is_excluded() {
        let fixture = Fixture {
            people: vec![person("nm1", "A")],
            titles: vec![],
            ratings: vec![rating("tt1", 9.0, 100)],
            credits: vec![credit("tt1", 1, "nm1", RoleCategory::Actor)],
        };

        assert!(fixture.compute(ScoreMode::Unweighted).is_empty());
    }

    #[test]
    fn test_actor_and_actress_roles_are_separate_groups() {
        let fixture = Fixture {
            people: vec![person("nm1", "A")],
            titles: vec![title("tt1", Some(90)), title("tt2", Some(60))],
            ratings: vec![rating("tt1", 8.0, 1), rating("tt2", 4.0, 1)],
            credits: vec![
                credit("tt1", 1, "nm1", RoleCategory::Actor),
                credit("tt2", 1, "nm1", RoleCategory::Actress),
            ],
        };

        let stats = fixture.compute(ScoreMode::Unweighted);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].profession, RoleCategory::Actor);
        assert_eq!(stats[1].profession, RoleCategory::Actress);
    }

    #[test]
    fn test_duplicate_credits_count_title_once() {
        let fixture = Fixture {
            people: vec![person("nm1", "A")],
            titles: vec![title("tt1", Some(90)), title("tt2", Some(10))],
            ratings: vec![rating("tt1", 9.0, 1), rating("tt2", 6.0, 1)],
            credits: vec![
                credit("tt1", 1, "nm1", RoleCategory::Actor),
                credit("tt1", 2, "nm1", RoleCategory::Actor),
                credit("tt2", 1, "nm1", RoleCategory::Actor),
            ],
        };

        let stats = fixture.compute(ScoreMode::Unweighted);
        assert_eq!(stats[0].number_of_titles, 2);
        // Joined rows: 9.0, 9.0, 6.0
        assert_eq!(stats[0].score, 8.0);
        assert_eq!(stats[0].total_runtime_minutes, 190);
    }

    #[test]
    fn test_score_rounding() {
        let fixture = Fixture {
            people: vec![person("nm1", "A")],
            titles: vec![title("tt1", None), title("tt2", None), title("tt3", None)],
            ratings: vec![rating("tt1", 7.0, 1), rating("tt2", 7.0, 1), rating("tt3", 8.0, 1)],
            credits: vec![
                credit("tt1", 1, "nm1", RoleCategory::Actor),
                credit("tt2", 1, "nm1", RoleCategory::Actor),
                credit("tt3", 1, "nm1", RoleCategory::Actor),
            ],
        };

        assert_eq!(fixture.compute(ScoreMode::Unweighted)[0].score, 7.33);
        assert_eq!(round_score(6.666), 6.67);
        assert_eq!(round_score(7.0), 7.0);
    }

    #[test]
    fn test_vote_weighted_mode() {
        let fixture = Fixture {
            people: vec![person("nm1", "A"), person("nm2", "B")],
            titles: vec![title("tt1", None), title("tt2", None), title("tt3", None)],
            ratings: vec![rating("tt1", 9.0, 300), rating("tt2", 5.0, 100), rating("tt3", 6.0, 0)],
            credits: vec![
                credit("tt1", 1, "nm1", RoleCategory::Actor),
                credit("tt2", 1, "nm1", RoleCategory::Actor),
                credit("tt3", 1, "nm2", RoleCategory::Actor),
            ],
        };

        let weighted = fixture.compute(ScoreMode::VoteWeighted);
        assert_eq!(weighted[0].nconst, "nm1");
        assert_eq!(weighted[0].score, 8.0);
        // No votes at all: fall back to the plain mean
        assert_eq!(weighted[1].score, 6.0);

        let unweighted = fixture.compute(ScoreMode::Unweighted);
        assert_eq!(unweighted[0].score, 7.0);
    }

    #[test]
    fn test_published_order() {
        let fixture = Fixture {
            people: vec![person("nm1", "Zed"), person("nm2", "Amy"), person("nm3", "Bob")],
            titles: vec![title("tt1", None), title("tt2", None)],
            ratings: vec![rating("tt1", 6.0, 1), rating("tt2", 8.0, 1)],
            credits: vec![
                credit("tt1", 1, "nm1", RoleCategory::Actor),
                credit("tt1", 2, "nm2", RoleCategory::Actress),
                credit("tt2", 1, "nm3", RoleCategory::Actor),
            ],
        };

        let names: Vec<String> = fixture
            .compute(ScoreMode::Unweighted)
            .into_iter()
            .map(|s| s.primary_name)
            .collect();
        assert_eq!(names, vec!["Bob", "Amy", "Zed"]);
    }

    #[test]
    fn test_score_mode_from_str() {
        assert_eq!("weighted".parse::<ScoreMode>().unwrap(), ScoreMode::VoteWeighted);
        assert_eq!("UNWEIGHTED".parse::<ScoreMode>().unwrap(), ScoreMode::Unweighted);
        assert!("median".parse::<ScoreMode>().is_err());
    }

    #[tokio::test]
    async fn test_failed_recompute_keeps_previous_stats() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert(&RecordBatch::from_records(Dataset::People, vec![Record::Person(person("nm1", "A"))]))
            .await
            .unwrap();
        store
            .upsert(&RecordBatch::Titles(vec![title("tt1", Some(90))]))
            .await
            .unwrap();
        store
            .upsert(&RecordBatch::Ratings(vec![rating("tt1", 7.5, 10)]))
            .await
            .unwrap();
        store
            .upsert(&RecordBatch::Participations(vec![credit("tt1", 1, "nm1", RoleCategory::Actor)]))
            .await
            .unwrap();

        let engine = AggregationEngine::new(store.clone(), ScoreMode::Unweighted);
        assert_eq!(engine.recompute().await.unwrap(), 1);
        let before = store.list_stats(&StatsQuery::default()).await.unwrap();

        store
            .upsert(&RecordBatch::Ratings(vec![rating("tt1", 2.0, 10)]))
            .await
            .unwrap();
        store.inject_failures(FailPoint::Recompute, 1);

        let err = engine.recompute().await.unwrap_err();
        assert!(matches!(err, EtlError::AggregationFailure(_)));
        assert_eq!(store.list_stats(&StatsQuery::default()).await.unwrap(), before);
    }

    fn arb_fixture() -> impl Strategy<Value = Fixture> {
        let ratings = prop::collection::vec((0u32..=100, 0i64..1000), 1..8);
        let runtimes = prop::collection::vec(prop::option::of(1i32..300), 8);
        let credits = prop::collection::vec((0usize..10, 0usize..4, any::<bool>()), 0..40);

        (ratings, runtimes, credits).prop_map(|(ratings, runtimes, credits)| {
            let people = (0..3).map(|i| person(&format!("nm{}", i), &format!("P{}", i))).collect();
            let titles = runtimes
                .iter()
                .enumerate()
                .map(|(i, runtime)| title(&format!("tt{}", i), *runtime))
                .collect();
            let ratings = ratings
                .iter()
                .enumerate()
                .map(|(i, (tenths, votes))| rating(&format!("tt{}", i), f64::from(*tenths) / 10.0, *votes))
                .collect();
            let credits = credits
                .iter()
                .enumerate()
                .map(|(ordering, (t, p, actress))| {
                    let category = if *actress { RoleCategory::Actress } else { RoleCategory::Actor };
                    credit(&format!("tt{}", t), ordering as i32, &format!("nm{}", p), category)
                })
                .collect();
            Fixture {
                people,
                titles,
                ratings,
                credits,
            }
        })
    }

    proptest! {
        #[test]
        fn prop_scores_are_bounded_and_rounded(fixture in arb_fixture(), weighted in any::<bool>()) {
            let mode = if weighted { ScoreMode::VoteWeighted } else { ScoreMode::Unweighted };
            for stat in fixture.compute(mode) {
                prop_assert!((0.0..=10.0).contains(&stat.score));
                prop_assert!(((stat.score * 100.0).round() - stat.score * 100.0).abs() < 1e-6);
                prop_assert!(stat.number_of_titles >= 1);
                prop_assert!(stat.total_runtime_minutes >= 0);
            }
        }

        #[test]
        fn prop_title_count_matches_distinct_joined_titles(fixture in arb_fixture()) {
            let stats = fixture.compute(ScoreMode::Unweighted);
            let rated: HashSet<&str> = fixture.ratings.iter().map(|r| r.tconst.as_str()).collect();
            let known_people: HashSet<&str> = fixture.people.iter().map(|p| p.nconst.as_str()).collect();

            for stat in &stats {
                let expected: HashSet<&str> = fixture
                    .credits
                    .iter()
                    .filter(|c| c.nconst == stat.nconst && c.category == stat.profession)
                    .map(|c| c.tconst.as_str())
                    .filter(|t| rated.contains(t))
                    .collect();
                prop_assert_eq!(stat.number_of_titles as usize, expected.len());
            }

            // Every qualifying (person, role) pair is present exactly once
            let qualifying: HashSet<(&str, RoleCategory)> = fixture
                .credits
                .iter()
                .filter(|c| rated.contains(c.tconst.as_str()) && known_people.contains(c.nconst.as_str()))
                .map(|c| (c.nconst.as_str(), c.category))
                .collect();
            prop_assert_eq!(stats.len(), qualifying.len());
        }
    }
}
