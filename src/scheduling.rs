//! Scheduling strategies: which eligible queued task a worker is offered next.
//!
//! Selection is a pure function over candidates the store has already
//! filtered (queued, past `not_before`, matching type and capabilities). It
//! never writes; the claim that follows is a separate conditional update, so
//! two workers selecting the same candidate cannot both own it.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{Capabilities, TaskId};

/// A claimable task as seen by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: TaskId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Insertion order; breaks `created_at` ties within one millisecond.
    pub seq: i64,
    pub requirements: Capabilities,
}

/// Maps a priority to a relative selection weight.
pub type WeightFn = fn(i32) -> f64;

/// `1 / priority`, with priorities below 1 treated as 1.
pub fn inverse_priority(priority: i32) -> f64 {
    1.0 / f64::from(priority.max(1))
}

/// The closed set of selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Fifo,
    Lifo,
    #[default]
    Priority,
    WeightedRandom,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Fifo,
        StrategyKind::Lifo,
        StrategyKind::Priority,
        StrategyKind::WeightedRandom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Fifo => "fifo",
            StrategyKind::Lifo => "lifo",
            StrategyKind::Priority => "priority",
            StrategyKind::WeightedRandom => "weighted_random",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(StrategyKind::Fifo),
            "lifo" => Ok(StrategyKind::Lifo),
            "priority" => Ok(StrategyKind::Priority),
            "weighted_random" | "weighted-random" => Ok(StrategyKind::WeightedRandom),
            other => Err(Error::Validation(format!(
                "unknown scheduling strategy '{other}' (expected fifo, lifo, priority, or weighted_random)"
            ))),
        }
    }
}

/// A configured strategy.
#[derive(Debug, Clone, Copy, Default)]
pub enum SchedulingStrategy {
    Fifo,
    Lifo,
    #[default]
    Priority,
    WeightedRandom { weight: WeightFn },
}

impl From<StrategyKind> for SchedulingStrategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Fifo => SchedulingStrategy::Fifo,
            StrategyKind::Lifo => SchedulingStrategy::Lifo,
            StrategyKind::Priority => SchedulingStrategy::Priority,
            StrategyKind::WeightedRandom => SchedulingStrategy::WeightedRandom {
                weight: inverse_priority,
            },
        }
    }
}

impl SchedulingStrategy {
    /// Weighted-random with a custom weight function.
    pub fn weighted_random(weight: WeightFn) -> Self {
        SchedulingStrategy::WeightedRandom { weight }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            SchedulingStrategy::Fifo => StrategyKind::Fifo,
            SchedulingStrategy::Lifo => StrategyKind::Lifo,
            SchedulingStrategy::Priority => StrategyKind::Priority,
            SchedulingStrategy::WeightedRandom { .. } => StrategyKind::WeightedRandom,
        }
    }

    /// ORDER BY used when paging candidates out of the store, so the best
    /// candidates for this strategy come first.
    pub(crate) fn candidate_order(&self) -> &'static str {
        match self {
            SchedulingStrategy::Fifo => "created_at ASC, rowid ASC",
            SchedulingStrategy::Lifo => "created_at DESC, rowid DESC",
            SchedulingStrategy::Priority | SchedulingStrategy::WeightedRandom { .. } => {
                "priority ASC, created_at ASC, rowid ASC"
            }
        }
    }

    /// Pick one candidate. `None` only when `candidates` is empty (or every
    /// weight is zero for weighted-random).
    pub fn select_next<R: Rng>(&self, candidates: &[Candidate], rng: &mut R) -> Option<TaskId> {
        match self {
            SchedulingStrategy::Fifo => candidates
                .iter()
                .min_by_key(|c| (c.created_at, c.seq))
                .map(|c| c.id),
            SchedulingStrategy::Lifo => candidates
                .iter()
                .max_by_key(|c| (c.created_at, c.seq))
                .map(|c| c.id),
            SchedulingStrategy::Priority => candidates
                .iter()
                .min_by_key(|c| (c.priority, c.created_at, c.seq))
                .map(|c| c.id),
            SchedulingStrategy::WeightedRandom { weight } => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|c| {
                        let w = weight(c.priority);
                        if w.is_finite() && w > 0.0 { w } else { 0.0 }
                    })
                    .collect();
                let index = WeightedIndex::new(&weights).ok()?;
                Some(candidates[index.sample(rng)].id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn candidate(seq: i64, priority: i32, age_secs: i64) -> Candidate {
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Candidate {
            id: TaskId::new(),
            priority,
            created_at: base - Duration::seconds(age_secs),
            seq,
            requirements: Capabilities::new(),
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn empty_candidates_select_nothing() {
        for kind in StrategyKind::ALL {
            let strategy = SchedulingStrategy::from(kind);
            assert_eq!(strategy.select_next(&[], &mut rng()), None);
        }
    }

    #[test]
    fn fifo_picks_oldest() {
        let cs = vec![candidate(1, 0, 10), candidate(2, 0, 30), candidate(3, 0, 20)];
        let picked = SchedulingStrategy::Fifo.select_next(&cs, &mut rng());
        assert_eq!(picked, Some(cs[1].id));
    }

    #[test]
    fn lifo_picks_newest() {
        let cs = vec![candidate(1, 0, 10), candidate(2, 0, 30), candidate(3, 0, 5)];
        let picked = SchedulingStrategy::Lifo.select_next(&cs, &mut rng());
        assert_eq!(picked, Some(cs[2].id));
    }

    #[test]
    fn fifo_breaks_same_instant_ties_by_insertion() {
        let cs = vec![candidate(7, 0, 10), candidate(3, 0, 10)];
        let picked = SchedulingStrategy::Fifo.select_next(&cs, &mut rng());
        assert_eq!(picked, Some(cs[1].id));
    }

    #[test]
    fn priority_prefers_lower_value_then_older() {
        let cs = vec![
            candidate(1, 5, 100),
            candidate(2, 1, 10),
            candidate(3, 1, 20),
            candidate(4, 9, 500),
        ];
        let picked = SchedulingStrategy::Priority.select_next(&cs, &mut rng());
        assert_eq!(picked, Some(cs[2].id));
    }

    #[test]
    fn weighted_random_is_reproducible_with_a_seed() {
        let cs: Vec<_> = (0..8).map(|i| candidate(i, (i % 4) as i32 + 1, i)).collect();
        let strategy = SchedulingStrategy::from(StrategyKind::WeightedRandom);

        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| strategy.select_next(&cs, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn weighted_random_favours_urgent_tasks() {
        let cs = vec![candidate(1, 1, 0), candidate(2, 10, 0)];
        let strategy = SchedulingStrategy::from(StrategyKind::WeightedRandom);
        let mut rng = rng();
        let urgent = (0..2000)
            .filter(|_| strategy.select_next(&cs, &mut rng) == Some(cs[0].id))
            .count();
        // Expected share is 10/11.
        assert!(urgent > 1700, "urgent picked {urgent} times");
    }

    #[test]
    fn weighted_random_with_custom_weight_can_exclude() {
        fn only_zero(priority: i32) -> f64 {
            if priority == 0 { 1.0 } else { 0.0 }
        }
        let cs = vec![candidate(1, 3, 0), candidate(2, 0, 0)];
        let strategy = SchedulingStrategy::weighted_random(only_zero);
        let mut rng = rng();
        for _ in 0..50 {
            assert_eq!(strategy.select_next(&cs, &mut rng), Some(cs[1].id));
        }
        assert_eq!(strategy.select_next(&cs[..1], &mut rng), None);
    }

    #[test]
    fn kinds_parse_from_config_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<StrategyKind>().unwrap(), kind);
        }
        assert!(matches!(
            "round_robin".parse::<StrategyKind>(),
            Err(Error::Validation(_))
        ));
    }
}
