//! Offline evaluation of the reducer and merger.
//!
//! Synthetic item pools carry hidden integer scores; a simulated rater answers
//! every question from those scores, so runs are deterministic and the
//! produced ranking can be checked against the truth.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::decision::Decision;
use crate::merger::{ListMerger, MergeError, MergeOptions, WindowPolicy};
use crate::node::{ItemId, Ranking};
use crate::reducer::{ReduceError, TournamentReducer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseKind {
    /// One pool, reduced by one rater.
    Reduce,
    /// Items split across raters, each reduced separately, then merged.
    Merge { raters: usize, policy: WindowPolicy },
}

#[derive(Debug, Clone)]
pub struct SyntheticCase {
    pub name: &'static str,
    pub kind: CaseKind,
    /// Hidden score per item, in input order. Higher ranks higher.
    pub scores: Vec<i64>,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationMetrics {
    pub items: usize,
    pub decisions: usize,
    pub classes: usize,
    pub kendall_tau: f64,
    /// Every pair ranks exactly as the hidden scores order it.
    pub exact: bool,
    pub latency_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub case_name: String,
    pub metrics: EvaluationMetrics,
    pub ranking: Ranking,
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("unknown case: {0}")]
    UnknownCase(String),
}

pub fn synthetic_cases() -> Vec<SyntheticCase> {
    vec![
        SyntheticCase {
            name: "distinct_12",
            kind: CaseKind::Reduce,
            scores: shuffled_scores(12, 42),
            seed: 42,
        },
        SyntheticCase {
            name: "heavy_ties_20",
            kind: CaseKind::Reduce,
            scores: seeded_random_scores(20, 4, 43),
            seed: 43,
        },
        SyntheticCase {
            name: "sorted_15",
            kind: CaseKind::Reduce,
            scores: (1..=15).rev().collect(),
            seed: 44,
        },
        SyntheticCase {
            name: "reversed_15",
            kind: CaseKind::Reduce,
            scores: (1..=15).collect(),
            seed: 45,
        },
        SyntheticCase {
            name: "multi_rater_merge_24",
            kind: CaseKind::Merge {
                raters: 3,
                policy: WindowPolicy::Carry,
            },
            scores: shuffled_scores(24, 46),
            seed: 46,
        },
        SyntheticCase {
            name: "multi_rater_merge_reset_24",
            kind: CaseKind::Merge {
                raters: 3,
                policy: WindowPolicy::Reset,
            },
            scores: shuffled_scores(24, 46),
            seed: 46,
        },
    ]
}

/// Runs every case, or only the one named by `filter`.
pub fn run_synthetic_suite(filter: Option<&str>) -> Result<Vec<EvaluationResult>, EvaluationError> {
    let cases = synthetic_cases();
    let selected: Vec<SyntheticCase> = match filter {
        Some(name) => cases.into_iter().filter(|c| c.name == name).collect(),
        None => cases,
    };
    if let (Some(name), true) = (filter, selected.is_empty()) {
        return Err(EvaluationError::UnknownCase(name.to_string()));
    }

    selected.iter().map(run_synthetic_case).collect()
}

pub fn run_synthetic_case(case: &SyntheticCase) -> Result<EvaluationResult, EvaluationError> {
    let started = Instant::now();
    let ids: Vec<ItemId> = (0..case.scores.len()).map(item_id).collect();
    let truth: HashMap<ItemId, i64> = ids.iter().cloned().zip(case.scores.iter().copied()).collect();

    let (ranking, decisions) = match case.kind {
        CaseKind::Reduce => reduce_with_oracle(ids.clone(), &truth)?,
        CaseKind::Merge { raters, policy } => {
            let mut rng = StdRng::seed_from_u64(case.seed);
            let mut pools: Vec<Vec<ItemId>> = vec![Vec::new(); raters.max(1)];
            for id in &ids {
                let rater = rng.gen_range(0..pools.len());
                pools[rater].push(id.clone());
            }

            let mut decisions = 0;
            let mut rankings = Vec::with_capacity(pools.len());
            for pool in pools.into_iter().filter(|p| !p.is_empty()) {
                let (ranking, used) = reduce_with_oracle(pool, &truth)?;
                decisions += used;
                rankings.push(ranking);
            }
            let options = MergeOptions {
                window_policy: policy,
                ..MergeOptions::default()
            };
            let (ranking, used) = merge_with_oracle(rankings, options, &truth)?;
            (ranking, decisions + used)
        }
    };

    let position: HashMap<&str, usize> = ranking
        .iter()
        .enumerate()
        .flat_map(|(rank, group)| group.iter().map(move |id| (id.as_str(), rank)))
        .collect();
    let true_scores: Vec<i64> = ids.iter().map(|id| truth[id]).collect();
    // Higher is better on both sides; a missing item sinks to the bottom.
    let pred_scores: Vec<i64> = ids
        .iter()
        .map(|id| position.get(id.as_str()).map_or(i64::MIN, |rank| -(*rank as i64)))
        .collect();

    Ok(EvaluationResult {
        case_name: case.name.to_string(),
        metrics: EvaluationMetrics {
            items: ids.len(),
            decisions,
            classes: ranking.len(),
            kendall_tau: kendall_tau_b(&pred_scores, &true_scores),
            exact: is_exact(&pred_scores, &true_scores),
            latency_ms: started.elapsed().as_millis(),
        },
        ranking,
    })
}

/// Simulated rater: compares groups by the hidden score of their first member.
pub fn judge(truth: &HashMap<ItemId, i64>, left: &[ItemId], right: &[ItemId]) -> Decision {
    let score = |group: &[ItemId]| group.first().and_then(|id| truth.get(id)).copied();
    match score(left).cmp(&score(right)) {
        Ordering::Greater => Decision::Greater,
        Ordering::Equal => Decision::Equal,
        Ordering::Less => Decision::Less,
    }
}

fn reduce_with_oracle(
    items: Vec<ItemId>,
    truth: &HashMap<ItemId, i64>,
) -> Result<(Ranking, usize), ReduceError> {
    let mut reducer = TournamentReducer::new(items)?;
    let mut decisions = 0;
    while let Some((champion, challenger)) = reducer.current_pair() {
        let decision = judge(truth, champion, challenger);
        reducer.apply(decision)?;
        decisions += 1;
    }
    Ok((reducer.into_ranking(), decisions))
}

fn merge_with_oracle(
    rankings: Vec<Ranking>,
    options: MergeOptions,
    truth: &HashMap<ItemId, i64>,
) -> Result<(Ranking, usize), MergeError> {
    let mut merger = ListMerger::new(rankings, options)?;
    let mut decisions = 0;
    while let Some((element, pivot)) = merger.current_pair() {
        let decision = judge(truth, element, pivot);
        merger.apply(decision)?;
        decisions += 1;
    }
    Ok((merger.into_ranking(), decisions))
}

fn item_id(index: usize) -> ItemId {
    format!("item_{index:02}")
}

fn shuffled_scores(n: usize, seed: u64) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut scores: Vec<i64> = (1..=n as i64).collect();
    scores.shuffle(&mut rng);
    scores
}

fn seeded_random_scores(n: usize, levels: i64, seed: u64) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(0..levels)).collect()
}

/// Per item pair, how the ranking orders it next to how the hidden scores do.
fn pair_orders<'a>(
    pred: &'a [i64],
    truth: &'a [i64],
) -> impl Iterator<Item = (Ordering, Ordering)> + 'a {
    (0..pred.len()).flat_map(move |i| {
        ((i + 1)..pred.len()).map(move |j| (pred[i].cmp(&pred[j]), truth[i].cmp(&truth[j])))
    })
}

/// Every pair, ties included, ordered as the hidden scores order it.
fn is_exact(pred: &[i64], truth: &[i64]) -> bool {
    pred.len() == truth.len() && pair_orders(pred, truth).all(|(p, t)| p == t)
}

/// Tau-b: concordance with a tie correction on each side.
fn kendall_tau_b(pred: &[i64], truth: &[i64]) -> f64 {
    if pred.len() != truth.len() || pred.len() < 2 {
        return 0.0;
    }
    let (mut concordant, mut discordant) = (0u64, 0u64);
    let (mut tied_pred, mut tied_truth) = (0u64, 0u64);
    for orders in pair_orders(pred, truth) {
        match orders {
            (Ordering::Equal, Ordering::Equal) => {}
            (Ordering::Equal, _) => tied_pred += 1,
            (_, Ordering::Equal) => tied_truth += 1,
            (p, t) if p == t => concordant += 1,
            _ => discordant += 1,
        }
    }

    let untied = concordant + discordant;
    let denom = (((untied + tied_pred) * (untied + tied_truth)) as f64).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (concordant as f64 - discordant as f64) / denom
}
