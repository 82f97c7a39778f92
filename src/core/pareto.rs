// src/core/pareto.rs — Multi-objective Pareto front engine
//
// Pure computation over scored results: dominance filtering, stratified
// fronts and bounded top-K retention. No I/O.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::types::ExperimentResult;
use crate::infra::errors::ValidationError;

/// Whether larger or smaller values of an objective are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Maximize,
    Minimize,
}

/// A named numeric metric results are scored on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub direction: Direction,
}

impl Objective {
    pub fn maximize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Maximize,
        }
    }

    pub fn minimize(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Minimize,
        }
    }

    /// Normalize a raw value to "higher is better".
    pub fn oriented(&self, value: f64) -> f64 {
        match self.direction {
            Direction::Maximize => value,
            Direction::Minimize => -value,
        }
    }
}

/// How an oversized front is ranked before truncation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RankingRule {
    /// Weighted sum of min-max normalized objectives. Objectives absent from
    /// `weights` get weight 0; an empty map weights every objective 1.
    WeightedSum { weights: BTreeMap<String, f64> },
    /// NSGA-II crowding distance; boundary members rank first.
    CrowdingDistance,
}

impl Default for RankingRule {
    fn default() -> Self {
        Self::CrowdingDistance
    }
}

/// Non-dominated subset of a result collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParetoFront {
    pub stratum: Option<String>,
    pub members: Vec<ExperimentResult>,
}

impl ParetoFront {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, result_id: &str) -> bool {
        self.members.iter().any(|m| m.id == result_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMember {
    /// 1-based position; 1 is best.
    pub rank: usize,
    pub score: f64,
    pub result: ExperimentResult,
}

/// A front after ranking and top-K truncation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFront {
    pub stratum: Option<String>,
    pub rule: RankingRule,
    pub members: Vec<RankedMember>,
    pub dropped: usize,
}

impl RankedFront {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Crowding distance stored for boundary members. Kept finite so fronts
/// survive a JSON round-trip.
const BOUNDARY_DISTANCE: f64 = f64::MAX;

pub fn validate_objectives(objectives: &[Objective]) -> Result<(), ValidationError> {
    if objectives.is_empty() {
        return Err(ValidationError::NoObjectives);
    }
    let mut seen = HashSet::new();
    for o in objectives {
        if !seen.insert(o.name.as_str()) {
            return Err(ValidationError::DuplicateObjective(o.name.clone()));
        }
    }
    Ok(())
}

/// Objective vector of `result`, oriented so higher is better.
fn oriented_vector(
    result: &ExperimentResult,
    objectives: &[Objective],
) -> Result<Vec<f64>, ValidationError> {
    objectives
        .iter()
        .map(|o| {
            let value = result.objectives.get(&o.name).copied().ok_or_else(|| {
                ValidationError::MissingObjective {
                    result_id: result.id.clone(),
                    objective: o.name.clone(),
                }
            })?;
            if !value.is_finite() {
                return Err(ValidationError::NonNumericObjective {
                    result_id: result.id.clone(),
                    objective: o.name.clone(),
                });
            }
            Ok(o.oriented(value))
        })
        .collect()
}

fn dominates_vec(a: &[f64], b: &[f64]) -> bool {
    let mut strictly_better = false;
    for (ai, bi) in a.iter().zip(b) {
        if ai < bi {
            return false;
        }
        if ai > bi {
            strictly_better = true;
        }
    }
    strictly_better
}

/// True iff `a` is at least as good as `b` on every objective and strictly
/// better on at least one.
pub fn dominates(
    a: &ExperimentResult,
    b: &ExperimentResult,
    objectives: &[Objective],
) -> Result<bool, ValidationError> {
    Ok(dominates_vec(
        &oriented_vector(a, objectives)?,
        &oriented_vector(b, objectives)?,
    ))
}

fn stable_order(a: &ExperimentResult, b: &ExperimentResult) -> Ordering {
    a.config_id()
        .cmp(b.config_id())
        .then_with(|| a.id.cmp(&b.id))
}

/// Compute the non-dominated subset of `results`.
///
/// Members come back ordered by configuration id (then result id), so the
/// output does not depend on input order. Identical vectors are all kept.
pub fn compute_front(
    results: &[ExperimentResult],
    objectives: &[Objective],
) -> Result<ParetoFront, ValidationError> {
    validate_objectives(objectives)?;

    let mut scored = results
        .iter()
        .map(|r| Ok((r, oriented_vector(r, objectives)?)))
        .collect::<Result<Vec<_>, ValidationError>>()?;
    scored.sort_by(|(a, _), (b, _)| stable_order(a, b));

    let members = scored
        .iter()
        .filter(|(_, v)| !scored.iter().any(|(_, other)| dominates_vec(other, v)))
        .map(|(r, _)| (*r).clone())
        .collect();

    Ok(ParetoFront {
        stratum: None,
        members,
    })
}

/// Partition `results` by the value of parameter `key` and compute an
/// independent front per partition.
pub fn stratify(
    results: &[ExperimentResult],
    objectives: &[Objective],
    key: &str,
) -> Result<BTreeMap<String, ParetoFront>, ValidationError> {
    let mut partitions: BTreeMap<String, Vec<ExperimentResult>> = BTreeMap::new();
    for r in results {
        let value =
            r.configuration
                .get(key)
                .ok_or_else(|| ValidationError::MissingStratumKey {
                    result_id: r.id.clone(),
                    key: key.to_string(),
                })?;
        partitions
            .entry(format!("{key}={value}"))
            .or_default()
            .push(r.clone());
    }

    partitions
        .into_iter()
        .map(|(stratum, members)| {
            let mut front = compute_front(&members, objectives)?;
            front.stratum = Some(stratum.clone());
            Ok((stratum, front))
        })
        .collect()
}

/// Rank every member of `front` under `rule`, best first.
///
/// Ties on score are broken by configuration id, then result id.
pub fn rank(
    front: &ParetoFront,
    objectives: &[Objective],
    rule: &RankingRule,
) -> Result<Vec<RankedMember>, ValidationError> {
    validate_objectives(objectives)?;
    let vectors = front
        .members
        .iter()
        .map(|r| oriented_vector(r, objectives))
        .collect::<Result<Vec<_>, _>>()?;

    let scores = match rule {
        RankingRule::WeightedSum { weights } => weighted_sum_scores(&vectors, objectives, weights)?,
        RankingRule::CrowdingDistance => crowding_distances(&vectors, objectives.len()),
    };

    let mut order: Vec<usize> = (0..front.members.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .total_cmp(&scores[a])
            .then_with(|| stable_order(&front.members[a], &front.members[b]))
    });

    Ok(order
        .into_iter()
        .enumerate()
        .map(|(pos, idx)| RankedMember {
            rank: pos + 1,
            score: scores[idx],
            result: front.members[idx].clone(),
        })
        .collect())
}

/// Keep the best `k` members of `front` under `rule`.
pub fn retain_top_k(
    front: &ParetoFront,
    k: usize,
    objectives: &[Objective],
    rule: &RankingRule,
) -> Result<RankedFront, ValidationError> {
    let mut members = rank(front, objectives, rule)?;
    let dropped = members.len().saturating_sub(k);
    members.truncate(k);
    Ok(RankedFront {
        stratum: front.stratum.clone(),
        rule: rule.clone(),
        members,
        dropped,
    })
}

/// Number of other results each result dominates, keyed by result id.
pub fn dominance_counts(
    results: &[ExperimentResult],
    objectives: &[Objective],
) -> Result<BTreeMap<String, usize>, ValidationError> {
    validate_objectives(objectives)?;
    let vectors = results
        .iter()
        .map(|r| oriented_vector(r, objectives))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(results
        .iter()
        .zip(&vectors)
        .map(|(r, v)| {
            let count = vectors.iter().filter(|o| dominates_vec(v, o)).count();
            (r.id.clone(), count)
        })
        .collect())
}

/// Per-objective (min, max) over oriented vectors.
fn bounds(vectors: &[Vec<f64>], dims: usize) -> Vec<(f64, f64)> {
    (0..dims)
        .map(|d| {
            vectors.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v[d]), hi.max(v[d]))
            })
        })
        .collect()
}

fn weighted_sum_scores(
    vectors: &[Vec<f64>],
    objectives: &[Objective],
    weights: &BTreeMap<String, f64>,
) -> Result<Vec<f64>, ValidationError> {
    if let Some(unknown) = weights
        .keys()
        .find(|k| !objectives.iter().any(|o| &o.name == *k))
    {
        return Err(ValidationError::UnknownWeight(unknown.clone()));
    }
    let w: Vec<f64> = objectives
        .iter()
        .map(|o| {
            if weights.is_empty() {
                1.0
            } else {
                weights.get(&o.name).copied().unwrap_or(0.0)
            }
        })
        .collect();
    let bounds = bounds(vectors, objectives.len());

    Ok(vectors
        .iter()
        .map(|v| {
            v.iter()
                .zip(&bounds)
                .zip(&w)
                .map(|((x, (lo, hi)), weight)| {
                    let range = hi - lo;
                    let normalized = if range > 0.0 { (x - lo) / range } else { 1.0 };
                    weight * normalized
                })
                .sum::<f64>()
        })
        .collect())
}

fn crowding_distances(vectors: &[Vec<f64>], dims: usize) -> Vec<f64> {
    let n = vectors.len();
    let mut distance = vec![0.0_f64; n];
    if n <= 2 {
        return vec![BOUNDARY_DISTANCE; n];
    }

    for d in 0..dims {
        let mut idx: Vec<usize> = (0..n).collect();
        idx.sort_by(|&a, &b| vectors[a][d].total_cmp(&vectors[b][d]));
        let lo = vectors[idx[0]][d];
        let hi = vectors[idx[n - 1]][d];
        distance[idx[0]] = f64::INFINITY;
        distance[idx[n - 1]] = f64::INFINITY;

        let range = hi - lo;
        if range <= 0.0 {
            continue;
        }
        for w in 1..n - 1 {
            let i = idx[w];
            if distance[i].is_finite() {
                distance[i] += (vectors[idx[w + 1]][d] - vectors[idx[w - 1]][d]) / range;
            }
        }
    }

    distance
        .into_iter()
        .map(|d| if d.is_finite() { d } else { BOUNDARY_DISTANCE })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Configuration, ParamValue};
    use chrono::Utc;

    fn objectives() -> Vec<Objective> {
        vec![Objective::maximize("psnr"), Objective::minimize("latency")]
    }

    fn result(cr: i64, tag: i64, psnr: f64, latency: f64) -> ExperimentResult {
        let cfg = Configuration::from_pairs([
            ("compression_ratio", ParamValue::Int(cr)),
            ("tag", ParamValue::Int(tag)),
        ])
        .unwrap();
        let objs = [("psnr".to_string(), psnr), ("latency".to_string(), latency)]
            .into_iter()
            .collect();
        ExperimentResult::succeeded(1, cfg, objs, Utc::now())
    }

    fn points(front: &ParetoFront) -> Vec<(f64, f64)> {
        let mut p: Vec<_> = front
            .members
            .iter()
            .map(|r| (r.objectives["psnr"], r.objectives["latency"]))
            .collect();
        p.sort_by(|a, b| a.partial_cmp(b).unwrap());
        p
    }

    /// Tiny deterministic generator for property-style checks.
    fn lcg_results(seed: u64, n: usize) -> Vec<ExperimentResult> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let mut next = move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) % 20) as f64
        };
        (0..n)
            .map(|i| result(8 * (1 + (i as i64 % 3)), i as i64, next(), next()))
            .collect()
    }

    #[test]
    fn test_scenario_dominated_point_excluded() {
        let results = vec![
            result(8, 1, 20.0, 50.0),
            result(8, 2, 25.0, 40.0),
            result(8, 3, 25.0, 60.0),
        ];
        let front = compute_front(&results, &objectives()).unwrap();
        // Lower latency wins, so (25, 40) beats (20, 50) as well.
        assert_eq!(points(&front), vec![(25.0, 40.0)]);
    }

    #[test]
    fn test_trade_off_keeps_both_extremes() {
        let results = vec![
            result(8, 1, 20.0, 30.0),
            result(8, 2, 25.0, 40.0),
            result(8, 3, 25.0, 60.0),
        ];
        let front = compute_front(&results, &objectives()).unwrap();
        assert_eq!(points(&front), vec![(20.0, 30.0), (25.0, 40.0)]);
    }

    #[test]
    fn test_identical_vectors_both_retained() {
        let results = vec![result(8, 1, 25.0, 40.0), result(8, 2, 25.0, 40.0)];
        let front = compute_front(&results, &objectives()).unwrap();
        assert_eq!(front.len(), 2);
    }

    #[test]
    fn test_front_never_contains_dominated_member() {
        let objs = objectives();
        for seed in 0..50 {
            let front = compute_front(&lcg_results(seed, 40), &objs).unwrap();
            for a in &front.members {
                for b in &front.members {
                    assert!(!dominates(a, b, &objs).unwrap());
                }
            }
        }
    }

    #[test]
    fn test_front_is_idempotent() {
        let objs = objectives();
        for seed in 0..50 {
            let front = compute_front(&lcg_results(seed, 30), &objs).unwrap();
            let again = compute_front(&front.members, &objs).unwrap();
            assert_eq!(front, again);
        }
    }

    #[test]
    fn test_front_independent_of_input_order() {
        let objs = objectives();
        let results = lcg_results(7, 25);
        let mut reversed = results.clone();
        reversed.reverse();
        assert_eq!(
            compute_front(&results, &objs).unwrap(),
            compute_front(&reversed, &objs).unwrap()
        );
    }

    #[test]
    fn test_missing_objective_rejected() {
        let mut r = result(8, 1, 20.0, 50.0);
        r.objectives.remove("latency");
        let err = compute_front(&[r], &objectives()).unwrap_err();
        assert!(matches!(err, ValidationError::MissingObjective { .. }));
    }

    #[test]
    fn test_non_numeric_objective_rejected() {
        let mut r = result(8, 1, 20.0, 50.0);
        r.objectives.insert("psnr".into(), f64::NAN);
        let err = compute_front(&[r], &objectives()).unwrap_err();
        assert!(matches!(err, ValidationError::NonNumericObjective { .. }));
    }

    #[test]
    fn test_duplicate_objective_rejected() {
        let objs = vec![Objective::maximize("psnr"), Objective::minimize("psnr")];
        assert_eq!(
            compute_front(&[], &objs).unwrap_err(),
            ValidationError::DuplicateObjective("psnr".into())
        );
        assert_eq!(
            compute_front(&[], &[]).unwrap_err(),
            ValidationError::NoObjectives
        );
    }

    #[test]
    fn test_stratify_computes_independent_fronts() {
        let results = vec![
            result(8, 1, 30.0, 50.0),
            result(8, 2, 28.0, 60.0),
            result(16, 3, 22.0, 30.0),
            result(16, 4, 21.0, 35.0),
        ];
        let fronts = stratify(&results, &objectives(), "compression_ratio").unwrap();
        assert_eq!(fronts.len(), 2);
        let f8 = &fronts["compression_ratio=8"];
        assert_eq!(f8.stratum.as_deref(), Some("compression_ratio=8"));
        assert_eq!(points(f8), vec![(30.0, 50.0)]);
        assert_eq!(points(&fronts["compression_ratio=16"]), vec![(22.0, 30.0)]);
    }

    #[test]
    fn test_stratify_missing_key_rejected() {
        let results = vec![result(8, 1, 30.0, 50.0)];
        let err = stratify(&results, &objectives(), "num_stages").unwrap_err();
        assert!(matches!(err, ValidationError::MissingStratumKey { .. }));
    }

    #[test]
    fn test_retain_top_k_size_and_order() {
        let objs = objectives();
        let rules = [
            RankingRule::CrowdingDistance,
            RankingRule::WeightedSum {
                weights: BTreeMap::new(),
            },
            RankingRule::WeightedSum {
                weights: [("psnr".to_string(), 2.0)].into_iter().collect(),
            },
        ];
        for seed in 0..30 {
            let front = compute_front(&lcg_results(seed, 40), &objs).unwrap();
            for rule in &rules {
                for k in [0, 1, 3, 100] {
                    let all = rank(&front, &objs, rule).unwrap();
                    let kept = retain_top_k(&front, k, &objs, rule).unwrap();
                    assert_eq!(kept.len(), front.len().min(k));
                    assert_eq!(kept.dropped, front.len() - kept.len());
                    let dropped = &all[kept.len()..];
                    for m in &kept.members {
                        for d in dropped {
                            assert!(m.score >= d.score);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_crowding_distance_prefers_extremes() {
        let results = vec![
            result(8, 1, 10.0, 10.0),
            result(8, 2, 20.0, 20.0),
            result(8, 3, 21.0, 21.0),
            result(8, 4, 30.0, 30.0),
        ];
        let objs = objectives();
        let front = compute_front(&results, &objs).unwrap();
        assert_eq!(front.len(), 4);
        let kept = retain_top_k(&front, 2, &objs, &RankingRule::CrowdingDistance).unwrap();
        let mut psnr: Vec<f64> = kept
            .members
            .iter()
            .map(|m| m.result.objectives["psnr"])
            .collect();
        psnr.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(psnr, vec![10.0, 30.0]);
        assert_eq!(kept.members[0].rank, 1);
    }

    #[test]
    fn test_weighted_sum_prefers_heavier_objective() {
        let results = vec![result(8, 1, 30.0, 90.0), result(8, 2, 20.0, 10.0)];
        let objs = objectives();
        let front = compute_front(&results, &objs).unwrap();
        let rule = RankingRule::WeightedSum {
            weights: [("psnr".to_string(), 1.0)].into_iter().collect(),
        };
        let kept = retain_top_k(&front, 1, &objs, &rule).unwrap();
        assert_eq!(kept.members[0].result.objectives["psnr"], 30.0);
    }

    #[test]
    fn test_weighted_sum_unknown_objective_rejected() {
        let front = compute_front(&[result(8, 1, 1.0, 1.0)], &objectives()).unwrap();
        let rule = RankingRule::WeightedSum {
            weights: [("ssim".to_string(), 1.0)].into_iter().collect(),
        };
        assert_eq!(
            rank(&front, &objectives(), &rule).unwrap_err(),
            ValidationError::UnknownWeight("ssim".into())
        );
    }

    #[test]
    fn test_dominance_counts() {
        let results = vec![
            result(8, 1, 20.0, 50.0),
            result(8, 2, 25.0, 40.0),
            result(8, 3, 25.0, 60.0),
        ];
        let counts = dominance_counts(&results, &objectives()).unwrap();
        assert_eq!(counts[&results[1].id], 2);
        assert_eq!(counts[&results[0].id], 0);
        assert_eq!(counts[&results[2].id], 0);
    }

    #[test]
    fn test_ranked_front_survives_json() {
        let results = vec![result(8, 1, 10.0, 10.0), result(8, 2, 20.0, 20.0)];
        let objs = objectives();
        let front = compute_front(&results, &objs).unwrap();
        let kept = retain_top_k(&front, 5, &objs, &RankingRule::CrowdingDistance).unwrap();
        let json = serde_json::to_string(&kept).unwrap();
        let back: RankedFront = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kept);
    }
}
