//! # Fitting
//!
//! Orchestrates the whole pipeline for one call:
//!
//! 1. Validate the samples and the configuration.
//! 2. Sample every group's ROC candidates and reduce them to hulls (in parallel).
//! 3. Project the hulls onto the frontier of the fairness constraint (after a barrier).
//! 4. Evaluate the linear objective at every frontier vertex and keep the best.
//! 5. Turn each group's target at that vertex into a [`GroupRule`].
//!
//! Fitting is deterministic: identical inputs give `==` policies.

use crate::data::{DataError, FitData};
use crate::frontier::{self, Constraint, Frontier, Realization};
use crate::hull::{self, GroupHull, HullError, HullPosition};
use crate::objective::{LinearObjective, Objective};
use crate::policy::{FitSummary, GroupRule, GroupSummary, Policy};
use crate::roc::{GroupRoc, group_roc};
use crate::types::TieRule;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Objective values closer than this are treated as a tie.
const OBJECTIVE_TIE_EPS: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid input data: {0}")]
    Data(#[from] DataError),

    #[error("Hull construction failed: {0}")]
    Hull(#[from] HullError),

    #[error(
        "Group '{group}' has {distinct} distinct score(s); at least 2 are needed to trace a ROC curve."
    )]
    InsufficientData { group: String, distinct: usize },

    #[error("Objective '{name}' is not supported: {reason}.")]
    UnsupportedObjective { name: String, reason: String },

    #[error(
        "Constraint '{0}' is not supported. Expected one of 'equalized_odds', 'demographic_parity', 'true_positive_rate_parity' or 'false_positive_rate_parity'."
    )]
    UnsupportedConstraint(String),

    #[error(
        "Group '{group}' was declared but has no samples, so no rule for it can be checked against the constraint."
    )]
    ConstraintInfeasible { group: String },

    #[error("Group '{0}' appears in the data but not among the declared groups.")]
    UndeclaredGroup(String),

    #[error("Objective '{objective}' is undefined on this data: {reason}.")]
    UndefinedObjective { objective: Objective, reason: String },

    #[error(
        "The constraint frontier needs {needed} vertices, more than the configured cap of {cap}."
    )]
    IterationCapExceeded { cap: usize, needed: usize },
}

fn default_tolerance() -> f64 {
    1e-12
}

/// Everything that shapes a fit besides the samples themselves. Embedded in the saved
/// policy so a loaded policy knows how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub constraint: Constraint,
    pub objective: Objective,
    #[serde(default)]
    pub tie_rule: TieRule,
    /// Slack for rate comparisons (vertex snapping, deduplication, observed thresholds).
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Abort when the frontier would exceed this many vertices.
    #[serde(default)]
    pub max_frontier_vertices: Option<usize>,
    /// When non-empty, the exact set of groups the data must contain.
    #[serde(default)]
    pub expected_groups: Vec<String>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            constraint: Constraint::EqualizedOdds,
            objective: Objective::BalancedAccuracy,
            tie_rule: TieRule::default(),
            tolerance: default_tolerance(),
            max_frontier_vertices: None,
            expected_groups: Vec::new(),
        }
    }
}

impl FitConfig {
    /// Rejects combinations the optimizer cannot honor before touching any data.
    pub fn validate(&self) -> Result<(), FitError> {
        if self.constraint == Constraint::TruePositiveRateParity && !self.objective.is_monotone()
        {
            return Err(FitError::UnsupportedObjective {
                name: self.objective.name().to_string(),
                reason: format!(
                    "its optimum under {} lies off the upper ROC hull",
                    self.constraint
                ),
            });
        }
        Ok(())
    }
}

/// Fits a policy from raw columns and constraint/objective names.
///
/// Names are parsed before any computation, so a misconfigured call fails fast with
/// [`FitError::UnsupportedConstraint`] or [`FitError::UnsupportedObjective`].
pub fn fit<S: AsRef<str>>(
    scores: &[f64],
    labels: &[u8],
    groups: &[S],
    constraint: &str,
    objective: &str,
) -> Result<Policy, FitError> {
    let config = FitConfig {
        constraint: constraint.parse()?,
        objective: objective.parse()?,
        ..FitConfig::default()
    };
    config.validate()?;
    let data = FitData::from_slices(scores, labels, groups)?;
    fit_policy(&data, &config)
}

/// The main entry point for fitting.
pub fn fit_policy(data: &FitData, config: &FitConfig) -> Result<Policy, FitError> {
    config.validate()?;
    data.validate()?;
    log::info!(
        "Fitting {} policy maximizing {} over {} samples.",
        config.constraint,
        config.objective,
        data.len()
    );

    // 1. Partition the samples and check them against the declared groups.
    let partition = data.partition();
    check_declared_groups(&partition, &config.expected_groups)?;
    let columns: Vec<(&str, Vec<f64>, Vec<u8>)> = partition
        .iter()
        .map(|(&group, rows)| {
            let scores = rows.iter().map(|&row| data.scores[row]).collect();
            let labels = rows.iter().map(|&row| data.labels[row]).collect();
            (group, scores, labels)
        })
        .collect();

    // 2. Per-group sampling. Groups are independent, so this runs on the rayon pool.
    let rocs: Vec<GroupRoc> = columns
        .par_iter()
        .map(|(group, scores, labels)| group_roc(group, scores, labels, config.tie_rule))
        .collect();
    for roc in &rocs {
        if roc.counts.distinct_scores < 2 {
            return Err(FitError::InsufficientData {
                group: roc.group.clone(),
                distinct: roc.counts.distinct_scores,
            });
        }
        if let Some(degeneracy) = roc.counts.degeneracy() {
            log::warn!(
                "Group '{}' has {}; its undefined rate is clamped to 0.",
                roc.group,
                degeneracy
            );
        }
    }

    // 3. Hulls, then the barrier: projection needs every group at once.
    let hulls = hull::build_hulls(rocs)?;
    for hull in &hulls {
        log::debug!(
            "Group '{}': {} candidates reduced to {} hull vertices.",
            hull.group,
            hull.candidates.len(),
            hull.vertices.len()
        );
    }

    let counts: Vec<_> = hulls.iter().map(|h| h.counts).collect();
    let objective = LinearObjective::compile(config.objective, &counts)?;
    let frontier = frontier::project(
        &hulls,
        config.constraint,
        config.tolerance,
        config.max_frontier_vertices,
    )?;

    // 4. The objective is linear along every frontier edge, so a vertex is optimal.
    let (best, objective_value) =
        select_optimum(&frontier, &objective).ok_or(FitError::Data(DataError::Empty))?;
    let vertex = &frontier.vertices[best];
    log::info!(
        "Best {} = {:.6} at frontier coordinate {:.6} (vertex {} of {}).",
        config.objective,
        objective_value,
        vertex.coordinate,
        best + 1,
        frontier.vertices.len()
    );

    // 5. Realize every group's target as a rule and record its exact rates.
    let mut rules = BTreeMap::new();
    let mut groups = BTreeMap::new();
    for ((hull, target), (_, scores, labels)) in
        hulls.iter().zip(&vertex.targets).zip(&columns)
    {
        let realization = frontier::realize(hull, *target, config.tolerance);
        let rule = rule_for(hull, &realization);
        if !rule.is_deterministic() {
            log::debug!("Group '{}' needs a randomized rule: {:?}", hull.group, rule);
        }
        groups.insert(
            hull.group.clone(),
            summarize(hull, &rule, config.tie_rule, scores, labels),
        );
        rules.insert(hull.group.clone(), rule);
    }

    let summary = FitSummary {
        objective_value,
        frontier_coordinate: vertex.coordinate,
        frontier_vertices: frontier.vertices.len(),
        groups,
    };
    log::info!("Fitted rules for {} groups.", rules.len());
    Ok(Policy::new(config.clone(), rules, summary))
}

fn check_declared_groups(
    partition: &BTreeMap<&str, Vec<usize>>,
    expected: &[String],
) -> Result<(), FitError> {
    if expected.is_empty() {
        return Ok(());
    }
    if let Some(missing) = expected.iter().find(|g| !partition.contains_key(g.as_str())) {
        return Err(FitError::ConstraintInfeasible {
            group: missing.clone(),
        });
    }
    if let Some(extra) = partition
        .keys()
        .find(|g| !expected.iter().any(|e| e.as_str() == **g))
    {
        return Err(FitError::UndeclaredGroup(extra.to_string()));
    }
    Ok(())
}

/// Index and value of the best vertex. Ties go to the earliest vertex, the one
/// closest to fpr = 0 (or the lowest shared rate).
pub fn select_optimum(frontier: &Frontier, objective: &LinearObjective) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, vertex) in frontier.vertices.iter().enumerate() {
        let value = objective.evaluate(&vertex.targets);
        match best {
            Some((_, current)) if value <= current + OBJECTIVE_TIE_EPS => {}
            _ => best = Some((index, value)),
        }
    }
    best
}

/// Converts a realization into the persisted rule. Thresholds come from hull vertices
/// or observed candidates, so they are always scores the tie rule was swept with.
fn rule_for(hull: &GroupHull, realization: &Realization) -> GroupRule {
    let from_position = |position: HullPosition| {
        let lower = &hull.vertices[position.lower];
        if position.is_vertex() {
            GroupRule::threshold(&hull.group, lower.threshold)
        } else {
            // The upper vertex has the higher fpr and therefore the lower threshold.
            let upper = &hull.vertices[position.upper];
            GroupRule::mixture(
                &hull.group,
                upper.threshold,
                lower.threshold,
                position.weight,
            )
        }
    };
    match *realization {
        Realization::Observed(point) => GroupRule::threshold(&hull.group, point.threshold),
        Realization::OnHull(position) => from_position(position),
        Realization::Blended {
            position,
            ignore_probability,
            constant_rate,
        } => from_position(position).blended(ignore_probability, constant_rate),
    }
}

/// Exact expected rates of `rule` on the group's own fitting samples.
fn summarize(
    hull: &GroupHull,
    rule: &GroupRule,
    tie_rule: TieRule,
    scores: &[f64],
    labels: &[u8],
) -> GroupSummary {
    let (mut selected, mut true_positive, mut false_positive) = (0.0, 0.0, 0.0);
    for (&score, &label) in scores.iter().zip(labels) {
        let probability = rule.selection_probability(score, tie_rule);
        selected += probability;
        if label == 1 {
            true_positive += probability;
        } else {
            false_positive += probability;
        }
    }
    let counts = hull.counts;
    let rate = |mass: f64, total: usize| {
        if total == 0 {
            0.0
        } else {
            mass / total as f64
        }
    };
    GroupSummary {
        counts,
        base_rate: counts.base_rate(),
        expected_fpr: rate(false_positive, counts.negatives),
        expected_tpr: rate(true_positive, counts.positives),
        expected_selection_rate: rate(selected, counts.samples),
        degeneracy: counts.degeneracy(),
        hull_vertices: hull.vertices.len(),
    }
}
