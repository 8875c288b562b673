//! # Constraint Projection
//!
//! Turns the per-group hulls into the joint feasible frontier of a fairness constraint.
//! The frontier is an explicit, immutable list of vertices, each a complete tuple of
//! per-group (fpr, tpr) targets. Consecutive vertices are joined by straight edges along
//! which every group moves linearly, so any objective linear in the rates varies
//! linearly along each edge and attains its maximum at a vertex.
//!
//! - Equalized odds: all groups share one (fpr, tpr). The jointly achievable region is
//!   the intersection of the groups' hull regions; its upper boundary is the pointwise
//!   minimum of the hull envelopes. Vertices sit at every hull breakpoint and at every
//!   crossing of two envelopes.
//! - Rate parity: all groups share one value of a linear rate (selection rate, tpr or
//!   fpr). Each hull is re-parametrized by that rate; the frontier coordinate is the
//!   shared rate and the vertices are the union of every group's breakpoints.
//!
//! A degenerate group (no positives or no negatives) has one undefined rate. It can
//! match any value of that rate, so it never narrows the frontier along that axis.

use crate::estimate::FitError;
use crate::hull::{GroupHull, HullPosition};
use crate::types::{Degeneracy, GroupCounts, OperatingPoint, RatePoint};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Equal tpr and equal fpr across groups.
    EqualizedOdds,
    /// Equal selection rate across groups.
    DemographicParity,
    /// Equal tpr across groups (equal opportunity).
    TruePositiveRateParity,
    /// Equal fpr across groups.
    FalsePositiveRateParity,
}

impl Constraint {
    pub fn name(self) -> &'static str {
        match self {
            Constraint::EqualizedOdds => "equalized_odds",
            Constraint::DemographicParity => "demographic_parity",
            Constraint::TruePositiveRateParity => "true_positive_rate_parity",
            Constraint::FalsePositiveRateParity => "false_positive_rate_parity",
        }
    }

    /// Coefficients `(w_fpr, w_tpr)` of the rate the groups must share, or `None` for
    /// equalized odds, which pins both rates.
    pub fn rate_weights(self, counts: &GroupCounts) -> Option<(f64, f64)> {
        match self {
            Constraint::EqualizedOdds => None,
            Constraint::DemographicParity => {
                let base_rate = counts.base_rate();
                Some((1.0 - base_rate, base_rate))
            }
            Constraint::TruePositiveRateParity => Some((0.0, 1.0)),
            Constraint::FalsePositiveRateParity => Some((1.0, 0.0)),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Constraint {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "equalized_odds" => Ok(Constraint::EqualizedOdds),
            "demographic_parity" => Ok(Constraint::DemographicParity),
            "true_positive_rate_parity" | "equal_opportunity" => {
                Ok(Constraint::TruePositiveRateParity)
            }
            "false_positive_rate_parity" => Ok(Constraint::FalsePositiveRateParity),
            other => Err(FitError::UnsupportedConstraint(other.to_string())),
        }
    }
}

/// One frontier vertex: the shared coordinate and every group's target point.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontierVertex {
    /// Shared fpr (equalized odds) or shared rate (parity constraints).
    pub coordinate: f64,
    /// Targets aligned with the hulls the frontier was built from.
    pub targets: Vec<RatePoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frontier {
    pub constraint: Constraint,
    /// Ordered by ascending coordinate.
    pub vertices: Vec<FrontierVertex>,
}

/// Projects the hulls onto the feasible frontier of `constraint`.
///
/// `max_vertices` is the only abort mechanism: a frontier that would need more vertices
/// fails with [`FitError::IterationCapExceeded`].
pub fn project(
    hulls: &[GroupHull],
    constraint: Constraint,
    tolerance: f64,
    max_vertices: Option<usize>,
) -> Result<Frontier, FitError> {
    let vertices = match constraint {
        Constraint::EqualizedOdds => equalized_odds_vertices(hulls, tolerance),
        _ => rate_parity_vertices(hulls, constraint, tolerance),
    };
    if let Some(cap) = max_vertices {
        if vertices.len() > cap {
            return Err(FitError::IterationCapExceeded {
                cap,
                needed: vertices.len(),
            });
        }
    }
    log::debug!(
        "{} frontier has {} vertices across {} groups.",
        constraint,
        vertices.len(),
        hulls.len()
    );
    Ok(Frontier {
        constraint,
        vertices,
    })
}

fn equalized_odds_vertices(hulls: &[GroupHull], tolerance: f64) -> Vec<FrontierVertex> {
    // Only groups with both labels bound the shared tpr.
    let binding: Vec<&GroupHull> = hulls
        .iter()
        .filter(|h| h.counts.degeneracy().is_none())
        .collect();
    if binding.is_empty() {
        return independent_axis_vertices(hulls);
    }

    let breakpoints = sorted_unique(
        binding
            .iter()
            .flat_map(|h| h.vertices.iter().map(|v| v.fpr))
            .chain([0.0, 1.0]),
        tolerance,
    );

    // Between consecutive breakpoints every envelope is a single segment, so two
    // envelopes cross there at most once.
    let mut crossings = Vec::new();
    for (&a, &b) in breakpoints.iter().tuple_windows() {
        let at_a: Vec<f64> = binding.iter().map(|h| h.tpr_at(a)).collect();
        let at_b: Vec<f64> = binding.iter().map(|h| h.tpr_at(b)).collect();
        for (i, j) in (0..binding.len()).tuple_combinations() {
            let (da, db) = (at_a[i] - at_a[j], at_b[i] - at_b[j]);
            if da * db < 0.0 {
                crossings.push(a + (b - a) * da / (da - db));
            }
        }
    }

    sorted_unique(breakpoints.into_iter().chain(crossings), tolerance)
        .into_iter()
        .map(|x| {
            let y = binding
                .iter()
                .map(|h| h.tpr_at(x))
                .fold(f64::INFINITY, f64::min);
            FrontierVertex {
                coordinate: x,
                targets: vec![RatePoint::new(x, y); hulls.len()],
            }
        })
        .collect()
}

/// Equalized odds when no group has both labels. Groups without positives share only
/// an fpr and groups without negatives share only a tpr, so the two rates move
/// independently. Every rate in [0, 1] is reachable on a defined axis, and a linear
/// objective peaks at a corner of the unit square, so the corners are the vertices.
fn independent_axis_vertices(hulls: &[GroupHull]) -> Vec<FrontierVertex> {
    let has = |kind| hulls.iter().any(|h| h.counts.degeneracy() == Some(kind));
    let fprs: &[f64] = if has(Degeneracy::NoPositives) {
        &[0.0, 1.0]
    } else {
        &[0.0]
    };
    let tprs: &[f64] = if has(Degeneracy::NoNegatives) {
        &[0.0, 1.0]
    } else {
        &[0.0]
    };
    fprs.iter()
        .cartesian_product(tprs)
        .map(|(&fpr, &tpr)| FrontierVertex {
            coordinate: fpr,
            targets: vec![RatePoint::new(fpr, tpr); hulls.len()],
        })
        .collect()
}

/// The fixed target of a group whose shared rate is exactly its undefined rate.
/// Such a group is unconstrained; it sits at the point every monotone objective
/// prefers on its defined axis.
fn free_target(hull: &GroupHull, weights: (f64, f64)) -> Option<RatePoint> {
    match (hull.counts.degeneracy(), weights) {
        (Some(Degeneracy::NoPositives), (w_fpr, _)) if w_fpr == 0.0 => {
            Some(RatePoint::new(0.0, 0.0))
        }
        (Some(Degeneracy::NoNegatives), (_, w_tpr)) if w_tpr == 0.0 => {
            Some(RatePoint::new(0.0, 1.0))
        }
        _ => None,
    }
}

fn rate_parity_vertices(
    hulls: &[GroupHull],
    constraint: Constraint,
    tolerance: f64,
) -> Vec<FrontierVertex> {
    let weights: Vec<(f64, f64)> = hulls
        .iter()
        .map(|h| constraint.rate_weights(&h.counts).unwrap_or((0.0, 0.0)))
        .collect();
    let fixed: Vec<Option<RatePoint>> = hulls
        .iter()
        .zip(&weights)
        .map(|(h, &w)| free_target(h, w))
        .collect();

    let rates = sorted_unique(
        hulls
            .iter()
            .zip(&weights)
            .zip(&fixed)
            .filter(|(_, pinned)| pinned.is_none())
            .flat_map(|((h, &(wf, wt)), _)| {
                h.vertices.iter().map(move |v| wf * v.fpr + wt * v.tpr)
            })
            .chain([0.0, 1.0]),
        tolerance,
    );

    rates
        .into_iter()
        .map(|rate| FrontierVertex {
            coordinate: rate,
            targets: hulls
                .iter()
                .zip(&weights)
                .zip(&fixed)
                .map(|((h, &w), pinned)| {
                    pinned.unwrap_or_else(|| h.locate_rate(w, rate, tolerance).point(h))
                })
                .collect(),
        })
        .collect()
}

/// Sorts and drops values within `tolerance` of the previously kept one.
fn sorted_unique(values: impl IntoIterator<Item = f64>, tolerance: f64) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.into_iter().collect();
    sorted.sort_by(f64::total_cmp);
    let mut unique: Vec<f64> = Vec::with_capacity(sorted.len());
    for value in sorted {
        if unique.last().is_none_or(|&last| value - last > tolerance) {
            unique.push(value);
        }
    }
    unique
}

/// How one group reaches its target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Realization {
    /// An observed threshold lands on the target: a deterministic rule.
    Observed(OperatingPoint),
    /// The target is a point of the hull, reached by mixing the two end thresholds of
    /// one edge (or a single vertex threshold).
    OnHull(HullPosition),
    /// The target lies strictly below the hull. With probability `ignore_probability`
    /// the score is ignored and the decision is Bernoulli(`constant_rate`); otherwise
    /// the hull point at `position` is used.
    Blended {
        position: HullPosition,
        ignore_probability: f64,
        constant_rate: f64,
    },
}

/// Finds the least randomized way for `hull`'s group to operate at `target`.
///
/// Preference order: an observed threshold, a point of the hull, a mix along the
/// vertical fpr = 0 edge, and finally the hull point at the target fpr mixed with the
/// constant classifier Bernoulli(fpr), which stays on the diagonal.
pub fn realize(hull: &GroupHull, target: RatePoint, tolerance: f64) -> Realization {
    match hull.counts.degeneracy() {
        // Only the fpr is defined.
        Some(Degeneracy::NoPositives) => {
            let clamped = RatePoint::new(target.fpr, 0.0);
            return match hull.observed_at(clamped, tolerance) {
                Some(point) => Realization::Observed(*point),
                None => Realization::OnHull(hull.locate_fpr(target.fpr, tolerance)),
            };
        }
        // Only the tpr is defined.
        Some(Degeneracy::NoNegatives) => {
            let clamped = RatePoint::new(0.0, target.tpr);
            return match hull.observed_at(clamped, tolerance) {
                Some(point) => Realization::Observed(*point),
                None => Realization::OnHull(hull.locate_rate((0.0, 1.0), target.tpr, tolerance)),
            };
        }
        None => {}
    }

    if let Some(point) = hull.observed_at(target, tolerance) {
        return Realization::Observed(*point);
    }

    let position = hull.locate_fpr(target.fpr, tolerance);
    let on_hull = position.point(hull);
    if (on_hull.tpr - target.tpr).abs() <= tolerance {
        return Realization::OnHull(position);
    }

    if target.fpr <= tolerance && hull.has_vertical_start() {
        let top = hull.vertices[1].tpr;
        if target.tpr < top {
            return Realization::OnHull(HullPosition {
                lower: 0,
                upper: 1,
                weight: target.tpr / top,
            });
        }
    }

    let lift = on_hull.tpr - target.fpr;
    if lift <= tolerance {
        return Realization::OnHull(position);
    }
    Realization::Blended {
        position,
        ignore_probability: ((on_hull.tpr - target.tpr) / lift).clamp(0.0, 1.0),
        constant_rate: target.fpr,
    }
}

impl Realization {
    /// The (fpr, tpr) this realization operates at.
    pub fn rates(&self, hull: &GroupHull) -> RatePoint {
        match *self {
            Realization::Observed(point) => point.rates(),
            Realization::OnHull(position) => position.point(hull),
            Realization::Blended {
                position,
                ignore_probability,
                constant_rate,
            } => position.point(hull).lerp(
                RatePoint::new(constant_rate, constant_rate),
                ignore_probability,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hull::build_group_hull;
    use crate::roc::group_roc;
    use crate::types::TieRule;
    use approx::assert_abs_diff_eq;

    fn hull(group: &str, scores: &[f64], labels: &[u8]) -> GroupHull {
        build_group_hull(group_roc(group, scores, labels, TieRule::StrictlyAbove)).unwrap()
    }

    fn example_hulls() -> Vec<GroupHull> {
        vec![
            hull("A", &[0.9, 0.8, 0.4, 0.2], &[1, 1, 0, 0]),
            hull("B", &[0.9, 0.3, 0.2, 0.1], &[1, 0, 1, 0]),
        ]
    }

    fn synthetic(group: &str, vertices: &[(f64, f64)]) -> GroupHull {
        let n = vertices.len();
        GroupHull {
            group: group.to_string(),
            counts: GroupCounts {
                samples: 10,
                positives: 5,
                negatives: 5,
                distinct_scores: n,
            },
            vertices: vertices
                .iter()
                .enumerate()
                .map(|(i, &(fpr, tpr))| OperatingPoint::new(fpr, tpr, (n - i) as f64))
                .collect(),
            candidates: Vec::new(),
        }
    }

    #[test]
    fn constraint_names_parse() {
        assert_eq!(
            "equalized_odds".parse::<Constraint>().unwrap(),
            Constraint::EqualizedOdds
        );
        assert_eq!(
            "equal_opportunity".parse::<Constraint>().unwrap(),
            Constraint::TruePositiveRateParity
        );
        match "individual_fairness".parse::<Constraint>() {
            Err(FitError::UnsupportedConstraint(name)) => assert_eq!(name, "individual_fairness"),
            other => panic!("expected UnsupportedConstraint, got {:?}", other),
        }
    }

    #[test]
    fn equalized_odds_frontier_is_pointwise_minimum() {
        let frontier = project(&example_hulls(), Constraint::EqualizedOdds, 1e-12, None).unwrap();
        let points: Vec<(f64, f64)> = frontier
            .vertices
            .iter()
            .map(|v| (v.targets[0].fpr, v.targets[0].tpr))
            .collect();
        assert_eq!(points, vec![(0.0, 0.5), (0.5, 1.0), (1.0, 1.0)]);
        for vertex in &frontier.vertices {
            assert_eq!(vertex.targets[0], vertex.targets[1]);
        }
    }

    #[test]
    fn crossing_envelopes_add_a_vertex() {
        // X is strong at low fpr, Y catches up later: the envelopes cross once.
        let hulls = vec![
            synthetic("X", &[(0.0, 0.0), (0.2, 0.6), (1.0, 1.0)]),
            synthetic("Y", &[(0.0, 0.0), (0.6, 0.95), (1.0, 1.0)]),
        ];
        let frontier = project(&hulls, Constraint::EqualizedOdds, 1e-12, None).unwrap();
        let xs: Vec<f64> = frontier.vertices.iter().map(|v| v.coordinate).collect();
        // Between 0.2 and 0.6: X = 0.6 + 0.5 (x - 0.2), Y = 0.95 x / 0.6.
        let crossing = (0.6 - 0.1) / (0.95 / 0.6 - 0.5);
        assert!(xs.iter().any(|&x| (x - crossing).abs() < 1e-12));
        for vertex in &frontier.vertices {
            let expected = hulls[0]
                .tpr_at(vertex.coordinate)
                .min(hulls[1].tpr_at(vertex.coordinate));
            assert_abs_diff_eq!(vertex.targets[0].tpr, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn demographic_parity_targets_share_selection_rate() {
        let hulls = example_hulls();
        let frontier = project(&hulls, Constraint::DemographicParity, 1e-12, None).unwrap();
        assert_eq!(frontier.vertices.first().unwrap().coordinate, 0.0);
        assert_eq!(frontier.vertices.last().unwrap().coordinate, 1.0);
        for vertex in &frontier.vertices {
            for (hull, target) in hulls.iter().zip(&vertex.targets) {
                assert_abs_diff_eq!(
                    target.selection_rate(hull.counts.base_rate()),
                    vertex.coordinate,
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn degenerate_group_does_not_bind_equalized_odds() {
        let hulls = vec![
            hull("A", &[0.9, 0.8, 0.4, 0.2], &[1, 1, 0, 0]),
            hull("C", &[0.7, 0.3, 0.1], &[0, 0, 0]),
        ];
        let frontier = project(&hulls, Constraint::EqualizedOdds, 1e-12, None).unwrap();
        // A alone reaches tpr 1 at fpr 0.
        assert_eq!(frontier.vertices[0].targets[0], RatePoint::new(0.0, 1.0));
    }

    #[test]
    fn single_label_groups_move_on_separate_axes() {
        let hulls = vec![
            hull("A", &[0.9, 0.5, 0.1], &[0, 0, 0]),
            hull("B", &[0.8, 0.4, 0.2], &[1, 1, 1]),
        ];
        let frontier = project(&hulls, Constraint::EqualizedOdds, 1e-12, None).unwrap();
        let corners: Vec<(f64, f64)> = frontier
            .vertices
            .iter()
            .map(|v| (v.targets[0].fpr, v.targets[0].tpr))
            .collect();
        assert_eq!(corners, vec![(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0)]);

        // B reaches tpr 1 while A stays at fpr 0.
        let b = realize(&hulls[1], frontier.vertices[1].targets[1], 1e-12);
        assert_abs_diff_eq!(b.rates(&hulls[1]).tpr, 1.0, epsilon = 1e-12);
        let a = realize(&hulls[0], frontier.vertices[1].targets[0], 1e-12);
        assert_abs_diff_eq!(a.rates(&hulls[0]).fpr, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn tpr_parity_pins_groups_without_positives() {
        let hulls = vec![
            hull("A", &[0.9, 0.8, 0.4, 0.2], &[1, 1, 0, 0]),
            hull("C", &[0.7, 0.3, 0.1], &[0, 0, 0]),
        ];
        let frontier =
            project(&hulls, Constraint::TruePositiveRateParity, 1e-12, None).unwrap();
        for vertex in &frontier.vertices {
            assert_eq!(vertex.targets[1], RatePoint::new(0.0, 0.0));
        }
    }

    #[test]
    fn vertex_cap_aborts_projection() {
        match project(&example_hulls(), Constraint::DemographicParity, 1e-12, Some(2)) {
            Err(FitError::IterationCapExceeded { cap, needed }) => {
                assert_eq!(cap, 2);
                assert!(needed > 2);
            }
            other => panic!("expected IterationCapExceeded, got {:?}", other),
        }
    }

    #[test]
    fn unique_values_respect_tolerance() {
        let values = sorted_unique([0.5, 0.1, 0.5 + 1e-14, 0.3, 0.1], 1e-12);
        assert_eq!(values, vec![0.1, 0.3, 0.5]);
    }

    #[test]
    fn observed_thresholds_are_preferred() {
        let a = hull("A", &[0.9, 0.8, 0.4, 0.2], &[1, 1, 0, 0]);
        // (0, 0.5) is strictly inside A's vertical edge but is reached by threshold 0.8.
        match realize(&a, RatePoint::new(0.0, 0.5), 1e-12) {
            Realization::Observed(point) => assert_eq!(point.threshold, 0.8),
            other => panic!("expected an observed threshold, got {:?}", other),
        }
    }

    #[test]
    fn vertical_edge_is_mixed_when_no_threshold_lands() {
        let a = hull("A", &[0.9, 0.8, 0.4, 0.2], &[1, 1, 0, 0]);
        let target = RatePoint::new(0.0, 0.25);
        let realization = realize(&a, target, 1e-12);
        assert_eq!(
            realization,
            Realization::OnHull(HullPosition {
                lower: 0,
                upper: 1,
                weight: 0.25
            })
        );
        assert!(realization.rates(&a).approx_eq(target, 1e-12));
    }

    #[test]
    fn points_below_the_hull_blend_with_a_constant_rule() {
        let x = synthetic("X", &[(0.0, 0.0), (0.2, 0.6), (1.0, 1.0)]);
        let target = RatePoint::new(0.2, 0.4);
        let realization = realize(&x, target, 1e-12);
        match realization {
            Realization::Blended {
                position,
                ignore_probability,
                constant_rate,
            } => {
                assert!(position.is_vertex());
                assert_abs_diff_eq!(ignore_probability, 0.5, epsilon = 1e-12);
                assert_abs_diff_eq!(constant_rate, 0.2, epsilon = 1e-12);
            }
            other => panic!("expected a blended rule, got {:?}", other),
        }
        assert!(realization.rates(&x).approx_eq(target, 1e-12));
    }

    #[test]
    fn hull_points_are_reached_without_blending() {
        let b = hull("B", &[0.9, 0.3, 0.2, 0.1], &[1, 0, 1, 0]);
        let target = RatePoint::new(0.25, 0.75);
        let realization = realize(&b, target, 1e-12);
        assert!(matches!(realization, Realization::OnHull(p) if !p.is_vertex()));
        assert!(realization.rates(&b).approx_eq(target, 1e-12));
    }
}
