use crate::roc::GroupRoc;
use crate::types::{GroupCounts, OperatingPoint, RatePoint};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Slack used when deciding whether a point lies strictly above a chord.
const CHORD_EPS: f64 = 1e-12;

/// Error type for hull building.
#[derive(thiserror::Error, Debug)]
pub enum HullError {
    #[error(
        "Operating point (fpr={fpr}, tpr={tpr}) of group '{group}' is not a finite point of the unit square."
    )]
    InvalidPoint { group: String, fpr: f64, tpr: f64 },
}

/// The upper-left convex hull of one group's achievable (fpr, tpr) pairs.
///
/// Vertices run from (0,0) to (1,1). The fpr strictly increases from vertex to vertex,
/// except that the first edge may be vertical, from (0,0) up to the best rule that
/// still has fpr 0. The tpr never decreases. Every point on an edge is reachable by
/// randomizing between the thresholds of its two end vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupHull {
    pub group: String,
    pub counts: GroupCounts,
    pub vertices: Vec<OperatingPoint>,
    /// Every candidate from the sampler, kept so a rule can snap to an observed
    /// threshold that lands exactly on a target point.
    pub candidates: Vec<OperatingPoint>,
}

/// A location on a hull: `(1 - weight) * vertices[lower] + weight * vertices[upper]`.
/// `lower == upper` (and `weight == 0`) marks a vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HullPosition {
    pub lower: usize,
    pub upper: usize,
    pub weight: f64,
}

impl HullPosition {
    pub fn vertex(index: usize) -> Self {
        Self {
            lower: index,
            upper: index,
            weight: 0.0,
        }
    }

    pub fn is_vertex(&self) -> bool {
        self.lower == self.upper
    }

    pub fn point(&self, hull: &GroupHull) -> RatePoint {
        let lower = hull.vertices[self.lower].rates();
        if self.is_vertex() {
            lower
        } else {
            lower.lerp(hull.vertices[self.upper].rates(), self.weight)
        }
    }
}

impl GroupHull {
    pub fn has_vertical_start(&self) -> bool {
        self.vertices.len() > 1 && self.vertices[1].fpr == 0.0
    }

    /// The concave envelope evaluated at `fpr` (clamped to [0,1]). At fpr 0 this is the
    /// top of the vertical start edge, if there is one.
    pub fn tpr_at(&self, fpr: f64) -> f64 {
        let x = fpr.clamp(0.0, 1.0);
        for pair in self.vertices.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.fpr <= a.fpr {
                continue;
            }
            if x <= b.fpr {
                let weight = ((x - a.fpr) / (b.fpr - a.fpr)).clamp(0.0, 1.0);
                return a.tpr + weight * (b.tpr - a.tpr);
            }
        }
        self.vertices.last().map_or(1.0, |v| v.tpr)
    }

    /// Locates the point of the envelope at `fpr`. A vertex within `tolerance` wins over
    /// an edge; at fpr 0 the top of a vertical start edge is returned.
    pub fn locate_fpr(&self, fpr: f64, tolerance: f64) -> HullPosition {
        let x = fpr.clamp(0.0, 1.0);
        // Last match so that a vertical run resolves to its highest vertex.
        if let Some(index) = self
            .vertices
            .iter()
            .rposition(|v| (v.fpr - x).abs() <= tolerance)
        {
            return HullPosition::vertex(index);
        }
        for (lower, pair) in self.vertices.windows(2).enumerate() {
            let (a, b) = (&pair[0], &pair[1]);
            if a.fpr < x && x < b.fpr {
                return HullPosition {
                    lower,
                    upper: lower + 1,
                    weight: (x - a.fpr) / (b.fpr - a.fpr),
                };
            }
        }
        HullPosition::vertex(self.vertices.len() - 1)
    }

    /// Locates the hull point whose linear rate `w_fpr * fpr + w_tpr * tpr` equals
    /// `rate`. With non-negative weights that rate never decreases along the hull.
    /// When several vertices share the rate, the one with the highest tpr (then the
    /// lowest fpr) is chosen.
    pub fn locate_rate(&self, weights: (f64, f64), rate: f64, tolerance: f64) -> HullPosition {
        let value = |v: &OperatingPoint| weights.0 * v.fpr + weights.1 * v.tpr;

        let mut best: Option<usize> = None;
        for (index, vertex) in self.vertices.iter().enumerate() {
            if (value(vertex) - rate).abs() > tolerance {
                continue;
            }
            best = match best {
                Some(current) if !dominates(vertex, &self.vertices[current]) => Some(current),
                _ => Some(index),
            };
        }
        if let Some(index) = best {
            return HullPosition::vertex(index);
        }

        for (lower, pair) in self.vertices.windows(2).enumerate() {
            let (lo, hi) = (value(&pair[0]), value(&pair[1]));
            if lo < rate && rate < hi {
                return HullPosition {
                    lower,
                    upper: lower + 1,
                    weight: (rate - lo) / (hi - lo),
                };
            }
        }
        if self.vertices.first().is_some_and(|v| rate < value(v)) {
            HullPosition::vertex(0)
        } else {
            HullPosition::vertex(self.vertices.len() - 1)
        }
    }

    /// First observed threshold whose operating point lies within `tolerance` of `target`.
    pub fn observed_at(&self, target: RatePoint, tolerance: f64) -> Option<&OperatingPoint> {
        self.candidates
            .iter()
            .find(|c| c.rates().approx_eq(target, tolerance))
    }
}

/// Higher tpr wins; equal tpr falls back to lower fpr.
fn dominates(a: &OperatingPoint, b: &OperatingPoint) -> bool {
    a.tpr > b.tpr || (a.tpr == b.tpr && a.fpr < b.fpr)
}

/// z-component of `(a - o) x (b - o)`. Negative means `a` is strictly above the chord
/// from `o` to `b` when the three are ordered by fpr.
#[inline]
fn cross(o: &OperatingPoint, a: &OperatingPoint, b: &OperatingPoint) -> f64 {
    (a.fpr - o.fpr) * (b.tpr - o.tpr) - (a.tpr - o.tpr) * (b.fpr - o.fpr)
}

/// Reduces one group's candidates to the upper-left convex hull.
pub fn build_group_hull(roc: GroupRoc) -> Result<GroupHull, HullError> {
    for p in &roc.points {
        let in_square = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_square(p.fpr) || !in_square(p.tpr) || p.threshold.is_nan() {
            return Err(HullError::InvalidPoint {
                group: roc.group.clone(),
                fpr: p.fpr,
                tpr: p.tpr,
            });
        }
    }

    let mut points = roc.points.clone();
    let origin = match points.iter().find(|p| p.fpr == 0.0 && p.tpr == 0.0) {
        Some(p) => *p,
        None => {
            let p = OperatingPoint::new(0.0, 0.0, f64::INFINITY);
            points.push(p);
            p
        }
    };
    if !points.iter().any(|p| p.fpr == 1.0 && p.tpr == 1.0) {
        points.push(OperatingPoint::new(1.0, 1.0, f64::NEG_INFINITY));
    }

    points.sort_by(|a, b| {
        a.fpr
            .total_cmp(&b.fpr)
            .then(b.tpr.total_cmp(&a.tpr))
            .then(b.threshold.total_cmp(&a.threshold))
    });
    // Best point per fpr: the sort put it first.
    points.dedup_by(|later, kept| later.fpr == kept.fpr);

    let mut chain: Vec<OperatingPoint> = Vec::with_capacity(points.len() + 1);
    for p in points {
        while chain.len() >= 2
            && cross(&chain[chain.len() - 2], &chain[chain.len() - 1], &p) >= -CHORD_EPS
        {
            chain.pop();
        }
        chain.push(p);
    }
    if chain.first().is_some_and(|first| first.tpr > 0.0) {
        chain.insert(0, origin);
    }

    Ok(GroupHull {
        group: roc.group,
        counts: roc.counts,
        vertices: chain,
        candidates: roc.points,
    })
}

/// Builds every group's hull on the rayon pool. The output keeps the input order, and
/// nothing downstream starts until all hulls are done.
pub fn build_hulls(rocs: Vec<GroupRoc>) -> Result<Vec<GroupHull>, HullError> {
    rocs.into_par_iter().map(build_group_hull).collect()
}
