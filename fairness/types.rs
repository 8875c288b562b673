use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a score is compared against a threshold when deciding a positive prediction.
///
/// Thresholds are always taken from observed scores, so the rule decides which side of
/// a repeated score the cut falls on. Both rules expose every distinct cut of the data;
/// they differ only in which sentinel completes the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieRule {
    /// Predict 1 iff `score > threshold`.
    #[default]
    StrictlyAbove,
    /// Predict 1 iff `score >= threshold`.
    AtOrAbove,
}

impl TieRule {
    #[inline]
    pub fn accepts(self, score: f64, threshold: f64) -> bool {
        match self {
            TieRule::StrictlyAbove => score > threshold,
            TieRule::AtOrAbove => score >= threshold,
        }
    }

    /// The threshold added to the observed scores so that both trivial rules exist.
    /// Under `StrictlyAbove` the largest score already yields predict-none, so the
    /// missing rule is predict-all; under `AtOrAbove` it is the other way round.
    pub fn sentinel(self) -> f64 {
        match self {
            TieRule::StrictlyAbove => f64::NEG_INFINITY,
            TieRule::AtOrAbove => f64::INFINITY,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TieRule::StrictlyAbove => "strictly_above",
            TieRule::AtOrAbove => "at_or_above",
        }
    }
}

impl fmt::Display for TieRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TieRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "strictly_above" | "gt" | ">" => Ok(TieRule::StrictlyAbove),
            "at_or_above" | "ge" | ">=" => Ok(TieRule::AtOrAbove),
            other => Err(format!(
                "unknown tie rule '{other}' (expected 'strictly_above' or 'at_or_above')"
            )),
        }
    }
}

/// Why one of a group's rates is undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degeneracy {
    /// No positive labels: the true-positive rate is clamped to 0.
    NoPositives,
    /// No negative labels: the false-positive rate is clamped to 0.
    NoNegatives,
}

impl fmt::Display for Degeneracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degeneracy::NoPositives => f.write_str("no positive labels"),
            Degeneracy::NoNegatives => f.write_str("no negative labels"),
        }
    }
}

/// The confusion-matrix outcome of thresholding one group's scores at `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingPoint {
    pub fpr: f64,
    pub tpr: f64,
    pub threshold: f64,
}

impl OperatingPoint {
    pub fn new(fpr: f64, tpr: f64, threshold: f64) -> Self {
        Self {
            fpr,
            tpr,
            threshold,
        }
    }

    pub fn rates(&self) -> RatePoint {
        RatePoint {
            fpr: self.fpr,
            tpr: self.tpr,
        }
    }
}

/// A bare (fpr, tpr) coordinate in ROC space, without the rule that reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    pub fpr: f64,
    pub tpr: f64,
}

impl RatePoint {
    pub fn new(fpr: f64, tpr: f64) -> Self {
        Self { fpr, tpr }
    }

    /// `(1 - weight) * self + weight * other`.
    #[inline]
    pub fn lerp(self, other: RatePoint, weight: f64) -> RatePoint {
        RatePoint {
            fpr: self.fpr + weight * (other.fpr - self.fpr),
            tpr: self.tpr + weight * (other.tpr - self.tpr),
        }
    }

    /// Probability of a positive prediction for a group with the given base rate.
    #[inline]
    pub fn selection_rate(self, base_rate: f64) -> f64 {
        (1.0 - base_rate) * self.fpr + base_rate * self.tpr
    }

    pub fn approx_eq(self, other: RatePoint, tolerance: f64) -> bool {
        (self.fpr - other.fpr).abs() <= tolerance && (self.tpr - other.tpr).abs() <= tolerance
    }
}

/// Label counts for one group, computed once by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupCounts {
    pub samples: usize,
    pub positives: usize,
    pub negatives: usize,
    pub distinct_scores: usize,
}

impl GroupCounts {
    /// Fraction of positive labels. Zero for an empty group.
    pub fn base_rate(&self) -> f64 {
        ratio(self.positives, self.samples)
    }

    pub fn degeneracy(&self) -> Option<Degeneracy> {
        if self.positives == 0 {
            Some(Degeneracy::NoPositives)
        } else if self.negatives == 0 {
            Some(Degeneracy::NoNegatives)
        } else {
            None
        }
    }
}

/// `count / total`, clamped to 0 when `total` is zero.
#[inline]
pub fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_rules_disagree_only_on_equality() {
        assert!(TieRule::StrictlyAbove.accepts(0.6, 0.5));
        assert!(TieRule::AtOrAbove.accepts(0.6, 0.5));
        assert!(!TieRule::StrictlyAbove.accepts(0.5, 0.5));
        assert!(TieRule::AtOrAbove.accepts(0.5, 0.5));
        assert!(TieRule::StrictlyAbove.accepts(-1e300, TieRule::StrictlyAbove.sentinel()));
        assert!(!TieRule::AtOrAbove.accepts(1e300, TieRule::AtOrAbove.sentinel()));
    }

    #[test]
    fn tie_rule_parses_aliases() {
        assert_eq!("gt".parse::<TieRule>().unwrap(), TieRule::StrictlyAbove);
        assert_eq!(">=".parse::<TieRule>().unwrap(), TieRule::AtOrAbove);
        assert!("between".parse::<TieRule>().is_err());
    }

    #[test]
    fn degenerate_counts_are_flagged() {
        let counts = GroupCounts {
            samples: 3,
            positives: 0,
            negatives: 3,
            distinct_scores: 3,
        };
        assert_eq!(counts.degeneracy(), Some(Degeneracy::NoPositives));
        assert_eq!(counts.base_rate(), 0.0);
        assert_eq!(ratio(1, 0), 0.0);
    }

    #[test]
    fn lerp_and_selection_rate() {
        let a = RatePoint::new(0.0, 0.5);
        let b = RatePoint::new(0.5, 1.0);
        let mid = a.lerp(b, 0.5);
        assert_eq!(mid, RatePoint::new(0.25, 0.75));
        assert_eq!(mid.selection_rate(0.5), 0.5);
    }
}
