//! Scalar objectives the optimizer can maximize.
//!
//! Every supported objective is linear in the per-group (fpr, tpr) pairs once the
//! group sizes and base rates are fixed, so it compiles to a [`LinearObjective`]:
//! a constant plus one tpr and one fpr coefficient per group.

use crate::estimate::FitError;
use crate::types::{GroupCounts, RatePoint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// `0.5 * (TPR + TNR)` over the whole population.
    BalancedAccuracy,
    Accuracy,
    TruePositiveRate,
    TrueNegativeRate,
    /// Fraction of the population predicted positive.
    SelectionRate,
}

impl Objective {
    pub fn name(self) -> &'static str {
        match self {
            Objective::BalancedAccuracy => "balanced_accuracy",
            Objective::Accuracy => "accuracy",
            Objective::TruePositiveRate => "true_positive_rate",
            Objective::TrueNegativeRate => "true_negative_rate",
            Objective::SelectionRate => "selection_rate",
        }
    }

    /// Non-decreasing in every tpr and non-increasing in every fpr. Only such
    /// objectives are maximized by points on the upper hull under every constraint.
    pub fn is_monotone(self) -> bool {
        !matches!(self, Objective::SelectionRate)
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Objective {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "balanced_accuracy" | "balanced_accuracy_score" => Ok(Objective::BalancedAccuracy),
            "accuracy" | "accuracy_score" => Ok(Objective::Accuracy),
            "true_positive_rate" | "tpr" | "recall" => Ok(Objective::TruePositiveRate),
            "true_negative_rate" | "tnr" | "specificity" => Ok(Objective::TrueNegativeRate),
            "selection_rate" => Ok(Objective::SelectionRate),
            "f1" | "f1_score" | "precision" | "precision_score" | "log_loss" | "roc_auc" => {
                Err(FitError::UnsupportedObjective {
                    name: s.trim().to_string(),
                    reason: "it is not linear in the per-group (fpr, tpr)".to_string(),
                })
            }
            other => Err(FitError::UnsupportedObjective {
                name: other.to_string(),
                reason: "unknown objective name".to_string(),
            }),
        }
    }
}

/// `constant + sum_g (tpr_coef_g * tpr_g + fpr_coef_g * fpr_g)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearObjective {
    pub constant: f64,
    /// `(tpr_coef, fpr_coef)` per group, aligned with the hulls passed to `compile`.
    pub coefficients: Vec<(f64, f64)>,
}

impl LinearObjective {
    /// Expresses `objective` in terms of per-group rates. Groups without positives (or
    /// negatives) get a zero coefficient on their undefined rate, so the clamped value
    /// never reaches the objective.
    pub fn compile(objective: Objective, counts: &[GroupCounts]) -> Result<Self, FitError> {
        let total: usize = counts.iter().map(|c| c.samples).sum();
        let positives: usize = counts.iter().map(|c| c.positives).sum();
        let negatives: usize = counts.iter().map(|c| c.negatives).sum();

        let require = |count: usize, what: &str| {
            if count == 0 {
                Err(FitError::UndefinedObjective {
                    objective,
                    reason: format!("the data contains no {what}"),
                })
            } else {
                Ok(count as f64)
            }
        };

        let (constant, coefficients) = match objective {
            Objective::BalancedAccuracy => {
                let p = require(positives, "positive labels")?;
                let q = require(negatives, "negative labels")?;
                let coefs = counts
                    .iter()
                    .map(|c| (0.5 * c.positives as f64 / p, -0.5 * c.negatives as f64 / q))
                    .collect();
                (0.5, coefs)
            }
            Objective::Accuracy => {
                let n = require(total, "samples")?;
                let coefs = counts
                    .iter()
                    .map(|c| (c.positives as f64 / n, -(c.negatives as f64) / n))
                    .collect();
                (negatives as f64 / n, coefs)
            }
            Objective::TruePositiveRate => {
                let p = require(positives, "positive labels")?;
                let coefs = counts
                    .iter()
                    .map(|c| (c.positives as f64 / p, 0.0))
                    .collect();
                (0.0, coefs)
            }
            Objective::TrueNegativeRate => {
                let q = require(negatives, "negative labels")?;
                let coefs = counts
                    .iter()
                    .map(|c| (0.0, -(c.negatives as f64) / q))
                    .collect();
                (1.0, coefs)
            }
            Objective::SelectionRate => {
                let n = require(total, "samples")?;
                let coefs = counts
                    .iter()
                    .map(|c| (c.positives as f64 / n, c.negatives as f64 / n))
                    .collect();
                (0.0, coefs)
            }
        };

        Ok(Self {
            constant,
            coefficients,
        })
    }

    pub fn evaluate(&self, points: &[RatePoint]) -> f64 {
        debug_assert_eq!(points.len(), self.coefficients.len());
        self.coefficients
            .iter()
            .zip(points)
            .fold(self.constant, |acc, (&(a, b), p)| acc + a * p.tpr + b * p.fpr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn counts(positives: usize, negatives: usize) -> GroupCounts {
        GroupCounts {
            samples: positives + negatives,
            positives,
            negatives,
            distinct_scores: positives + negatives,
        }
    }

    #[test]
    fn names_round_trip() {
        for objective in [
            Objective::BalancedAccuracy,
            Objective::Accuracy,
            Objective::TruePositiveRate,
            Objective::TrueNegativeRate,
            Objective::SelectionRate,
        ] {
            assert_eq!(objective.name().parse::<Objective>().unwrap(), objective);
        }
    }

    #[test]
    fn nonlinear_objectives_are_rejected() {
        match "f1".parse::<Objective>() {
            Err(FitError::UnsupportedObjective { name, .. }) => assert_eq!(name, "f1"),
            other => panic!("expected UnsupportedObjective, got {:?}", other),
        }
        assert!("best_guess".parse::<Objective>().is_err());
    }

    #[test]
    fn balanced_accuracy_under_shared_rates() {
        let groups = [counts(2, 2), counts(5, 1)];
        let objective = LinearObjective::compile(Objective::BalancedAccuracy, &groups).unwrap();
        let p = RatePoint::new(0.2, 0.7);
        let value = objective.evaluate(&[p, p]);
        assert_abs_diff_eq!(value, 0.5 * (0.7 + 1.0 - 0.2), epsilon = 1e-12);
    }

    #[test]
    fn accuracy_matches_confusion_counts() {
        // Group A: 4 pos, 6 neg at (fpr 0.5, tpr 0.75) -> 3 TP, 3 TN.
        // Group B: 1 pos, 9 neg at (fpr 0, tpr 1) -> 1 TP, 9 TN.
        let groups = [counts(4, 6), counts(1, 9)];
        let objective = LinearObjective::compile(Objective::Accuracy, &groups).unwrap();
        let value =
            objective.evaluate(&[RatePoint::new(0.5, 0.75), RatePoint::new(0.0, 1.0)]);
        assert_abs_diff_eq!(value, 16.0 / 20.0, epsilon = 1e-12);
    }

    #[test]
    fn selection_rate_weights_by_population() {
        let groups = [counts(1, 3), counts(3, 1)];
        let objective = LinearObjective::compile(Objective::SelectionRate, &groups).unwrap();
        let value = objective.evaluate(&[RatePoint::new(1.0, 1.0), RatePoint::new(0.0, 0.0)]);
        assert_abs_diff_eq!(value, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn missing_labels_do_not_produce_nan() {
        let groups = [counts(0, 4), counts(0, 2)];
        match LinearObjective::compile(Objective::BalancedAccuracy, &groups) {
            Err(FitError::UndefinedObjective { objective, .. }) => {
                assert_eq!(objective, Objective::BalancedAccuracy)
            }
            other => panic!("expected UndefinedObjective, got {:?}", other),
        }
        let tnr = LinearObjective::compile(Objective::TrueNegativeRate, &groups).unwrap();
        assert!(tnr.evaluate(&[RatePoint::new(0.5, 0.0); 2]).is_finite());
    }
}
