//! Per-group rates and the disparity summaries derived from them.
//!
//! Predictions may be hard decisions (0 or 1) or selection probabilities; a
//! probability contributes its expected count, so the same code reports both the
//! realized and the expected behavior of a policy.

use crate::data::{DataError, partition_groups};
use crate::types::Degeneracy;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRates {
    pub samples: usize,
    pub positives: usize,
    pub negatives: usize,
    pub selection_rate: f64,
    /// Clamped to 0 when the group has no positives.
    pub true_positive_rate: f64,
    /// Clamped to 0 when the group has no negatives.
    pub false_positive_rate: f64,
    #[serde(default)]
    pub degeneracy: Option<Degeneracy>,
}

/// Rates of every group, keyed in sorted order.
pub fn group_rates(
    predictions: ArrayView1<f64>,
    labels: ArrayView1<u8>,
    groups: &[String],
) -> Result<BTreeMap<String, GroupRates>, DataError> {
    if predictions.len() != labels.len() || labels.len() != groups.len() {
        return Err(DataError::LengthMismatch {
            scores: predictions.len(),
            labels: labels.len(),
            groups: groups.len(),
        });
    }
    if let Some(row) = predictions
        .iter()
        .position(|p| !(0.0..=1.0).contains(p))
    {
        return Err(DataError::InvalidPrediction {
            row: row + 1,
            value: predictions[row],
        });
    }
    if let Some(row) = labels.iter().position(|&label| label > 1) {
        return Err(DataError::InvalidLabel {
            row: row + 1,
            value: f64::from(labels[row]),
        });
    }

    let mut rates = BTreeMap::new();
    for (group, rows) in partition_groups(groups) {
        let (mut selected, mut true_positive, mut false_positive) = (0.0, 0.0, 0.0);
        let mut positives = 0usize;
        for &row in &rows {
            let p = predictions[row];
            selected += p;
            if labels[row] == 1 {
                positives += 1;
                true_positive += p;
            } else {
                false_positive += p;
            }
        }
        let negatives = rows.len() - positives;
        let per = |mass: f64, total: usize| if total == 0 { 0.0 } else { mass / total as f64 };
        let degeneracy = if positives == 0 {
            Some(Degeneracy::NoPositives)
        } else if negatives == 0 {
            Some(Degeneracy::NoNegatives)
        } else {
            None
        };
        rates.insert(
            group.to_string(),
            GroupRates {
                samples: rows.len(),
                positives,
                negatives,
                selection_rate: per(selected, rows.len()),
                true_positive_rate: per(true_positive, positives),
                false_positive_rate: per(false_positive, negatives),
                degeneracy,
            },
        );
    }
    Ok(rates)
}

/// Largest pairwise gaps between groups, each `max - min` over the groups where the
/// rate is defined. With fewer than two such groups the gap is 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisparityReport {
    pub selection_rate_difference: f64,
    pub true_positive_rate_difference: f64,
    pub false_positive_rate_difference: f64,
    pub by_group: BTreeMap<String, GroupRates>,
}

impl DisparityReport {
    pub fn from_rates(by_group: BTreeMap<String, GroupRates>) -> Self {
        let spread = |values: Vec<f64>| -> f64 {
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            if values.is_empty() { 0.0 } else { max - min }
        };
        let selection = by_group.values().map(|r| r.selection_rate).collect();
        let tpr = by_group
            .values()
            .filter(|r| r.positives > 0)
            .map(|r| r.true_positive_rate)
            .collect();
        let fpr = by_group
            .values()
            .filter(|r| r.negatives > 0)
            .map(|r| r.false_positive_rate)
            .collect();
        Self {
            selection_rate_difference: spread(selection),
            true_positive_rate_difference: spread(tpr),
            false_positive_rate_difference: spread(fpr),
            by_group,
        }
    }

    /// The larger of the tpr and fpr gaps.
    pub fn equalized_odds_difference(&self) -> f64 {
        self.true_positive_rate_difference
            .max(self.false_positive_rate_difference)
    }
}
