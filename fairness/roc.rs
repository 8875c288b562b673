//! Per-group ROC sampling.
//!
//! Every distinct score observed in a group is a candidate threshold. One extra
//! sentinel threshold (see [`TieRule::sentinel`]) makes sure both trivial rules,
//! predict-none and predict-all, are among the candidates. The sweep sorts a group's
//! scores once and accumulates label counts block by block, so a group with `n`
//! samples costs `O(n log n)`.

use crate::types::{GroupCounts, OperatingPoint, TieRule, ratio};
use std::cmp::Ordering;

/// Every candidate operating point of one group, ordered by descending threshold
/// (equivalently, non-decreasing fpr and tpr).
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRoc {
    pub group: String,
    pub counts: GroupCounts,
    pub points: Vec<OperatingPoint>,
}

/// Computes the candidate operating points of one group.
///
/// `scores` and `labels` hold only this group's samples. A group without positives
/// (or negatives) gets its undefined rate clamped to 0 at every threshold; callers read
/// the flag from [`GroupCounts::degeneracy`].
pub fn group_roc(group: &str, scores: &[f64], labels: &[u8], tie_rule: TieRule) -> GroupRoc {
    debug_assert_eq!(scores.len(), labels.len());

    let mut order: Vec<(f64, bool)> = scores
        .iter()
        .zip(labels)
        .map(|(&score, &label)| (score, label == 1))
        .collect();
    order.sort_by(|a, b| descending(a.0, b.0));

    let positives = order.iter().filter(|(_, is_positive)| *is_positive).count();
    let negatives = order.len() - positives;
    let point = |tp: usize, fp: usize, threshold: f64| {
        OperatingPoint::new(ratio(fp, negatives), ratio(tp, positives), threshold)
    };

    let mut points = Vec::with_capacity(order.len() + 1);
    let (mut tp, mut fp) = (0usize, 0usize);
    if tie_rule == TieRule::AtOrAbove {
        points.push(point(0, 0, tie_rule.sentinel()));
    }

    let mut start = 0;
    while start < order.len() {
        let threshold = order[start].0;
        let mut end = start;
        let (mut block_tp, mut block_fp) = (0usize, 0usize);
        while end < order.len() && order[end].0 == threshold {
            if order[end].1 {
                block_tp += 1;
            } else {
                block_fp += 1;
            }
            end += 1;
        }

        match tie_rule {
            // The block itself sits on the threshold and is not selected.
            TieRule::StrictlyAbove => {
                points.push(point(tp, fp, threshold));
                tp += block_tp;
                fp += block_fp;
            }
            TieRule::AtOrAbove => {
                tp += block_tp;
                fp += block_fp;
                points.push(point(tp, fp, threshold));
            }
        }
        start = end;
    }

    if tie_rule == TieRule::StrictlyAbove {
        points.push(point(tp, fp, tie_rule.sentinel()));
    }

    let distinct_scores = points.len() - 1;
    GroupRoc {
        group: group.to_string(),
        counts: GroupCounts {
            samples: order.len(),
            positives,
            negatives,
            distinct_scores,
        },
        points,
    }
}

#[inline]
fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}
