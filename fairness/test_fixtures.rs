//! Test fixtures and builders for fairpost tests.
//!
//! Scores are drawn from two unit-variance normals per group, one for negatives centered
//! at 0 and one for positives shifted by the group's separation. Larger separation means
//! a better per-group classifier.

use crate::data::FitData;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// One group of synthetic samples.
#[derive(Clone, Debug)]
pub struct GroupSpec {
    name: String,
    samples: usize,
    prevalence: f64,
    separation: f64,
}

impl GroupSpec {
    pub fn new(name: &str, samples: usize) -> Self {
        Self {
            name: name.to_string(),
            samples,
            prevalence: 0.5,
            separation: 1.0,
        }
    }

    /// Set the fraction of positive labels.
    pub fn with_prevalence(mut self, p: f64) -> Self {
        self.prevalence = p.clamp(0.0, 1.0);
        self
    }

    /// Set the shift of the positive score distribution.
    pub fn with_separation(mut self, s: f64) -> Self {
        self.separation = s;
        self
    }
}

/// Builder for creating synthetic fitting data with configurable groups.
pub struct SyntheticDataBuilder {
    groups: Vec<GroupSpec>,
    rounding: Option<f64>,
    seed: u64,
}

impl SyntheticDataBuilder {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            rounding: None,
            seed: 42,
        }
    }

    pub fn with_group(mut self, group: GroupSpec) -> Self {
        self.groups.push(group);
        self
    }

    /// Round every score to a multiple of `step`, which creates ties.
    pub fn rounded_to(mut self, step: f64) -> Self {
        self.rounding = Some(step);
        self
    }

    /// Set the random seed for reproducibility.
    pub fn seed(mut self, s: u64) -> Self {
        self.seed = s;
        self
    }

    pub fn build(self) -> FitData {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut scores = Vec::new();
        let mut labels = Vec::new();
        let mut groups = Vec::new();

        for group in &self.groups {
            let positives = ((group.samples as f64) * group.prevalence).round() as usize;
            for i in 0..group.samples {
                let label = u8::from(i < positives);
                let noise: f64 = rng.sample(StandardNormal);
                let mut score = noise + f64::from(label) * group.separation;
                if let Some(step) = self.rounding {
                    score = (score / step).round() * step;
                }
                scores.push(score);
                labels.push(label);
                groups.push(group.name.clone());
            }
        }

        FitData::new(Array1::from(scores), Array1::from(labels), groups)
            .expect("synthetic data is always valid")
    }
}
