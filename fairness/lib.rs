#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod estimate;
pub mod frontier;
pub mod hull;
pub mod metrics;
pub mod objective;
pub mod policy;
pub mod roc;
pub mod types;

#[cfg(test)]
mod test_fixtures;

pub use estimate::{FitConfig, FitError, fit, fit_policy};
pub use frontier::Constraint;
pub use metrics::DisparityReport;
pub use objective::Objective;
pub use policy::{GroupRule, Policy, PolicyError, PredictError};
pub use types::TieRule;
