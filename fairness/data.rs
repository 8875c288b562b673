//! # Data Loading and Validation Module
//!
//! This module is the exclusive entry point for user-provided samples. It validates
//! score/label/group columns, whether they arrive as in-memory slices from a caller
//! or as a tab-separated file, and hands the optimizer clean `ndarray` columns.
//!
//! - Strict Schema: Column names are not configurable. Files must carry `score`,
//!   `group` and (for fitting and reports) `label`; `sample_id` is optional.
//! - User-Centric Errors: Failures are assumed to be user-input errors. The
//!   `DataError` enum reports the offending column and row.

use ndarray::Array1;
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Validated samples for one fitting call: one score, label and group per applicant.
#[derive(Debug, Clone, PartialEq)]
pub struct FitData {
    /// Continuous risk scores from the upstream classifier.
    pub scores: Array1<f64>,
    /// Binary outcomes, each 0 or 1.
    pub labels: Array1<u8>,
    /// Protected-attribute value of each sample.
    pub groups: Vec<String>,
}

/// Samples awaiting a decision; labels are not needed.
#[derive(Debug, Clone)]
pub struct PredictionData {
    pub scores: Array1<f64>,
    pub groups: Vec<String>,
    /// Taken from a `sample_id` column when present, otherwise 1-based row numbers.
    pub sample_ids: Vec<String>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("Input columns disagree in length: {scores} scores, {labels} labels, {groups} groups.")]
    LengthMismatch {
        scores: usize,
        labels: usize,
        groups: usize,
    },
    #[error("The input contains no samples.")]
    Empty,
    #[error("Label at row {row} is {value}; labels must be 0 or 1.")]
    InvalidLabel { row: usize, value: f64 },
    #[error("Group id at row {0} is empty.")]
    EmptyGroupId(usize),
    #[error("Prediction at row {row} is {value}; predictions must be probabilities in [0, 1].")]
    InvalidPrediction { row: usize, value: f64 },
}

impl FitData {
    /// Wraps already-materialized columns after validating them.
    pub fn new(
        scores: Array1<f64>,
        labels: Array1<u8>,
        groups: Vec<String>,
    ) -> Result<Self, DataError> {
        let data = Self {
            scores,
            labels,
            groups,
        };
        data.validate()?;
        Ok(data)
    }

    pub fn from_slices<S: AsRef<str>>(
        scores: &[f64],
        labels: &[u8],
        groups: &[S],
    ) -> Result<Self, DataError> {
        Self::new(
            Array1::from(scores.to_vec()),
            Array1::from(labels.to_vec()),
            groups.iter().map(|g| g.as_ref().to_string()).collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Checks the invariants every consumer relies on. The fields are public, so the
    /// optimizer re-runs this instead of trusting the constructor.
    pub fn validate(&self) -> Result<(), DataError> {
        validate_columns(self.scores.len(), self.labels.len(), self.groups.len())?;
        validate_scores(&self.scores)?;
        if let Some(row) = self.labels.iter().position(|&label| label > 1) {
            return Err(DataError::InvalidLabel {
                row: row + 1,
                value: f64::from(self.labels[row]),
            });
        }
        validate_groups(&self.groups)
    }

    /// Row indices of every group, keyed in a stable (sorted) order.
    pub fn partition(&self) -> BTreeMap<&str, Vec<usize>> {
        partition_groups(&self.groups)
    }
}

impl PredictionData {
    pub fn new(
        scores: Array1<f64>,
        groups: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self, DataError> {
        validate_columns(scores.len(), sample_ids.len(), groups.len())?;
        validate_scores(&scores)?;
        validate_groups(&groups)?;
        Ok(Self {
            scores,
            groups,
            sample_ids,
        })
    }
}

/// Row indices of every distinct group id, keyed in sorted order.
pub fn partition_groups(groups: &[String]) -> BTreeMap<&str, Vec<usize>> {
    let mut partition: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (row, group) in groups.iter().enumerate() {
        partition.entry(group.as_str()).or_default().push(row);
    }
    partition
}

fn validate_columns(scores: usize, labels: usize, groups: usize) -> Result<(), DataError> {
    if scores != labels || scores != groups {
        return Err(DataError::LengthMismatch {
            scores,
            labels,
            groups,
        });
    }
    if scores == 0 {
        return Err(DataError::Empty);
    }
    Ok(())
}

fn validate_scores(scores: &Array1<f64>) -> Result<(), DataError> {
    if scores.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DataError::NonFiniteValuesFound("score".to_string()))
    }
}

fn validate_groups(groups: &[String]) -> Result<(), DataError> {
    match groups.iter().position(|g| g.trim().is_empty()) {
        Some(row) => Err(DataError::EmptyGroupId(row + 1)),
        None => Ok(()),
    }
}

/// Loads and validates a labeled, group-tagged file for fitting or reporting.
pub fn load_fit_data(path: &str) -> Result<FitData, DataError> {
    let loaded = internal::load_data(path, true, false)?;
    // Present because `include_label` was requested.
    let labels = loaded
        .labels
        .ok_or_else(|| DataError::ColumnNotFound("label".to_string()))?;
    FitData::new(loaded.scores, labels, loaded.groups)
}

/// Loads and validates a group-tagged file for inference.
pub fn load_prediction_data(path: &str) -> Result<PredictionData, DataError> {
    let loaded = internal::load_data(path, false, true)?;
    let n = loaded.scores.len();
    let sample_ids = loaded
        .sample_ids
        .unwrap_or_else(|| (1..=n).map(|i| i.to_string()).collect());
    PredictionData::new(loaded.scores, loaded.groups, sample_ids)
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    pub(super) struct LoadedData {
        pub scores: Array1<f64>,
        pub labels: Option<Array1<u8>>,
        pub groups: Vec<String>,
        pub sample_ids: Option<Vec<String>>,
    }

    /// The single, unified data loading function. It reads a file, validates the
    /// required columns and returns them as owned columns.
    pub(super) fn load_data(
        path: &str,
        include_label: bool,
        include_sample_ids: bool,
    ) -> Result<LoadedData, DataError> {
        fn extract_numeric_column(
            df: &DataFrame,
            column_name: &str,
        ) -> Result<Vec<f64>, DataError> {
            let series = df.column(column_name)?;
            if series.null_count() > 0 {
                return Err(DataError::MissingValuesFound(column_name.to_string()));
            }

            let casted = match series.cast(&DataType::Float64) {
                Ok(casted) => casted,
                Err(_) => {
                    return Err(DataError::ColumnWrongType {
                        column_name: column_name.to_string(),
                        expected_type: "f64 (numeric)",
                        found_type: format!("{:?}", series.dtype()),
                    });
                }
            };

            if casted.null_count() > 0 {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }

            let chunked = casted.f64()?.rechunk();
            let values: Vec<f64> = chunked.into_no_null_iter().collect();
            if values.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
            }
            Ok(values)
        }

        fn extract_text_column(
            df: &DataFrame,
            column_name: &str,
        ) -> Result<Vec<String>, DataError> {
            let series = df.column(column_name)?;
            if series.null_count() > 0 {
                return Err(DataError::MissingValuesFound(column_name.to_string()));
            }
            let casted = series
                .cast(&DataType::String)
                .map_err(|_| DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "string",
                    found_type: format!("{:?}", series.dtype()),
                })?;
            let mut values = Vec::with_capacity(casted.len());
            for value in casted.str()?.into_iter() {
                match value {
                    Some(text) => values.push(text.trim().to_string()),
                    None => return Err(DataError::MissingValuesFound(column_name.to_string())),
                }
            }
            Ok(values)
        }

        fn labels_from(values: Vec<f64>) -> Result<Array1<u8>, DataError> {
            let mut labels = Vec::with_capacity(values.len());
            for (row, value) in values.into_iter().enumerate() {
                if value == 0.0 {
                    labels.push(0u8);
                } else if value == 1.0 {
                    labels.push(1u8);
                } else {
                    return Err(DataError::InvalidLabel {
                        row: row + 1,
                        value,
                    });
                }
            }
            Ok(Array1::from(labels))
        }

        let mut required_cols: Vec<&str> = vec!["score", "group"];
        if include_label {
            required_cols.push("label");
        }

        log::info!("Loading data from '{path}'");
        let mut df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let columns_set: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for col_name in &required_cols {
            if !columns_set.contains(*col_name) {
                return Err(DataError::ColumnNotFound(col_name.to_string()));
            }
        }
        let has_sample_ids = include_sample_ids && columns_set.contains("sample_id");

        let mut projection = required_cols.clone();
        if has_sample_ids {
            projection.push("sample_id");
        }
        df = df.select(projection)?;

        let scores = Array1::from_vec(extract_numeric_column(&df, "score")?);
        let groups = extract_text_column(&df, "group")?;
        let labels = if include_label {
            Some(labels_from(extract_numeric_column(&df, "label")?)?)
        } else {
            None
        };
        let sample_ids = if has_sample_ids {
            Some(extract_text_column(&df, "sample_id")?)
        } else {
            None
        };

        log::info!(
            "Loaded {} rows with columns {:?}.",
            scores.len(),
            required_cols
        );

        Ok(LoadedData {
            scores,
            labels,
            groups,
            sample_ids,
        })
    }
}
