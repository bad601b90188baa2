use chrono::NaiveDate;
use thiserror::Error;

use crate::dataset::{Dimension, Metric};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("negative value {value} for {metric} on {date} ({dimension}/{dimension_value})")]
    NegativeValue {
        metric: Metric,
        dimension: Dimension,
        dimension_value: String,
        date: NaiveDate,
        value: f64,
    },

    #[error("non-finite value for {metric} on {date} ({dimension}/{dimension_value})")]
    NonFiniteValue {
        metric: Metric,
        dimension: Dimension,
        dimension_value: String,
        date: NaiveDate,
    },

    #[error("bounce rate {value} outside [0, 1] on {date} ({dimension}/{dimension_value})")]
    RateOutOfRange {
        dimension: Dimension,
        dimension_value: String,
        date: NaiveDate,
        value: f64,
    },

    #[error("duplicate point for {metric} on {date} ({dimension}/{dimension_value})")]
    DuplicateDate {
        metric: Metric,
        dimension: Dimension,
        dimension_value: String,
        date: NaiveDate,
    },

    #[error("property registry is malformed: {0}")]
    MalformedRegistry(String),
}
