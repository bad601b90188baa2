//! Dataset loading and validation.
//!
//! The wire blob is one JSON object per (property, reference date) with a
//! point array per dimension. Sort order on the wire is unspecified; this
//! module sorts, validates and normalises so the core only ever sees a
//! well-formed [`CleanDataset`].

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

use nightwatch_core::dataset::{CleanDataset, DataPoint, Dimension, Metric};
use nightwatch_core::CoreError;

use crate::{BlobStore, StoreError};

/// Minimum distinct settled days the overall series must cover; shorter
/// histories cannot support even the disaster baseline.
pub const MIN_HISTORY_DAYS: usize = 2;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("dataset not found for property {0}")]
    Missing(String),

    #[error("malformed dataset for property {property_id}: {reason}")]
    Malformed { property_id: String, reason: String },

    #[error("invalid dataset for property {property_id}: {source}")]
    Invalid {
        property_id: String,
        #[source]
        source: CoreError,
    },

    #[error("insufficient history for property {property_id}: {reason}")]
    InsufficientHistory { property_id: String, reason: String },

    #[error(transparent)]
    Store(StoreError),
}

impl LoadError {
    /// True for the "not enough settled data" family, as opposed to a
    /// broken or unreachable blob.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, LoadError::InsufficientHistory { .. })
    }
}

/// Blob key of the property registry.
pub const REGISTRY_KEY: &str = "config/properties.json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("property registry missing at {REGISTRY_KEY}")]
    Missing,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Malformed(CoreError),
}

/// Load the property registry from the store. Any failure here is fatal
/// for the run; there is nothing to monitor without it.
pub async fn load_registry(
    store: &dyn BlobStore,
) -> Result<nightwatch_core::registry::PropertyRegistry, RegistryError> {
    let bytes = match store.get(REGISTRY_KEY).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => return Err(RegistryError::Missing),
        Err(e) => return Err(RegistryError::Store(e)),
    };
    nightwatch_core::registry::PropertyRegistry::from_json(&bytes)
        .map_err(RegistryError::Malformed)
}

#[derive(Debug, Deserialize)]
struct DatasetFile {
    property_id: String,
    reference_date: NaiveDate,
    #[serde(default)]
    overall: Vec<WirePoint>,
    #[serde(default)]
    geography: Vec<WirePoint>,
    #[serde(default)]
    device: Vec<WirePoint>,
    #[serde(default)]
    traffic_source: Vec<WirePoint>,
    #[serde(default)]
    landing_page: Vec<WirePoint>,
}

#[derive(Debug, Deserialize)]
struct WirePoint {
    date: NaiveDate,
    #[serde(default)]
    dimension_value: String,
    metric: Metric,
    value: f64,
}

/// Blob key for one property's clean dataset.
pub fn dataset_key(property_id: &str, reference_date: NaiveDate) -> String {
    format!("clean_dataset/{property_id}/{reference_date}.json")
}

/// Load and validate one property's dataset from the store.
pub async fn load_dataset(
    store: &dyn BlobStore,
    property_id: &str,
    reference_date: NaiveDate,
    settling_days: i64,
) -> Result<CleanDataset, LoadError> {
    let key = dataset_key(property_id, reference_date);
    let bytes = match store.get(&key).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            return Err(LoadError::Missing(property_id.to_string()));
        }
        Err(e) => return Err(LoadError::Store(e)),
    };
    let dataset = parse_dataset(&bytes, settling_days)?;
    if dataset.property_id != property_id {
        return Err(LoadError::Malformed {
            property_id: property_id.to_string(),
            reason: format!(
                "blob claims property_id {:?}",
                dataset.property_id
            ),
        });
    }
    Ok(dataset)
}

/// Parse and validate raw dataset bytes. Also used by `nightwatch verify`
/// on a local file.
pub fn parse_dataset(bytes: &[u8], settling_days: i64) -> Result<CleanDataset, LoadError> {
    let file: DatasetFile = serde_json::from_slice(bytes).map_err(|e| LoadError::Malformed {
        property_id: "<unknown>".to_string(),
        reason: e.to_string(),
    })?;

    let property_id = file.property_id.clone();
    if property_id.trim().is_empty() {
        return Err(LoadError::Malformed {
            property_id,
            reason: "empty property_id".to_string(),
        });
    }

    let analysis_date = file.reference_date - chrono::Duration::days(settling_days);
    let mut dataset = CleanDataset::new(property_id.clone(), file.reference_date, analysis_date);

    let series = [
        (Dimension::Overall, &file.overall),
        (Dimension::Geography, &file.geography),
        (Dimension::Device, &file.device),
        (Dimension::TrafficSource, &file.traffic_source),
        (Dimension::LandingPage, &file.landing_page),
    ];
    for (dimension, points) in series {
        for point in points.iter() {
            if dimension != Dimension::Overall && point.dimension_value.is_empty() {
                return Err(LoadError::Malformed {
                    property_id: property_id.clone(),
                    reason: format!(
                        "{dimension} point on {} has an empty dimension_value",
                        point.date
                    ),
                });
            }
            if point.metric.is_count() && point.value.fract() != 0.0 {
                return Err(LoadError::Malformed {
                    property_id: property_id.clone(),
                    reason: format!(
                        "{} on {} is not an integer: {}",
                        point.metric, point.date, point.value
                    ),
                });
            }
            let value = if dimension == Dimension::Overall {
                ""
            } else {
                point.dimension_value.as_str()
            };
            dataset.push_point(
                dimension,
                value,
                point.metric,
                DataPoint::new(point.date, point.value),
            );
        }
    }

    let dataset = dataset.finalize().map_err(|source| LoadError::Invalid {
        property_id: property_id.clone(),
        source,
    })?;

    match dataset.overall(Metric::Sessions) {
        Some(sessions) if sessions.len() >= MIN_HISTORY_DAYS => {}
        _ => {
            return Err(LoadError::InsufficientHistory {
                property_id,
                reason: format!(
                    "overall sessions series has fewer than {MIN_HISTORY_DAYS} settled days"
                ),
            });
        }
    }

    Ok(dataset)
}
