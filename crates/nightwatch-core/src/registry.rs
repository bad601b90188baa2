use serde::{Deserialize, Serialize};

use crate::dataset::Dimension;
use crate::error::CoreError;

/// One monitored property, as configured by the account team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub property_id: String,
    pub dataset_id: String,
    pub client_name: String,
    pub domain: String,
    /// Comma-separated event names that feed the `conversions` metric
    /// upstream; the detectors take `conversions` as given.
    #[serde(default)]
    pub conversion_events: String,
    #[serde(default)]
    pub notes: Option<String>,
    pub is_configured: bool,
    /// Dimensions the account team muted for this property.
    #[serde(default)]
    pub disabled_dimensions: Vec<Dimension>,
    /// Replaces the default session-volume floors of the record and trend
    /// detectors when set.
    #[serde(default)]
    pub min_sessions_override: Option<f64>,
}

impl PropertyConfig {
    pub fn conversion_event_list(&self) -> Vec<&str> {
        self.conversion_events
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn dimension_enabled(&self, dimension: Dimension) -> bool {
        !self.disabled_dimensions.contains(&dimension)
    }

    pub fn volume_floor(&self, default: f64) -> f64 {
        self.min_sessions_override.unwrap_or(default)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    properties: Vec<PropertyConfig>,
}

/// The set of monitored properties, loaded from `config/properties.json`.
#[derive(Debug, Clone)]
pub struct PropertyRegistry {
    pub properties: Vec<PropertyConfig>,
}

impl PropertyRegistry {
    pub fn from_json(bytes: &[u8]) -> Result<Self, CoreError> {
        let file: RegistryFile = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::MalformedRegistry(e.to_string()))?;
        for property in &file.properties {
            if property.property_id.trim().is_empty() {
                return Err(CoreError::MalformedRegistry(
                    "property with empty property_id".to_string(),
                ));
            }
        }
        Ok(Self {
            properties: file.properties,
        })
    }

    /// Only `is_configured` properties are processed.
    pub fn enabled(&self) -> impl Iterator<Item = &PropertyConfig> {
        self.properties.iter().filter(|p| p.is_configured)
    }

    pub fn get(&self, property_id: &str) -> Option<&PropertyConfig> {
        self.properties
            .iter()
            .find(|p| p.property_id == property_id)
    }

    /// Soft configuration problems worth a log line but not a failed run.
    pub fn validation_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for property in self.enabled() {
            if property.conversion_event_list().is_empty() {
                warnings.push(format!(
                    "{} ({}) has no conversion events configured",
                    property.client_name, property.property_id
                ));
            }
            if !property.domain.contains('.') {
                warnings.push(format!(
                    "{} ({}) has a suspicious domain: {:?}",
                    property.client_name, property.property_id, property.domain
                ));
            }
        }
        warnings
    }
}
