//! The four anomaly detectors.
//!
//! Each detector is a pure function over an immutable [`CleanDataset`]:
//! no I/O, no system time, no shared state. Statistical questions go
//! through the kernel in `nightwatch_core::stats`, and a kernel `None`
//! always means "no signal", never "anomaly".

pub mod disaster;
pub mod record;
pub mod spam;
pub mod trend;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use nightwatch_core::alert::{Alert, DetectorKind};
use nightwatch_core::dataset::CleanDataset;
use nightwatch_core::registry::PropertyConfig;

pub use disaster::DisasterDetector;
pub use record::RecordDetector;
pub use spam::SpamDetector;
pub use trend::TrendDetector;

/// History (in calendar days, ending at the analysis date) the dataset
/// loader requests so the longest detector window is always satisfiable.
pub const LONGEST_WINDOW_DAYS: i64 = 193;

pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Calendar days of history this detector reads, ending at the
    /// analysis date.
    fn required_days(&self) -> i64;

    /// Run the detector. Domain conditions never error: a dataset that
    /// cannot support a test simply produces no alerts.
    fn detect(
        &self,
        generated_at: DateTime<Utc>,
        property: &PropertyConfig,
        dataset: &CleanDataset,
    ) -> Vec<Alert>;
}

pub fn all_detectors() -> Vec<Arc<dyn Detector>> {
    vec![
        Arc::new(DisasterDetector),
        Arc::new(SpamDetector),
        Arc::new(RecordDetector),
        Arc::new(TrendDetector),
    ]
}

pub fn detectors_for(kinds: &[DetectorKind]) -> Vec<Arc<dyn Detector>> {
    all_detectors()
        .into_iter()
        .filter(|d| kinds.contains(&d.kind()))
        .collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::{NaiveDate, TimeZone, Utc};

    use nightwatch_core::dataset::{CleanDataset, DataPoint, Dimension, Metric};
    use nightwatch_core::registry::PropertyConfig;

    pub fn anchor() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
    }

    pub fn stamp() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 6, 6, 0, 0).unwrap()
    }

    pub fn property() -> PropertyConfig {
        PropertyConfig {
            property_id: "prop_test".to_string(),
            dataset_id: "analytics_test".to_string(),
            client_name: "Test Client".to_string(),
            domain: "test-client.com".to_string(),
            conversion_events: "purchase".to_string(),
            notes: None,
            is_configured: true,
            disabled_dimensions: vec![],
            min_sessions_override: None,
        }
    }

    pub struct DatasetBuilder {
        dataset: CleanDataset,
    }

    impl DatasetBuilder {
        /// Reference date three days after the anchor, matching the
        /// default settling delay.
        pub fn new() -> Self {
            let anchor = anchor();
            Self {
                dataset: CleanDataset::new(
                    "prop_test",
                    anchor + chrono::Duration::days(3),
                    anchor,
                ),
            }
        }

        /// Seed a contiguous series whose last value lands on the anchor.
        pub fn series(
            self,
            dimension: Dimension,
            value: &str,
            metric: Metric,
            values: &[f64],
        ) -> Self {
            self.series_ending(dimension, value, metric, values, 0)
        }

        /// Seed a contiguous series ending `days_before_anchor` days
        /// before the anchor (to model a gap on the analysis day).
        pub fn series_ending(
            mut self,
            dimension: Dimension,
            value: &str,
            metric: Metric,
            values: &[f64],
            days_before_anchor: i64,
        ) -> Self {
            let end = anchor() - chrono::Duration::days(days_before_anchor);
            let len = values.len() as i64;
            for (i, v) in values.iter().enumerate() {
                let date = end - chrono::Duration::days(len - 1 - i as i64);
                self.dataset
                    .push_point(dimension, value, metric, DataPoint::new(date, *v));
            }
            self
        }

        pub fn build(self) -> CleanDataset {
            self.dataset.finalize().expect("valid test dataset")
        }
    }
}
