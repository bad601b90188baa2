//! Record detector: 90-day highs and lows by dimension, P1/P3.
//!
//! The prior window ends two days before the analysis day so that one
//! anomalous day cannot immediately become its own baseline.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use nightwatch_core::alert::{
    Alert, AlertDetails, DetectionMethod, DetectorKind, Priority, RecordType, Severity,
};
use nightwatch_core::dataset::{CleanDataset, Dimension, Metric};
use nightwatch_core::registry::PropertyConfig;
use nightwatch_core::stats::{self, Window, MIN_DISTRIBUTION_POINTS};

use crate::Detector;

/// Mean daily sessions over the prior window a segment needs to qualify.
const VOLUME_FLOOR: f64 = 100.0;
/// A record must clear the old extremum by this much (percent) to matter.
const SIGNIFICANCE_PCT: f64 = 5.0;
/// Length of the prior extremum window.
const WINDOW_DAYS: i64 = 90;
/// Business impact per percentage point past the old record.
const IMPACT_SCALE: f64 = 1.5;
/// A worst-ever low never scores below this.
const LOW_IMPACT_FLOOR: u8 = 40;

const DIMENSIONS: [Dimension; 4] = [
    Dimension::Overall,
    Dimension::Device,
    Dimension::TrafficSource,
    Dimension::LandingPage,
];

const METRICS: [Metric; 3] = [Metric::Sessions, Metric::Users, Metric::Conversions];

pub struct RecordDetector;

impl Detector for RecordDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Record
    }

    fn required_days(&self) -> i64 {
        93
    }

    fn detect(
        &self,
        generated_at: DateTime<Utc>,
        property: &PropertyConfig,
        dataset: &CleanDataset,
    ) -> Vec<Alert> {
        let anchor = dataset.analysis_date;
        let prior_window =
            Window::trailing(anchor - chrono::Duration::days(2), WINDOW_DAYS);
        let volume_floor = property.volume_floor(VOLUME_FLOOR);
        let mut alerts = Vec::new();

        for dimension in DIMENSIONS {
            if !property.dimension_enabled(dimension) {
                continue;
            }
            for value in dataset.segment_values(dimension) {
                let Some(sessions) = dataset.series(dimension, value, Metric::Sessions) else {
                    continue;
                };
                // High-traffic segments only.
                let Some(mean_sessions) = stats::rolling_mean_with_min(
                    sessions,
                    prior_window,
                    MIN_DISTRIBUTION_POINTS,
                ) else {
                    continue;
                };
                if mean_sessions < volume_floor {
                    continue;
                }

                for metric in METRICS {
                    let Some(points) = dataset.series(dimension, value, metric) else {
                        continue;
                    };
                    let Some(observed) = stats::value_on(points, anchor) else {
                        continue;
                    };
                    let Some(extrema) = stats::extrema(points, prior_window) else {
                        continue;
                    };

                    if observed > extrema.max.value && extrema.max.value > 0.0 {
                        let pct = (observed - extrema.max.value) / extrema.max.value * 100.0;
                        if pct >= SIGNIFICANCE_PCT {
                            alerts.push(record_alert(
                                generated_at,
                                property,
                                anchor,
                                dimension,
                                value,
                                metric,
                                RecordType::High,
                                observed,
                                extrema.max.value,
                                pct,
                            ));
                        }
                    } else if observed < extrema.min.value && extrema.min.value > 0.0 {
                        let pct = (extrema.min.value - observed) / extrema.min.value * 100.0;
                        if pct >= SIGNIFICANCE_PCT {
                            alerts.push(record_alert(
                                generated_at,
                                property,
                                anchor,
                                dimension,
                                value,
                                metric,
                                RecordType::Low,
                                observed,
                                extrema.min.value,
                                pct,
                            ));
                        }
                    }
                }
            }
        }

        alerts
    }
}

#[allow(clippy::too_many_arguments)]
fn record_alert(
    generated_at: DateTime<Utc>,
    property: &PropertyConfig,
    anchor: chrono::NaiveDate,
    dimension: Dimension,
    value: &str,
    metric: Metric,
    record_type: RecordType,
    observed: f64,
    previous_record: f64,
    pct: f64,
) -> Alert {
    let segment = if value.is_empty() {
        String::new()
    } else {
        format!("{value} ")
    };
    let (priority, severity, delta, message, increase_pct, decline_pct) = match record_type {
        RecordType::High => (
            Priority::P3,
            Severity::Info,
            pct,
            format!(
                "{segment}new 90-day high for {metric}: {observed:.0} (previous {previous_record:.0})"
            ),
            Some(pct),
            None,
        ),
        RecordType::Low => (
            Priority::P1,
            Severity::Warning,
            -pct,
            format!(
                "{segment}new 90-day low for {metric}: {observed:.0} (previous low {previous_record:.0})"
            ),
            None,
            Some(pct),
        ),
    };

    let business_impact = (pct * IMPACT_SCALE).round().min(100.0) as u8;
    let business_impact = match record_type {
        RecordType::High => business_impact,
        RecordType::Low => business_impact.max(LOW_IMPACT_FLOOR),
    };

    Alert {
        detector: DetectorKind::Record,
        priority,
        property_id: property.property_id.clone(),
        date: anchor,
        dimension,
        dimension_value: value.to_string(),
        metric,
        observed_value: observed,
        baseline_value: previous_record,
        delta,
        severity,
        business_impact,
        detection_methods: BTreeSet::from([DetectionMethod::Threshold]),
        message,
        details: AlertDetails::Record {
            record_type,
            previous_record,
            increase_pct,
            decline_pct,
        },
        generated_at,
    }
}
