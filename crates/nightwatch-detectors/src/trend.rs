//! Trend detector: sustained directional shifts, P2/P3.
//!
//! Short- vs long-window moving-average crossover: the 30-day mean pulling
//! more than 15% away from the 180-day mean marks a real shift, not a
//! one-day blip.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use nightwatch_core::alert::{
    Alert, AlertDetails, DetectionMethod, DetectorKind, Priority, Severity, TrendDirection,
};
use nightwatch_core::dataset::{CleanDataset, Dimension, Metric};
use nightwatch_core::registry::PropertyConfig;
use nightwatch_core::stats::{self, Window};

use crate::Detector;

/// Mean daily sessions over the long window a segment needs to qualify.
const VOLUME_FLOOR: f64 = 50.0;
/// Minimum |MA_30 − MA_180| / MA_180 to trigger.
const CHANGE_THRESHOLD: f64 = 0.15;
const SHORT_WINDOW_DAYS: i64 = 30;
const LONG_WINDOW_DAYS: i64 = 180;
/// Business impact per percentage point of crossover gap.
const IMPACT_SCALE: f64 = 0.4;
/// At most this many trend alerts per property per dimension per day.
const MAX_PER_DIMENSION: usize = 3;

const METRICS: [Metric; 3] = [Metric::Sessions, Metric::Users, Metric::Conversions];

pub struct TrendDetector;

impl Detector for TrendDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Trend
    }

    fn required_days(&self) -> i64 {
        183
    }

    fn detect(
        &self,
        generated_at: DateTime<Utc>,
        property: &PropertyConfig,
        dataset: &CleanDataset,
    ) -> Vec<Alert> {
        let anchor = dataset.analysis_date;
        let short_window = Window::trailing(anchor, SHORT_WINDOW_DAYS);
        let long_window = Window::trailing(anchor, LONG_WINDOW_DAYS);
        let volume_floor = property.volume_floor(VOLUME_FLOOR);
        let mut alerts = Vec::new();

        for dimension in Dimension::ALL {
            if !property.dimension_enabled(dimension) {
                continue;
            }

            let mut dimension_alerts = Vec::new();
            for value in dataset.segment_values(dimension) {
                let Some(sessions) = dataset.series(dimension, value, Metric::Sessions) else {
                    continue;
                };
                let Some(mean_sessions) = stats::rolling_mean(sessions, long_window) else {
                    continue;
                };
                if mean_sessions < volume_floor {
                    continue;
                }

                for metric in METRICS {
                    let Some(points) = dataset.series(dimension, value, metric) else {
                        continue;
                    };
                    let Some(short_mean) = stats::rolling_mean(points, short_window) else {
                        continue;
                    };
                    let Some(long_mean) = stats::rolling_mean(points, long_window) else {
                        continue;
                    };
                    if long_mean <= 0.0 {
                        continue;
                    }

                    let change = (short_mean - long_mean) / long_mean;
                    if change.abs() < CHANGE_THRESHOLD {
                        continue;
                    }

                    let direction = if change > 0.0 {
                        TrendDirection::Up
                    } else {
                        TrendDirection::Down
                    };
                    let (priority, severity) = match direction {
                        TrendDirection::Up => (Priority::P3, Severity::Info),
                        TrendDirection::Down => (Priority::P2, Severity::Warning),
                    };
                    let change_pct = change * 100.0;
                    let arrow = match direction {
                        TrendDirection::Up => "up",
                        TrendDirection::Down => "down",
                    };
                    let segment = if value.is_empty() {
                        String::new()
                    } else {
                        format!("{value}: ")
                    };

                    dimension_alerts.push(Alert {
                        detector: DetectorKind::Trend,
                        priority,
                        property_id: property.property_id.clone(),
                        date: anchor,
                        dimension,
                        dimension_value: value.to_string(),
                        metric,
                        observed_value: short_mean,
                        baseline_value: long_mean,
                        delta: change_pct,
                        severity,
                        business_impact: (change_pct.abs() * IMPACT_SCALE).round().min(100.0)
                            as u8,
                        detection_methods: BTreeSet::from([DetectionMethod::MaCrossover]),
                        message: format!(
                            "{segment}{metric} trending {arrow} {:.1}%: 30-day avg {short_mean:.0} vs 180-day avg {long_mean:.0}",
                            change_pct.abs()
                        ),
                        details: AlertDetails::Trend {
                            direction,
                            recent_avg: short_mean,
                            baseline_avg: long_mean,
                            change_pct,
                        },
                        generated_at,
                    });
                }
            }

            // Keep the strongest crossovers when a dimension is noisy.
            dimension_alerts.sort_by(|a, b| {
                b.delta
                    .abs()
                    .partial_cmp(&a.delta.abs())
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.dimension_value.cmp(&b.dimension_value))
                    .then_with(|| a.metric.cmp(&b.metric))
            });
            dimension_alerts.truncate(MAX_PER_DIMENSION);
            alerts.extend(dimension_alerts);
        }

        alerts
    }
}
