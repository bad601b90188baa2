//! Spam detector: probable bot bursts, P1.
//!
//! A session spike only becomes a spam alert when a behavioural quality
//! signal agrees with the statistics: bots bounce fast and leave fast.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use nightwatch_core::alert::{
    Alert, AlertDetails, DetectionMethod, DetectorKind, Priority, Severity,
};
use nightwatch_core::dataset::{CleanDataset, Dimension, Metric};
use nightwatch_core::registry::PropertyConfig;
use nightwatch_core::stats::{self, Window, MIN_ROLLING_POINTS};

use crate::Detector;

/// Z-score a spike must reach to become a candidate.
const Z_THRESHOLD: f64 = 3.0;
/// Z-score beyond which a fully-confirmed burst is critical.
const CRITICAL_Z: f64 = 5.0;
/// Bounce rate (fraction) above which traffic quality is suspect.
const BOUNCE_THRESHOLD: f64 = 0.85;
/// Average session duration (seconds) below which quality is suspect.
const DURATION_FLOOR_SECS: f64 = 10.0;
/// Minimum analysed-day sessions for the overall dimension.
const OVERALL_VOLUME_FLOOR: f64 = 100.0;
/// Minimum analysed-day sessions for a segment.
const SEGMENT_VOLUME_FLOOR: f64 = 10.0;
/// Trailing baseline window, ending the day before the analysis day.
const BASELINE_DAYS: i64 = 7;
/// Business impact per unit of z-score.
const IMPACT_PER_Z: f64 = 10.0;
/// Extra impact when both quality signals fail.
const BOTH_SIGNALS_BONUS: u8 = 15;

const DIMENSIONS: [Dimension; 3] = [
    Dimension::Overall,
    Dimension::Geography,
    Dimension::TrafficSource,
];

pub struct SpamDetector;

impl Detector for SpamDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Spam
    }

    fn required_days(&self) -> i64 {
        10
    }

    fn detect(
        &self,
        generated_at: DateTime<Utc>,
        property: &PropertyConfig,
        dataset: &CleanDataset,
    ) -> Vec<Alert> {
        let anchor = dataset.analysis_date;
        let baseline_window =
            Window::trailing(anchor - chrono::Duration::days(1), BASELINE_DAYS);
        let mut alerts = Vec::new();

        for dimension in DIMENSIONS {
            if !property.dimension_enabled(dimension) {
                continue;
            }
            for value in dataset.segment_values(dimension) {
                let Some(sessions) = dataset.series(dimension, value, Metric::Sessions) else {
                    continue;
                };
                let Some(observed) = stats::value_on(sessions, anchor) else {
                    continue;
                };

                let floor = if dimension == Dimension::Overall {
                    OVERALL_VOLUME_FLOOR
                } else {
                    SEGMENT_VOLUME_FLOOR
                };
                if observed < floor {
                    continue;
                }

                let baseline_values = stats::window_values(sessions, baseline_window);
                if baseline_values.len() < MIN_ROLLING_POINTS {
                    continue;
                }
                let (Some(baseline_mean), Some(baseline_stddev)) = (
                    stats::mean(&baseline_values),
                    stats::stddev(&baseline_values),
                ) else {
                    continue;
                };
                let Some(z) = stats::z_score(observed, baseline_mean, baseline_stddev) else {
                    continue;
                };
                if z < Z_THRESHOLD {
                    continue;
                }

                let bounce_rate = dataset
                    .series(dimension, value, Metric::BounceRate)
                    .and_then(|points| stats::value_on(points, anchor));
                let avg_duration = dataset
                    .series(dimension, value, Metric::AvgSessionDuration)
                    .and_then(|points| stats::value_on(points, anchor));

                let bounce_failed = bounce_rate.is_some_and(|b| b > BOUNCE_THRESHOLD);
                let duration_failed = avg_duration.is_some_and(|d| d < DURATION_FLOOR_SECS);
                if !bounce_failed && !duration_failed {
                    continue;
                }
                let both_failed = bounce_failed && duration_failed;

                let mut detection_methods = BTreeSet::from([DetectionMethod::ZScore]);
                if bounce_failed {
                    detection_methods.insert(DetectionMethod::BounceRate);
                }
                if duration_failed {
                    detection_methods.insert(DetectionMethod::SessionDuration);
                }

                let severity = if z >= CRITICAL_Z && both_failed {
                    Severity::Critical
                } else {
                    Severity::Warning
                };

                let mut business_impact = (z * IMPACT_PER_Z).round().min(100.0) as u8;
                if both_failed {
                    business_impact = business_impact.saturating_add(BOTH_SIGNALS_BONUS).min(100);
                }

                let bounce_pct = bounce_rate.unwrap_or(0.0) * 100.0;
                let message = if dimension == Dimension::Overall {
                    format!(
                        "Spam traffic detected: {observed:.0} sessions with {bounce_pct:.1}% bounce rate"
                    )
                } else {
                    format!(
                        "Spam from {value}: {observed:.0} sessions, {bounce_pct:.1}% bounce rate"
                    )
                };

                alerts.push(Alert {
                    detector: DetectorKind::Spam,
                    priority: Priority::P1,
                    property_id: property.property_id.clone(),
                    date: anchor,
                    dimension,
                    dimension_value: value.to_string(),
                    metric: Metric::Sessions,
                    observed_value: observed,
                    baseline_value: baseline_mean,
                    delta: z,
                    severity,
                    business_impact,
                    detection_methods,
                    message,
                    details: AlertDetails::Spam {
                        z_score: z,
                        bounce_rate: bounce_rate.unwrap_or(0.0),
                        avg_session_duration: avg_duration.unwrap_or(0.0),
                    },
                    generated_at,
                });
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{property, stamp, DatasetBuilder};

    use super::*;

    const RU_BURST: [f64; 10] = [5.0, 6.0, 7.0, 5.0, 6.0, 4.0, 5.0, 6.0, 7.0, 120.0];

    fn ru_dataset(bounce: f64, duration: f64) -> CleanDataset {
        let mut bounce_series = [0.4; 10];
        bounce_series[9] = bounce;
        let mut duration_series = [90.0; 10];
        duration_series[9] = duration;
        DatasetBuilder::new()
            .series(Dimension::Geography, "RU", Metric::Sessions, &RU_BURST)
            .series(Dimension::Geography, "RU", Metric::BounceRate, &bounce_series)
            .series(
                Dimension::Geography,
                "RU",
                Metric::AvgSessionDuration,
                &duration_series,
            )
            .build()
    }

    #[test]
    fn country_burst_with_failed_quality_signals_is_critical() {
        let dataset = ru_dataset(0.93, 4.0);
        let alerts = SpamDetector.detect(stamp(), &property(), &dataset);
        assert_eq!(alerts.len(), 1);

        let alert = &alerts[0];
        assert_eq!(alert.priority, Priority::P1);
        assert_eq!(alert.dimension, Dimension::Geography);
        assert_eq!(alert.dimension_value, "RU");
        assert!(alert.delta >= 10.0, "z was {}", alert.delta);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.business_impact, 100);
        assert_eq!(
            alert.detection_methods,
            BTreeSet::from([
                DetectionMethod::ZScore,
                DetectionMethod::BounceRate,
                DetectionMethod::SessionDuration,
            ])
        );
    }

    #[test]
    fn spike_without_quality_confirmation_is_ignored() {
        // Healthy bounce and duration: statistically odd, behaviourally fine.
        let dataset = ru_dataset(0.35, 120.0);
        assert!(SpamDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }

    #[test]
    fn one_failed_signal_is_a_warning_with_that_method() {
        let dataset = ru_dataset(0.93, 120.0);
        let alerts = SpamDetector.detect(stamp(), &property(), &dataset);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(
            alerts[0].detection_methods,
            BTreeSet::from([DetectionMethod::ZScore, DetectionMethod::BounceRate])
        );
    }

    #[test]
    fn volume_floor_mutes_tiny_segments() {
        // Same shape, scaled down below the 10-session segment floor.
        let scaled: Vec<f64> = RU_BURST.iter().map(|v| v / 20.0).collect();
        let mut bounce = [0.4; 10];
        bounce[9] = 0.95;
        let dataset = DatasetBuilder::new()
            .series(Dimension::Geography, "RU", Metric::Sessions, &scaled)
            .series(Dimension::Geography, "RU", Metric::BounceRate, &bounce)
            .build();
        assert!(SpamDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }

    #[test]
    fn overall_dimension_needs_a_hundred_sessions() {
        // A 50-session day cannot be overall spam even with z >> 3.
        let mut sessions = [4.0; 10];
        sessions[9] = 50.0;
        let mut bounce = [0.3; 10];
        bounce[9] = 0.99;
        let dataset = DatasetBuilder::new()
            .series(Dimension::Overall, "", Metric::Sessions, &sessions)
            .series(Dimension::Overall, "", Metric::BounceRate, &bounce)
            .build();
        assert!(SpamDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }

    #[test]
    fn flat_baseline_has_no_defined_z_score() {
        let mut sessions = [20.0; 10];
        sessions[9] = 200.0;
        let mut bounce = [0.3; 10];
        bounce[9] = 0.95;
        let dataset = DatasetBuilder::new()
            .series(Dimension::Geography, "DE", Metric::Sessions, &sessions)
            .series(Dimension::Geography, "DE", Metric::BounceRate, &bounce)
            .build();
        assert!(SpamDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }

    #[test]
    fn suppressed_dimension_is_skipped() {
        let dataset = ru_dataset(0.93, 4.0);
        let mut muted = property();
        muted.disabled_dimensions = vec![Dimension::Geography];
        assert!(SpamDetector.detect(stamp(), &muted, &dataset).is_empty());
    }

    #[test]
    fn six_day_baseline_is_insufficient() {
        // 7 total points: anchor plus a 6-day baseline, one day short.
        let dataset = DatasetBuilder::new()
            .series(
                Dimension::Geography,
                "RU",
                Metric::Sessions,
                &[5.0, 6.0, 4.0, 5.0, 6.0, 7.0, 120.0],
            )
            .series(
                Dimension::Geography,
                "RU",
                Metric::BounceRate,
                &[0.4, 0.4, 0.4, 0.4, 0.4, 0.4, 0.95],
            )
            .build();
        assert!(SpamDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }
}
