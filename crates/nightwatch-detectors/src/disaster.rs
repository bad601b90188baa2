//! Disaster detector: catastrophic site-wide failures, P0.
//!
//! Threshold comparison of the analysis day against a 3-day prior mean,
//! overall dimension only. A disaster alert without a credible baseline is
//! worse than none, so an incomplete prior window emits nothing.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use nightwatch_core::alert::{
    Alert, AlertDetails, DetectionMethod, DetectorKind, DisasterTrigger, Priority, Severity,
};
use nightwatch_core::dataset::{CleanDataset, Dimension, Metric};
use nightwatch_core::registry::PropertyConfig;
use nightwatch_core::stats::{self, Window};

use crate::Detector;

/// Sessions below this count as "site down".
const NEAR_ZERO_SESSIONS: f64 = 10.0;
/// Session baselines below this are too small to call a disaster.
const BASELINE_MIN_SESSIONS: f64 = 100.0;
/// Conversion baselines below this are too small to call a tracking failure.
const BASELINE_MIN_CONVERSIONS: f64 = 1.0;
/// Relative drop that counts as catastrophic.
const CATASTROPHIC_DROP: f64 = 0.90;
/// Days in the prior baseline; all of them must be present.
const BASELINE_DAYS: i64 = 3;

pub struct DisasterDetector;

impl Detector for DisasterDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Disaster
    }

    fn required_days(&self) -> i64 {
        4
    }

    fn detect(
        &self,
        generated_at: DateTime<Utc>,
        property: &PropertyConfig,
        dataset: &CleanDataset,
    ) -> Vec<Alert> {
        let anchor = dataset.analysis_date;
        let baseline_window = Window::trailing(anchor - chrono::Duration::days(1), BASELINE_DAYS);
        let mut alerts = Vec::new();

        if let Some(sessions) = dataset.overall(Metric::Sessions) {
            let observed = stats::value_on(sessions, anchor);
            let baseline_values = stats::window_values(sessions, baseline_window);
            if let (Some(observed), Some(baseline)) =
                (observed, complete_mean(&baseline_values))
            {
                if observed < NEAR_ZERO_SESSIONS && baseline >= BASELINE_MIN_SESSIONS {
                    alerts.push(self.alert(
                        generated_at,
                        property,
                        dataset,
                        DisasterTrigger::NearZeroTraffic,
                        Metric::Sessions,
                        observed,
                        baseline,
                        95,
                        format!(
                            "Site down: only {observed:.0} sessions against a {baseline:.0} session baseline"
                        ),
                    ));
                }

                if baseline >= BASELINE_MIN_SESSIONS {
                    let drop = (baseline - observed) / baseline;
                    if drop >= CATASTROPHIC_DROP {
                        alerts.push(self.alert(
                            generated_at,
                            property,
                            dataset,
                            DisasterTrigger::CatastrophicDrop,
                            Metric::Sessions,
                            observed,
                            baseline,
                            85,
                            format!(
                                "Catastrophic traffic drop: -{:.1}% vs 3-day baseline",
                                drop * 100.0
                            ),
                        ));
                    }
                }
            }
        }

        if let Some(conversions) = dataset.overall(Metric::Conversions) {
            let observed = stats::value_on(conversions, anchor);
            let baseline_values = stats::window_values(conversions, baseline_window);
            if let (Some(observed), Some(baseline)) =
                (observed, complete_mean(&baseline_values))
            {
                if observed == 0.0 && baseline >= BASELINE_MIN_CONVERSIONS {
                    alerts.push(self.alert(
                        generated_at,
                        property,
                        dataset,
                        DisasterTrigger::TrackingFailure,
                        Metric::Conversions,
                        observed,
                        baseline,
                        100,
                        format!(
                            "Conversion tracking failure: 0 conversions against a {baseline:.1} conversion baseline"
                        ),
                    ));
                }
            }
        }

        alerts
    }
}

impl DisasterDetector {
    #[allow(clippy::too_many_arguments)]
    fn alert(
        &self,
        generated_at: DateTime<Utc>,
        property: &PropertyConfig,
        dataset: &CleanDataset,
        trigger: DisasterTrigger,
        metric: Metric,
        observed: f64,
        baseline: f64,
        business_impact: u8,
        message: String,
    ) -> Alert {
        Alert {
            detector: DetectorKind::Disaster,
            priority: Priority::P0,
            property_id: property.property_id.clone(),
            date: dataset.analysis_date,
            dimension: Dimension::Overall,
            dimension_value: String::new(),
            metric,
            observed_value: observed,
            baseline_value: baseline,
            delta: (observed - baseline) / baseline,
            severity: Severity::Critical,
            business_impact,
            detection_methods: BTreeSet::from([DetectionMethod::Threshold]),
            message,
            details: AlertDetails::Disaster { trigger },
            generated_at,
        }
    }
}

/// Mean of the prior window only when every baseline day is present.
fn complete_mean(values: &[f64]) -> Option<f64> {
    if values.len() != BASELINE_DAYS as usize {
        return None;
    }
    stats::mean(values)
}

#[cfg(test)]
mod tests {
    use crate::testutil::{property, stamp, DatasetBuilder};

    use super::*;

    #[test]
    fn zero_conversions_with_steady_sessions_is_a_tracking_failure() {
        let dataset = DatasetBuilder::new()
            .series(
                Dimension::Overall,
                "",
                Metric::Conversions,
                &[3.0, 4.0, 5.0, 2.0, 3.0, 4.0, 5.0, 3.0, 4.0, 5.0, 3.0, 4.0, 5.0, 0.0],
            )
            .series(Dimension::Overall, "", Metric::Sessions, &[500.0; 14])
            .build();

        let alerts = DisasterDetector.detect(stamp(), &property(), &dataset);
        assert_eq!(alerts.len(), 1);

        let alert = &alerts[0];
        assert_eq!(alert.priority, Priority::P0);
        assert_eq!(alert.metric, Metric::Conversions);
        assert_eq!(alert.observed_value, 0.0);
        assert_eq!(alert.baseline_value, 4.0);
        assert_eq!(alert.business_impact, 100);
        assert_eq!(
            alert.details,
            AlertDetails::Disaster {
                trigger: DisasterTrigger::TrackingFailure
            }
        );
        assert!(alert
            .detection_methods
            .contains(&DetectionMethod::Threshold));
    }

    #[test]
    fn near_zero_traffic_also_fires_the_drop_trigger_distinctly() {
        let dataset = DatasetBuilder::new()
            .series(Dimension::Overall, "", Metric::Sessions, &[450.0, 500.0, 550.0, 3.0])
            .build();

        let alerts = DisasterDetector.detect(stamp(), &property(), &dataset);
        let triggers: Vec<DisasterTrigger> = alerts
            .iter()
            .map(|a| match a.details {
                AlertDetails::Disaster { trigger } => trigger,
                _ => panic!("disaster details expected"),
            })
            .collect();
        assert_eq!(
            triggers,
            vec![
                DisasterTrigger::NearZeroTraffic,
                DisasterTrigger::CatastrophicDrop
            ]
        );
        assert_eq!(alerts[0].business_impact, 95);
        assert_eq!(alerts[1].business_impact, 85);
    }

    #[test]
    fn incomplete_baseline_emits_nothing() {
        // Only two of the three prior days exist.
        let dataset = DatasetBuilder::new()
            .series(Dimension::Overall, "", Metric::Sessions, &[500.0, 480.0, 2.0])
            .build();

        assert!(DisasterDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }

    #[test]
    fn small_sites_never_disaster() {
        // Baseline mean of 60 sessions is below the credibility floor.
        let dataset = DatasetBuilder::new()
            .series(Dimension::Overall, "", Metric::Sessions, &[60.0, 60.0, 60.0, 2.0])
            .build();

        assert!(DisasterDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }

    #[test]
    fn missing_analysis_day_is_a_gap_not_a_zero() {
        // Series ends the day before the anchor: no row for "yesterday",
        // so nothing can trigger. A gap is not a zero.
        let dataset = DatasetBuilder::new()
            .series_ending(
                Dimension::Overall,
                "",
                Metric::Sessions,
                &[500.0, 510.0, 490.0, 505.0],
                1,
            )
            .build();

        assert!(DisasterDetector
            .detect(stamp(), &property(), &dataset)
            .is_empty());
    }
}
