//! Cross-detector consolidation and the daily digest model.
//!
//! The consolidator imposes the one deterministic ordering the rest of the
//! system relies on: two runs over the same inputs must serialise to
//! byte-identical digests.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::{Alert, DetectorKind, RecordType, TrendDirection};
use crate::dataset::Metric;
use crate::registry::PropertyConfig;

/// Hard cap on consolidated alerts per property per day.
pub const MAX_ALERTS_PER_PROPERTY: usize = 12;

/// Share of analysed properties that must show the same anomaly before it
/// counts as a portfolio-wide pattern.
pub const PATTERN_RATIO_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorCounts {
    pub disaster: usize,
    pub spam: usize,
    pub record: usize,
    pub trend: usize,
}

impl DetectorCounts {
    pub fn bump(&mut self, kind: DetectorKind) {
        match kind {
            DetectorKind::Disaster => self.disaster += 1,
            DetectorKind::Spam => self.spam += 1,
            DetectorKind::Record => self.record += 1,
            DetectorKind::Trend => self.trend += 1,
        }
    }

    pub fn get(&self, kind: DetectorKind) -> usize {
        match kind {
            DetectorKind::Disaster => self.disaster,
            DetectorKind::Spam => self.spam,
            DetectorKind::Record => self.record,
            DetectorKind::Trend => self.trend,
        }
    }

    pub fn total(&self) -> usize {
        self.disaster + self.spam + self.record + self.trend
    }
}

/// Why a property (or one detector on it) contributed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueReason {
    LoadFailed,
    InsufficientData,
    DetectorFailed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIssue {
    pub property_id: String,
    pub reason: IssueReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector: Option<DetectorKind>,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRollup {
    pub property_id: String,
    pub client_name: String,
    pub counts: DetectorCounts,
    /// P2/P3 alerts dropped by the per-property cap.
    pub suppressed_count: usize,
    pub all_clear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternConfidence {
    Low,
    Medium,
    High,
}

/// The same anomaly firing across a meaningful share of the portfolio on
/// one day: usually an industry shift or a platform-side change rather
/// than fifty separate client problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPattern {
    pub date: NaiveDate,
    pub detector: DetectorKind,
    pub metric: Metric,
    pub affected_properties: usize,
    pub total_properties: usize,
    pub affected_ratio: f64,
    pub confidence: PatternConfidence,
    pub property_ids: Vec<String>,
}

/// The consolidated, ordered alert report for one reference date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub generated_at: DateTime<Utc>,
    pub reference_date: NaiveDate,
    pub properties_analyzed: usize,
    pub counts: DetectorCounts,
    pub total_alerts: usize,
    pub alerts: Vec<Alert>,
    pub rollups: Vec<PropertyRollup>,
    pub all_clear_properties: Vec<String>,
    /// P2/P3 alerts dropped by per-property caps, summed over properties.
    pub suppressed_total: usize,
    /// Trend(down) alerts dropped because a Record(low) covered the same
    /// series (the stronger signal supersedes the weaker).
    pub deduped_count: usize,
    pub portfolio_patterns: Vec<PortfolioPattern>,
    pub issues: Vec<RunIssue>,
}

impl Digest {
    pub fn all_clear(&self) -> bool {
        self.total_alerts == 0
    }
}

/// Total order over alerts: priority asc, business impact desc, then
/// (property, date desc, dimension, dimension value) with detector and
/// metric as final tie-breaks so the order never depends on arrival order.
pub fn compare_alerts(a: &Alert, b: &Alert) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(b.business_impact.cmp(&a.business_impact))
        .then(a.property_id.cmp(&b.property_id))
        .then(b.date.cmp(&a.date))
        .then(a.dimension.cmp(&b.dimension))
        .then(a.dimension_value.cmp(&b.dimension_value))
        .then(a.detector.cmp(&b.detector))
        .then(a.metric.cmp(&b.metric))
}

type SeriesKey = (String, NaiveDate, crate::dataset::Dimension, String, Metric);

fn series_key(alert: &Alert) -> SeriesKey {
    (
        alert.property_id.clone(),
        alert.date,
        alert.dimension,
        alert.dimension_value.clone(),
        alert.metric,
    )
}

/// Merge the four detector streams for every analysed property into the
/// day's digest.
pub fn consolidate(
    generated_at: DateTime<Utc>,
    reference_date: NaiveDate,
    analyzed: &[PropertyConfig],
    alerts: Vec<Alert>,
    mut issues: Vec<RunIssue>,
) -> Digest {
    // Record(low) supersedes Trend(down) on the same series.
    let record_lows: BTreeSet<SeriesKey> = alerts
        .iter()
        .filter(|a| a.record_type() == Some(RecordType::Low))
        .map(series_key)
        .collect();
    let before_dedup = alerts.len();
    let alerts: Vec<Alert> = alerts
        .into_iter()
        .filter(|a| {
            !(a.trend_direction() == Some(TrendDirection::Down)
                && record_lows.contains(&series_key(a)))
        })
        .collect();
    let deduped_count = before_dedup - alerts.len();

    // Per-property volume cap: all P0/P1, then highest-impact P2/P3.
    let mut by_property: BTreeMap<String, Vec<Alert>> = BTreeMap::new();
    for alert in alerts {
        by_property
            .entry(alert.property_id.clone())
            .or_default()
            .push(alert);
    }

    let mut kept: Vec<Alert> = Vec::new();
    let mut suppressed_by_property: BTreeMap<String, usize> = BTreeMap::new();
    for (property_id, mut candidates) in by_property {
        candidates.sort_by(compare_alerts);
        let (protected, mut rest): (Vec<Alert>, Vec<Alert>) = candidates
            .into_iter()
            .partition(|a| a.priority.is_protected());

        let slots = MAX_ALERTS_PER_PROPERTY.saturating_sub(protected.len());
        rest.sort_by(|a, b| {
            b.business_impact
                .cmp(&a.business_impact)
                .then_with(|| compare_alerts(a, b))
        });
        let suppressed = rest.len().saturating_sub(slots);
        rest.truncate(slots);

        if suppressed > 0 {
            suppressed_by_property.insert(property_id, suppressed);
        }
        kept.extend(protected);
        kept.extend(rest);
    }

    kept.sort_by(compare_alerts);

    let mut counts = DetectorCounts::default();
    let mut per_property_counts: BTreeMap<&str, DetectorCounts> = BTreeMap::new();
    for alert in &kept {
        counts.bump(alert.detector);
        per_property_counts
            .entry(alert.property_id.as_str())
            .or_default()
            .bump(alert.detector);
    }

    let mut rollups: Vec<PropertyRollup> = analyzed
        .iter()
        .map(|property| {
            let property_counts = per_property_counts
                .get(property.property_id.as_str())
                .copied()
                .unwrap_or_default();
            PropertyRollup {
                property_id: property.property_id.clone(),
                client_name: property.client_name.clone(),
                suppressed_count: suppressed_by_property
                    .get(&property.property_id)
                    .copied()
                    .unwrap_or(0),
                all_clear: property_counts.total() == 0,
                counts: property_counts,
            }
        })
        .collect();
    rollups.sort_by(|a, b| a.property_id.cmp(&b.property_id));

    let all_clear_properties: Vec<String> = rollups
        .iter()
        .filter(|r| r.all_clear)
        .map(|r| r.property_id.clone())
        .collect();

    let portfolio_patterns = detect_portfolio_patterns(&kept, analyzed.len());

    issues.sort_by(|a, b| {
        a.property_id
            .cmp(&b.property_id)
            .then(a.reason.cmp(&b.reason))
            .then(a.detector.cmp(&b.detector))
            .then(a.detail.cmp(&b.detail))
    });

    Digest {
        generated_at,
        reference_date,
        properties_analyzed: analyzed.len(),
        counts,
        total_alerts: kept.len(),
        alerts: kept,
        rollups,
        all_clear_properties,
        suppressed_total: suppressed_by_property.values().sum(),
        deduped_count,
        portfolio_patterns,
        issues,
    }
}

fn detect_portfolio_patterns(alerts: &[Alert], total_properties: usize) -> Vec<PortfolioPattern> {
    if total_properties == 0 {
        return vec![];
    }

    let mut groups: BTreeMap<(NaiveDate, DetectorKind, Metric), BTreeSet<&str>> = BTreeMap::new();
    for alert in alerts {
        groups
            .entry((alert.date, alert.detector, alert.metric))
            .or_default()
            .insert(alert.property_id.as_str());
    }

    let mut patterns: Vec<PortfolioPattern> = groups
        .into_iter()
        .filter_map(|((date, detector, metric), properties)| {
            let affected = properties.len();
            let ratio = affected as f64 / total_properties as f64;
            if affected < 2 || ratio < PATTERN_RATIO_THRESHOLD {
                return None;
            }
            let confidence = if ratio >= 0.7 {
                PatternConfidence::High
            } else if ratio >= 0.5 {
                PatternConfidence::Medium
            } else {
                PatternConfidence::Low
            };
            Some(PortfolioPattern {
                date,
                detector,
                metric,
                affected_properties: affected,
                total_properties,
                affected_ratio: ratio,
                confidence,
                property_ids: properties.into_iter().map(str::to_string).collect(),
            })
        })
        .collect();

    patterns.sort_by(|a, b| {
        b.affected_properties
            .cmp(&a.affected_properties)
            .then(a.date.cmp(&b.date))
            .then(a.detector.cmp(&b.detector))
            .then(a.metric.cmp(&b.metric))
    });
    patterns
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::alert::{
        AlertDetails, DetectionMethod, DisasterTrigger, Priority, Severity,
    };
    use crate::dataset::Dimension;

    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
    }

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 6, 6, 0, 0).unwrap()
    }

    fn property(id: &str) -> PropertyConfig {
        PropertyConfig {
            property_id: id.to_string(),
            dataset_id: format!("analytics_{id}"),
            client_name: format!("Client {id}"),
            domain: format!("{id}.example.com"),
            conversion_events: "purchase".to_string(),
            notes: None,
            is_configured: true,
            disabled_dimensions: vec![],
            min_sessions_override: None,
        }
    }

    fn alert(
        property_id: &str,
        detector: DetectorKind,
        priority: Priority,
        impact: u8,
        dimension_value: &str,
    ) -> Alert {
        let details = match detector {
            DetectorKind::Disaster => AlertDetails::Disaster {
                trigger: DisasterTrigger::NearZeroTraffic,
            },
            DetectorKind::Spam => AlertDetails::Spam {
                z_score: 4.0,
                bounce_rate: 0.9,
                avg_session_duration: 5.0,
            },
            DetectorKind::Record => AlertDetails::Record {
                record_type: RecordType::Low,
                previous_record: 100.0,
                increase_pct: None,
                decline_pct: Some(10.0),
            },
            DetectorKind::Trend => AlertDetails::Trend {
                direction: TrendDirection::Down,
                recent_avg: 80.0,
                baseline_avg: 100.0,
                change_pct: -20.0,
            },
        };
        Alert {
            detector,
            priority,
            property_id: property_id.to_string(),
            date: day(3),
            dimension: Dimension::Overall,
            dimension_value: dimension_value.to_string(),
            metric: Metric::Sessions,
            observed_value: 1.0,
            baseline_value: 2.0,
            delta: -0.5,
            severity: Severity::Warning,
            business_impact: impact,
            detection_methods: BTreeSet::from([DetectionMethod::Threshold]),
            message: "test alert".to_string(),
            details,
            generated_at: stamp(),
        }
    }

    #[test]
    fn cap_keeps_protected_alerts_and_fills_with_top_impact() {
        let mut alerts = Vec::new();
        for i in 0..3 {
            alerts.push(alert("p1", DetectorKind::Disaster, Priority::P0, 100, &format!("d{i}")));
        }
        for i in 0..5 {
            alerts.push(alert("p1", DetectorKind::Spam, Priority::P1, 80, &format!("s{i}")));
        }
        for i in 0..10u8 {
            alerts.push(alert("p1", DetectorKind::Trend, Priority::P2, 50 + i, &format!("t{i}")));
        }
        for i in 0..20u8 {
            alerts.push(alert("p1", DetectorKind::Record, Priority::P3, 30 + i, &format!("r{i}")));
        }

        let digest = consolidate(stamp(), day(6), &[property("p1")], alerts, vec![]);

        assert_eq!(digest.total_alerts, MAX_ALERTS_PER_PROPERTY);
        assert_eq!(digest.counts.disaster, 3);
        assert_eq!(digest.counts.spam, 5);
        // 4 remaining slots go to the highest business impact in P2 ∪ P3.
        let filler_impacts: Vec<u8> = digest
            .alerts
            .iter()
            .filter(|a| !a.priority.is_protected())
            .map(|a| a.business_impact)
            .collect();
        assert_eq!(filler_impacts, vec![59, 58, 57, 56]);
        assert_eq!(digest.suppressed_total, 26);
        assert_eq!(digest.rollups[0].suppressed_count, 26);
    }

    #[test]
    fn record_low_supersedes_trend_down_on_same_series() {
        let record_low = alert("p1", DetectorKind::Record, Priority::P1, 60, "");
        let trend_down = alert("p1", DetectorKind::Trend, Priority::P2, 20, "");
        let mut trend_up = alert("p1", DetectorKind::Trend, Priority::P3, 20, "");
        trend_up.details = AlertDetails::Trend {
            direction: TrendDirection::Up,
            recent_avg: 120.0,
            baseline_avg: 100.0,
            change_pct: 20.0,
        };

        let digest = consolidate(
            stamp(),
            day(6),
            &[property("p1")],
            vec![trend_down, record_low, trend_up],
            vec![],
        );

        assert_eq!(digest.deduped_count, 1);
        assert_eq!(digest.counts.record, 1);
        assert_eq!(digest.counts.trend, 1);
        assert_eq!(
            digest.alerts[1].trend_direction(),
            Some(TrendDirection::Up)
        );
    }

    #[test]
    fn ordering_is_a_total_order() {
        let mut alerts = vec![
            alert("p2", DetectorKind::Trend, Priority::P2, 40, ""),
            alert("p1", DetectorKind::Spam, Priority::P1, 70, "RU"),
            alert("p1", DetectorKind::Disaster, Priority::P0, 100, ""),
            alert("p1", DetectorKind::Spam, Priority::P1, 90, "UA"),
            alert("p3", DetectorKind::Record, Priority::P3, 75, "mobile"),
        ];
        // Arrival order must not matter.
        alerts.reverse();

        let properties = [property("p1"), property("p2"), property("p3")];
        let digest = consolidate(stamp(), day(6), &properties, alerts, vec![]);

        let order: Vec<(&str, Priority, u8)> = digest
            .alerts
            .iter()
            .map(|a| (a.property_id.as_str(), a.priority, a.business_impact))
            .collect();
        assert_eq!(
            order,
            vec![
                ("p1", Priority::P0, 100),
                ("p1", Priority::P1, 90),
                ("p1", Priority::P1, 70),
                ("p2", Priority::P2, 40),
                ("p3", Priority::P3, 75),
            ]
        );
    }

    #[test]
    fn all_clear_properties_are_rolled_up() {
        let properties = [property("p1"), property("p2")];
        let digest = consolidate(
            stamp(),
            day(6),
            &properties,
            vec![alert("p1", DetectorKind::Spam, Priority::P1, 50, "RU")],
            vec![],
        );

        assert_eq!(digest.all_clear_properties, vec!["p2".to_string()]);
        assert!(!digest.all_clear());

        let empty = consolidate(stamp(), day(6), &properties, vec![], vec![]);
        assert!(empty.all_clear());
        assert_eq!(empty.all_clear_properties.len(), 2);
    }

    #[test]
    fn portfolio_pattern_requires_thirty_percent_of_properties() {
        let properties: Vec<PropertyConfig> =
            (1..=10).map(|i| property(&format!("p{i:02}"))).collect();

        // Same (date, detector, metric) anomaly on four of ten properties.
        let alerts: Vec<Alert> = (1..=4)
            .map(|i| alert(&format!("p{i:02}"), DetectorKind::Spam, Priority::P1, 60, "RU"))
            .collect();
        let digest = consolidate(stamp(), day(6), &properties, alerts, vec![]);

        assert_eq!(digest.portfolio_patterns.len(), 1);
        let pattern = &digest.portfolio_patterns[0];
        assert_eq!(pattern.affected_properties, 4);
        assert_eq!(pattern.confidence, PatternConfidence::Low);
        assert_eq!(pattern.property_ids.len(), 4);

        // Two of ten is below the threshold.
        let few: Vec<Alert> = (1..=2)
            .map(|i| alert(&format!("p{i:02}"), DetectorKind::Spam, Priority::P1, 60, "RU"))
            .collect();
        let digest = consolidate(stamp(), day(6), &properties, few, vec![]);
        assert!(digest.portfolio_patterns.is_empty());
    }

    #[test]
    fn issues_are_sorted_deterministically() {
        let issues = vec![
            RunIssue {
                property_id: "p2".to_string(),
                reason: IssueReason::LoadFailed,
                detector: None,
                detail: "blob missing".to_string(),
            },
            RunIssue {
                property_id: "p1".to_string(),
                reason: IssueReason::DetectorFailed,
                detector: Some(DetectorKind::Trend),
                detail: "panicked".to_string(),
            },
        ];
        let digest = consolidate(stamp(), day(6), &[property("p1")], vec![], issues);
        assert_eq!(digest.issues[0].property_id, "p1");
        assert_eq!(digest.issues[1].property_id, "p2");
    }
}
