use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::{Dimension, Metric};

/// Which detector produced an alert. Exactly one per alert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Disaster,
    Spam,
    Record,
    Trend,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 4] = [
        DetectorKind::Disaster,
        DetectorKind::Spam,
        DetectorKind::Record,
        DetectorKind::Trend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Disaster => "disaster",
            DetectorKind::Spam => "spam",
            DetectorKind::Record => "record",
            DetectorKind::Trend => "trend",
        }
    }

    /// Blob name of this detector's per-run alert artifact.
    pub fn artifact_name(&self) -> String {
        format!("{}_alerts.json", self.as_str())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "disaster" => Some(DetectorKind::Disaster),
            "spam" => Some(DetectorKind::Spam),
            "record" => Some(DetectorKind::Record),
            "trend" => Some(DetectorKind::Trend),
            _ => None,
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity tier; P0 sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }

    /// P0/P1 are never suppressed by the per-property volume cap.
    pub fn is_protected(&self) -> bool {
        matches!(self, Priority::P0 | Priority::P1)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// Named tests that contributed to an alert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Threshold,
    ZScore,
    BounceRate,
    SessionDuration,
    MaCrossover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisasterTrigger {
    NearZeroTraffic,
    TrackingFailure,
    CatastrophicDrop,
}

impl DisasterTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisasterTrigger::NearZeroTraffic => "near_zero_traffic",
            DisasterTrigger::TrackingFailure => "tracking_failure",
            DisasterTrigger::CatastrophicDrop => "catastrophic_drop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
}

/// Detector-specific payload. Everything the digest treats uniformly lives
/// on [`Alert`] itself; these are the extras operators drill into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertDetails {
    Disaster {
        trigger: DisasterTrigger,
    },
    Spam {
        z_score: f64,
        bounce_rate: f64,
        avg_session_duration: f64,
    },
    Record {
        record_type: RecordType,
        previous_record: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        increase_pct: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decline_pct: Option<f64>,
    },
    Trend {
        direction: TrendDirection,
        recent_avg: f64,
        baseline_avg: f64,
        change_pct: f64,
    },
}

/// One detected anomaly. A value object: immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub detector: DetectorKind,
    pub priority: Priority,
    pub property_id: String,
    /// The day the condition triggered (always the analysis date).
    pub date: NaiveDate,
    pub dimension: Dimension,
    /// "" for the overall dimension.
    pub dimension_value: String,
    pub metric: Metric,
    pub observed_value: f64,
    pub baseline_value: f64,
    /// Signed relative change, z-score or percentage, detector-specific;
    /// the `details` payload says which.
    pub delta: f64,
    pub severity: Severity,
    /// 0–100, deterministic from the inputs; ranks alerts within a priority.
    pub business_impact: u8,
    pub detection_methods: BTreeSet<DetectionMethod>,
    pub message: String,
    pub details: AlertDetails,
    pub generated_at: DateTime<Utc>,
}

impl Alert {
    pub fn record_type(&self) -> Option<RecordType> {
        match &self.details {
            AlertDetails::Record { record_type, .. } => Some(*record_type),
            _ => None,
        }
    }

    pub fn trend_direction(&self) -> Option<TrendDirection> {
        match &self.details {
            AlertDetails::Trend { direction, .. } => Some(*direction),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_p0_first() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P3);
        assert!(Priority::P0.is_protected());
        assert!(Priority::P1.is_protected());
        assert!(!Priority::P2.is_protected());
    }

    #[test]
    fn wire_names_are_stable() {
        assert_eq!(
            serde_json::to_string(&Priority::P0).expect("json"),
            "\"P0\""
        );
        assert_eq!(
            serde_json::to_string(&DetectionMethod::MaCrossover).expect("json"),
            "\"ma_crossover\""
        );
        assert_eq!(DetectorKind::Trend.artifact_name(), "trend_alerts.json");
        assert_eq!(DetectorKind::parse("spam"), Some(DetectorKind::Spam));
        assert_eq!(DetectorKind::parse("nope"), None);
    }
}
