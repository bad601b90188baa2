use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Breakdown axis of a metric series.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Overall,
    Geography,
    Device,
    TrafficSource,
    LandingPage,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Overall,
        Dimension::Geography,
        Dimension::Device,
        Dimension::TrafficSource,
        Dimension::LandingPage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Overall => "overall",
            Dimension::Geography => "geography",
            Dimension::Device => "device",
            Dimension::TrafficSource => "traffic_source",
            Dimension::LandingPage => "landing_page",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily metrics present in the clean dataset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Sessions,
    Users,
    PageViews,
    Conversions,
    BounceRate,
    AvgSessionDuration,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Sessions => "sessions",
            Metric::Users => "users",
            Metric::PageViews => "page_views",
            Metric::Conversions => "conversions",
            Metric::BounceRate => "bounce_rate",
            Metric::AvgSessionDuration => "avg_session_duration",
        }
    }

    /// Count metrics must be non-negative integers on the wire.
    pub fn is_count(&self) -> bool {
        matches!(
            self,
            Metric::Sessions | Metric::Users | Metric::PageViews | Metric::Conversions
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One day of one metric. A missing day is a gap, never a zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub date: NaiveDate,
    pub value: f64,
}

impl DataPoint {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

/// A concrete slice within a dimension ("" for overall).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    pub dimension: Dimension,
    pub value: String,
}

impl SegmentKey {
    pub fn overall() -> Self {
        Self {
            dimension: Dimension::Overall,
            value: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SegmentSeries {
    metrics: BTreeMap<Metric, Vec<DataPoint>>,
}

/// Per-property input to the detectors: ordered, gap-allowed daily series
/// grouped by (dimension, dimension value). Immutable once finalised.
#[derive(Debug, Clone)]
pub struct CleanDataset {
    pub property_id: String,
    /// The run's reference date (the blob key).
    pub reference_date: NaiveDate,
    /// Latest settled day; every series ends on or before this date and
    /// detectors anchor their windows here.
    pub analysis_date: NaiveDate,
    segments: BTreeMap<SegmentKey, SegmentSeries>,
}

impl CleanDataset {
    pub fn new(property_id: impl Into<String>, reference_date: NaiveDate, analysis_date: NaiveDate) -> Self {
        Self {
            property_id: property_id.into(),
            reference_date,
            analysis_date,
            segments: BTreeMap::new(),
        }
    }

    /// Append one point. Ordering and uniqueness are checked in
    /// [`CleanDataset::finalize`].
    pub fn push_point(&mut self, dimension: Dimension, value: &str, metric: Metric, point: DataPoint) {
        self.segments
            .entry(SegmentKey {
                dimension,
                value: value.to_string(),
            })
            .or_default()
            .metrics
            .entry(metric)
            .or_default()
            .push(point);
    }

    /// Sort every series, validate values and drop points newer than the
    /// analysis date (those days are not settled yet).
    pub fn finalize(mut self) -> Result<Self, CoreError> {
        let analysis_date = self.analysis_date;
        for (key, segment) in self.segments.iter_mut() {
            for (metric, points) in segment.metrics.iter_mut() {
                points.retain(|p| p.date <= analysis_date);
                points.sort_by_key(|p| p.date);
                for pair in points.windows(2) {
                    if pair[0].date == pair[1].date {
                        return Err(CoreError::DuplicateDate {
                            metric: *metric,
                            dimension: key.dimension,
                            dimension_value: key.value.clone(),
                            date: pair[0].date,
                        });
                    }
                }
                for point in points.iter() {
                    if !point.value.is_finite() {
                        return Err(CoreError::NonFiniteValue {
                            metric: *metric,
                            dimension: key.dimension,
                            dimension_value: key.value.clone(),
                            date: point.date,
                        });
                    }
                    if point.value < 0.0 {
                        return Err(CoreError::NegativeValue {
                            metric: *metric,
                            dimension: key.dimension,
                            dimension_value: key.value.clone(),
                            date: point.date,
                            value: point.value,
                        });
                    }
                    if *metric == Metric::BounceRate && point.value > 1.0 {
                        return Err(CoreError::RateOutOfRange {
                            dimension: key.dimension,
                            dimension_value: key.value.clone(),
                            date: point.date,
                            value: point.value,
                        });
                    }
                }
            }
        }
        self.segments.retain(|_, segment| {
            segment.metrics.retain(|_, points| !points.is_empty());
            !segment.metrics.is_empty()
        });
        Ok(self)
    }

    /// Ordered series for one (dimension, value, metric); `None` when the
    /// segment or metric is absent.
    pub fn series(&self, dimension: Dimension, value: &str, metric: Metric) -> Option<&[DataPoint]> {
        self.segments
            .get(&SegmentKey {
                dimension,
                value: value.to_string(),
            })
            .and_then(|segment| segment.metrics.get(&metric))
            .map(Vec::as_slice)
    }

    pub fn overall(&self, metric: Metric) -> Option<&[DataPoint]> {
        self.series(Dimension::Overall, "", metric)
    }

    /// Distinct segment values present for a dimension, in key order.
    pub fn segment_values(&self, dimension: Dimension) -> Vec<&str> {
        self.segments
            .keys()
            .filter(|key| key.dimension == dimension)
            .map(|key| key.value.as_str())
            .collect()
    }

    /// Total number of points across all series.
    pub fn point_count(&self) -> usize {
        self.segments
            .values()
            .flat_map(|segment| segment.metrics.values())
            .map(Vec::len)
            .sum()
    }

    /// Date coverage of the overall sessions series, if any.
    pub fn overall_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let sessions = self.overall(Metric::Sessions)?;
        Some((sessions.first()?.date, sessions.last()?.date))
    }
}
