//! Statistical kernel shared by every detector.
//!
//! Pure and deterministic: every function takes dated points plus a window
//! specification and returns `None` when the sample is too small or the
//! statistic is undefined (zero spread). Gaps are skipped, never imputed;
//! detectors treat `None` as "no signal".

use chrono::NaiveDate;

use crate::dataset::DataPoint;

/// Minimum valid points for rolling-window statistics.
pub const MIN_ROLLING_POINTS: usize = 7;

/// Minimum valid points for quartile and extremum tests over long horizons.
pub const MIN_DISTRIBUTION_POINTS: usize = 30;

/// Spread below this is treated as zero.
const SIGMA_FLOOR: f64 = 1e-10;

/// A trailing window of `days` calendar days ending at `end` (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub end: NaiveDate,
    pub days: i64,
}

impl Window {
    pub fn trailing(end: NaiveDate, days: i64) -> Self {
        Self { end, days }
    }

    pub fn start(&self) -> NaiveDate {
        self.end - chrono::Duration::days(self.days - 1)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start() && date <= self.end
    }
}

/// Values of the points that fall inside the window, in date order.
pub fn window_values(points: &[DataPoint], window: Window) -> Vec<f64> {
    points
        .iter()
        .filter(|p| window.contains(p.date))
        .map(|p| p.value)
        .collect()
}

/// The value observed on one specific day, if present.
pub fn value_on(points: &[DataPoint], date: NaiveDate) -> Option<f64> {
    points
        .iter()
        .find(|p| p.date == date)
        .map(|p| p.value)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn stddev(values: &[f64]) -> Option<f64> {
    let mean_value = mean(values)?;
    let variance = values
        .iter()
        .map(|v| {
            let diff = v - mean_value;
            diff * diff
        })
        .sum::<f64>()
        / values.len() as f64;
    Some(variance.sqrt())
}

/// `(x - mean) / stddev`; undefined when the spread is (near) zero.
pub fn z_score(x: f64, mean_value: f64, stddev_value: f64) -> Option<f64> {
    if stddev_value <= SIGMA_FLOOR {
        return None;
    }
    Some((x - mean_value) / stddev_value)
}

/// First and third quartile via linear interpolation on sorted values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quartiles {
    pub q1: f64,
    pub q3: f64,
}

pub fn quartiles(values: &[f64]) -> Option<Quartiles> {
    quartiles_with_min(values, MIN_DISTRIBUTION_POINTS)
}

pub fn quartiles_with_min(values: &[f64], min_n: usize) -> Option<Quartiles> {
    if values.len() < min_n.max(2) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
    Some(Quartiles {
        q1: interpolated_quantile(&sorted, 0.25),
        q3: interpolated_quantile(&sorted, 0.75),
    })
}

pub fn iqr(values: &[f64]) -> Option<f64> {
    quartiles(values).map(|q| q.q3 - q.q1)
}

fn interpolated_quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Mean over a trailing window, guarded by [`MIN_ROLLING_POINTS`].
pub fn rolling_mean(points: &[DataPoint], window: Window) -> Option<f64> {
    rolling_mean_with_min(points, window, MIN_ROLLING_POINTS)
}

pub fn rolling_mean_with_min(points: &[DataPoint], window: Window, min_n: usize) -> Option<f64> {
    let values = window_values(points, window);
    if values.len() < min_n {
        return None;
    }
    mean(&values)
}

/// Window max/min with the dates they occurred on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrema {
    pub max: DataPoint,
    pub min: DataPoint,
    pub sample_size: usize,
}

/// Historical extremum over a window, guarded by
/// [`MIN_DISTRIBUTION_POINTS`].
pub fn extrema(points: &[DataPoint], window: Window) -> Option<Extrema> {
    extrema_with_min(points, window, MIN_DISTRIBUTION_POINTS)
}

pub fn extrema_with_min(points: &[DataPoint], window: Window, min_n: usize) -> Option<Extrema> {
    let in_window: Vec<&DataPoint> = points
        .iter()
        .filter(|p| window.contains(p.date))
        .collect();
    if in_window.len() < min_n.max(1) {
        return None;
    }
    let mut max = *in_window[0];
    let mut min = *in_window[0];
    for point in &in_window[1..] {
        if point.value > max.value {
            max = **point;
        }
        if point.value < min.value {
            min = **point;
        }
    }
    Some(Extrema {
        max,
        min,
        sample_size: in_window.len(),
    })
}
