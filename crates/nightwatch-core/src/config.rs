use std::time::Duration;

use chrono::NaiveDate;

use crate::clock::Clock;

/// Default days between an event date and the warehouse export being
/// considered complete.
pub const DEFAULT_SETTLING_DAYS: i64 = 3;

/// Ceiling for the auto-sized worker pool.
pub const MAX_POOL_SIZE: usize = 16;

/// Run-level configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Days subtracted from the reference date to get the analysis date.
    pub settling_days: i64,
    /// Forced reference date (`REFERENCE_DATE_OVERRIDE`); otherwise the
    /// clock's current UTC day.
    pub reference_date_override: Option<NaiveDate>,
    /// Explicit worker pool size; `None` auto-sizes from the property count.
    pub worker_pool_size: Option<usize>,
    /// Whole-run wall-clock budget.
    pub run_timeout: Duration,
    /// Per-property wall-clock budget (load + all four detectors).
    pub property_timeout: Duration,
    /// Blob store root for the filesystem store.
    pub data_dir: String,
    /// Digest recipients, comma-separated in `NIGHTWATCH_RECIPIENTS`.
    pub recipients: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            settling_days: DEFAULT_SETTLING_DAYS,
            reference_date_override: None,
            worker_pool_size: None,
            run_timeout: Duration::from_secs(600),
            property_timeout: Duration::from_secs(60),
            data_dir: "./data".to_string(),
            recipients: vec![],
        }
    }
}

impl RunConfig {
    /// Read configuration from the environment. Unknown variables are
    /// ignored; malformed values of recognised variables are errors.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("SETTLING_DAYS") {
            config.settling_days = raw
                .trim()
                .parse::<i64>()
                .map_err(|e| format!("invalid SETTLING_DAYS: {e}"))?;
            if config.settling_days < 0 {
                return Err("SETTLING_DAYS must be non-negative".to_string());
            }
        }
        if let Ok(raw) = std::env::var("REFERENCE_DATE_OVERRIDE") {
            config.reference_date_override = Some(
                raw.trim()
                    .parse::<NaiveDate>()
                    .map_err(|e| format!("invalid REFERENCE_DATE_OVERRIDE: {e}"))?,
            );
        }
        if let Ok(raw) = std::env::var("WORKER_POOL_SIZE") {
            let size = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid WORKER_POOL_SIZE: {e}"))?;
            if size == 0 {
                return Err("WORKER_POOL_SIZE must be at least 1".to_string());
            }
            config.worker_pool_size = Some(size);
        }
        if let Ok(raw) = std::env::var("RUN_TIMEOUT_SECONDS") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid RUN_TIMEOUT_SECONDS: {e}"))?;
            config.run_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("NIGHTWATCH_PROPERTY_TIMEOUT_SECONDS") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid NIGHTWATCH_PROPERTY_TIMEOUT_SECONDS: {e}"))?;
            config.property_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("NIGHTWATCH_DATA_DIR") {
            if !raw.trim().is_empty() {
                config.data_dir = raw.trim().to_string();
            }
        }
        if let Ok(raw) = std::env::var("NIGHTWATCH_RECIPIENTS") {
            config.recipients = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }

    /// The date this run is "for": the override if present, else the
    /// clock's current UTC day.
    pub fn reference_date(&self, clock: &dyn Clock) -> NaiveDate {
        self.reference_date_override.unwrap_or_else(|| clock.today())
    }

    /// Latest calendar day whose data is fully settled.
    pub fn analysis_date(&self, reference_date: NaiveDate) -> NaiveDate {
        reference_date - chrono::Duration::days(self.settling_days)
    }

    /// Bounded pool size: `min(properties * 4, 16)` unless overridden.
    pub fn pool_size(&self, property_count: usize) -> usize {
        self.worker_pool_size
            .unwrap_or_else(|| (property_count * 4).clamp(1, MAX_POOL_SIZE))
    }
}
