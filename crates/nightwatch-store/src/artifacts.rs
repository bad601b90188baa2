//! Per-run artifact persistence.
//!
//! Every artifact write is retried with exponential backoff before the run
//! gives up; the store's atomic put keeps rerun overwrites safe.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use nightwatch_core::alert::{Alert, DetectorKind};

use crate::{BlobStore, StoreError};

/// Backoff schedule between write attempts.
pub const WRITE_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(4)];

/// Final wait before the last attempt.
pub const FINAL_BACKOFF: Duration = Duration::from_secs(16);

/// One detector's alert stream for one run, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorReport {
    pub detector: DetectorKind,
    pub generated_at: DateTime<Utc>,
    pub reference_date: NaiveDate,
    pub properties_analyzed: usize,
    pub total_alerts: usize,
    pub alerts: Vec<Alert>,
}

impl DetectorReport {
    pub fn new(
        detector: DetectorKind,
        generated_at: DateTime<Utc>,
        reference_date: NaiveDate,
        properties_analyzed: usize,
        alerts: Vec<Alert>,
    ) -> Self {
        Self {
            detector,
            generated_at,
            reference_date,
            properties_analyzed,
            total_alerts: alerts.len(),
            alerts,
        }
    }
}

/// Results namespace for one reference date.
pub fn results_key(reference_date: NaiveDate, name: &str) -> String {
    format!("results/{reference_date}/{name}")
}

/// Serialise and write a JSON artifact with the default retry schedule.
pub async fn persist_json<T: Serialize>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
        key: key.to_string(),
        source,
    })?;
    persist_bytes_with_backoff(store, key, &bytes, &default_backoff()).await
}

/// Write a rendered (non-JSON) artifact with the default retry schedule.
pub async fn persist_text(
    store: &dyn BlobStore,
    key: &str,
    text: &str,
) -> Result<(), StoreError> {
    persist_bytes_with_backoff(store, key, text.as_bytes(), &default_backoff()).await
}

fn default_backoff() -> Vec<Duration> {
    let mut schedule = WRITE_BACKOFF.to_vec();
    schedule.push(FINAL_BACKOFF);
    schedule
}

/// Write with explicit backoff: `backoff.len()` retries after the first
/// attempt, sleeping `backoff[i]` before retry `i`.
pub async fn persist_bytes_with_backoff(
    store: &dyn BlobStore,
    key: &str,
    bytes: &[u8],
    backoff: &[Duration],
) -> Result<(), StoreError> {
    let mut last_err = match store.put(key, bytes).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    for (attempt, delay) in backoff.iter().enumerate() {
        warn!(
            key,
            attempt = attempt + 1,
            error = %last_err,
            "artifact write failed, retrying"
        );
        tokio::time::sleep(*delay).await;
        match store.put(key, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}
