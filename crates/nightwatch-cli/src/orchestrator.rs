//! One full pipeline run: registry → datasets → detectors → consolidation
//! → artifacts → delivery.
//!
//! Detector tasks fan out over a bounded pool; each property's dataset is
//! loaded once and shared read-only by its four detectors. Alerts come
//! back as task return values; the consolidator imposes the only ordering
//! that matters.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use nightwatch_core::alert::{Alert, DetectorKind};
use nightwatch_core::clock::Clock;
use nightwatch_core::config::RunConfig;
use nightwatch_core::digest::{
    consolidate, DetectorCounts, Digest, IssueReason, RunIssue,
};
use nightwatch_core::registry::PropertyConfig;
use nightwatch_detectors::{all_detectors, detectors_for, Detector};
use nightwatch_store::artifacts::{self, DetectorReport};
use nightwatch_store::loader;
use nightwatch_store::BlobStore;

use crate::delivery::DeliveryAdapter;
use crate::render;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub reference_date: Option<NaiveDate>,
    /// Restrict the run to these property ids (all enabled when empty).
    pub properties: Vec<String>,
    /// Restrict the run to these detectors (all four when empty).
    pub detectors: Vec<DetectorKind>,
    /// Detect and consolidate but skip artifacts and delivery.
    pub dry_run: bool,
}

/// Fatal before the pipeline can start; maps to exit code 2.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    DeliveryFailed,
    Cancelled,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::PartialFailure => 3,
            RunOutcome::DeliveryFailed => 4,
            RunOutcome::Cancelled => 5,
        }
    }
}

/// Per-run summary, logged and persisted as `run_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub reference_date: NaiveDate,
    pub analysis_date: NaiveDate,
    pub outcome: RunOutcome,
    pub properties_attempted: usize,
    pub properties_loaded: usize,
    pub properties_failed: usize,
    pub properties_timed_out: usize,
    pub alerts: DetectorCounts,
    pub delivery_provider: Option<String>,
    pub wall_ms: u128,
}

enum PropertyOutcome {
    Loaded {
        property_id: String,
        alerts: Vec<Alert>,
        detector_failures: Vec<(DetectorKind, String)>,
    },
    LoadFailed {
        property_id: String,
        reason: IssueReason,
        detail: String,
    },
    TimedOut {
        property_id: String,
    },
    Cancelled,
}

/// Resolves once the cancel flag flips to true; never resolves otherwise.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: stay pending forever.
            std::future::pending::<()>().await;
        }
    }
}

pub async fn run_pipeline(
    options: &RunOptions,
    config: &RunConfig,
    clock: &dyn Clock,
    store: Arc<dyn BlobStore>,
    delivery: &dyn DeliveryAdapter,
    shutdown: watch::Receiver<bool>,
) -> Result<RunSummary, PipelineError> {
    let started = Instant::now();
    let run_id = Uuid::new_v4().to_string();
    let generated_at = clock.now();
    let reference_date = options
        .reference_date
        .unwrap_or_else(|| config.reference_date(clock));
    let analysis_date = config.analysis_date(reference_date);

    let registry = loader::load_registry(store.as_ref())
        .await
        .map_err(|e| PipelineError::Config(e.to_string()))?;
    for warning in registry.validation_warnings() {
        warn!(%warning, "registry configuration");
    }

    let mut targets: Vec<PropertyConfig> = registry.enabled().cloned().collect();
    if !options.properties.is_empty() {
        for requested in &options.properties {
            if !targets.iter().any(|p| &p.property_id == requested) {
                return Err(PipelineError::Config(format!(
                    "property {requested} is not in the enabled registry"
                )));
            }
        }
        targets.retain(|p| options.properties.contains(&p.property_id));
    }
    if targets.is_empty() {
        return Err(PipelineError::Config(
            "no enabled properties to analyze".to_string(),
        ));
    }

    let detectors: Vec<Arc<dyn Detector>> = if options.detectors.is_empty() {
        all_detectors()
    } else {
        detectors_for(&options.detectors)
    };

    info!(
        run_id = %run_id,
        %reference_date,
        %analysis_date,
        properties = targets.len(),
        detectors = detectors.len(),
        dry_run = options.dry_run,
        "pipeline run starting"
    );

    if *shutdown.borrow() {
        return Ok(RunSummary {
            run_id,
            reference_date,
            analysis_date,
            outcome: RunOutcome::Cancelled,
            properties_attempted: targets.len(),
            properties_loaded: 0,
            properties_failed: 0,
            properties_timed_out: 0,
            alerts: DetectorCounts::default(),
            delivery_provider: None,
            wall_ms: started.elapsed().as_millis(),
        });
    }

    // Internal cancel flag, fed by the external shutdown signal.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    {
        let cancel_tx = cancel_tx.clone();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    let _ = cancel_tx.send(true);
                    return;
                }
                if shutdown.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    let semaphore = Arc::new(Semaphore::new(config.pool_size(targets.len())));
    let settling_days = config.settling_days;
    let property_timeout = config.property_timeout;
    let mut handles = Vec::with_capacity(targets.len());
    for property in targets.clone() {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        let detectors = detectors.clone();
        let cancel = cancel_rx.clone();
        let property_id = property.property_id.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled(cancel) => PropertyOutcome::Cancelled,
                outcome = async {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return PropertyOutcome::Cancelled;
                    };
                    let work = process_property(
                        store.as_ref(),
                        &property,
                        reference_date,
                        settling_days,
                        &detectors,
                        generated_at,
                    );
                    match tokio::time::timeout(property_timeout, work).await {
                        Ok(outcome) => outcome,
                        Err(_) => PropertyOutcome::TimedOut {
                            property_id: property.property_id.clone(),
                        },
                    }
                } => outcome,
            }
        });
        handles.push((property_id, handle));
    }

    let gather = async {
        let mut outcomes = Vec::with_capacity(handles.len());
        for (property_id, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(PropertyOutcome::LoadFailed {
                    property_id,
                    reason: IssueReason::DetectorFailed,
                    detail: format!("property task panicked: {e}"),
                }),
            }
        }
        outcomes
    };
    let outcomes = tokio::select! {
        outcomes = gather => outcomes,
        _ = tokio::time::sleep(config.run_timeout) => {
            let _ = cancel_tx.send(true);
            warn!(run_id = %run_id, "run timeout exceeded; cancelling pending work");
            return Ok(RunSummary {
                run_id,
                reference_date,
                analysis_date,
                outcome: RunOutcome::Cancelled,
                properties_attempted: targets.len(),
                properties_loaded: 0,
                properties_failed: 0,
                properties_timed_out: 0,
                alerts: DetectorCounts::default(),
                delivery_provider: None,
                wall_ms: started.elapsed().as_millis(),
            });
        }
    };

    let mut analyzed: Vec<PropertyConfig> = Vec::new();
    let mut all_alerts: Vec<Alert> = Vec::new();
    let mut issues: Vec<RunIssue> = Vec::new();
    let mut failed = 0usize;
    let mut timed_out = 0usize;
    let mut was_cancelled = false;

    for outcome in outcomes {
        match outcome {
            PropertyOutcome::Loaded {
                property_id,
                alerts,
                detector_failures,
            } => {
                if let Some(property) = targets.iter().find(|p| p.property_id == property_id) {
                    analyzed.push(property.clone());
                }
                all_alerts.extend(alerts);
                for (kind, detail) in detector_failures {
                    warn!(property_id = %property_id, detector = %kind, %detail, "detector failed");
                    issues.push(RunIssue {
                        property_id: property_id.clone(),
                        reason: IssueReason::DetectorFailed,
                        detector: Some(kind),
                        detail,
                    });
                }
            }
            PropertyOutcome::LoadFailed {
                property_id,
                reason,
                detail,
            } => {
                warn!(property_id = %property_id, ?reason, %detail, "property skipped");
                failed += 1;
                issues.push(RunIssue {
                    property_id,
                    reason,
                    detector: None,
                    detail,
                });
            }
            PropertyOutcome::TimedOut { property_id } => {
                warn!(property_id = %property_id, "property timed out");
                timed_out += 1;
                issues.push(RunIssue {
                    property_id,
                    reason: IssueReason::TimedOut,
                    detector: None,
                    detail: format!(
                        "exceeded the {}s property budget",
                        property_timeout.as_secs()
                    ),
                });
            }
            PropertyOutcome::Cancelled => {
                was_cancelled = true;
            }
        }
    }

    if was_cancelled || *cancel_rx.borrow() {
        return Ok(RunSummary {
            run_id,
            reference_date,
            analysis_date,
            outcome: RunOutcome::Cancelled,
            properties_attempted: targets.len(),
            properties_loaded: analyzed.len(),
            properties_failed: failed,
            properties_timed_out: timed_out,
            alerts: DetectorCounts::default(),
            delivery_provider: None,
            wall_ms: started.elapsed().as_millis(),
        });
    }

    // Persist each detector's raw stream, then the consolidated digest.
    let mut persist_failed = false;
    if !options.dry_run {
        for detector in &detectors {
            let kind = detector.kind();
            let mut stream: Vec<Alert> = all_alerts
                .iter()
                .filter(|a| a.detector == kind)
                .cloned()
                .collect();
            stream.sort_by(nightwatch_core::digest::compare_alerts);
            let report = DetectorReport::new(
                kind,
                generated_at,
                reference_date,
                analyzed.len(),
                stream,
            );
            let key = artifacts::results_key(reference_date, &kind.artifact_name());
            if let Err(e) = artifacts::persist_json(store.as_ref(), &key, &report).await {
                warn!(key, error = %e, "failed to persist detector artifact");
                persist_failed = true;
            }
        }
    }

    let digest = consolidate(
        generated_at,
        reference_date,
        &analyzed,
        all_alerts,
        issues,
    );
    let digest_html = render::render_html(&digest);
    let digest_text = render::render_text(&digest);

    if !options.dry_run {
        persist_failed |= persist_digest(store.as_ref(), &digest, &digest_html, &digest_text).await;
    }

    let delivery_provider = if options.dry_run {
        None
    } else {
        match delivery
            .deliver(&digest, &digest_html, &digest_text, &config.recipients)
            .await
        {
            Ok(provider) => Some(provider),
            Err(e) => {
                warn!(error = %e, "digest delivery failed");
                // Exit 4 promises "digest produced and persisted"; when
                // persistence already failed, the run is still a
                // persistence failure and keeps exit 3.
                let outcome = if persist_failed {
                    RunOutcome::PartialFailure
                } else {
                    RunOutcome::DeliveryFailed
                };
                let summary = summarize(
                    run_id,
                    reference_date,
                    analysis_date,
                    outcome,
                    &targets,
                    &analyzed,
                    failed,
                    timed_out,
                    &digest,
                    None,
                    started,
                );
                log_summary(&summary, &digest);
                if let Err(e) = artifacts::persist_json(
                    store.as_ref(),
                    &artifacts::results_key(reference_date, "run_summary.json"),
                    &summary,
                )
                .await
                {
                    warn!(error = %e, "failed to persist run summary");
                }
                return Ok(summary);
            }
        }
    };

    let outcome = if persist_failed || failed > 0 || timed_out > 0 || !digest.issues.is_empty() {
        RunOutcome::PartialFailure
    } else {
        RunOutcome::Success
    };
    let summary = summarize(
        run_id,
        reference_date,
        analysis_date,
        outcome,
        &targets,
        &analyzed,
        failed,
        timed_out,
        &digest,
        delivery_provider,
        started,
    );
    log_summary(&summary, &digest);

    if !options.dry_run {
        if let Err(e) = artifacts::persist_json(
            store.as_ref(),
            &artifacts::results_key(reference_date, "run_summary.json"),
            &summary,
        )
        .await
        {
            warn!(error = %e, "failed to persist run summary");
        }
    }

    Ok(summary)
}

async fn process_property(
    store: &dyn BlobStore,
    property: &PropertyConfig,
    reference_date: NaiveDate,
    settling_days: i64,
    detectors: &[Arc<dyn Detector>],
    generated_at: DateTime<Utc>,
) -> PropertyOutcome {
    let property_id = property.property_id.clone();
    let dataset = match loader::load_dataset(store, &property_id, reference_date, settling_days)
        .await
    {
        Ok(dataset) => {
            // One load serves all four detectors; note when the history is
            // shorter than the longest window so a quiet trend detector is
            // explainable from the logs.
            let horizon_start = dataset.analysis_date
                - chrono::Duration::days(nightwatch_detectors::LONGEST_WINDOW_DAYS - 1);
            if dataset
                .overall_span()
                .is_none_or(|(first, _)| first > horizon_start)
            {
                tracing::debug!(
                    property_id = %property_id,
                    "history does not cover the longest detector window"
                );
            }
            Arc::new(dataset)
        }
        Err(e) => {
            let reason = if e.is_insufficient_data() {
                IssueReason::InsufficientData
            } else {
                IssueReason::LoadFailed
            };
            return PropertyOutcome::LoadFailed {
                property_id,
                reason,
                detail: e.to_string(),
            };
        }
    };

    let mut alerts = Vec::new();
    let mut detector_failures = Vec::new();
    for detector in detectors {
        let task_detector = Arc::clone(detector);
        let task_dataset = Arc::clone(&dataset);
        let task_property = property.clone();
        // A panicking detector must not take the other three down with it.
        let result = tokio::spawn(async move {
            task_detector.detect(generated_at, &task_property, &task_dataset)
        })
        .await;
        match result {
            Ok(found) => alerts.extend(found),
            Err(e) => detector_failures.push((detector.kind(), e.to_string())),
        }
    }

    PropertyOutcome::Loaded {
        property_id,
        alerts,
        detector_failures,
    }
}

async fn persist_digest(
    store: &dyn BlobStore,
    digest: &Digest,
    digest_html: &str,
    digest_text: &str,
) -> bool {
    let mut failed = false;
    let date = digest.reference_date;
    if let Err(e) = artifacts::persist_json(
        store,
        &artifacts::results_key(date, "digest.json"),
        digest,
    )
    .await
    {
        warn!(error = %e, "failed to persist digest.json");
        failed = true;
    }
    for (name, contents) in [("digest.html", digest_html), ("digest.txt", digest_text)] {
        if let Err(e) =
            artifacts::persist_text(store, &artifacts::results_key(date, name), contents).await
        {
            warn!(artifact = name, error = %e, "failed to persist rendered digest");
            failed = true;
        }
    }
    failed
}

#[allow(clippy::too_many_arguments)]
fn summarize(
    run_id: String,
    reference_date: NaiveDate,
    analysis_date: NaiveDate,
    outcome: RunOutcome,
    targets: &[PropertyConfig],
    analyzed: &[PropertyConfig],
    failed: usize,
    timed_out: usize,
    digest: &Digest,
    delivery_provider: Option<String>,
    started: Instant,
) -> RunSummary {
    RunSummary {
        run_id,
        reference_date,
        analysis_date,
        outcome,
        properties_attempted: targets.len(),
        properties_loaded: analyzed.len(),
        properties_failed: failed,
        properties_timed_out: timed_out,
        alerts: digest.counts,
        delivery_provider,
        wall_ms: started.elapsed().as_millis(),
    }
}

fn log_summary(summary: &RunSummary, digest: &Digest) {
    info!(
        run_id = %summary.run_id,
        outcome = ?summary.outcome,
        attempted = summary.properties_attempted,
        loaded = summary.properties_loaded,
        failed = summary.properties_failed,
        timed_out = summary.properties_timed_out,
        alerts = digest.total_alerts,
        suppressed = digest.suppressed_total,
        wall_ms = summary.wall_ms as u64,
        "pipeline run finished"
    );
}
