use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use nightwatch_core::alert::DetectorKind;
use nightwatch_core::clock::SystemClock;
use nightwatch_core::config::RunConfig;
use nightwatch_core::dataset::Dimension;
use nightwatch_core::digest::Digest;
use nightwatch_store::loader;
use nightwatch_store::FsBlobStore;

use nightwatch_cli::{delivery, orchestrator, render};
use orchestrator::{PipelineError, RunOptions};

const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "nightwatch",
    about = "Daily anomaly detection and alerting across a web-analytics portfolio",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full detection pipeline for one reference date
    Run {
        /// Reference date (YYYY-MM-DD); defaults to today UTC, or
        /// REFERENCE_DATE_OVERRIDE when set
        #[arg(long)]
        reference_date: Option<NaiveDate>,

        /// Comma-separated property ids (default: every enabled property)
        #[arg(long, value_delimiter = ',')]
        properties: Vec<String>,

        /// Comma-separated detectors: disaster, spam, record, trend
        #[arg(long, value_delimiter = ',')]
        detectors: Vec<String>,

        /// Detect and consolidate, but write no artifacts and deliver nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Render a persisted digest.json to HTML (and a .txt sibling)
    Render {
        #[arg(long)]
        from: PathBuf,

        #[arg(long)]
        out: PathBuf,
    },

    /// Parse and validate a clean dataset file
    Verify {
        #[arg(long)]
        dataset: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            reference_date,
            properties,
            detectors,
            dry_run,
        } => run_command(reference_date, properties, detectors, dry_run).await,
        Command::Render { from, out } => render_command(&from, &out),
        Command::Verify { dataset } => verify_command(&dataset),
    }
}

async fn run_command(
    reference_date: Option<NaiveDate>,
    properties: Vec<String>,
    detector_names: Vec<String>,
    dry_run: bool,
) -> ExitCode {
    let config = match RunConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid environment configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut detectors = Vec::with_capacity(detector_names.len());
    for name in &detector_names {
        match DetectorKind::parse(name) {
            Some(kind) => detectors.push(kind),
            None => {
                error!(detector = %name, "unknown detector (expected disaster, spam, record or trend)");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    let options = RunOptions {
        reference_date,
        properties,
        detectors,
        dry_run,
    };
    let store = Arc::new(FsBlobStore::new(&config.data_dir));
    let delivery = delivery::EnvDelivery;

    // Ctrl-c flips the shutdown flag; in-flight work stops at the next
    // suspension point and the run exits with the cancellation code.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    match orchestrator::run_pipeline(
        &options,
        &config,
        &SystemClock,
        store,
        &delivery,
        shutdown_rx,
    )
    .await
    {
        Ok(summary) => ExitCode::from(summary.outcome.exit_code()),
        Err(PipelineError::Config(message)) => {
            error!(%message, "run aborted");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn render_command(from: &Path, out: &Path) -> ExitCode {
    let bytes = match std::fs::read(from) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %from.display(), error = %e, "could not read digest");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let digest: Digest = match serde_json::from_slice(&bytes) {
        Ok(digest) => digest,
        Err(e) => {
            error!(path = %from.display(), error = %e, "not a valid digest");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = std::fs::write(out, render::render_html(&digest)) {
        error!(path = %out.display(), error = %e, "could not write rendered digest");
        return ExitCode::from(EXIT_CONFIG);
    }
    println!("wrote {}", out.display());

    if out.extension().is_some_and(|ext| ext == "html") {
        let text_path = out.with_extension("txt");
        if let Err(e) = std::fs::write(&text_path, render::render_text(&digest)) {
            error!(path = %text_path.display(), error = %e, "could not write text digest");
            return ExitCode::from(EXIT_CONFIG);
        }
        println!("wrote {}", text_path.display());
    }
    ExitCode::SUCCESS
}

fn verify_command(dataset: &Path) -> ExitCode {
    let settling_days = std::env::var("SETTLING_DAYS")
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(nightwatch_core::config::DEFAULT_SETTLING_DAYS);

    let bytes = match std::fs::read(dataset) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %dataset.display(), error = %e, "could not read dataset");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let parsed = match loader::parse_dataset(&bytes, settling_days) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(path = %dataset.display(), error = %e, "dataset is invalid");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    println!("property_id:    {}", parsed.property_id);
    println!("reference_date: {}", parsed.reference_date);
    println!("analysis_date:  {}", parsed.analysis_date);
    if let Some((first, last)) = parsed.overall_span() {
        println!("overall span:   {first} .. {last}");
    }
    println!("total points:   {}", parsed.point_count());
    for dimension in Dimension::ALL {
        let segments = parsed.segment_values(dimension);
        if !segments.is_empty() {
            println!("{dimension}: {} segment(s)", segments.len());
        }
    }
    println!("dataset is valid");
    ExitCode::SUCCESS
}
