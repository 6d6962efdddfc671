//! Job definition and orchestration: Auth → paginated extract → normalize →
//! (enrich) → output, where output is either a warehouse load (introspect →
//! truncate/ensure → chunked transactions) or a CSV report file.
//!
//! One discipline for every job: all pages are buffered and the frame fully
//! normalized before anything destructive touches the destination. The
//! truncate never runs against a partial extraction.

use chrono::Local;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::enrich::{self, DesktopClient, EnrichError, EnrichSpec, PositionLookup};
use crate::model::{JobReport, LoadMode};
use crate::normalize::{self, NormalizeError, NormalizeSpec};
use crate::report::{self, ReportError};
use crate::retry::RetryPolicy;
use crate::salesforce::{self, QueryPages, RecordSource, SfError};
use crate::warehouse::{Destination, LoadError, Warehouse};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Salesforce(#[from] SfError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Enrich(#[from] EnrichError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Where a job's normalized frame ends up.
#[derive(Debug, Clone)]
pub enum Output {
    /// A warehouse table, written through the [`Destination`] seam.
    Warehouse {
        table: String,
        mode: LoadMode,
        /// `CREATE TABLE IF NOT EXISTS` DDL for upsert destinations whose
        /// schema this tool owns.
        ensure_ddl: Option<String>,
    },
    /// A display-shaped CSV file with human-facing headers.
    Csv { path: PathBuf },
}

impl Output {
    pub fn describe(&self) -> String {
        match self {
            Output::Warehouse { table, mode, .. } => {
                format!("table `{table}` ({})", mode.as_str())
            }
            Output::Csv { path } => format!("csv {}", path.display()),
        }
    }
}

/// One configured extract-transform-load run for a single destination
/// table. Jobs are independent, restartable units with no shared state.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub soql: String,
    pub normalize: NormalizeSpec,
    pub enrich: Option<EnrichSpec>,
    pub output: Output,
}

/// Drive one job over already-constructed collaborators. Kept separate
/// from [`run`] so tests can plug in scripted sources and recording
/// destinations.
pub async fn run_job(
    job: &Job,
    source: &mut dyn RecordSource,
    lookup: Option<&mut dyn PositionLookup>,
    destination: &dyn Destination,
    chunk_size: usize,
) -> Result<JobReport, JobError> {
    info!(job = %job.name, output = %job.output.describe(), "job started");

    // Extract: buffer every page before any destination work.
    let mut records = Vec::new();
    let mut pages = 0usize;
    while let Some(batch) = source.next_page().await? {
        pages += 1;
        records.extend(batch);
    }
    info!(job = %job.name, pages, records = records.len(), "extraction finished");

    if records.is_empty() {
        // Benign: zero upstream rows is not a failure, downstream work is
        // skipped and the destination is left untouched.
        info!(job = %job.name, "no records returned; nothing to load");
        return Ok(JobReport::empty(&job.name));
    }

    // Transform.
    let mut frame = normalize::normalize_batch(&records, &job.normalize)?;
    info!(job = %job.name, rows = frame.len(), columns = frame.columns().len(), "batch normalized");

    // Enrich (optional, strictly sequential).
    let enrich_summary = match (&job.enrich, lookup) {
        (Some(spec), Some(api)) => {
            let now = Local::now().naive_local();
            Some(enrich::enrich_frame(&mut frame, api, spec, now).await)
        }
        (Some(_), None) => {
            warn!(job = %job.name, "job requests enrichment but no lookup client was provided; skipping");
            None
        }
        _ => None,
    };

    let report = match &job.output {
        Output::Csv { path } => {
            let written = report::write_csv(&frame, path)?;
            JobReport {
                job: job.name.clone(),
                records_fetched: records.len(),
                rows_loaded: written,
                chunks_failed: 0,
                enrich: enrich_summary,
            }
        }
        Output::Warehouse {
            table,
            mode,
            ensure_ddl,
        } => {
            // Project to the live destination schema first — upstream
            // schemas evolve independently, extra source columns are
            // dropped silently rather than erroring.
            if let Some(ddl) = ensure_ddl {
                destination.ensure_table(ddl).await?;
            }
            let live = destination.columns(table).await?;
            let keep: Vec<String> = frame
                .columns()
                .iter()
                .filter(|c| live.contains(c))
                .cloned()
                .collect();
            if keep.len() < frame.columns().len() {
                info!(
                    job = %job.name,
                    kept = keep.len(),
                    dropped = frame.columns().len() - keep.len(),
                    "projected out source columns absent from destination"
                );
            }
            let frame = frame.project(&keep);

            if *mode == LoadMode::Truncate {
                destination.truncate(table).await?;
            }
            let stats = destination.load(&frame, table, mode, chunk_size).await?;

            JobReport {
                job: job.name.clone(),
                records_fetched: records.len(),
                rows_loaded: stats.inserted,
                chunks_failed: stats.failed_chunks,
                enrich: enrich_summary,
            }
        }
    };

    if report.is_degraded() {
        warn!(
            job = %report.job,
            fetched = report.records_fetched,
            loaded = report.rows_loaded,
            failed_chunks = report.chunks_failed,
            "job finished DEGRADED: some chunks did not commit"
        );
    } else {
        info!(
            job = %report.job,
            fetched = report.records_fetched,
            loaded = report.rows_loaded,
            "job finished OK"
        );
    }
    Ok(report)
}

/// Composition root for a real run: builds the HTTP clients, authenticates,
/// wires the paginated source and the warehouse, and delegates to
/// [`run_job`]. Nothing is cached between invocations — every run
/// re-authenticates and re-queries its window.
pub async fn run(cfg: &Config, warehouse: &Warehouse, job: &Job) -> Result<JobReport, JobError> {
    let http = Client::builder()
        .user_agent("sf-sync/0.1")
        .timeout(Duration::from_secs(cfg.app.http_timeout_secs))
        .no_proxy()
        .build()?;

    let session = salesforce::authenticate(&http, &cfg.salesforce).await?;
    let retry = RetryPolicy::with_max_attempts(cfg.app.max_attempts);
    let mut source = QueryPages::with_retry(
        http.clone(),
        session,
        &cfg.salesforce.api_version,
        &job.soql,
        retry,
    );

    let mut lookup = if job.enrich.is_some() {
        let desktop_http = if cfg.desktop.verify_ssl {
            http.clone()
        } else {
            Client::builder()
                .user_agent("sf-sync/0.1")
                .timeout(Duration::from_secs(cfg.app.http_timeout_secs))
                .danger_accept_invalid_certs(true)
                .no_proxy()
                .build()?
        };
        let mut client = DesktopClient::new(desktop_http, &cfg.desktop);
        // Fail the job up front if the enrichment API is unreachable,
        // before any pages are pulled.
        client.refresh_token().await?;
        Some(client)
    } else {
        None
    };

    run_job(
        job,
        &mut source,
        lookup.as_mut().map(|c| c as &mut dyn PositionLookup),
        warehouse,
        cfg.app.chunk_size,
    )
    .await
}
