use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::cli::IngestArgs;
use crate::error::IngestError;
use crate::mapper::map_row;
use crate::reader::SourceReader;
use crate::schema::{SourceKind, classify};
use crate::storage::StoragePaths;
use crate::store::{ProviderStore, SqliteStore};
use crate::upsert::{DEFAULT_MAX_ATTEMPTS, UpsertAction, Upserter};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_size: usize,
    /// Preferred entry-name prefix when the source is a zip archive.
    pub zip_prefix: Option<String>,
    pub max_attempts: u32,
    pub show_progress: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            zip_prefix: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub rows: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub interrupted: bool,
}

impl IngestReport {
    fn absorb(&mut self, other: &IngestReport) {
        self.rows += other.rows;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.interrupted |= other.interrupted;
    }
}

pub async fn run(cmd: IngestArgs, paths: &StoragePaths) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    stop_on_ctrl_c(Arc::clone(&shutdown));

    let opts = IngestOptions {
        batch_size: cmd.batch_size,
        zip_prefix: cmd.zip_prefix.clone(),
        max_attempts: cmd.max_attempts,
        show_progress: !cmd.no_progress,
    };
    let db_path = paths.db_path.clone();

    let totals = tokio::task::spawn_blocking(move || -> anyhow::Result<IngestReport> {
        let store = SqliteStore::open(&db_path)
            .with_context(|| format!("open provider store at {}", db_path.display()))?;
        let mut totals = IngestReport::default();
        for source in &cmd.sources {
            let report = ingest_source(&store, source, &opts, &shutdown)
                .with_context(|| format!("ingest {}", source.display()))?;
            totals.absorb(&report);
            if report.interrupted {
                break;
            }
        }
        Ok(totals)
    })
    .await
    .context("ingest task panicked")??;

    tracing::info!("Ingest totals: {}", serde_json::to_string(&totals)?);
    Ok(())
}

/// First Ctrl-C raises `stop` so work ends at the next batch boundary; a
/// second one exits immediately.
pub fn stop_on_ctrl_c(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if stop.swap(true, Ordering::SeqCst) {
                tracing::warn!("Second interrupt, exiting without waiting for the batch");
                std::process::exit(130);
            }
            tracing::warn!("Interrupt received, stopping after the current batch (Ctrl-C again to force)");
        }
    });
}

/// Stream one source file into the store.
///
/// Rows with no usable NPI are skipped and records that cannot be written
/// are counted as failed; both are logged and the run continues. A store
/// outage aborts the run. `shutdown` is checked between batches.
pub fn ingest_source<S: ProviderStore + ?Sized>(
    store: &S,
    path: &Path,
    opts: &IngestOptions,
    shutdown: &AtomicBool,
) -> Result<IngestReport, IngestError> {
    let reader = SourceReader::open(path, opts.zip_prefix.as_deref())?;
    let columns = reader.peek_header()?;
    let kind = classify(&columns);
    if kind == SourceKind::Unknown {
        return Err(IngestError::SchemaUnresolvable {
            path: path.to_path_buf(),
            columns,
        });
    }
    tracing::info!(
        "Ingesting {} as {kind} source ({} columns)",
        path.display(),
        columns.len()
    );

    let upserter = Upserter::new(store).with_max_attempts(opts.max_attempts);
    let progress = ingest_progress(opts.show_progress, &reader.table_name());
    let mut report = IngestReport::default();

    for batch in reader.read_batches(opts.batch_size, None)? {
        if shutdown.load(Ordering::SeqCst) {
            tracing::warn!("Shutdown requested; stopping after {} rows", report.rows);
            report.interrupted = true;
            break;
        }
        let batch = batch?;
        let mapped_at = Utc::now();

        for row in batch.rows() {
            report.rows += 1;
            let candidate = match map_row(&row, kind, mapped_at) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!("{}: skipping row: {e}", path.display());
                    report.skipped += 1;
                    continue;
                }
            };
            match upserter.upsert(&candidate) {
                Ok(outcome) => match outcome.action {
                    UpsertAction::Inserted => report.inserted += 1,
                    UpsertAction::Updated => report.updated += 1,
                    UpsertAction::Unchanged => report.unchanged += 1,
                },
                Err(e) if e.is_fatal() => {
                    progress.abandon_with_message("store unavailable");
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(npi = %candidate.npi(), "upsert failed: {e}");
                    report.failed += 1;
                }
            }
        }

        progress.set_position(report.rows);
        progress.set_message(format!(
            "+{} ~{} ={}",
            report.inserted, report.updated, report.unchanged
        ));
        tracing::debug!(
            batch_rows = batch.len(),
            rows = report.rows,
            inserted = report.inserted,
            updated = report.updated,
            "batch committed"
        );
    }

    progress.finish_and_clear();
    tracing::info!(
        "Finished {}: {} rows, {} inserted, {} updated, {} unchanged, {} skipped, {} failed",
        path.display(),
        report.rows,
        report.inserted,
        report.updated,
        report.unchanged,
        report.skipped,
        report.failed
    );
    Ok(report)
}

fn ingest_progress(visible: bool, prefix: &str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] {pos} rows {per_sec} {msg}",
    ) {
        progress.set_style(style);
    }
    progress.set_prefix(prefix.to_string());
    progress.enable_steady_tick(Duration::from_millis(250));
    progress
}
