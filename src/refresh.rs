use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::NaiveDate;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use tokio::io::AsyncWriteExt;

use crate::cli::RefreshArgs;
use crate::constants::{
    CMS_CSV_URL, CMS_META_URL, NPPES_BASE_URL, NPPES_ENTRY_PREFIX, NPPES_LISTING_URL,
};
use crate::ingest::{IngestOptions, IngestReport, ingest_source, stop_on_ctrl_c};
use crate::storage::{StoragePaths, file_present_nonempty};
use crate::store::SqliteStore;

/// Upstream endpoints; tests point these at a local mock server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub nppes_listing: String,
    pub nppes_base: String,
    pub cms_meta: String,
    pub cms_csv: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            nppes_listing: NPPES_LISTING_URL.to_string(),
            nppes_base: NPPES_BASE_URL.to_string(),
            cms_meta: CMS_META_URL.to_string(),
            cms_csv: CMS_CSV_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyArchive {
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub nppes: Option<IngestReport>,
    pub cms: Option<IngestReport>,
}

pub async fn run(opts: RefreshArgs, paths: &StoragePaths) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    stop_on_ctrl_c(Arc::clone(&shutdown));

    let client = reqwest::Client::new();
    let ingest = IngestOptions {
        show_progress: true,
        ..IngestOptions::default()
    };
    let interval = opts
        .interval_hours
        .filter(|h| *h > 0)
        .map(|h| Duration::from_secs(h * 3600));
    if let Some(hours) = opts.interval_hours.filter(|h| *h > 0) {
        tracing::info!("Refreshing every {hours}h until interrupted");
    }

    schedule(
        &client,
        &Endpoints::default(),
        paths,
        &ingest,
        &opts,
        interval,
        &shutdown,
    )
    .await
}

/// Run refresh passes. A single pass (`interval` of `None`) reports its
/// failure; with an interval a failed pass is logged and the next one still
/// runs.
pub async fn schedule(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    paths: &StoragePaths,
    ingest: &IngestOptions,
    opts: &RefreshArgs,
    interval: Option<Duration>,
    shutdown: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        match refresh_once(client, endpoints, paths, ingest, opts, shutdown).await {
            Ok(summary) => tracing::info!(
                "Refresh pass done (nppes: {}, cms: {})",
                describe(summary.nppes.as_ref()),
                describe(summary.cms.as_ref())
            ),
            Err(e) if interval.is_some() => {
                tracing::error!("Refresh pass failed, will retry next interval: {e:#}")
            }
            Err(e) => return Err(e),
        }

        let Some(interval) = interval else {
            return Ok(());
        };
        if !sleep_unless_shutdown(interval, shutdown).await {
            tracing::info!("Shutdown requested; refresh loop stopped");
            return Ok(());
        }
    }
}

/// Sleep for `total`, waking every second to check `shutdown`. Returns
/// `false` when shutdown was requested.
async fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let tick = Duration::from_secs(1);
    let mut remaining = total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if remaining.is_zero() {
            return true;
        }
        let step = remaining.min(tick);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
}

fn describe(report: Option<&IngestReport>) -> String {
    match report {
        None => "skipped".to_string(),
        Some(r) => format!("{} rows, {} inserted, {} updated", r.rows, r.inserted, r.updated),
    }
}

/// One pass over both upstreams. A failing NPPES leg does not stop the CMS
/// leg; the first failure is returned once both have run.
pub async fn refresh_once(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    paths: &StoragePaths,
    ingest: &IngestOptions,
    opts: &RefreshArgs,
    shutdown: &Arc<AtomicBool>,
) -> anyhow::Result<RefreshSummary> {
    paths.ensure_dirs().context("create data directories")?;
    let mut summary = RefreshSummary::default();
    let mut failure: Option<anyhow::Error> = None;

    if !opts.skip_nppes {
        match refresh_nppes(client, endpoints, paths, ingest, shutdown).await {
            Ok(report) => summary.nppes = report,
            Err(e) => {
                tracing::error!("NPPES refresh failed: {e:#}");
                failure = Some(e.context("NPPES refresh"));
            }
        }
    }
    if !opts.skip_cms && !shutdown.load(Ordering::SeqCst) {
        match refresh_cms(client, endpoints, paths, ingest, shutdown).await {
            Ok(report) => summary.cms = report,
            Err(e) => {
                tracing::error!("CMS refresh failed: {e:#}");
                failure.get_or_insert(e.context("CMS refresh"));
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

/// Pick the weekly archive with the latest end date from the listing page.
pub fn latest_weekly_archive(listing: &str) -> Option<WeeklyArchive> {
    let pattern = Regex::new(r"NPPES_Data_Dissemination_(\d{6})_(\d{6})_Weekly\.zip").ok()?;
    pattern
        .captures_iter(listing)
        .filter_map(|caps| {
            let start = NaiveDate::parse_from_str(&caps[1], "%m%d%y").ok()?;
            let end = NaiveDate::parse_from_str(&caps[2], "%m%d%y").ok()?;
            Some(WeeklyArchive {
                name: caps[0].to_string(),
                start,
                end,
            })
        })
        .max_by_key(|a| (a.end, a.start))
}

async fn refresh_nppes(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    paths: &StoragePaths,
    ingest: &IngestOptions,
    shutdown: &Arc<AtomicBool>,
) -> anyhow::Result<Option<IngestReport>> {
    let listing = fetch_text(client, &endpoints.nppes_listing).await?;
    let Some(archive) = latest_weekly_archive(&listing) else {
        tracing::warn!("No weekly archive listed at {}", endpoints.nppes_listing);
        return Ok(None);
    };

    let dest = paths.downloads_dir.join(&archive.name);
    if file_present_nonempty(&dest) {
        tracing::info!("Local archive is current: {}", dest.display());
    } else {
        let url = format!("{}{}", endpoints.nppes_base, archive.name);
        ensure_download(client, &url, &dest).await?;
    }

    let ingest = IngestOptions {
        zip_prefix: Some(NPPES_ENTRY_PREFIX.to_string()),
        ..ingest.clone()
    };
    let report = ingest_blocking(paths.db_path.clone(), dest, ingest, Arc::clone(shutdown)).await?;
    Ok(Some(report))
}

async fn refresh_cms(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    paths: &StoragePaths,
    ingest: &IngestOptions,
    shutdown: &Arc<AtomicBool>,
) -> anyhow::Result<Option<IngestReport>> {
    let remote = match cms_last_modified(client, &endpoints.cms_meta).await {
        Ok(Some(modified)) => modified,
        Ok(None) => {
            tracing::warn!("CMS metadata carries no modified stamp; skipping");
            return Ok(None);
        }
        Err(e) => {
            tracing::warn!("CMS metadata fetch failed: {e:#}");
            return Ok(None);
        }
    };

    let marker = paths.cms_marker();
    let local = tokio::fs::read_to_string(&marker)
        .await
        .ok()
        .map(|s| s.trim().to_string());
    if local.as_deref() == Some(remote.as_str()) {
        tracing::info!("CMS dataset is up to date ({remote})");
        return Ok(None);
    }

    tracing::info!("New CMS dataset version: {remote}");
    let csv = paths.cms_csv();
    ensure_download(client, &endpoints.cms_csv, &csv).await?;

    let report =
        ingest_blocking(paths.db_path.clone(), csv, ingest.clone(), Arc::clone(shutdown)).await?;
    if report.interrupted {
        tracing::warn!("CMS ingest interrupted; marker left at previous version");
        return Ok(Some(report));
    }
    tokio::fs::write(&marker, &remote)
        .await
        .with_context(|| format!("write {}", marker.display()))?;
    Ok(Some(report))
}

async fn cms_last_modified(client: &reqwest::Client, url: &str) -> anyhow::Result<Option<String>> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    if !resp.status().is_success() {
        return Err(anyhow!("metadata request failed ({}): {}", resp.status(), url));
    }
    let meta: serde_json::Value = resp.json().await.context("decode CMS metadata")?;
    let modified = ["mtch_modified", "modified"]
        .iter()
        .find_map(|key| meta.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string);
    Ok(modified)
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    if !resp.status().is_success() {
        return Err(anyhow!("Request failed ({}): {}", resp.status(), url));
    }
    resp.text().await.with_context(|| format!("read body from {url}"))
}

async fn ingest_blocking(
    db_path: PathBuf,
    source: PathBuf,
    opts: IngestOptions,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<IngestReport> {
    tokio::task::spawn_blocking(move || {
        let store = SqliteStore::open(&db_path)
            .with_context(|| format!("open provider store at {}", db_path.display()))?;
        ingest_source(&store, &source, &opts, &shutdown)
            .with_context(|| format!("ingest {}", source.display()))
    })
    .await
    .context("ingest task panicked")?
}

/// Stream `url` into `dest` through a `.part` file, so an interrupted
/// download never looks like a complete archive.
async fn ensure_download(client: &reqwest::Client, url: &str, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    if !resp.status().is_success() {
        return Err(anyhow!("Download failed ({}): {}", resp.status(), url));
    }

    let progress = download_progress(resp.content_length(), dest);
    tracing::info!("Downloading {} -> {}", url, dest.display());

    let part = part_path(dest);
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("create {}", part.display()))?;
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.with_context(|| format!("read body chunk from {url}"))?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("write {}", part.display()))?;
        progress.inc(chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&part, dest)
        .await
        .with_context(|| format!("rename {} -> {}", part.display(), dest.display()))?;
    progress.finish_and_clear();
    tracing::info!("Saved {} ({} bytes)", dest.display(), progress.position());
    Ok(())
}

fn download_progress(total: Option<u64>, dest: &Path) -> ProgressBar {
    let (progress, template) = match total {
        Some(len) => (
            ProgressBar::new(len),
            "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.cyan/blue}] \
{bytes}/{total_bytes} {bytes_per_sec} eta {eta}",
        ),
        None => (
            ProgressBar::new_spinner(),
            "{spinner:.green} {prefix:.bold} [{elapsed_precise}] {bytes} {bytes_per_sec}",
        ),
    };
    if let Ok(style) = ProgressStyle::with_template(template) {
        progress.set_style(style);
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    progress.set_prefix(name);
    progress
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
