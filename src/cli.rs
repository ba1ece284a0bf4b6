use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::ingest::DEFAULT_BATCH_SIZE;
use crate::upsert::DEFAULT_MAX_ATTEMPTS;

#[derive(Parser, Debug)]
#[command(name = "npi-reconcile")]
#[command(about = "Reconcile NPPES and CMS provider files into one NPI-keyed store", long_about = None)]
pub struct Args {
    /// Data directory (downloads, markers, default database location).
    #[arg(long, global = true, env = "NPI_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// SQLite database file [default: <data-dir>/providers.sqlite].
    #[arg(long, global = true, env = "NPI_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Map and merge one or more source files (.csv, .csv.gz, .zip) into the store.
    Ingest(IngestArgs),
    /// Describe a source file: format, entry, columns, inferred types, detected source.
    Inspect(InspectArgs),
    /// Show the stored document for an NPI, or the raw rows for it in a source file.
    Lookup(LookupArgs),
    /// Fetch the latest upstream files when they changed and ingest them.
    Refresh(RefreshArgs),
    /// Serve the HTTP query API.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    /// Preferred CSV entry-name prefix inside zip archives (e.g. npidata).
    #[arg(long)]
    pub zip_prefix: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Attempts per record when concurrent writers conflict.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Disable the progress spinner.
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct InspectArgs {
    pub source: PathBuf,

    #[arg(long)]
    pub zip_prefix: Option<String>,

    /// Rows sampled for type inference.
    #[arg(long, default_value_t = 1000)]
    pub sample_size: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LookupArgs {
    pub npi: String,

    /// Search this source file instead of the store.
    #[arg(long)]
    pub source: Option<PathBuf>,

    #[arg(long)]
    pub zip_prefix: Option<String>,

    /// Return every matching row, not just the first (with --source).
    #[arg(long)]
    pub all: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RefreshArgs {
    /// Keep running, refreshing every N hours.
    #[arg(long)]
    pub interval_hours: Option<u64>,

    #[arg(long)]
    pub skip_nppes: bool,

    #[arg(long)]
    pub skip_cms: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8787)]
    pub port: u16,
}
