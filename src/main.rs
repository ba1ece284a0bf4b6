mod cli;
mod constants;
mod error;
mod ingest;
mod inspect;
mod mapper;
mod merge;
mod query;
mod reader;
mod record;
mod refresh;
mod schema;
mod server;
mod storage;
mod store;
mod upsert;

use anyhow::Context;
use clap::Parser;

use crate::storage::StoragePaths;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional.
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = cli::Args::parse();
    let paths = StoragePaths::new(&args.data_dir, args.db_path.clone());

    match args.cmd {
        cli::Command::Ingest(cmd) => ingest::run(cmd, &paths).await.context("ingest failed"),
        cli::Command::Inspect(cmd) => inspect::run(cmd).context("inspect failed"),
        cli::Command::Lookup(cmd) => inspect::lookup(cmd, &paths).context("lookup failed"),
        cli::Command::Refresh(cmd) => refresh::run(cmd, &paths).await.context("refresh failed"),
        cli::Command::Serve(cmd) => server::run(cmd, &paths).await.context("serve failed"),
    }
}
