use std::path::Path;

use anyhow::{Context, anyhow};
use serde::Serialize;

use crate::cli::{InspectArgs, LookupArgs};
use crate::error::SourceError;
use crate::ingest::DEFAULT_BATCH_SIZE;
use crate::mapper::NPI_COLUMN;
use crate::query::ProviderQueries;
use crate::reader::{ColumnType, SourceInfo, SourceReader};
use crate::record::Npi;
use crate::schema::classify;
use crate::storage::StoragePaths;
use crate::store::SqliteStore;

#[derive(Debug, Serialize)]
pub struct SourceDescription {
    pub info: SourceInfo,
    pub table: String,
    pub source_kind: String,
    pub columns: Vec<ColumnDescription>,
}

#[derive(Debug, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

pub fn describe_source(
    path: &Path,
    zip_prefix: Option<&str>,
    sample_size: usize,
) -> Result<SourceDescription, SourceError> {
    let reader = SourceReader::open(path, zip_prefix)?;
    let columns: Vec<ColumnDescription> = reader
        .sample_schema(sample_size)?
        .iter()
        .map(|(name, ty)| ColumnDescription {
            name: name.clone(),
            ty: *ty,
        })
        .collect();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();

    Ok(SourceDescription {
        info: reader.info()?,
        table: reader.table_name(),
        source_kind: classify(&names).to_string(),
        columns,
    })
}

pub fn run(cmd: InspectArgs) -> anyhow::Result<()> {
    let description = describe_source(&cmd.source, cmd.zip_prefix.as_deref(), cmd.sample_size)
        .with_context(|| format!("inspect {}", cmd.source.display()))?;
    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(())
}

pub fn lookup(cmd: LookupArgs, paths: &StoragePaths) -> anyhow::Result<()> {
    if let Some(source) = &cmd.source {
        let reader = SourceReader::open(source, cmd.zip_prefix.as_deref())
            .with_context(|| format!("open {}", source.display()))?;
        let rows = reader
            .find_rows(NPI_COLUMN, &cmd.npi, DEFAULT_BATCH_SIZE, !cmd.all)
            .with_context(|| format!("scan {}", source.display()))?;
        if rows.is_empty() {
            tracing::warn!("NPI {} not found in {}", cmd.npi, source.display());
        }
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let npi = Npi::parse(&cmd.npi).ok_or_else(|| anyhow!("invalid NPI {:?}", cmd.npi))?;
    let store = SqliteStore::open(&paths.db_path)
        .with_context(|| format!("open provider store at {}", paths.db_path.display()))?;
    let entry = ProviderQueries::new(store.connection())
        .get_by_npi(npi)?
        .ok_or_else(|| anyhow!("no provider with NPI {npi}"))?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}
