//! Error types for each stage of the reconciliation pipeline.
//!
//! Source and store errors abort the current run. Map and upsert errors are
//! scoped to one row or record; the ingest loop logs and counts them.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("unsupported source {}: expected .csv, .csv.gz or .zip", path.display())]
    UnsupportedExtension { path: PathBuf },

    #[error("invalid zip archive {}: {source}", path.display())]
    InvalidArchive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("no .csv entry in archive {}", path.display())]
    NoTabularEntry { path: PathBuf },

    #[error("entry {entry} in {} uses unsupported compression {method}", path.display())]
    UnsupportedCompression {
        path: PathBuf,
        entry: String,
        method: String,
    },

    #[error("corrupt entry {entry} in {}: {detail}", path.display())]
    CorruptEntry {
        path: PathBuf,
        entry: String,
        detail: String,
    },

    #[error("column(s) {missing:?} not present in {}", path.display())]
    UnknownColumns { path: PathBuf, missing: Vec<String> },

    #[error("failed reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MapError {
    #[error("row {row}: required field {field} missing or unparsable ({value:?})")]
    RequiredFieldMissing {
        row: u64,
        field: &'static str,
        value: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another writer touched the same NPI between our read and our write.
    #[error("conflicting write for NPI {npi}")]
    Conflict { npi: String },

    #[error("stored document {id} could not be decoded: {source}")]
    Corrupt {
        id: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed creating database directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("provider store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("failed encoding provider document: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum UpsertError {
    #[error("gave up on NPI {npi} after {attempts} conflicting writes")]
    RetriesExhausted { npi: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UpsertError {
    /// Whether the error should stop the whole ingest run rather than just
    /// the record that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UpsertError::Store(StoreError::Unavailable(_)) | UpsertError::Store(StoreError::Encode(_))
        )
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("column layout of {} matches no known source (columns: {columns:?})", path.display())]
    SchemaUnresolvable { path: PathBuf, columns: Vec<String> },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Upsert(#[from] UpsertError),
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("invalid search pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("cannot sort by {0:?}")]
    UnknownSortField(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for QueryError {
    fn from(e: rusqlite::Error) -> Self {
        QueryError::Store(StoreError::Unavailable(e))
    }
}

impl QueryError {
    /// Whether the caller asked for something malformed, as opposed to the
    /// store failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidPattern { .. } | QueryError::UnknownSortField(_)
        )
    }
}
