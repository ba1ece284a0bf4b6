use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde_json::Value;

use crate::error::StoreError;
use crate::record::{CanonicalProviderRecord, Npi};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// A provider document as persisted, with the revision it was read at.
#[derive(Debug, Clone)]
pub struct StoredProvider {
    pub id: i64,
    pub revision: i64,
    pub record: CanonicalProviderRecord,
}

/// Document store keyed by normalized NPI.
///
/// `insert` and `replace` report lost races as [`StoreError::Conflict`]:
/// a unique-key violation on insert, or a revision that moved on replace.
pub trait ProviderStore {
    fn find_by_npi(&self, npi: Npi) -> Result<Option<StoredProvider>, StoreError>;

    fn insert(&self, record: &CanonicalProviderRecord) -> Result<i64, StoreError>;

    fn replace(
        &self,
        id: i64,
        expected_revision: i64,
        record: &CanonicalProviderRecord,
    ) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS providers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                npi TEXT NOT NULL UNIQUE,
                revision INTEGER NOT NULL DEFAULT 0,
                document TEXT NOT NULL,
                updated_at TEXT
            );
            ",
        )?;
        crate::query::register_functions(&conn)?;
        Ok(Self { conn })
    }

    /// Underlying connection, for read-only queries.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM providers", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

/// Decode a stored document, flattening legacy nested addresses.
pub fn decode_document(id: i64, raw: &str) -> Result<CanonicalProviderRecord, StoreError> {
    serde_json::from_str::<Value>(raw)
        .and_then(CanonicalProviderRecord::from_json)
        .map_err(|source| StoreError::Corrupt { id, source })
}

impl ProviderStore for SqliteStore {
    fn find_by_npi(&self, npi: Npi) -> Result<Option<StoredProvider>, StoreError> {
        let row: Option<(i64, i64, String)> = self
            .conn
            .query_row(
                "SELECT id, revision, document FROM providers WHERE npi = ?1",
                [npi.key()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(id, revision, document)| {
            Ok(StoredProvider {
                id,
                revision,
                record: decode_document(id, &document)?,
            })
        })
        .transpose()
    }

    fn insert(&self, record: &CanonicalProviderRecord) -> Result<i64, StoreError> {
        let npi = record.npi().key();
        let document = serde_json::to_string(record)?;
        let inserted = self.conn.execute(
            "
            INSERT INTO providers (npi, revision, document, updated_at)
            VALUES (?1, 0, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ",
            params![npi, document],
        );
        match inserted {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Err(StoreError::Conflict { npi })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn replace(
        &self,
        id: i64,
        expected_revision: i64,
        record: &CanonicalProviderRecord,
    ) -> Result<(), StoreError> {
        let document = serde_json::to_string(record)?;
        let changed = self.conn.execute(
            "
            UPDATE providers
            SET document = ?1,
                revision = revision + 1,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE id = ?2 AND revision = ?3
            ",
            params![document, id, expected_revision],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict {
                npi: record.npi().key(),
            });
        }
        Ok(())
    }
}
