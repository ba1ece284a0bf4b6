//! Streaming access to provider source files.
//!
//! A source is a plain `.csv`, a gzip-compressed `.csv.gz`, or a `.zip`
//! archive holding one or more CSV entries. Everything is validated when the
//! reader is opened; rows are only read when a caller asks for them, and
//! every read opens its own file handle that is closed when the returned
//! value is dropped.

use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{ByteRecord, StringRecord};
use flate2::CrcReader;
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use serde::Serialize;
use thiserror::Error;
use zip::CompressionMethod;

use crate::error::SourceError;
use crate::record::Npi;

type SourceStream = Box<dyn Read + Send>;

#[derive(Debug, Clone)]
enum SourceFormat {
    Csv,
    GzipCsv,
    Zip(ZipEntry),
}

#[derive(Debug, Clone)]
struct ZipEntry {
    name: String,
    data_start: u64,
    compressed_size: u64,
    size: u64,
    crc32: u32,
    deflated: bool,
}

/// Raised from inside the entry stream when the bytes read do not match the
/// CRC-32 recorded in the archive.
#[derive(Error, Debug)]
#[error("entry {entry} failed its CRC-32 check (expected {expected:08x}, got {actual:08x})")]
struct ChecksumMismatch {
    entry: String,
    expected: u32,
    actual: u32,
}

/// Zip entry stream that checks the entry's CRC-32 once it reaches the end.
struct CheckedEntry {
    inner: CrcReader<SourceStream>,
    entry: String,
    expected: u32,
    verified: bool,
}

impl Read for CheckedEntry {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.verified {
            let actual = self.inner.crc().sum();
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    ChecksumMismatch {
                        entry: self.entry.clone(),
                        expected: self.expected,
                        actual,
                    },
                ));
            }
            self.verified = true;
        }
        Ok(n)
    }
}

/// Decode a raw row. Cells that are not valid UTF-8 (older NPPES extracts
/// carry Latin-1 names) are decoded lossily instead of failing the source.
fn decode_record(raw: &ByteRecord, path: &Path, row: u64) -> StringRecord {
    match StringRecord::from_byte_record(raw.clone()) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(
                "{} row {row}: invalid UTF-8, replacing undecodable bytes",
                path.display()
            );
            StringRecord::from_byte_record_lossy(e.into_byte_record())
        }
    }
}

/// Map a CSV read failure, surfacing CRC mismatches as a corrupt archive.
fn csv_error(path: &Path, source: csv::Error) -> SourceError {
    if let csv::ErrorKind::Io(io_err) = source.kind() {
        if let Some(mismatch) = io_err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ChecksumMismatch>())
        {
            return SourceError::CorruptEntry {
                path: path.to_path_buf(),
                entry: mismatch.entry.clone(),
                detail: mismatch.to_string(),
            };
        }
    }
    SourceError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Column type inferred from a sample of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Empty,
    Integer,
    Float,
    Boolean,
    Text,
}

impl ColumnType {
    fn of(value: &str) -> Self {
        let v = value.trim();
        if v.is_empty() {
            ColumnType::Empty
        } else if v.parse::<i64>().is_ok() {
            ColumnType::Integer
        } else if v.parse::<f64>().is_ok() {
            ColumnType::Float
        } else if v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("false") {
            ColumnType::Boolean
        } else {
            ColumnType::Text
        }
    }

    fn widen(self, other: Self) -> Self {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Empty, b) => b,
            (a, Empty) => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => Text,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub format: &'static str,
    pub file_size: u64,
    pub entry: Option<String>,
    pub compressed_size: Option<u64>,
    pub uncompressed_size: Option<u64>,
    pub compression: Option<&'static str>,
}

/// Column names of a source plus a name -> position index.
#[derive(Debug)]
pub struct Header {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    fn new(columns: Vec<String>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self { columns, index }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }
}

/// One batch of rows sharing a header.
#[derive(Debug)]
pub struct RowBatch {
    header: Arc<Header>,
    records: Vec<StringRecord>,
    first_row: u64,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.records.iter().enumerate().map(|(i, record)| Row {
            header: &self.header,
            record,
            number: self.first_row + i as u64,
        })
    }
}

/// Borrowed view of one source row.
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    header: &'a Header,
    record: &'a StringRecord,
    number: u64,
}

impl<'a> Row<'a> {
    /// Trimmed cell value; `None` for a missing column or a blank cell.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = self.header.position(column)?;
        self.record
            .get(idx)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// 1-based data row number within the source.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.header
            .columns()
            .iter()
            .zip(self.record.iter())
            .map(|(c, v)| (c.clone(), v.to_string()))
            .collect()
    }

    #[cfg(test)]
    pub fn for_test(header: &'a Header, record: &'a StringRecord) -> Self {
        Row {
            header,
            record,
            number: 1,
        }
    }
}

#[cfg(test)]
pub fn test_header(columns: &[&str]) -> Header {
    Header::new(columns.iter().map(|c| c.to_string()).collect())
}

#[derive(Debug, Serialize)]
pub struct MatchedRow {
    pub row: u64,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct SourceReader {
    path: PathBuf,
    format: SourceFormat,
    schema: OnceCell<Vec<(String, ColumnType)>>,
}

impl SourceReader {
    /// Validate `path` and resolve which CSV to read.
    ///
    /// For archives, the first `.csv` entry whose file name starts with
    /// `prefix` (case-insensitive) is chosen, falling back to the first
    /// `.csv` entry when nothing matches. Header-only `fileheader` entries
    /// are never chosen.
    pub fn open(path: impl Into<PathBuf>, prefix: Option<&str>) -> Result<Self, SourceError> {
        let path = path.into();
        if !path.is_file() {
            return Err(SourceError::NotFound { path });
        }

        let lower = path.to_string_lossy().to_ascii_lowercase();
        let format = if lower.ends_with(".zip") {
            SourceFormat::Zip(select_zip_entry(&path, prefix)?)
        } else if lower.ends_with(".csv.gz") {
            SourceFormat::GzipCsv
        } else if lower.ends_with(".csv") {
            SourceFormat::Csv
        } else {
            return Err(SourceError::UnsupportedExtension { path });
        };

        Ok(Self {
            path,
            format,
            schema: OnceCell::new(),
        })
    }

    /// Name of the CSV actually read (the archive entry for zips).
    pub fn table_name(&self) -> String {
        match &self.format {
            SourceFormat::Zip(entry) => entry.name.clone(),
            _ => self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    pub fn info(&self) -> Result<SourceInfo, SourceError> {
        let file_size = std::fs::metadata(&self.path)
            .map_err(|source| self.io_err(source))?
            .len();
        let info = match &self.format {
            SourceFormat::Csv => SourceInfo {
                path: self.path.clone(),
                format: "csv",
                file_size,
                entry: None,
                compressed_size: None,
                uncompressed_size: None,
                compression: None,
            },
            SourceFormat::GzipCsv => SourceInfo {
                path: self.path.clone(),
                format: "csv.gz",
                file_size,
                entry: None,
                compressed_size: Some(file_size),
                uncompressed_size: None,
                compression: Some("gzip"),
            },
            SourceFormat::Zip(entry) => SourceInfo {
                path: self.path.clone(),
                format: "zip",
                file_size,
                entry: Some(entry.name.clone()),
                compressed_size: Some(entry.compressed_size),
                uncompressed_size: Some(entry.size),
                compression: Some(if entry.deflated { "deflate" } else { "stored" }),
            },
        };
        Ok(info)
    }

    /// Column names, without reading any data rows.
    pub fn peek_header(&self) -> Result<Vec<String>, SourceError> {
        let mut reader = self.csv_reader()?;
        let headers = reader.headers().map_err(|source| self.csv_err(source))?;
        Ok(headers.iter().map(|h| h.trim().to_string()).collect())
    }

    /// Column types inferred from the first `sample_size` rows. Computed
    /// once; later calls return the cached result whatever the size.
    pub fn sample_schema(
        &self,
        sample_size: usize,
    ) -> Result<&[(String, ColumnType)], SourceError> {
        if let Some(schema) = self.schema.get() {
            return Ok(schema);
        }

        let mut reader = self.csv_reader()?;
        let columns: Vec<String> = reader
            .headers()
            .map_err(|source| self.csv_err(source))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut types = vec![ColumnType::Empty; columns.len()];

        let mut raw = ByteRecord::new();
        for row in 1..=sample_size as u64 {
            let more = reader
                .read_byte_record(&mut raw)
                .map_err(|source| self.csv_err(source))?;
            if !more {
                break;
            }
            let record = decode_record(&raw, &self.path, row);
            for (ty, value) in types.iter_mut().zip(record.iter()) {
                *ty = ty.widen(ColumnType::of(value));
            }
        }

        Ok(self.schema.get_or_init(|| columns.into_iter().zip(types).collect()))
    }

    /// Lazily read the source in batches of `batch_size` rows, optionally
    /// keeping only `columns`. Each call starts from the first row.
    pub fn read_batches(
        &self,
        batch_size: usize,
        columns: Option<&[&str]>,
    ) -> Result<BatchIter, SourceError> {
        let mut reader = self.csv_reader()?;
        let all: Vec<String> = reader
            .headers()
            .map_err(|source| self.csv_err(source))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let (header, projection) = match columns {
            None => (Header::new(all), None),
            Some(wanted) => {
                let full = Header::new(all);
                let missing: Vec<String> = wanted
                    .iter()
                    .filter(|c| full.position(c).is_none())
                    .map(|c| c.to_string())
                    .collect();
                if !missing.is_empty() {
                    return Err(SourceError::UnknownColumns {
                        path: self.path.clone(),
                        missing,
                    });
                }
                let positions = wanted.iter().filter_map(|c| full.position(c)).collect();
                let names = wanted.iter().map(|c| c.to_string()).collect();
                (Header::new(names), Some(positions))
            }
        };

        Ok(BatchIter {
            path: self.path.clone(),
            reader,
            header: Arc::new(header),
            projection,
            batch_size: batch_size.max(1),
            rows_read: 0,
            done: false,
        })
    }

    /// Scan the whole source for rows whose `column` equals `value`.
    ///
    /// NPI-looking values compare by identifier, so `1234567890` matches a
    /// cell holding `1234567890.0`.
    pub fn find_rows(
        &self,
        column: &str,
        value: &str,
        batch_size: usize,
        first_only: bool,
    ) -> Result<Vec<MatchedRow>, SourceError> {
        let header = self.peek_header()?;
        if !header.iter().any(|c| c == column) {
            return Err(SourceError::UnknownColumns {
                path: self.path.clone(),
                missing: vec![column.to_string()],
            });
        }

        let wanted = value.trim();
        let wanted_npi = Npi::parse(wanted);
        let mut matches = Vec::new();

        for batch in self.read_batches(batch_size, None)? {
            let batch = batch?;
            for row in batch.rows() {
                let Some(cell) = row.get(column) else {
                    continue;
                };
                let hit = match wanted_npi {
                    Some(npi) => Npi::parse(cell) == Some(npi),
                    None => cell == wanted,
                };
                if hit {
                    matches.push(MatchedRow {
                        row: row.number(),
                        values: row.to_map(),
                    });
                    if first_only {
                        return Ok(matches);
                    }
                }
            }
        }
        Ok(matches)
    }

    fn open_stream(&self) -> Result<SourceStream, SourceError> {
        let file = File::open(&self.path).map_err(|source| self.io_err(source))?;
        let stream: SourceStream = match &self.format {
            SourceFormat::Csv => Box::new(BufReader::new(file)),
            SourceFormat::GzipCsv => Box::new(MultiGzDecoder::new(BufReader::new(file))),
            SourceFormat::Zip(entry) => {
                let mut file = file;
                file.seek(SeekFrom::Start(entry.data_start))
                    .map_err(|source| self.io_err(source))?;
                let raw = BufReader::new(file).take(entry.compressed_size);
                let decoded: SourceStream = if entry.deflated {
                    Box::new(DeflateDecoder::new(raw))
                } else {
                    Box::new(raw)
                };
                Box::new(CheckedEntry {
                    inner: CrcReader::new(decoded),
                    entry: entry.name.clone(),
                    expected: entry.crc32,
                    verified: false,
                })
            }
        };
        Ok(stream)
    }

    fn csv_reader(&self) -> Result<csv::Reader<SourceStream>, SourceError> {
        let stream = self.open_stream()?;
        Ok(csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(stream))
    }

    fn io_err(&self, source: std::io::Error) -> SourceError {
        SourceError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_err(&self, source: csv::Error) -> SourceError {
        csv_error(&self.path, source)
    }
}

fn select_zip_entry(path: &Path, prefix: Option<&str>) -> Result<ZipEntry, SourceError> {
    let invalid = |source| SourceError::InvalidArchive {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(invalid)?;

    let prefix = prefix.map(str::to_ascii_lowercase).unwrap_or_default();
    let mut first_csv: Option<usize> = None;
    let mut chosen: Option<usize> = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(invalid)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_ascii_lowercase();
        if !name.ends_with(".csv") {
            continue;
        }
        let base = name.rsplit('/').next().unwrap_or(&name);
        // NPPES ships a header-only companion CSV next to the data file.
        if base.contains("fileheader") {
            continue;
        }
        first_csv.get_or_insert(i);
        if base.starts_with(&prefix) {
            chosen = Some(i);
            break;
        }
    }

    let idx = match (chosen, first_csv) {
        (Some(i), _) => i,
        (None, Some(i)) => {
            tracing::warn!(
                "No CSV entry in {} starts with {:?}; using the first CSV entry",
                path.display(),
                prefix
            );
            i
        }
        (None, None) => {
            return Err(SourceError::NoTabularEntry {
                path: path.to_path_buf(),
            });
        }
    };

    let entry = archive.by_index(idx).map_err(invalid)?;
    let deflated = match entry.compression() {
        CompressionMethod::Stored => false,
        CompressionMethod::Deflated => true,
        other => {
            return Err(SourceError::UnsupportedCompression {
                path: path.to_path_buf(),
                entry: entry.name().to_string(),
                method: format!("{other:?}"),
            });
        }
    };

    tracing::info!("Using {} from {}", entry.name(), path.display());
    Ok(ZipEntry {
        name: entry.name().to_string(),
        data_start: entry.data_start(),
        compressed_size: entry.compressed_size(),
        size: entry.size(),
        crc32: entry.crc32(),
        deflated,
    })
}

/// Iterator over [`RowBatch`]es. Owns the open source; dropping it closes
/// the file.
pub struct BatchIter {
    path: PathBuf,
    reader: csv::Reader<SourceStream>,
    header: Arc<Header>,
    projection: Option<Vec<usize>>,
    batch_size: usize,
    rows_read: u64,
    done: bool,
}

impl Iterator for BatchIter {
    type Item = Result<RowBatch, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let first_row = self.rows_read + 1;
        let mut records = Vec::with_capacity(self.batch_size);
        let mut raw = ByteRecord::new();
        while records.len() < self.batch_size {
            match self.reader.read_byte_record(&mut raw) {
                Ok(true) => {
                    let row = first_row + records.len() as u64;
                    let record = decode_record(&raw, &self.path, row);
                    let kept = match &self.projection {
                        Some(positions) => positions
                            .iter()
                            .map(|&i| record.get(i).unwrap_or(""))
                            .collect(),
                        None => record,
                    };
                    records.push(kept);
                }
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(source) => {
                    self.done = true;
                    return Some(Err(csv_error(&self.path, source)));
                }
            }
        }

        if records.is_empty() {
            return None;
        }
        self.rows_read += records.len() as u64;
        tracing::debug!(
            "Read rows {}..={} from {}",
            first_row,
            self.rows_read,
            self.path.display()
        );
        Some(Ok(RowBatch {
            header: Arc::clone(&self.header),
            records,
            first_row,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const CSV: &str = "\
\"NPI\",\"Entity Type Code\",\"Provider First Name\",\"Grd_yr\"
\"1000000001\",\"1\",\"JANE\",\"1998\"
\"1000000002\",\"2\",\"\",\"2001\"
\"1000000003\",\"1\",\"AMIR\",\"\"
";

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn write_zip(dir: &Path, entries: &[(&str, &str)], method: CompressionMethod) -> PathBuf {
        let path = dir.join("bundle.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default().compression_method(method);
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    fn npis(reader: &SourceReader) -> Vec<String> {
        reader
            .read_batches(2, None)
            .unwrap()
            .flat_map(|b| {
                let b = b.unwrap();
                b.rows()
                    .map(|r| r.get("NPI").unwrap().to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn rejects_missing_and_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = SourceReader::open(dir.path().join("nope.csv"), None).unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));

        let txt = write_file(dir.path(), "data.txt", b"a,b\n");
        let err = SourceReader::open(txt, None).unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedExtension { .. }));

        let bad_zip = write_file(dir.path(), "bad.zip", b"definitely not a zip");
        let err = SourceReader::open(bad_zip, None).unwrap_err();
        assert!(matches!(err, SourceError::InvalidArchive { .. }));
    }

    #[test]
    fn zip_without_csv_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            &[("readme.pdf", "x")],
            CompressionMethod::Stored,
        );
        let err = SourceReader::open(path, Some("npidata")).unwrap_err();
        assert!(matches!(err, SourceError::NoTabularEntry { .. }));
    }

    #[test]
    fn plain_csv_reads_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "providers.csv", CSV.as_bytes());
        let reader = SourceReader::open(&path, None).unwrap();

        assert_eq!(
            reader.peek_header().unwrap(),
            vec!["NPI", "Entity Type Code", "Provider First Name", "Grd_yr"]
        );

        let batches: Vec<RowBatch> = reader
            .read_batches(2, None)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(batches.iter().map(RowBatch::len).collect::<Vec<_>>(), vec![2, 1]);

        let second = batches[0].rows().nth(1).unwrap();
        assert_eq!(second.number(), 2);
        assert_eq!(second.get("Provider First Name"), None);
        assert_eq!(second.get("No Such Column"), None);

        // restartable
        assert_eq!(npis(&reader), vec!["1000000001", "1000000002", "1000000003"]);
        assert_eq!(npis(&reader).len(), 3);
    }

    #[test]
    fn column_filter_projects_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "providers.csv", CSV.as_bytes());
        let reader = SourceReader::open(&path, None).unwrap();

        let mut batches = reader.read_batches(10, Some(&["Grd_yr", "NPI"])).unwrap();
        let batch = batches.next().unwrap().unwrap();
        let first = batch.rows().next().unwrap();
        assert_eq!(first.get("NPI"), Some("1000000001"));
        assert_eq!(first.get("Grd_yr"), Some("1998"));
        assert_eq!(first.get("Provider First Name"), None);

        let err = reader.read_batches(10, Some(&["NPI", "Bogus"])).err().unwrap();
        match err {
            SourceError::UnknownColumns { missing, .. } => assert_eq!(missing, vec!["Bogus"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn sample_schema_infers_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "providers.csv", CSV.as_bytes());
        let reader = SourceReader::open(&path, None).unwrap();

        let schema = reader.sample_schema(100).unwrap().to_vec();
        assert_eq!(
            schema,
            vec![
                ("NPI".to_string(), ColumnType::Integer),
                ("Entity Type Code".to_string(), ColumnType::Integer),
                ("Provider First Name".to_string(), ColumnType::Text),
                ("Grd_yr".to_string(), ColumnType::Integer),
            ]
        );

        std::fs::write(&path, "NPI\nabc\n").unwrap();
        assert_eq!(reader.sample_schema(1).unwrap(), schema.as_slice());
    }

    #[test]
    fn gzip_csv_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(CSV.as_bytes()).unwrap();
        let path = write_file(dir.path(), "providers.csv.gz", &enc.finish().unwrap());
        let reader = SourceReader::open(&path, None).unwrap();
        assert_eq!(npis(&reader).len(), 3);
    }

    #[test]
    fn zip_entry_selected_by_prefix_for_both_methods() {
        for method in [CompressionMethod::Stored, CompressionMethod::Deflated] {
            let dir = tempfile::tempdir().unwrap();
            let path = write_zip(
                dir.path(),
                &[
                    ("othername_pfile.csv", "NPI,Other\n9,9\n"),
                    ("npidata_pfile_fileheader.csv", "NPI,Entity Type Code\n"),
                    ("npidata_pfile_2025.csv", CSV),
                    ("npidata_pfile_2025_fileheader.txt", "x"),
                ],
                method,
            );
            let reader = SourceReader::open(&path, Some("NPIDATA")).unwrap();
            assert_eq!(reader.table_name(), "npidata_pfile_2025.csv");
            assert_eq!(npis(&reader), vec!["1000000001", "1000000002", "1000000003"]);

            let info = reader.info().unwrap();
            assert_eq!(info.format, "zip");
            assert_eq!(info.uncompressed_size, Some(CSV.len() as u64));
        }
    }

    #[test]
    fn zip_falls_back_to_first_csv_when_prefix_misses() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            &[("notes.txt", "x"), ("dac_national.csv", CSV)],
            CompressionMethod::Deflated,
        );
        let reader = SourceReader::open(&path, Some("npidata")).unwrap();
        assert_eq!(reader.table_name(), "dac_national.csv");
    }

    #[test]
    fn find_rows_matches_npi_representations() {
        let dir = tempfile::tempdir().unwrap();
        let body = "NPI,Name\n1000000001.0,A\n1000000002,B\n1000000001,C\n";
        let path = write_file(dir.path(), "providers.csv", body.as_bytes());
        let reader = SourceReader::open(&path, None).unwrap();

        let all = reader.find_rows("NPI", "1000000001", 1, false).unwrap();
        assert_eq!(all.iter().map(|m| m.row).collect::<Vec<_>>(), vec![1, 3]);

        let first = reader.find_rows("NPI", "1000000001", 1, true).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].values["Name"], "A");

        assert!(reader.find_rows("npi", "1", 1, true).is_err());
    }

    #[test]
    fn corrupted_zip_entry_fails_its_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            &[("npidata.csv", "NPI,Entity Type Code\n1000000001,1\n")],
            CompressionMethod::Stored,
        );
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes
            .windows(10)
            .position(|w| w == b"1000000001")
            .unwrap();
        bytes[at + 9] = b'9';
        std::fs::write(&path, &bytes).unwrap();

        let reader = SourceReader::open(&path, None).unwrap();
        let results: Vec<_> = reader.read_batches(10, None).unwrap().collect();
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(SourceError::CorruptEntry { entry, .. }) if entry == "npidata.csv")),
            "expected a checksum failure, got {results:?}"
        );
    }

    #[test]
    fn intact_zip_entry_passes_its_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(dir.path(), &[("npidata.csv", CSV)], CompressionMethod::Stored);
        let reader = SourceReader::open(&path, None).unwrap();
        let batches: Result<Vec<_>, _> = reader.read_batches(1, None).unwrap().collect();
        assert_eq!(batches.unwrap().len(), 3);
    }

    #[test]
    fn invalid_utf8_cells_are_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"NPI,Name\n1000000001,SMITH\n1000000002,M\xD6LLER\n1000000003,DOE\n";
        let path = write_file(dir.path(), "providers.csv", body);
        let reader = SourceReader::open(&path, None).unwrap();

        let names: Vec<String> = reader
            .read_batches(1, None)
            .unwrap()
            .flat_map(|b| {
                b.unwrap()
                    .rows()
                    .map(|r| r.get("Name").unwrap().to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(names, vec!["SMITH", "M\u{FFFD}LLER", "DOE"]);
    }
}
