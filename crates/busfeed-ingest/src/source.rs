//! CSV row source
//!
//! Reads a delimited file with a header row and yields one [`RawRecord`] per data
//! row, lazily and exactly once.

use crate::record::{columns, RawRecord};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by the row source
#[derive(Debug, Error)]
pub enum SourceError {
    /// The file does not exist; fatal to the run
    #[error("source file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but cannot be opened or its header cannot be read; fatal
    #[error("source file unreadable: {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    /// A single data row could not be decoded; the run continues
    #[error("row {line}: {reason}")]
    Row { line: u64, reason: String },
}

impl SourceError {
    /// Whether the whole run must stop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::Row { .. })
    }
}

impl From<SourceError> for busfeed_common::BusfeedError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(path) => Self::SourceNotFound(path.display().to_string()),
            other => Self::SourceUnreadable(other.to_string()),
        }
    }
}

/// A CSV file opened for a single pass
pub struct CsvRowSource<R: Read = File> {
    reader: csv::Reader<R>,
    headers: csv::StringRecord,
}

impl CsvRowSource<File> {
    /// Open `path` and read its header row.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(path.to_path_buf()),
            _ => SourceError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })?;

        Self::from_reader(file).map_err(|e| match e {
            SourceError::Unreadable { reason, .. } => SourceError::Unreadable {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }
}

impl<R: Read> CsvRowSource<R> {
    /// Wrap any reader; the first line must be the header.
    pub fn from_reader(inner: R) -> Result<Self, SourceError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(inner);

        let headers = reader
            .headers()
            .map_err(|e| SourceError::Unreadable {
                path: PathBuf::new(),
                reason: e.to_string(),
            })?
            .clone();

        let missing: Vec<&str> = columns::ALL
            .iter()
            .copied()
            .filter(|c| !headers.iter().any(|h| h == *c))
            .collect();
        if !missing.is_empty() {
            warn!(missing = ?missing, "Source header lacks expected columns");
        }
        debug!(columns = headers.len(), "Opened CSV source");

        Ok(Self { reader, headers })
    }

    pub fn headers(&self) -> &csv::StringRecord {
        &self.headers
    }

    /// Consume the source as a lazy sequence of rows.
    pub fn rows(self) -> Rows<R> {
        Rows {
            records: self.reader.into_records(),
            headers: self.headers,
        }
    }
}

/// Iterator over the remaining rows of a [`CsvRowSource`]
pub struct Rows<R: Read> {
    records: csv::StringRecordsIntoIter<R>,
    headers: csv::StringRecord,
}

impl<R: Read> Iterator for Rows<R> {
    type Item = Result<RawRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                return Some(Err(SourceError::Row {
                    line,
                    reason: e.to_string(),
                }));
            }
        };

        // Short rows leave trailing columns absent rather than empty.
        let raw = self
            .headers
            .iter()
            .zip(record.iter())
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Some(Ok(raw))
    }
}
