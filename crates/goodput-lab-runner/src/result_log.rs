use goodput_lab_abstract::ResultRecord;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ResultLogError {
    #[error("failed to open result log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write result log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to read result log {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Append-only CSV of trial results. The first row is always the header.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row, writing the header first if the log is new or empty.
    pub fn append(&self, record: &ResultRecord) -> Result<(), ResultLogError> {
        let needs_header = fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| ResultLogError::Open {
                path: self.path.clone(),
                source,
            })?;

        let write_err = |source| ResultLogError::Write {
            path: self.path.clone(),
            source,
        };
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(ResultRecord::HEADER).map_err(write_err)?;
        }
        writer.serialize(record).map_err(write_err)?;
        writer
            .flush()
            .map_err(|e| write_err(csv::Error::from(e)))?;
        debug!("Appended result to {}", self.path.display());
        Ok(())
    }

    /// Reads every well-formed row. Rows without a congestion-control value,
    /// or that otherwise fail to parse, are skipped with a warning.
    pub fn read(path: &Path) -> Result<Vec<ResultRecord>, ResultLogError> {
        let read_err = |source| ResultLogError::Read {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(read_err)?;
        let headers = reader.headers().map_err(read_err)?.clone();

        let mut records = Vec::new();
        for (idx, row) in reader.records().enumerate() {
            let line = idx + 2;
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!("{}:{}: unreadable row skipped: {}", path.display(), line, e);
                    continue;
                }
            };
            if row.get(0).is_none_or(str::is_empty) {
                warn!(
                    "{}:{}: row without congestion control skipped",
                    path.display(),
                    line
                );
                continue;
            }
            match row.deserialize::<ResultRecord>(Some(&headers)) {
                Ok(record) => records.push(record),
                Err(e) => warn!("{}:{}: malformed row skipped: {}", path.display(), line, e),
            }
        }
        Ok(records)
    }
}
