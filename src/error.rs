//! Error taxonomy for the county pipeline.
//!
//! [`RecordError`] covers a single source row and is absorbed by the
//! aggregator (skip + count). [`PipelineError`] covers a whole file or the
//! configuration and terminates the run.

use std::path::PathBuf;
use thiserror::Error;

/// Why a single source row could not be used.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed geographic key '{raw}': {reason}")]
    MalformedKey { raw: String, reason: &'static str },

    #[error("missing value for field '{field}'")]
    MissingValue { field: String },

    #[error("invalid number '{raw}' for field '{field}'")]
    InvalidNumber { field: String, raw: String },

    #[error("value {value} for field '{field}' outside {min}..={max}")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("field '{field}' is not valid UTF-8: '{raw}'")]
    InvalidEncoding { field: String, raw: String },

    #[error("unreadable row: {0}")]
    Csv(#[from] csv::Error),
}

/// Fatal, file-level or configuration failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source unavailable: {}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("column '{column}' not found in {}", path.display())]
    UnknownColumn { path: PathBuf, column: String },

    #[error("no column mapping for field '{field}' in dataset '{dataset}'")]
    MissingMapping { dataset: String, field: String },

    #[error("key column missing from {}", path.display())]
    MissingKeyColumn { path: PathBuf },

    #[error("invalid key in {}", path.display())]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: RecordError,
    },

    #[error("column '{0}' appears in both tables")]
    DuplicateColumn(String),

    #[error("csv error in {}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("i/o error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{dataset}: skipped {rate:.3} of rows, above the limit of {max:.3}")]
    SkipRateExceeded { dataset: String, rate: f64, max: f64 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
