//! Source file access and row parsing.
//!
//! Opens plain or gzip-compressed delimited files and turns each row into a
//! [`RawRecord`] using a [`ColumnMapping`] resolved against the header.

use csv::{ByteRecord, ByteRecordsIntoIter, ReaderBuilder};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::config::{ColumnMapping, ColumnRef};
use crate::error::{PipelineError, RecordError, Result};
use crate::key::RawKey;
use crate::pipeline::datasets::{DatasetSchema, FieldSpec, KeySource};
use crate::pipeline::types::RawRecord;

/// Opens `path` for reading, decompressing when it ends in `.gz`.
///
/// # Errors
///
/// Returns [`PipelineError::SourceUnavailable`] when the file is missing or
/// unreadable.
pub fn open_source(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|source| PipelineError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    let gzipped = path.extension().and_then(|e| e.to_str()) == Some("gz");
    debug!(path = %path.display(), gzipped, "Opened source");
    if gzipped {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

enum KeyColumns {
    Single(usize),
    StateCounty { state: usize, county: usize },
}

/// Lazily yields one parsed record per data row.
///
/// Only mapped cells are decoded, so text in other columns may use any
/// encoding. An I/O failure ends iteration and is returned by
/// [`RecordReader::finish`].
pub struct RecordReader<R: Read> {
    rows: ByteRecordsIntoIter<R>,
    origin: PathBuf,
    key: KeyColumns,
    fields: Vec<(FieldSpec, usize)>,
    failure: Option<std::io::Error>,
}

impl RecordReader<Box<dyn Read>> {
    #[tracing::instrument(skip_all, fields(dataset = schema.name, path = %path.display()))]
    pub fn open(path: &Path, schema: &DatasetSchema, mapping: &ColumnMapping) -> Result<Self> {
        let reader = open_source(path)?;
        let reader = Self::from_reader(reader, path, schema, mapping)?;
        info!("Reading source");
        Ok(reader)
    }
}

impl<R: Read> RecordReader<R> {
    /// `origin` is only used in error messages.
    pub fn from_reader(
        reader: R,
        origin: &Path,
        schema: &DatasetSchema,
        mapping: &ColumnMapping,
    ) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr
            .byte_headers()
            .map_err(|source| PipelineError::Csv {
                path: origin.to_path_buf(),
                source,
            })?
            .clone();

        let resolve = |field: &str| -> Result<usize> {
            let column = mapping
                .get(field)
                .ok_or_else(|| PipelineError::MissingMapping {
                    dataset: schema.name.to_string(),
                    field: field.to_string(),
                })?;
            resolve_column(&headers, column).ok_or_else(|| PipelineError::UnknownColumn {
                path: origin.to_path_buf(),
                column: column.to_string(),
            })
        };

        let key = match &schema.key {
            KeySource::Single(field) => KeyColumns::Single(resolve(*field)?),
            KeySource::StateCounty { state, county } => KeyColumns::StateCounty {
                state: resolve(*state)?,
                county: resolve(*county)?,
            },
        };
        let fields = schema
            .fields
            .iter()
            .map(|spec| Ok((spec.clone(), resolve(spec.name)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rows: rdr.into_byte_records(),
            origin: origin.to_path_buf(),
            key,
            fields,
            failure: None,
        })
    }

    /// Reports whether the source was read to its end.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SourceUnavailable`] when reading stopped on
    /// an I/O failure, such as a truncated or corrupt gzip stream.
    pub fn finish(self) -> Result<()> {
        match self.failure {
            Some(source) => Err(PipelineError::SourceUnavailable {
                path: self.origin,
                source,
            }),
            None => Ok(()),
        }
    }

    fn parse(&self, row: &ByteRecord) -> std::result::Result<RawRecord, RecordError> {
        let key = match self.key {
            KeyColumns::Single(idx) => RawKey::Code(cell(row, idx, "key")?.to_string()),
            KeyColumns::StateCounty { state, county } => RawKey::StateCounty {
                state: cell(row, state, "state")?.to_string(),
                county: cell(row, county, "county")?.to_string(),
            },
        };
        let values = self
            .fields
            .iter()
            .map(|(spec, idx)| parse_value(spec, cell(row, *idx, spec.name)?))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(RawRecord { key, values })
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = std::result::Result<RawRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failure.is_some() {
            return None;
        }
        match self.rows.next()? {
            Ok(row) => Some(self.parse(&row)),
            Err(e) if e.is_io_error() => {
                error!(path = %self.origin.display(), error = %e, "Source read failed");
                if let csv::ErrorKind::Io(source) = e.into_kind() {
                    self.failure = Some(source);
                }
                None
            }
            Err(e) => Some(Err(RecordError::from(e))),
        }
    }
}

fn resolve_column(headers: &ByteRecord, column: &ColumnRef) -> Option<usize> {
    match column {
        ColumnRef::Index(idx) if *idx < headers.len() => Some(*idx),
        ColumnRef::Index(_) => None,
        ColumnRef::Name(name) => headers
            .iter()
            .position(|h| String::from_utf8_lossy(h).trim() == name),
    }
}

fn cell<'r>(
    row: &'r ByteRecord,
    idx: usize,
    field: &str,
) -> std::result::Result<&'r str, RecordError> {
    let bytes = row.get(idx).ok_or_else(|| RecordError::MissingValue {
        field: field.to_string(),
    })?;
    let value = std::str::from_utf8(bytes)
        .map_err(|_| RecordError::InvalidEncoding {
            field: field.to_string(),
            raw: String::from_utf8_lossy(bytes).into_owned(),
        })?
        .trim();
    if value.is_empty() {
        return Err(RecordError::MissingValue {
            field: field.to_string(),
        });
    }
    Ok(value)
}

/// Parses one numeric cell, treating `NA`/`NaN` as missing and enforcing
/// the field's bounds.
pub fn parse_value(spec: &FieldSpec, raw: &str) -> std::result::Result<f64, RecordError> {
    if is_missing_marker(raw) {
        return Err(RecordError::MissingValue {
            field: spec.name.to_string(),
        });
    }
    let value: f64 = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| RecordError::InvalidNumber {
            field: spec.name.to_string(),
            raw: raw.to_string(),
        })?;

    let min = spec.min.unwrap_or(f64::NEG_INFINITY);
    let max = spec.max.unwrap_or(f64::INFINITY);
    if value < min || value > max {
        return Err(RecordError::OutOfRange {
            field: spec.name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(value)
}

pub fn is_missing_marker(raw: &str) -> bool {
    let raw = raw.trim();
    raw.is_empty() || raw.eq_ignore_ascii_case("nan") || raw.eq_ignore_ascii_case("na")
}
