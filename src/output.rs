//! Flat-file persistence for aggregated and merged tables, and for
//! correlation reports.
//!
//! Missing values are written as empty cells; `NaN`/`NA` cells and
//! unparseable numbers load back as missing.

use csv::{ReaderBuilder, WriterBuilder};
use std::fs::{self, OpenOptions};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::correlate::CorrelationReport;
use crate::error::{PipelineError, Result};
use crate::key::KeyNormalizer;
use crate::pipeline::types::{Table, TableRow};
use crate::source::{is_missing_marker, open_source};

/// Logs a correlation report using Rust's debug pretty-print format.
pub fn print_pretty(report: &CorrelationReport) {
    debug!("{:#?}", report);
}

/// Logs a correlation report as pretty-printed JSON.
pub fn print_json(report: &CorrelationReport) -> anyhow::Result<()> {
    info!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> PipelineError + '_ {
    move |source| PipelineError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `table` with its key column first, replacing any existing file.
///
/// Keys are padded with `normalizer` before anything is written; a key that
/// cannot be padded fails with [`PipelineError::InvalidKey`].
#[tracing::instrument(skip_all, fields(path = %path.display(), rows = table.rows.len()))]
pub fn write_table(path: &Path, table: &Table, normalizer: &KeyNormalizer) -> Result<()> {
    let keys = table
        .rows
        .iter()
        .map(|row| normalizer.pad(&row.key))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|source| PipelineError::InvalidKey {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(path))?;
    }
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .map_err(csv_error(path))?;

    let header = std::iter::once(table.key_column.as_str())
        .chain(table.columns.iter().map(String::as_str));
    writer.write_record(header).map_err(csv_error(path))?;

    for (row, key) in table.rows.iter().zip(keys) {
        let mut record = Vec::with_capacity(table.columns.len() + 1);
        record.push(key.to_string());
        for idx in 0..table.columns.len() {
            record.push(format_value(row.values.get(idx).copied().flatten()));
        }
        writer.write_record(&record).map_err(csv_error(path))?;
    }
    writer.flush().map_err(io_error(path))?;

    info!("Table written");
    Ok(())
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => v.to_string(),
        _ => String::new(),
    }
}

/// Loads a persisted table. The key column is `key_column` when given,
/// otherwise the first column; keys are kept exactly as written.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn read_table(path: &Path, key_column: Option<&str>) -> Result<Table> {
    let reader = open_source(path)?;
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers().map_err(csv_error(path))?.clone();

    let key_idx = match key_column {
        Some(name) => headers.iter().position(|h| h.trim() == name),
        None => (!headers.is_empty()).then_some(0),
    }
    .ok_or_else(|| PipelineError::MissingKeyColumn {
        path: path.to_path_buf(),
    })?;

    let value_idx: Vec<usize> = (0..headers.len()).filter(|&i| i != key_idx).collect();
    let mut table = Table {
        key_column: headers[key_idx].trim().to_string(),
        columns: value_idx
            .iter()
            .map(|&i| headers[i].trim().to_string())
            .collect(),
        rows: Vec::new(),
    };

    let mut unparseable = 0usize;
    for record in rdr.records() {
        let record = record.map_err(csv_error(path))?;
        let key = record.get(key_idx).unwrap_or("").trim().to_string();
        let values = value_idx
            .iter()
            .map(|&i| {
                let raw = record.get(i).unwrap_or("");
                if is_missing_marker(raw) {
                    return None;
                }
                let parsed = raw.trim().parse::<f64>().ok();
                if parsed.is_none() {
                    unparseable += 1;
                }
                parsed
            })
            .collect();
        table.rows.push(TableRow { key, values });
    }

    if unparseable > 0 {
        warn!(unparseable, "Unparseable cells loaded as missing");
    }
    info!(rows = table.rows.len(), "Table loaded");
    Ok(table)
}

/// Appends a [`CorrelationReport`] as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_report(path: &Path, report: &CorrelationReport) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(io_error(path))?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // header only on a fresh file
        .from_writer(file);

    writer.serialize(report).map_err(csv_error(path))?;
    writer.flush().map_err(io_error(path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::env;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    fn report() -> CorrelationReport {
        CorrelationReport {
            generated_at: Utc::now(),
            x: "proportion_male".into(),
            y: "proportion_stayed_at_home".into(),
            coefficient: -0.25,
            p_value: 0.01,
            sample_size: 120,
        }
    }

    fn table() -> Table {
        Table {
            key_column: "county_fips".into(),
            columns: vec!["prop_male".into()],
            rows: vec![
                TableRow {
                    key: "01001".into(),
                    values: vec![Some(0.5)],
                },
                TableRow {
                    key: "1003".into(),
                    values: vec![None],
                },
            ],
        }
    }

    #[test]
    fn test_print_pretty_does_not_panic() {
        print_pretty(&report());
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&report()).unwrap();
    }

    #[test]
    fn test_write_table_pads_and_blanks_missing() {
        let path = temp_path("county_stats_test_write.csv");
        let _ = fs::remove_file(&path);

        write_table(&path, &table(), &KeyNormalizer::county()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "county_fips,prop_male\n01001,0.5\n01003,\n");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_table_rejects_malformed_key() {
        let path = temp_path("county_stats_test_write_bad_key.csv");
        let _ = fs::remove_file(&path);

        let mut bad = table();
        bad.rows[1].key = "10O3".into();
        assert!(matches!(
            write_table(&path, &bad, &KeyNormalizer::county()),
            Err(PipelineError::InvalidKey { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_read_then_write_repads_keys() {
        let path = temp_path("county_stats_test_repad.csv");
        fs::write(&path, "county_fips,p\n1001,0.5\n").unwrap();

        let table = read_table(&path, None).unwrap();
        write_table(&path, &table, &KeyNormalizer::county()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "county_fips,p\n01001,0.5\n");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_table_keeps_raw_keys() {
        let path = temp_path("county_stats_test_read.csv");
        fs::write(
            &path,
            "county_fips,proportion_stayed_at_home\n1001,0.2\n01003,NaN\n1005,oops\n",
        )
        .unwrap();

        let table = read_table(&path, None).unwrap();
        assert_eq!(table.key_column, "county_fips");
        assert_eq!(table.columns, vec!["proportion_stayed_at_home"]);
        assert_eq!(table.rows[0].key, "1001");
        assert_eq!(table.rows[0].values, vec![Some(0.2)]);
        assert_eq!(table.rows[1].values, vec![None]);
        assert_eq!(table.rows[2].values, vec![None]);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_table_named_key_column() {
        let path = temp_path("county_stats_test_read_named.csv");
        fs::write(&path, "prop_male,county_fips\n0.5,01001\n").unwrap();

        let table = read_table(&path, Some("county_fips")).unwrap();
        assert_eq!(table.columns, vec!["prop_male"]);
        assert_eq!(table.rows[0].key, "01001");
        assert!(matches!(
            read_table(&path, Some("fips")),
            Err(PipelineError::MissingKeyColumn { .. })
        ));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_report_writes_header_once() {
        let path = temp_path("county_stats_test_report.csv");
        let _ = fs::remove_file(&path);

        append_report(&path, &report()).unwrap();
        append_report(&path, &report()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let header_count = content.lines().filter(|l| l.contains("generated_at")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 3);

        fs::remove_file(&path).unwrap();
    }
}
