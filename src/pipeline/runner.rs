use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{JoinPolicy, PipelineConfig};
use crate::correlate::{CorrelationReport, CorrelationReporter, Spearman};
use crate::error::{PipelineError, RecordError, Result};
use crate::key::KeyNormalizer;
use crate::output::{append_report, read_table, write_table};
use crate::pipeline::aggregate::Aggregator;
use crate::pipeline::datasets::{DatasetKind, DatasetSchema, KEY_COLUMN};
use crate::pipeline::merge::{MergeReport, TableMerger};
use crate::pipeline::ratio::RatioDeriver;
use crate::pipeline::types::{AggregatedTable, DataQuality, MergedTable, RawRecord};
use crate::source::RecordReader;

/// Aggregates `records` under `schema` and computes its derived fields.
pub fn aggregate_records<I>(
    schema: &DatasetSchema,
    normalizer: KeyNormalizer,
    records: I,
) -> Result<AggregatedTable>
where
    I: IntoIterator<Item = std::result::Result<RawRecord, RecordError>>,
{
    let mut aggregator = Aggregator::new(normalizer, schema.field_names());
    aggregator.extend(records);
    RatioDeriver::new(schema.derived.clone()).derive(aggregator.finish())
}

/// Fails when a source skipped more rows than the configured limit allows.
pub fn check_skip_rate(dataset: &str, quality: &DataQuality, max: Option<f64>) -> Result<()> {
    let Some(max) = max else {
        return Ok(());
    };
    let rate = quality.skip_rate();
    if rate > max {
        return Err(PipelineError::SkipRateExceeded {
            dataset: dataset.to_string(),
            rate,
            max,
        });
    }
    Ok(())
}

/// Reads, aggregates and derives one dataset, then writes its table.
#[tracing::instrument(skip(config))]
pub fn run_dataset(config: &PipelineConfig, kind: DatasetKind) -> Result<(AggregatedTable, PathBuf)> {
    let schema = DatasetSchema::for_kind(kind);
    let source = config.source_path(&schema)?;
    let mapping = config.column_mapping(&schema);

    let mut records = RecordReader::open(&source, &schema, &mapping)?;
    let table = aggregate_records(&schema, config.normalizer(&schema), records.by_ref())?;
    records.finish()?;
    check_skip_rate(schema.name, &table.quality, config.max_skip_rate)?;

    let output = config.output_path(&schema)?;
    write_table(&output, &table.to_table(KEY_COLUMN), &config.merge_normalizer())?;
    info!(
        counties = table.len(),
        output = %output.display(),
        "Dataset aggregated"
    );
    Ok((table, output))
}

/// Loads two persisted tables and joins them on the renormalized key.
#[tracing::instrument(skip_all, fields(primary = %primary.display(), secondary = %secondary.display()))]
pub fn merge_files(
    config: &PipelineConfig,
    primary: &Path,
    secondary: &Path,
    policy: JoinPolicy,
) -> Result<(MergedTable, MergeReport)> {
    let left = read_table(primary, Some(KEY_COLUMN))?;
    let right = read_table(secondary, Some(KEY_COLUMN))?;

    let merger = TableMerger::new(config.merge_normalizer(), policy)
        .drop_missing(config.merge.drop_missing)
        .with_renames(config.merge.column_renames.clone());
    let (merged, report) = merger.merge(&left, &right)?;

    if report.malformed_keys > 0 || report.duplicate_keys > 0 {
        warn!(
            malformed = report.malformed_keys,
            duplicates = report.duplicate_keys,
            "Keys skipped during merge"
        );
    }
    Ok((merged, report))
}

/// Correlates two columns of a persisted table, optionally appending the
/// result to a report file.
pub fn correlate_file(
    input: &Path,
    x: &str,
    y: &str,
    report_path: Option<&Path>,
) -> Result<CorrelationReport> {
    let table = read_table(input, Some(KEY_COLUMN))?;
    let report = CorrelationReporter::new(Spearman).report(&table, x, y)?;
    if let Some(path) = report_path {
        append_report(path, &report)?;
    }
    Ok(report)
}

/// Census and mobility aggregation, merge, and correlation in one pass.
#[tracing::instrument(skip(config))]
pub fn run_all(config: &PipelineConfig) -> Result<CorrelationReport> {
    let (_, census) = run_dataset(config, DatasetKind::Census)?;
    let (_, mobility) = run_dataset(config, DatasetKind::Mobility)?;

    let (merged, _) = merge_files(config, &census, &mobility, config.merge.join_policy)?;
    let merged_path = config.merge_output_path()?;
    write_table(&merged_path, &merged.to_table(), &config.merge_normalizer())?;

    let report_path = config.report_path()?;
    correlate_file(
        &merged_path,
        &config.merge.correlate_x,
        &config.merge.correlate_y,
        Some(&report_path),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyMode, RawKey};
    use std::env;
    use std::fs;

    #[test]
    fn test_census_scenario() {
        let schema = DatasetSchema::census();
        let rows = [
            ("01", "001", 10.0, 5.0),
            ("01", "001", 0.0, 5.0),
            ("01", "002", 4.0, 4.0),
        ];
        let records = rows.iter().map(|(state, county, males, females)| {
            Ok(RawRecord {
                key: RawKey::StateCounty {
                    state: state.to_string(),
                    county: county.to_string(),
                },
                values: vec![*males, *females],
            })
        });
        let table = aggregate_records(&schema, KeyNormalizer::county(), records).unwrap();

        assert_eq!(table.sum("01001", "males"), Some(10.0));
        assert_eq!(table.sum("01001", "females"), Some(10.0));
        assert_eq!(table.sum("01002", "males"), Some(4.0));
        assert_eq!(table.derived("01001", "prop_male"), Some(0.5));
        assert_eq!(table.derived("01002", "prop_male"), Some(0.5));
    }

    #[test]
    fn test_mobility_scenario() {
        let schema = DatasetSchema::mobility();
        let records = vec![
            Ok(RawRecord {
                key: RawKey::Code("010010001001".into()),
                values: vec![100.0, 20.0],
            }),
            Ok(RawRecord {
                key: RawKey::Code("010010001002".into()),
                values: vec![50.0, 10.0],
            }),
        ];
        let normalizer = KeyNormalizer::new(5, KeyMode::Truncate);
        let table = aggregate_records(&schema, normalizer, records).unwrap();

        assert_eq!(table.sum("01001", "device_count"), Some(150.0));
        assert_eq!(table.sum("01001", "completely_home_device_count"), Some(30.0));
        assert_eq!(table.derived("01001", "proportion_stayed_at_home"), Some(0.2));
    }

    #[test]
    fn test_zero_deaths_is_missing() {
        let schema = DatasetSchema::deaths();
        let records = vec![Ok(RawRecord {
            key: RawKey::Code("1001".into()),
            values: vec![0.0, 0.0],
        })];
        let table = aggregate_records(&schema, KeyNormalizer::county(), records).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.derived("01001", "proportion_male_deaths"), None);
    }

    #[test]
    fn test_health_mean_skips_out_of_range_and_missing() {
        let schema = DatasetSchema::health();
        let records = RecordReader::from_reader(
            "county_fips,general_health\n1001,3\n1001,5\n1001,9\n1001,NA\n".as_bytes(),
            Path::new("health.csv"),
            &schema,
            &schema.default_columns(),
        )
        .unwrap();
        let table = aggregate_records(&schema, KeyNormalizer::county(), records).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.derived("01001", "mean_health_status"), Some(4.0));
        assert_eq!(table.quality.accepted, 2);
        assert_eq!(table.quality.skipped, 2);
    }

    #[test]
    fn test_run_dataset_fails_on_truncated_source() {
        let dir = env::temp_dir().join("county_stats_test_runner_truncated");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let mut csv = String::from("county_fips,male_deaths,female_deaths\n");
        for i in 0..20_000u32 {
            csv.push_str(&format!("{},{},{}\n", 1001 + (i % 3000), i % 17, i % 23));
        }
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, csv.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        fs::write(dir.join("deaths.csv.gz"), &compressed[..compressed.len() / 2]).unwrap();

        let mut config = PipelineConfig {
            data_dir: dir.clone(),
            ..Default::default()
        };
        config.deaths.source_file_path = Some("deaths.csv.gz".into());

        assert!(matches!(
            run_dataset(&config, DatasetKind::Deaths),
            Err(PipelineError::SourceUnavailable { .. })
        ));
        assert!(!dir.join("covid_deaths_gender_by_county.csv").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_check_skip_rate() {
        let quality = DataQuality {
            accepted: 9,
            skipped: 1,
            last_error: None,
        };
        assert!(check_skip_rate("census", &quality, None).is_ok());
        assert!(check_skip_rate("census", &quality, Some(0.1)).is_ok());
        assert!(matches!(
            check_skip_rate("census", &quality, Some(0.05)),
            Err(PipelineError::SkipRateExceeded { .. })
        ));
    }
}
