//! Run configuration.
//!
//! Stored as a JSON document; every field is optional and falls back to the
//! built-in dataset defaults:
//! ```json
//! {
//!   "data_dir": "data",
//!   "date_suffix": "2020-04-23",
//!   "mobility": {
//!     "source_file_path": "safegraph/{date}-social-distancing.csv.gz",
//!     "column_mapping": { "device_count": "device_count" }
//!   },
//!   "merge": { "join_policy": "left-with-missing", "drop_missing": false }
//! }
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::key::{COUNTY_KEY_WIDTH, KeyMode, KeyNormalizer};
use crate::pipeline::datasets::{DatasetKind, DatasetSchema};

/// Placeholder in source/output paths replaced by the run date.
pub const DATE_PLACEHOLDER: &str = "{date}";

/// A source column, by header name or 0-based position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRef::Index(i) => write!(f, "#{i}"),
            ColumnRef::Name(name) => f.write_str(name),
        }
    }
}

/// Semantic field name -> source column.
pub type ColumnMapping = BTreeMap<String, ColumnRef>;

/// How keys present in only one table are handled by a merge.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Keep keys present in both tables.
    #[default]
    Inner,
    /// Keep every primary key; absent secondary fields are missing.
    LeftWithMissing,
}

/// Per-dataset overrides of the built-in schema defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub source_file_path: Option<String>,
    pub output_file_path: Option<String>,
    pub key_mode: Option<KeyMode>,
    pub source_width: Option<usize>,
    pub column_mapping: ColumnMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub join_policy: JoinPolicy,
    pub drop_missing: bool,
    pub column_renames: BTreeMap<String, String>,
    pub correlate_x: String,
    pub correlate_y: String,
    pub output_file_path: String,
    pub report_file_path: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            join_policy: JoinPolicy::Inner,
            drop_missing: true,
            column_renames: BTreeMap::from([("prop_male".to_string(), "proportion_male".to_string())]),
            correlate_x: "proportion_male".to_string(),
            correlate_y: "proportion_stayed_at_home".to_string(),
            output_file_path: "census_and_safegraph_data_merged.csv".to_string(),
            report_file_path: "correlation_report.csv".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub date_suffix: Option<NaiveDate>,
    pub key_width: usize,
    /// Largest tolerated share of skipped rows per source; checked by the
    /// runner, not the aggregator.
    pub max_skip_rate: Option<f64>,
    pub census: DatasetConfig,
    pub mobility: DatasetConfig,
    pub health: DatasetConfig,
    pub deaths: DatasetConfig,
    pub merge: MergeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            date_suffix: None,
            key_width: COUNTY_KEY_WIDTH,
            max_skip_rate: None,
            census: DatasetConfig::default(),
            mobility: DatasetConfig::default(),
            health: DatasetConfig::default(),
            deaths: DatasetConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_width == 0 {
            return Err(PipelineError::Config("key_width must be positive".into()));
        }
        if let Some(rate) = self.max_skip_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(PipelineError::Config(format!(
                    "max_skip_rate {rate} outside 0..=1"
                )));
            }
        }
        Ok(())
    }

    pub fn dataset(&self, kind: DatasetKind) -> &DatasetConfig {
        match kind {
            DatasetKind::Census => &self.census,
            DatasetKind::Mobility => &self.mobility,
            DatasetKind::Health => &self.health,
            DatasetKind::Deaths => &self.deaths,
        }
    }

    pub fn dataset_mut(&mut self, kind: DatasetKind) -> &mut DatasetConfig {
        match kind {
            DatasetKind::Census => &mut self.census,
            DatasetKind::Mobility => &mut self.mobility,
            DatasetKind::Health => &mut self.health,
            DatasetKind::Deaths => &mut self.deaths,
        }
    }

    pub fn source_path(&self, schema: &DatasetSchema) -> Result<PathBuf> {
        let configured = self.dataset(schema.kind).source_file_path.as_deref();
        self.resolve_path(configured.unwrap_or(schema.default_source))
    }

    pub fn output_path(&self, schema: &DatasetSchema) -> Result<PathBuf> {
        let configured = self.dataset(schema.kind).output_file_path.as_deref();
        self.resolve_path(configured.unwrap_or(schema.default_output))
    }

    pub fn merge_output_path(&self) -> Result<PathBuf> {
        self.resolve_path(&self.merge.output_file_path)
    }

    pub fn report_path(&self) -> Result<PathBuf> {
        self.resolve_path(&self.merge.report_file_path)
    }

    pub fn normalizer(&self, schema: &DatasetSchema) -> KeyNormalizer {
        let dataset = self.dataset(schema.kind);
        let mode = dataset.key_mode.unwrap_or(schema.default_mode);
        KeyNormalizer::new(self.key_width, mode)
            .with_source_width(dataset.source_width.or(schema.default_source_width))
    }

    /// Normalizer applied to persisted keys before a merge.
    pub fn merge_normalizer(&self) -> KeyNormalizer {
        KeyNormalizer::new(self.key_width, KeyMode::Pad)
    }

    /// Schema default columns with configured overrides applied.
    pub fn column_mapping(&self, schema: &DatasetSchema) -> ColumnMapping {
        let mut mapping = schema.default_columns();
        for (field, column) in &self.dataset(schema.kind).column_mapping {
            mapping.insert(field.clone(), column.clone());
        }
        mapping
    }

    /// Joins `raw` onto `data_dir` and fills in the run date.
    fn resolve_path(&self, raw: &str) -> Result<PathBuf> {
        let resolved = if raw.contains(DATE_PLACEHOLDER) {
            let date = self.date_suffix.ok_or_else(|| {
                PipelineError::Config(format!("'{raw}' needs a date but none was configured"))
            })?;
            raw.replace(DATE_PLACEHOLDER, &date.format("%Y-%m-%d").to_string())
        } else {
            raw.to_string()
        };
        Ok(self.data_dir.join(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = PipelineConfig::default();
        let census = DatasetSchema::for_kind(DatasetKind::Census);
        assert_eq!(
            config.source_path(&census).unwrap(),
            PathBuf::from("data/census-2018-pop.csv")
        );
        assert_eq!(config.merge.join_policy, JoinPolicy::Inner);
        assert_eq!(config.normalizer(&census).width(), 5);
    }

    #[test]
    fn test_date_placeholder_requires_date() {
        let mut config = PipelineConfig::default();
        let mobility = DatasetSchema::for_kind(DatasetKind::Mobility);
        assert!(matches!(
            config.source_path(&mobility),
            Err(PipelineError::Config(_))
        ));

        config.date_suffix = NaiveDate::from_ymd_opt(2020, 4, 23);
        assert_eq!(
            config.source_path(&mobility).unwrap(),
            PathBuf::from("data/safegraph/2020-04-23-social-distancing.csv")
        );
    }

    #[test]
    fn test_parse_json_overrides() {
        let json = r#"{
            "date_suffix": "2020-04-24",
            "max_skip_rate": 0.1,
            "census": { "column_mapping": { "males": "TOT_MALE", "state": 0 } },
            "mobility": { "key_mode": "truncate", "source_width": 12 },
            "merge": { "join_policy": "left-with-missing", "drop_missing": false }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.date_suffix, NaiveDate::from_ymd_opt(2020, 4, 24));
        assert_eq!(config.merge.join_policy, JoinPolicy::LeftWithMissing);
        assert!(!config.merge.drop_missing);
        assert_eq!(config.merge.correlate_x, "proportion_male");

        let mapping = config.column_mapping(&DatasetSchema::for_kind(DatasetKind::Census));
        assert_eq!(mapping["males"], ColumnRef::Name("TOT_MALE".into()));
        assert_eq!(mapping["state"], ColumnRef::Index(0));
        assert_eq!(mapping["females"], ColumnRef::Index(9));
    }

    #[test]
    fn test_validate_rejects_bad_skip_rate() {
        let config = PipelineConfig {
            max_skip_rate: Some(1.5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
