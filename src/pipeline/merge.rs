use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::JoinPolicy;
use crate::error::{PipelineError, Result};
use crate::key::{GeoKey, KeyNormalizer};
use crate::pipeline::types::{MergedRow, MergedTable, Table};

/// Counts describing how two tables lined up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub primary_rows: usize,
    pub secondary_rows: usize,
    pub matched: usize,
    pub primary_only: usize,
    pub secondary_only: usize,
    pub dropped_missing: usize,
    pub malformed_keys: usize,
    pub duplicate_keys: usize,
}

/// Key-aligned join of two flat tables.
///
/// Keys on both sides are renormalized with the same normalizer right
/// before comparison, so a key persisted as `1001` matches `01001`.
#[derive(Debug, Clone)]
pub struct TableMerger {
    normalizer: KeyNormalizer,
    policy: JoinPolicy,
    drop_missing: bool,
    renames: BTreeMap<String, String>,
}

impl TableMerger {
    pub fn new(normalizer: KeyNormalizer, policy: JoinPolicy) -> Self {
        Self {
            normalizer,
            policy,
            drop_missing: false,
            renames: BTreeMap::new(),
        }
    }

    /// Drop merged rows where any field is missing.
    pub fn drop_missing(mut self, drop_missing: bool) -> Self {
        self.drop_missing = drop_missing;
        self
    }

    pub fn with_renames(mut self, renames: BTreeMap<String, String>) -> Self {
        self.renames = renames;
        self
    }

    #[tracing::instrument(skip_all, fields(policy = ?self.policy, drop_missing = self.drop_missing))]
    pub fn merge(&self, primary: &Table, secondary: &Table) -> Result<(MergedTable, MergeReport)> {
        let columns = self.merged_columns(primary, secondary)?;
        let mut report = MergeReport {
            primary_rows: primary.rows.len(),
            secondary_rows: secondary.rows.len(),
            ..Default::default()
        };

        let left = self.index(primary, &mut report);
        let right = self.index(secondary, &mut report);
        let secondary_width = secondary.columns.len();

        let mut rows = Vec::with_capacity(left.len());
        for (key, values) in &left {
            let matched = right.get(key);
            let secondary_values = match (matched, self.policy) {
                (Some(values), _) => {
                    report.matched += 1;
                    padded(values, secondary_width)
                }
                (None, JoinPolicy::Inner) => {
                    report.primary_only += 1;
                    continue;
                }
                (None, JoinPolicy::LeftWithMissing) => {
                    report.primary_only += 1;
                    vec![None; secondary_width]
                }
            };

            let mut merged = padded(values, primary.columns.len());
            merged.extend(secondary_values);

            if self.drop_missing && merged.iter().any(Option::is_none) {
                debug!(key = %key, "Dropping row with missing field");
                report.dropped_missing += 1;
                continue;
            }
            rows.push(MergedRow {
                key: key.clone(),
                values: merged,
            });
        }
        report.secondary_only = right.keys().filter(|k| !left.contains_key(*k)).count();

        info!(
            rows = rows.len(),
            matched = report.matched,
            primary_only = report.primary_only,
            secondary_only = report.secondary_only,
            dropped_missing = report.dropped_missing,
            "Merge complete"
        );

        Ok((
            MergedTable {
                key_column: primary.key_column.clone(),
                columns,
                rows,
            },
            report,
        ))
    }

    fn merged_columns(&self, primary: &Table, secondary: &Table) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for column in primary.columns.iter().chain(&secondary.columns) {
            let name = self.renames.get(column).unwrap_or(column).clone();
            if name == primary.key_column || !seen.insert(name.clone()) {
                return Err(PipelineError::DuplicateColumn(name));
            }
            columns.push(name);
        }
        Ok(columns)
    }

    /// Renormalizes keys; malformed and repeated keys are skipped and counted.
    fn index<'t>(
        &self,
        table: &'t Table,
        report: &mut MergeReport,
    ) -> BTreeMap<GeoKey, &'t [Option<f64>]> {
        let mut index = BTreeMap::new();
        for row in &table.rows {
            let key = match self.normalizer.pad(&row.key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Skipping row with malformed key");
                    report.malformed_keys += 1;
                    continue;
                }
            };
            if index.contains_key(&key) {
                warn!(key = %key, raw = %row.key, "Duplicate key after normalization, keeping first");
                report.duplicate_keys += 1;
                continue;
            }
            index.insert(key, row.values.as_slice());
        }
        index
    }
}

fn padded(values: &[Option<f64>], width: usize) -> Vec<Option<f64>> {
    let mut out: Vec<Option<f64>> = values.iter().take(width).copied().collect();
    out.resize(width, None);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::TableRow;

    fn table(key_column: &str, column: &str, rows: &[(&str, Option<f64>)]) -> Table {
        Table {
            key_column: key_column.to_string(),
            columns: vec![column.to_string()],
            rows: rows
                .iter()
                .map(|(key, value)| TableRow {
                    key: key.to_string(),
                    values: vec![*value],
                })
                .collect(),
        }
    }

    fn census() -> Table {
        table(
            "county_fips",
            "proportion_male",
            &[("01001", Some(0.5)), ("01002", Some(0.5)), ("01003", Some(0.4))],
        )
    }

    fn mobility() -> Table {
        table(
            "county_fips",
            "proportion_stayed_at_home",
            &[("01001", Some(0.2)), ("01002", None), ("02013", Some(0.3))],
        )
    }

    #[test]
    fn test_inner_keeps_intersection() {
        let merger = TableMerger::new(KeyNormalizer::county(), JoinPolicy::Inner);
        let (merged, report) = merger.merge(&census(), &mobility()).unwrap();

        assert_eq!(merged.keys(), vec!["01001", "01002"]);
        assert_eq!(merged.columns, vec!["proportion_male", "proportion_stayed_at_home"]);
        assert_eq!(merged.value("01001", "proportion_stayed_at_home"), Some(0.2));
        assert_eq!(report.matched, 2);
        assert_eq!(report.primary_only, 1);
        assert_eq!(report.secondary_only, 1);
    }

    #[test]
    fn test_left_with_missing_keeps_primary_keys() {
        let merger = TableMerger::new(KeyNormalizer::county(), JoinPolicy::LeftWithMissing);
        let (merged, _) = merger.merge(&census(), &mobility()).unwrap();

        assert_eq!(merged.keys(), vec!["01001", "01002", "01003"]);
        assert_eq!(merged.value("01003", "proportion_male"), Some(0.4));
        assert_eq!(merged.value("01003", "proportion_stayed_at_home"), None);
    }

    #[test]
    fn test_drop_missing_removes_incomplete_rows() {
        let merger = TableMerger::new(KeyNormalizer::county(), JoinPolicy::LeftWithMissing)
            .drop_missing(true);
        let (merged, report) = merger.merge(&census(), &mobility()).unwrap();

        assert_eq!(merged.keys(), vec!["01001"]);
        assert_eq!(report.dropped_missing, 2);
    }

    #[test]
    fn test_unpadded_persisted_keys_match_padded() {
        let reloaded = table(
            "county_fips",
            "proportion_stayed_at_home",
            &[("1001", Some(0.2)), ("1003", Some(0.1))],
        );
        let merger = TableMerger::new(KeyNormalizer::county(), JoinPolicy::Inner);
        let (merged, report) = merger.merge(&census(), &reloaded).unwrap();

        assert_eq!(merged.keys(), vec!["01001", "01003"]);
        assert_eq!(merged.value("01003", "proportion_stayed_at_home"), Some(0.1));
        assert_eq!(report.secondary_only, 0);
    }

    #[test]
    fn test_malformed_and_duplicate_keys_counted() {
        let secondary = table(
            "county_fips",
            "proportion_stayed_at_home",
            &[("1001", Some(0.2)), ("01001", Some(0.9)), ("XX", Some(0.1))],
        );
        let merger = TableMerger::new(KeyNormalizer::county(), JoinPolicy::Inner);
        let (merged, report) = merger.merge(&census(), &secondary).unwrap();

        assert_eq!(merged.value("01001", "proportion_stayed_at_home"), Some(0.2));
        assert_eq!(report.duplicate_keys, 1);
        assert_eq!(report.malformed_keys, 1);
    }

    #[test]
    fn test_renames_and_duplicate_columns() {
        let census = table("county_fips", "prop_male", &[("01001", Some(0.5))]);
        let merger = TableMerger::new(KeyNormalizer::county(), JoinPolicy::Inner).with_renames(
            BTreeMap::from([("prop_male".to_string(), "proportion_male".to_string())]),
        );
        let (merged, _) = merger.merge(&census, &mobility()).unwrap();
        assert_eq!(merged.columns[0], "proportion_male");

        let plain = TableMerger::new(KeyNormalizer::county(), JoinPolicy::Inner);
        assert!(matches!(
            plain.merge(&census, &census),
            Err(PipelineError::DuplicateColumn(_))
        ));
    }
}
