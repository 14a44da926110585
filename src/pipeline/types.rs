//! Data types shared by the aggregation, derivation and merge stages.

use std::collections::BTreeMap;

use crate::key::{GeoKey, RawKey};

/// A parsed source row. `values` line up with the aggregator's field list.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub key: RawKey,
    pub values: Vec<f64>,
}

/// Running sum and contribution count for one field of one key.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldSum {
    pub sum: f64,
    pub count: u64,
}

impl FieldSum {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn combine(&mut self, other: FieldSum) {
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Per-source data-quality counters. Rows that fail to parse are skipped
/// and recorded here instead of failing the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataQuality {
    pub accepted: u64,
    pub skipped: u64,
    pub last_error: Option<String>,
}

impl DataQuality {
    pub fn record_skip(&mut self, error: impl ToString) {
        self.skipped += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn skip_rate(&self) -> f64 {
        let total = self.accepted + self.skipped;
        if total == 0 {
            0.0
        } else {
            self.skipped as f64 / total as f64
        }
    }

    pub fn absorb(&mut self, other: DataQuality) {
        self.accepted += other.accepted;
        self.skipped += other.skipped;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
    }
}

/// Accumulated sums for one key plus any fields derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub key: GeoKey,
    pub sums: Vec<FieldSum>,
    pub derived: Vec<Option<f64>>,
}

/// One [`AggregatedRow`] per distinct key, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedTable {
    pub fields: Vec<String>,
    pub derived_fields: Vec<String>,
    pub rows: BTreeMap<GeoKey, AggregatedRow>,
    pub quality: DataQuality,
}

impl AggregatedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&AggregatedRow> {
        self.rows.get(key)
    }

    pub fn sum(&self, key: &str, field: &str) -> Option<f64> {
        let idx = self.fields.iter().position(|f| f == field)?;
        self.get(key).map(|row| row.sums[idx].sum)
    }

    /// Derived value, or `None` when the key, field or value is missing.
    pub fn derived(&self, key: &str, field: &str) -> Option<f64> {
        let idx = self.derived_fields.iter().position(|f| f == field)?;
        self.get(key).and_then(|row| row.derived.get(idx).copied().flatten())
    }

    /// Flat-file view: key column plus the derived fields.
    pub fn to_table(&self, key_column: &str) -> Table {
        Table {
            key_column: key_column.to_string(),
            columns: self.derived_fields.clone(),
            rows: self
                .rows
                .values()
                .map(|row| TableRow {
                    key: row.key.to_string(),
                    values: row.derived.clone(),
                })
                .collect(),
        }
    }
}

/// A keyed table as persisted to or loaded from a delimited file.
///
/// Keys are kept exactly as they appear on disk; they may have lost their
/// zero padding and must be renormalized before comparison.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub key_column: String,
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub key: String,
    pub values: Vec<Option<f64>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub key: GeoKey,
    pub values: Vec<Option<f64>>,
}

/// Output of a key-aligned join: primary columns then secondary columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedTable {
    pub key_column: String,
    pub columns: Vec<String>,
    pub rows: Vec<MergedRow>,
}

impl MergedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.rows.iter().map(|row| row.key.as_str()).collect()
    }

    pub fn value(&self, key: &str, column: &str) -> Option<f64> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|row| row.key.as_str() == key)
            .and_then(|row| row.values[idx])
    }

    pub fn to_table(&self) -> Table {
        Table {
            key_column: self.key_column.clone(),
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .map(|row| TableRow {
                    key: row.key.to_string(),
                    values: row.values.clone(),
                })
                .collect(),
        }
    }
}

/// Read access to named numeric columns, in a stable row order.
pub trait ColumnSource {
    fn column_values(&self, name: &str) -> Option<Vec<Option<f64>>>;
}

impl ColumnSource for Table {
    fn column_values(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.values.get(idx).copied().flatten())
                .collect(),
        )
    }
}

impl ColumnSource for MergedTable {
    fn column_values(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row.values[idx]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_sum_mean() {
        let mut s = FieldSum::default();
        assert_eq!(s.mean(), None);
        s.add(2.0);
        s.add(4.0);
        assert_eq!(s.mean(), Some(3.0));
    }

    #[test]
    fn test_skip_rate() {
        let mut q = DataQuality::default();
        assert_eq!(q.skip_rate(), 0.0);
        q.accepted = 3;
        q.record_skip("bad row");
        assert_eq!(q.skip_rate(), 0.25);
        assert_eq!(q.last_error.as_deref(), Some("bad row"));
    }

    #[test]
    fn test_table_column_values_treats_short_rows_as_missing() {
        let table = Table {
            key_column: "county_fips".into(),
            columns: vec!["a".into(), "b".into()],
            rows: vec![
                TableRow {
                    key: "01001".into(),
                    values: vec![Some(1.0), Some(2.0)],
                },
                TableRow {
                    key: "01003".into(),
                    values: vec![Some(3.0)],
                },
            ],
        };
        assert_eq!(table.column_values("b"), Some(vec![Some(2.0), None]));
        assert_eq!(table.column_values("c"), None);
    }
}
