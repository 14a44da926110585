//! Rank correlation between two columns of a merged table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::statistics::{Data, OrderStatistics, RankTieBreaker};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::pipeline::types::ColumnSource;

/// A rank-correlation routine over two equal-length samples.
///
/// Returns `(coefficient, significance)`.
pub trait RankCorrelation {
    fn correlate(&self, x: &[f64], y: &[f64]) -> (f64, f64);
}

/// Spearman's rho with a two-sided p-value from the t distribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Spearman;

impl RankCorrelation for Spearman {
    fn correlate(&self, x: &[f64], y: &[f64]) -> (f64, f64) {
        let n = x.len().min(y.len());
        let (x, y) = (&x[..n], &y[..n]);
        if n < 3 || !x.iter().chain(y).all(|v| v.is_finite()) {
            return (f64::NAN, f64::NAN);
        }
        let rho = pearson(&ranks(x), &ranks(y));
        if rho.is_nan() {
            return (f64::NAN, f64::NAN);
        }
        let rho = rho.clamp(-1.0, 1.0);
        if rho.abs() == 1.0 {
            return (rho, 0.0);
        }

        let df = (n - 2) as f64;
        let t = rho * (df / (1.0 - rho * rho)).sqrt();
        let p = match StudentsT::new(0.0, 1.0, df) {
            Ok(dist) => 2.0 * (1.0 - dist.cdf(t.abs())),
            Err(_) => f64::NAN,
        };
        (rho, p)
    }
}

/// 1-based ranks, ties sharing their average rank. Values must be finite.
fn ranks(values: &[f64]) -> Vec<f64> {
    Data::new(values.to_vec()).ranks(RankTieBreaker::Average)
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return f64::NAN;
    }
    cov / (var_x * var_y).sqrt()
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationReport {
    pub generated_at: DateTime<Utc>,
    pub x: String,
    pub y: String,
    pub coefficient: f64,
    pub p_value: f64,
    pub sample_size: usize,
}

/// Selects the rows where both columns are present and hands them, in table
/// order, to a [`RankCorrelation`] routine.
#[derive(Debug, Clone, Default)]
pub struct CorrelationReporter<C = Spearman> {
    routine: C,
}

impl<C: RankCorrelation> CorrelationReporter<C> {
    pub fn new(routine: C) -> Self {
        Self { routine }
    }

    #[tracing::instrument(skip(self, table))]
    pub fn report<T: ColumnSource>(&self, table: &T, x: &str, y: &str) -> Result<CorrelationReport> {
        let column = |name: &str| {
            table
                .column_values(name)
                .ok_or_else(|| PipelineError::Config(format!("unknown column '{name}'")))
        };
        let (xs, ys): (Vec<f64>, Vec<f64>) = column(x)?
            .into_iter()
            .zip(column(y)?)
            .filter_map(|pair| match pair {
                (Some(a), Some(b)) if a.is_finite() && b.is_finite() => Some((a, b)),
                _ => None,
            })
            .unzip();

        let (coefficient, p_value) = self.routine.correlate(&xs, &ys);
        info!(
            sample_size = xs.len(),
            coefficient,
            p_value,
            "Correlation computed"
        );

        Ok(CorrelationReport {
            generated_at: Utc::now(),
            x: x.to_string(),
            y: y.to_string(),
            coefficient,
            p_value,
            sample_size: xs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Table, TableRow};

    #[test]
    fn test_ranks_average_ties() {
        assert_eq!(ranks(&[5.0, 6.0, 7.0, 8.0, 7.0]), vec![1.0, 2.0, 3.5, 5.0, 3.5]);
    }

    #[test]
    fn test_spearman_with_ties() {
        let (rho, p) = Spearman.correlate(&[1.0, 2.0, 3.0, 4.0, 5.0], &[5.0, 6.0, 7.0, 8.0, 7.0]);
        assert!((rho - 0.820_782_681_668_123_3).abs() < 1e-12);
        assert!((p - 0.088_587_005_313_543_8).abs() < 1e-6);
    }

    #[test]
    fn test_spearman_perfect_and_degenerate() {
        let (rho, p) = Spearman.correlate(&[1.0, 2.0, 3.0, 4.0], &[10.0, 20.0, 30.0, 40.0]);
        assert_eq!((rho, p), (1.0, 0.0));

        let (rho, _) = Spearman.correlate(&[1.0, 2.0, 3.0, 4.0], &[4.0, 3.0, 2.0, 1.0]);
        assert_eq!(rho, -1.0);

        assert!(Spearman.correlate(&[1.0, 2.0], &[1.0, 2.0]).0.is_nan());
        assert!(Spearman.correlate(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).0.is_nan());
        assert!(Spearman.correlate(&[1.0, f64::NAN, 3.0], &[1.0, 2.0, 3.0]).0.is_nan());
    }

    struct Recorder;

    impl RankCorrelation for Recorder {
        fn correlate(&self, x: &[f64], y: &[f64]) -> (f64, f64) {
            (x.iter().sum(), y.iter().sum())
        }
    }

    #[test]
    fn test_report_excludes_missing_rows() {
        let table = Table {
            key_column: "county_fips".into(),
            columns: vec!["a".into(), "b".into()],
            rows: vec![
                TableRow {
                    key: "01001".into(),
                    values: vec![Some(1.0), Some(10.0)],
                },
                TableRow {
                    key: "01003".into(),
                    values: vec![Some(2.0), None],
                },
                TableRow {
                    key: "01005".into(),
                    values: vec![None, Some(30.0)],
                },
                TableRow {
                    key: "01007".into(),
                    values: vec![Some(4.0), Some(40.0)],
                },
            ],
        };
        let report = CorrelationReporter::new(Recorder)
            .report(&table, "a", "b")
            .unwrap();

        assert_eq!(report.sample_size, 2);
        assert_eq!(report.coefficient, 5.0);
        assert_eq!(report.p_value, 50.0);
    }

    #[test]
    fn test_report_unknown_column() {
        let table = Table::default();
        let reporter = CorrelationReporter::<Spearman>::default();
        assert!(reporter.report(&table, "a", "b").is_err());
    }
}
