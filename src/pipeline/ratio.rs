//! Derived proportions and means over aggregated sums.
//!
//! A zero denominator or a missing operand yields `None`; nothing here
//! coerces an undefined ratio to 0 or 1, and nothing here panics.

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::pipeline::types::{AggregatedTable, FieldSum};

/// How one derived field is computed from the aggregated sums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    /// `part / (part + complement)`, e.g. males over males + females.
    Share { part: String, complement: String },
    /// `part / whole`, e.g. devices at home over all devices.
    Fraction { part: String, whole: String },
    /// Running mean of one field.
    Mean { field: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedField {
    pub name: String,
    pub derivation: Derivation,
}

impl DerivedField {
    pub fn share(name: &str, part: &str, complement: &str) -> Self {
        Self {
            name: name.to_string(),
            derivation: Derivation::Share {
                part: part.to_string(),
                complement: complement.to_string(),
            },
        }
    }

    pub fn fraction(name: &str, part: &str, whole: &str) -> Self {
        Self {
            name: name.to_string(),
            derivation: Derivation::Fraction {
                part: part.to_string(),
                whole: whole.to_string(),
            },
        }
    }

    pub fn mean(name: &str, field: &str) -> Self {
        Self {
            name: name.to_string(),
            derivation: Derivation::Mean {
                field: field.to_string(),
            },
        }
    }
}

/// `numerator / denominator`, or `None` when undefined.
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if numerator.is_nan() || denominator.is_nan() || denominator == 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

/// `part / (part + complement)`, or `None` when undefined.
pub fn share(part: f64, complement: f64) -> Option<f64> {
    ratio(part, part + complement)
}

enum Resolved {
    Share(usize, usize),
    Fraction(usize, usize),
    Mean(usize),
}

impl Resolved {
    fn apply(&self, sums: &[FieldSum]) -> Option<f64> {
        match *self {
            Resolved::Share(p, c) => share(sums[p].sum, sums[c].sum),
            Resolved::Fraction(p, w) => ratio(sums[p].sum, sums[w].sum),
            Resolved::Mean(f) => sums[f].mean(),
        }
    }
}

/// Finalizes an [`AggregatedTable`] by computing its derived fields.
#[derive(Debug, Clone, Default)]
pub struct RatioDeriver {
    fields: Vec<DerivedField>,
}

impl RatioDeriver {
    pub fn new(fields: Vec<DerivedField>) -> Self {
        Self { fields }
    }

    pub fn derive(&self, mut table: AggregatedTable) -> Result<AggregatedTable> {
        let resolved = self
            .fields
            .iter()
            .map(|field| self.resolve(&table.fields, field))
            .collect::<Result<Vec<_>>>()?;

        let mut undefined = 0usize;
        for row in table.rows.values_mut() {
            row.derived = resolved.iter().map(|r| r.apply(&row.sums)).collect();
            undefined += row.derived.iter().filter(|v| v.is_none()).count();
        }
        table.derived_fields = self.fields.iter().map(|f| f.name.clone()).collect();

        debug!(
            rows = table.rows.len(),
            undefined, "Derived fields computed"
        );
        Ok(table)
    }

    fn resolve(&self, names: &[String], field: &DerivedField) -> Result<Resolved> {
        let index = |name: &str| {
            names.iter().position(|n| n == name).ok_or_else(|| {
                PipelineError::Config(format!(
                    "derived field '{}' refers to unknown field '{}'",
                    field.name, name
                ))
            })
        };
        Ok(match &field.derivation {
            Derivation::Share { part, complement } => {
                Resolved::Share(index(part)?, index(complement)?)
            }
            Derivation::Fraction { part, whole } => Resolved::Fraction(index(part)?, index(whole)?),
            Derivation::Mean { field } => Resolved::Mean(index(field)?),
        })
    }
}
