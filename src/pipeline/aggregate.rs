use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, RecordError, Result as PipelineResult};
use crate::key::{GeoKey, KeyNormalizer};
use crate::pipeline::types::{AggregatedRow, AggregatedTable, DataQuality, FieldSum, RawRecord};

/// Scoped aggregation context for one run over one source.
///
/// Groups records by normalized key and keeps a running [`FieldSum`] per
/// field. Rows that fail to parse or normalize are skipped and counted in
/// [`DataQuality`]. Sums over integer counts are exact, so the result does
/// not depend on row order; float inputs may differ in the last bit.
#[derive(Debug, Clone)]
pub struct Aggregator {
    normalizer: KeyNormalizer,
    fields: Vec<String>,
    sums: BTreeMap<GeoKey, Vec<FieldSum>>,
    quality: DataQuality,
    seen: u64,
}

impl Aggregator {
    pub fn new(normalizer: KeyNormalizer, fields: Vec<String>) -> Self {
        Self {
            normalizer,
            fields,
            sums: BTreeMap::new(),
            quality: DataQuality::default(),
            seen: 0,
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn quality(&self) -> &DataQuality {
        &self.quality
    }

    /// Adds one record, or records why it had to be skipped.
    pub fn push(&mut self, record: Result<RawRecord, RecordError>) {
        self.seen += 1;
        let outcome = record.and_then(|record| self.accumulate(record));
        match outcome {
            Ok(()) => self.quality.accepted += 1,
            Err(e) => {
                debug!(record = self.seen, error = %e, "Skipping record");
                self.quality.record_skip(e);
            }
        }
    }

    pub fn accumulate(&mut self, record: RawRecord) -> Result<(), RecordError> {
        if record.values.len() < self.fields.len() {
            return Err(RecordError::MissingValue {
                field: self.fields[record.values.len()].clone(),
            });
        }
        let key = self.normalizer.normalize(&record.key)?;
        let width = self.fields.len();
        let sums = self
            .sums
            .entry(key)
            .or_insert_with(|| vec![FieldSum::default(); width]);
        for (sum, value) in sums.iter_mut().zip(record.values) {
            sum.add(value);
        }
        Ok(())
    }

    /// Folds a lazily produced sequence of records into this aggregator.
    pub fn extend<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = Result<RawRecord, RecordError>>,
    {
        for record in records {
            self.push(record);
        }
    }

    /// Merges partial sums from an aggregator that saw a disjoint shard of
    /// the same source.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the shard was built with a
    /// different field list or key normalizer.
    pub fn absorb(&mut self, other: Aggregator) -> PipelineResult<()> {
        if other.fields != self.fields || other.normalizer != self.normalizer {
            return Err(PipelineError::Config(format!(
                "cannot absorb shard over {:?} into aggregator over {:?}",
                other.fields, self.fields
            )));
        }
        let width = self.fields.len();
        for (key, partial) in other.sums {
            let sums = self
                .sums
                .entry(key)
                .or_insert_with(|| vec![FieldSum::default(); width]);
            for (sum, part) in sums.iter_mut().zip(partial) {
                sum.combine(part);
            }
        }
        self.quality.absorb(other.quality);
        self.seen += other.seen;
        Ok(())
    }

    pub fn finish(self) -> AggregatedTable {
        if self.quality.skipped > 0 {
            warn!(
                accepted = self.quality.accepted,
                skipped = self.quality.skipped,
                last_error = self.quality.last_error.as_deref().unwrap_or(""),
                "Records skipped during aggregation"
            );
        }
        info!(
            keys = self.sums.len(),
            accepted = self.quality.accepted,
            skipped = self.quality.skipped,
            "Aggregation complete"
        );

        let rows = self
            .sums
            .into_iter()
            .map(|(key, sums)| {
                let row = AggregatedRow {
                    key: key.clone(),
                    sums,
                    derived: Vec::new(),
                };
                (key, row)
            })
            .collect();

        AggregatedTable {
            fields: self.fields,
            derived_fields: Vec::new(),
            rows,
            quality: self.quality,
        }
    }
}
