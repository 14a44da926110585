//! County aggregation pipeline.
//!
//! Source rows are grouped by normalized county key, summed, turned into
//! derived proportions, persisted, and joined with other aggregated tables
//! on that key.

pub mod aggregate;
pub mod datasets;
pub mod merge;
pub mod ratio;
pub mod runner;
pub mod types;
