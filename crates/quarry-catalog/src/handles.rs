//! Opaque-ish handles the optimizer receives from the catalog and embeds in
//! emitted scans. Serializable so EXPLAIN output and tests can inspect them.

use serde::{Deserialize, Serialize};

use quarry_core::path::Subfield;
use quarry_core::types::{DataType, Literal};

use crate::stats::ColumnStatistics;

/// Filter shapes a connector can evaluate below the scan. Conjuncts the
/// query-graph builder could not express in this language stay above the
/// scan as expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Between,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub column: String,
    pub op: FilterOp,
    pub literals: Vec<Literal>,
}

impl FilterSpec {
    pub fn eq(column: impl Into<String>, value: Literal) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            literals: vec![value],
        }
    }
}

/// Column selection within a layout, with optional subfield pruning and an
/// optional cast (e.g. map projected out as a struct of its accessed keys).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnHandle {
    pub column: String,
    pub subfields: Vec<Subfield>,
    pub cast_to: Option<DataType>,
}

/// A layout plus the columns and pushed-down filters a scan will apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableHandle {
    pub table: String,
    pub layout: String,
    pub columns: Vec<ColumnHandle>,
    pub pushdown_filters: Vec<FilterSpec>,
}

/// Result of `Catalog::sample`: pre- and post-filter row counts, plus
/// post-filter statistics for requested subfields when asked for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleResult {
    pub sampled: u64,
    pub matched: u64,
    pub statistics: Vec<(Subfield, ColumnStatistics)>,
}

impl SampleResult {
    /// Fraction of sampled rows matching the filters; 1 when nothing sampled.
    pub fn selectivity(&self) -> f64 {
        if self.sampled == 0 {
            1.0
        } else {
            self.matched as f64 / self.sampled as f64
        }
    }
}
