//! Tables, layouts, and the `Catalog` trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use quarry_core::error::Result;
use quarry_core::path::Subfield;
use quarry_core::types::{DataType, Schema, SortOrder};

use crate::handles::{ColumnHandle, FilterSpec, SampleResult, TableHandle};
use crate::stats::ColumnStatistics;

/// A named column of a table. Name and type are immutable; statistics may be
/// replaced as tables change or samples complete.
#[derive(Debug)]
pub struct Column {
    name: String,
    data_type: DataType,
    stats: RwLock<ColumnStatistics>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, stats: ColumnStatistics) -> Self {
        Self {
            name: name.into(),
            data_type,
            stats: RwLock::new(stats),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn stats(&self) -> ColumnStatistics {
        self.stats.read().clone()
    }

    pub fn set_stats(&self, stats: ColumnStatistics) {
        *self.stats.write() = stats;
    }

    pub fn approx_num_distinct(&self, default_value: u64) -> u64 {
        self.stats.read().approx_num_distinct(default_value)
    }
}

/// One physical organization of a table: base data, a sorted projection, an
/// index. Partitioning columns co-locate equal keys; lookup keys admit index
/// joins when the probe keys cover a prefix of them.
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub name: String,
    pub table: String,
    pub columns: Vec<Arc<Column>>,
    pub partition_columns: Vec<String>,
    pub order_columns: Vec<String>,
    pub sort_order: Vec<SortOrder>,
    pub lookup_keys: Vec<String>,
    pub supports_scan: bool,
    /// Row count of this layout (equals the table's for base layouts).
    pub cardinality: u64,
}

impl TableLayout {
    pub fn find_column(&self, name: &str) -> Option<&Arc<Column>> {
        self.columns.iter().find(|c| c.name() == name)
    }
}

#[derive(Debug)]
pub struct Table {
    pub name: String,
    pub schema: Schema,
    pub columns: Vec<Arc<Column>>,
    pub layouts: Vec<Arc<TableLayout>>,
    pub row_count: u64,
    pub options: BTreeMap<String, String>,
}

impl Table {
    pub fn find_column(&self, name: &str) -> Option<&Arc<Column>> {
        self.columns.iter().find(|c| c.name() == name)
    }

    /// The first layout that supports a full scan.
    pub fn scan_layout(&self) -> Option<&Arc<TableLayout>> {
        self.layouts.iter().find(|l| l.supports_scan)
    }
}

/// One partition of a layout. Unpartitioned tables have exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    pub table: String,
    pub partition: String,
}

#[derive(Debug, Clone)]
pub struct SplitOptions {
    /// Make no more than one split per file.
    pub whole_file: bool,
    /// Minimum number of splits to generate (e.g. one per driver); 0 = free.
    pub target_split_count: usize,
    /// Target bytes per split.
    pub file_bytes_per_split: u64,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            whole_file: false,
            target_split_count: 0,
            file_bytes_per_split: 128 << 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub path: String,
    pub start: u64,
    pub length: u64,
}

/// Enumerates splits covering a set of partitions.
pub trait SplitSource {
    /// Returns splits covering up to `target_bytes`; empty when exhausted.
    fn next_splits(&mut self, target_bytes: u64) -> Vec<Split>;
}

/// Abstract metadata interface consumed by the optimizer.
///
/// Everything here is synchronous and may block on I/O; these are the only
/// external calls made during optimization.
pub trait Catalog: Send + Sync {
    fn find_table(&self, name: &str) -> Result<Arc<Table>>;

    /// A column selection with subfield pruning and an optional cast. The
    /// set of supported casts is connector-specific; unsupported ones fail
    /// with a catalog error and callers fall back to the uncast read.
    fn create_column_handle(
        &self,
        layout: &TableLayout,
        column: &str,
        subfields: Vec<Subfield>,
        cast_to: Option<DataType>,
    ) -> Result<ColumnHandle>;

    /// Pushes `filters` into a scan handle where supported. Filters the
    /// connector cannot evaluate come back as the second tuple element and
    /// must be applied above the scan.
    fn create_table_handle(
        &self,
        layout: &TableLayout,
        columns: Vec<ColumnHandle>,
        filters: Vec<FilterSpec>,
    ) -> Result<(TableHandle, Vec<FilterSpec>)>;

    /// Samples `pct` percent of rows, applying the handle's filters plus
    /// `extra_filters`. Returns pre- and post-filter counts; when `fields`
    /// is non-empty, also post-filter statistics for those subfields.
    fn sample(
        &self,
        handle: &TableHandle,
        pct: f64,
        extra_filters: &[FilterSpec],
        fields: &[Subfield],
    ) -> Result<SampleResult>;

    /// Partitions matching the handle's filters. Consumed by the emitter.
    fn list_partitions(&self, handle: &TableHandle) -> Result<Vec<PartitionHandle>>;

    /// Split enumeration over `partitions`. Consumed by the emitter.
    fn split_source(
        &self,
        handle: &TableHandle,
        partitions: Vec<PartitionHandle>,
        options: SplitOptions,
    ) -> Result<Box<dyn SplitSource>>;
}
