//! In-memory catalog used by tests, the CLI and the bench.
//!
//! Statistics are declared up front by the builder; sampling answers are
//! derived from them deterministically so plan shapes are reproducible.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use quarry_core::error::{Error, Result};
use quarry_core::path::Subfield;
use quarry_core::types::{DataType, Field, Schema, SortOrder};

use crate::handles::{ColumnHandle, FilterOp, FilterSpec, SampleResult, TableHandle};
use crate::metadata::{
    Catalog, Column, PartitionHandle, Split, SplitOptions, SplitSource, Table, TableLayout,
};
use crate::stats::ColumnStatistics;

/// Fluent construction of a test table with layouts and statistics.
pub struct TableBuilder {
    name: String,
    fields: Vec<Field>,
    stats: HashMap<String, ColumnStatistics>,
    row_count: u64,
    partition_columns: Vec<String>,
    order_columns: Vec<String>,
    sort_order: Vec<SortOrder>,
    lookup_layouts: Vec<(String, Vec<String>)>,
    options: BTreeMap<String, String>,
}

impl TableBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            stats: HashMap::new(),
            row_count: 0,
            partition_columns: Vec::new(),
            order_columns: Vec::new(),
            sort_order: Vec::new(),
            lookup_layouts: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn column(mut self, name: &str, data_type: DataType) -> Self {
        self.fields.push(Field::new(name, data_type, true));
        self
    }

    pub fn column_with_stats(
        mut self,
        name: &str,
        data_type: DataType,
        stats: ColumnStatistics,
    ) -> Self {
        self.fields.push(Field::new(name, data_type, true));
        self.stats.insert(name.to_string(), stats);
        self
    }

    pub fn distinct(mut self, column: &str, num_distinct: u64) -> Self {
        self.stats
            .entry(column.to_string())
            .or_default()
            .num_distinct = Some(num_distinct);
        self
    }

    pub fn row_count(mut self, rows: u64) -> Self {
        self.row_count = rows;
        self
    }

    pub fn partitioned_by(mut self, columns: &[&str]) -> Self {
        self.partition_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn ordered_by(mut self, columns: &[&str], orders: Vec<SortOrder>) -> Self {
        self.order_columns = columns.iter().map(|c| c.to_string()).collect();
        self.sort_order = orders;
        self
    }

    /// Adds an index layout whose lookup keys admit index joins.
    pub fn lookup_index(mut self, layout_name: &str, keys: &[&str]) -> Self {
        self.lookup_layouts.push((
            layout_name.to_string(),
            keys.iter().map(|k| k.to_string()).collect(),
        ));
        self
    }

    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    fn build(mut self) -> Arc<Table> {
        let columns: Vec<Arc<Column>> = self
            .fields
            .iter()
            .map(|f| {
                let stats = self.stats.remove(&f.name).unwrap_or_default();
                Arc::new(Column::new(&f.name, f.data_type.clone(), stats))
            })
            .collect();

        let mut layouts = vec![Arc::new(TableLayout {
            name: "base".to_string(),
            table: self.name.clone(),
            columns: columns.clone(),
            partition_columns: self.partition_columns.clone(),
            order_columns: self.order_columns.clone(),
            sort_order: self.sort_order.clone(),
            lookup_keys: Vec::new(),
            supports_scan: true,
            cardinality: self.row_count,
        })];

        for (layout_name, keys) in &self.lookup_layouts {
            layouts.push(Arc::new(TableLayout {
                name: layout_name.clone(),
                table: self.name.clone(),
                columns: columns.clone(),
                partition_columns: self.partition_columns.clone(),
                order_columns: keys.clone(),
                sort_order: vec![SortOrder::default(); keys.len()],
                lookup_keys: keys.clone(),
                supports_scan: false,
                cardinality: self.row_count,
            }));
        }

        Arc::new(Table {
            name: self.name,
            schema: Schema::new(self.fields),
            columns,
            layouts,
            row_count: self.row_count,
            options: self.options,
        })
    }
}

#[derive(Default)]
pub struct TestCatalog {
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, builder: TableBuilder) -> Self {
        self.add_table(builder);
        self
    }

    pub fn add_table(&self, builder: TableBuilder) {
        let table = builder.build();
        self.tables.write().insert(table.name.clone(), table);
    }

    /// Stats-driven selectivity estimate, one factor per conjunct.
    fn filter_selectivity(table: &Table, filters: &[FilterSpec]) -> f64 {
        let mut selectivity = 1.0;
        for filter in filters {
            let ndv = table
                .find_column(&filter.column)
                .map(|c| c.approx_num_distinct(1000))
                .unwrap_or(1000)
                .max(1) as f64;
            selectivity *= match filter.op {
                FilterOp::Eq => 1.0 / ndv,
                FilterOp::In => (filter.literals.len() as f64 / ndv).min(1.0),
                FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge => 0.33,
                FilterOp::Between => 0.25,
            };
        }
        selectivity
    }
}

impl Catalog for TestCatalog {
    fn find_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Catalog(format!("table not found: {name}")))
    }

    fn create_column_handle(
        &self,
        layout: &TableLayout,
        column: &str,
        subfields: Vec<Subfield>,
        cast_to: Option<DataType>,
    ) -> Result<ColumnHandle> {
        let col = layout
            .find_column(column)
            .ok_or_else(|| Error::Catalog(format!("no column {column} in layout {}", layout.name)))?;

        if let Some(target) = &cast_to {
            // Only map→struct casts with string or integer keys are known.
            let key_ok = matches!(
                col.data_type(),
                DataType::Map(k, _) if matches!(**k, DataType::Utf8 | DataType::Int32 | DataType::Int64)
            );
            if !key_ok || !matches!(target, DataType::Row(_)) {
                return Err(Error::Catalog(format!(
                    "unsupported cast for column {column}: {:?} -> {:?}",
                    col.data_type(),
                    target
                )));
            }
        }

        Ok(ColumnHandle {
            column: column.to_string(),
            subfields,
            cast_to,
        })
    }

    fn create_table_handle(
        &self,
        layout: &TableLayout,
        columns: Vec<ColumnHandle>,
        filters: Vec<FilterSpec>,
    ) -> Result<(TableHandle, Vec<FilterSpec>)> {
        let mut pushdown = Vec::new();
        let mut rejected = Vec::new();
        for filter in filters {
            let supported = layout
                .find_column(&filter.column)
                .is_some_and(|c| !c.data_type().is_complex());
            if supported {
                pushdown.push(filter);
            } else {
                rejected.push(filter);
            }
        }
        Ok((
            TableHandle {
                table: layout.table.clone(),
                layout: layout.name.clone(),
                columns,
                pushdown_filters: pushdown,
            },
            rejected,
        ))
    }

    fn sample(
        &self,
        handle: &TableHandle,
        pct: f64,
        extra_filters: &[FilterSpec],
        fields: &[Subfield],
    ) -> Result<SampleResult> {
        let table = self.find_table(&handle.table)?;
        let sampled = ((table.row_count as f64) * pct / 100.0).round() as u64;
        let mut selectivity = Self::filter_selectivity(&table, &handle.pushdown_filters);
        selectivity *= Self::filter_selectivity(&table, extra_filters);
        let matched = ((sampled as f64) * selectivity).round() as u64;

        let mut statistics = Vec::new();
        for field in fields {
            // Child stats keyed by the first step's skyline name, when known.
            if let Some(name) = field.steps().first().and_then(|s| s.skyline_name()) {
                for column in &table.columns {
                    if let Some(child) = column.stats().child(&name) {
                        statistics.push((field.clone(), child.clone()));
                        break;
                    }
                }
            }
        }

        Ok(SampleResult {
            sampled,
            matched,
            statistics,
        })
    }

    fn list_partitions(&self, handle: &TableHandle) -> Result<Vec<PartitionHandle>> {
        // One partition per table; the test catalog does not model partition
        // pruning.
        Ok(vec![PartitionHandle {
            table: handle.table.clone(),
            partition: "p0".to_string(),
        }])
    }

    fn split_source(
        &self,
        handle: &TableHandle,
        partitions: Vec<PartitionHandle>,
        options: SplitOptions,
    ) -> Result<Box<dyn SplitSource>> {
        let table = self.find_table(&handle.table)?;
        let total_bytes = (table.row_count as f64
            * table
                .schema
                .fields
                .iter()
                .map(|f| f.data_type.estimated_byte_width())
                .sum::<f64>()) as u64;
        let per_split = options.file_bytes_per_split.max(1);
        let mut count = (total_bytes / per_split + 1) as usize;
        count = count.max(options.target_split_count).max(1);
        if options.whole_file {
            count = partitions.len().max(1);
        }

        let splits = (0..count)
            .map(|i| Split {
                path: format!("mem://{}/{}", handle.table, i),
                start: 0,
                length: total_bytes / count as u64,
            })
            .collect();
        Ok(Box::new(VecSplitSource { splits }))
    }
}

struct VecSplitSource {
    splits: Vec<Split>,
}

impl SplitSource for VecSplitSource {
    fn next_splits(&mut self, target_bytes: u64) -> Vec<Split> {
        let mut out = Vec::new();
        let mut bytes = 0u64;
        while let Some(split) = self.splits.pop() {
            bytes += split.length.max(1);
            out.push(split);
            if bytes >= target_bytes {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::types::Literal;

    fn catalog() -> TestCatalog {
        TestCatalog::new().with_table(
            TableBuilder::new("nation")
                .column("n_nationkey", DataType::Int64)
                .column("n_name", DataType::Utf8)
                .column(
                    "n_tags",
                    DataType::Map(Box::new(DataType::Utf8), Box::new(DataType::Int64)),
                )
                .distinct("n_nationkey", 25)
                .row_count(25),
        )
    }

    #[test]
    fn find_table_errors_on_unknown() {
        let cat = catalog();
        assert!(cat.find_table("nation").is_ok());
        assert!(matches!(
            cat.find_table("missing"),
            Err(Error::Catalog(_))
        ));
    }

    #[test]
    fn complex_column_filters_are_rejected() {
        let cat = catalog();
        let table = cat.find_table("nation").unwrap();
        let layout = table.scan_layout().unwrap();
        let (handle, rejected) = cat
            .create_table_handle(
                layout,
                vec![],
                vec![
                    FilterSpec::eq("n_nationkey", Literal::Int64(3)),
                    FilterSpec::eq("n_tags", Literal::Int64(1)),
                ],
            )
            .unwrap();
        assert_eq!(handle.pushdown_filters.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].column, "n_tags");
    }

    #[test]
    fn map_as_struct_cast_requires_string_or_int_keys() {
        let cat = catalog();
        let table = cat.find_table("nation").unwrap();
        let layout = table.scan_layout().unwrap();
        let target = DataType::Row(vec![Field::new("a", DataType::Int64, true)]);
        assert!(cat
            .create_column_handle(layout, "n_tags", vec![], Some(target.clone()))
            .is_ok());
        // Scalar columns cannot be cast.
        assert!(cat
            .create_column_handle(layout, "n_name", vec![], Some(target))
            .is_err());
    }

    #[test]
    fn sampling_tracks_declared_stats() {
        let cat = catalog();
        let table = cat.find_table("nation").unwrap();
        let layout = table.scan_layout().unwrap();
        let (handle, _) = cat
            .create_table_handle(
                layout,
                vec![],
                vec![FilterSpec::eq("n_nationkey", Literal::Int64(3))],
            )
            .unwrap();
        let sample = cat.sample(&handle, 100.0, &[], &[]).unwrap();
        assert_eq!(sample.sampled, 25);
        assert_eq!(sample.matched, 1);
        assert!((sample.selectivity() - 0.04).abs() < 1e-9);
    }
}
