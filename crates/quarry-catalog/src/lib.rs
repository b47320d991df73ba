#![forbid(unsafe_code)]
//! quarry-catalog: abstract metadata the optimizer plans against.
//!
//! A `Catalog` resolves table names to `Table`s; a `Table` has one
//! `TableLayout` per physical organization (base data, index, sorted
//! projection); a layout plus column/filter selection produces a
//! `TableHandle` usable for scan or lookup and for split enumeration.
//! All calls are synchronous and side-effect free at planning time.
//!
//! The in-memory [`TestCatalog`] backs tests, the CLI and the bench.

pub mod handles;
pub mod metadata;
pub mod stats;
pub mod test_catalog;

pub use handles::{ColumnHandle, FilterOp, FilterSpec, SampleResult, TableHandle};
pub use metadata::{
    Catalog, PartitionHandle, Split, SplitOptions, SplitSource, Table, TableLayout,
};
pub use stats::ColumnStatistics;
pub use test_catalog::{TableBuilder, TestCatalog};
