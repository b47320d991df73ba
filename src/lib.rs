#![forbid(unsafe_code)]
//! quarry: a cost-based query optimizer for an analytic SQL engine.
//!
//! Takes a logical relational plan plus catalog metadata and statistics,
//! and produces a distributed physical plan: a DAG of relation operators
//! cut into stages at shuffle boundaries, annotated with per-node
//! cardinality and cost predictions.
//!
//! This crate re-exports the public surface of the member crates; see
//! `quarry-optimizer` for the search engine itself.

pub use quarry_core::{
    config, error, logical, path, types, DataType, Error, Field, Literal, LogicalExpr,
    LogicalPlan, OptimizerOptions, PlanBuilder, Result, Schema, SortOrder,
};

pub use quarry_catalog::{
    Catalog, ColumnHandle, ColumnStatistics, FilterOp, FilterSpec, Table, TableBuilder,
    TableHandle, TableLayout, TestCatalog,
};

pub use quarry_optimizer::{
    record_execution, ExecutableFragment, FileHistory, History, HistoryEntry, MultiFragmentPlan,
    NodeStats, Optimization, PhysicalNode, PhysicalOp, Plan, PlanAndStats,
};
