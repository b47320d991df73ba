#![forbid(unsafe_code)]
//! quarry-core: shared vocabulary of the optimizer.
//!
//! Everything here is pure data: typed ids, the logical plan the optimizer
//! consumes, scalar/nested types, options, fingerprints. No planning logic,
//! no I/O (history file handling lives in `quarry-optimizer`).

pub mod bitset;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod logical;
pub mod path;
pub mod types;

pub use bitset::IdSet;
pub use config::OptimizerOptions;
pub use error::{Error, Result};
pub use hash::Digest;
pub use logical::{LogicalExpr, LogicalOp, LogicalPlan, PlanBuilder};
pub use path::{Step, Subfield, SubscriptKey};
pub use types::{DataType, Field, Literal, Schema, SortOrder};
