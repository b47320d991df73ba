#![forbid(unsafe_code)]
//! quarry-optimizer: cost-based planning of logical SQL plans into
//! distributed physical plans.
//!
//! Pipeline: logical plan → query graph (derived tables + join edges, with
//! subfield access marking) → memoized join-order/method search under the
//! cost model → relation-op tree → multi-fragment executable plan.
//!
//! One [`Optimization`] instance per query, used from one thread. The
//! returned plan borrows the instance's arena and must not outlive it.

pub mod arena;
pub mod cost;
pub mod emit;
pub mod expr;
pub mod graph;
pub mod history;
pub mod optimizer;
pub mod relation;
pub mod search;
pub mod trace;

pub use emit::{ExecutableFragment, MultiFragmentPlan, PhysicalNode, PhysicalOp, PlanAndStats};
pub use history::{record_execution, FileHistory, History, HistoryEntry, NodeStats};
pub use optimizer::Optimization;
pub use search::Plan;
pub use trace::{TraceEvent, TraceSink};
