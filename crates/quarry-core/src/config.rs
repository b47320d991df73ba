//! Optimizer configuration that callers can serialize/deserialize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Trace flag bits; see `quarry-optimizer`'s trace sink.
pub const TRACE_RETAINED: u32 = 1;
pub const TRACE_EXCEEDED_BEST: u32 = 2;
pub const TRACE_SAMPLE: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerOptions {
    /// Rewrite scans of complex-typed columns to read only live subfields.
    pub pushdown_subfields: bool,

    /// Table name → map columns a scan may expose as structs keyed by the
    /// accessed literal keys.
    pub map_as_struct: BTreeMap<String, Vec<String>>,

    /// Bitmask of TRACE_* flags; 0 disables memo tracing.
    pub trace_flags: u32,

    /// Percentage of rows to sample when calibrating filter selectivity.
    /// 0 disables sampling.
    pub sample_percent: f32,

    /// Maximum number of search expansions before the enumerator stops and
    /// keeps the best plan found. 0 = unbounded.
    pub search_node_budget: u64,

    /// Assumed per-conjunct selectivity until calibrated from sampling or
    /// history.
    pub default_fanout: f64,

    /// Cluster shape the emitted plan targets.
    pub num_workers: usize,
    pub num_drivers: usize,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            pushdown_subfields: true,
            map_as_struct: BTreeMap::new(),
            trace_flags: 0,
            sample_percent: 0.0,
            search_node_budget: 0,
            default_fanout: 0.8,
            num_workers: 4,
            num_drivers: 4,
        }
    }
}

impl OptimizerOptions {
    /// Create options from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `QUARRY_NUM_WORKERS`, `QUARRY_NUM_DRIVERS`
    /// - `QUARRY_SEARCH_NODE_BUDGET`
    /// - `QUARRY_SAMPLE_PERCENT`
    /// - `QUARRY_TRACE_FLAGS`
    /// - `QUARRY_PUSHDOWN_SUBFIELDS` (0/1)
    pub fn from_env() -> Self {
        let mut opts = Self::default();

        if let Ok(s) = std::env::var("QUARRY_NUM_WORKERS") {
            if let Ok(v) = s.parse::<usize>() {
                opts.num_workers = v;
            }
        }

        if let Ok(s) = std::env::var("QUARRY_NUM_DRIVERS") {
            if let Ok(v) = s.parse::<usize>() {
                opts.num_drivers = v;
            }
        }

        if let Ok(s) = std::env::var("QUARRY_SEARCH_NODE_BUDGET") {
            if let Ok(v) = s.parse::<u64>() {
                opts.search_node_budget = v;
            }
        }

        if let Ok(s) = std::env::var("QUARRY_SAMPLE_PERCENT") {
            if let Ok(v) = s.parse::<f32>() {
                opts.sample_percent = v;
            }
        }

        if let Ok(s) = std::env::var("QUARRY_TRACE_FLAGS") {
            if let Ok(v) = s.parse::<u32>() {
                opts.trace_flags = v;
            }
        }

        if let Ok(s) = std::env::var("QUARRY_PUSHDOWN_SUBFIELDS") {
            opts.pushdown_subfields = s != "0";
        }

        opts
    }

    pub fn single_node(&self) -> bool {
        self.num_workers <= 1
    }
}
