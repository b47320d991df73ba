//! The per-query `Optimization` instance.
//!
//! Construction lowers the logical plan into the query graph and calibrates
//! leaf selectivities (catalog stats → optional sampling → history), then
//! `best_plan` runs the memo search and `to_executable_plan` emits the
//! chosen relation-op tree as a multi-fragment plan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quarry_core::bitset::IdSet;
use quarry_core::config::OptimizerOptions;
use quarry_core::error::{Error, Result};
use quarry_core::id::{ColumnId, ExprId, TableId};
use quarry_core::logical::LogicalPlan;

use quarry_catalog::handles::{FilterSpec, TableHandle};
use quarry_catalog::Catalog;

use crate::arena::QueryArena;
use crate::expr::FunctionRegistry;
use crate::graph::{GraphBuilder, TableNode};
use crate::history::History;
use crate::relation::PlanCost;
use crate::search::{MemoKey, Plan, PlanSet};
use crate::trace::{TraceEvent, TraceEventKind, TraceSink, TracingSink};

/// One query optimization. Holds the arena every returned plan borrows
/// from; must stay alive as long as the plan is used.
pub struct Optimization<'a> {
    pub(crate) arena: QueryArena,
    pub(crate) catalog: &'a dyn Catalog,
    pub(crate) history: &'a dyn History,
    pub(crate) opts: OptimizerOptions,
    pub(crate) registry: FunctionRegistry,
    pub(crate) root_dt: TableId,

    pub(crate) memo: HashMap<MemoKey, PlanSet>,
    pub(crate) build_counter: u32,
    pub(crate) plan_counter: u32,

    /// Scan handle plus filters the connector rejected, per base table.
    pub(crate) leaf_handles: HashMap<TableId, (TableHandle, Vec<ExprId>)>,

    trace: Box<dyn TraceSink>,
    cancel: Arc<AtomicBool>,
    budget_used: u64,
    pub(crate) budget_exhausted: bool,
}

impl<'a> Optimization<'a> {
    pub fn new(
        plan: &LogicalPlan,
        catalog: &'a dyn Catalog,
        history: &'a dyn History,
        opts: OptimizerOptions,
    ) -> Result<Self> {
        let registry = FunctionRegistry::default();
        let mut arena = QueryArena::new();
        let root_dt =
            GraphBuilder::new(&mut arena, catalog, &registry, &opts).build(plan)?;

        let mut optimization = Self {
            arena,
            catalog,
            history,
            opts,
            registry,
            root_dt,
            memo: HashMap::new(),
            build_counter: 0,
            plan_counter: 0,
            leaf_handles: HashMap::new(),
            trace: Box::new(TracingSink),
            cancel: Arc::new(AtomicBool::new(false)),
            budget_used: 0,
            budget_exhausted: false,
        };
        optimization.prepare_leaves()?;
        Ok(optimization)
    }

    /// Replaces the trace sink (tests install a collector).
    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.trace = sink;
    }

    /// Flag checked at every memo boundary and search recursion; setting it
    /// aborts the call with `OverBudget`.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn arena(&self) -> &QueryArena {
        &self.arena
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.opts
    }

    /// Best physical plan for the whole query.
    pub fn best_plan(&mut self) -> Result<Plan> {
        let plan = self.plan_derived_table(self.root_dt)?;
        if self.budget_exhausted && self.opts.search_node_budget > 0 {
            tracing::debug!(
                budget = self.opts.search_node_budget,
                "search stopped at node budget; returning best found"
            );
        }
        Ok(plan)
    }

    /// Budget/cancellation check; called on every search expansion.
    pub(crate) fn tick(&mut self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::OverBudget("optimization cancelled".to_string()));
        }
        if self.opts.search_node_budget > 0 {
            self.budget_used += 1;
            if self.budget_used > self.opts.search_node_budget {
                self.budget_exhausted = true;
            }
        }
        Ok(())
    }

    pub(crate) fn next_plan_id(&mut self) -> u32 {
        self.plan_counter += 1;
        self.plan_counter
    }

    pub(crate) fn trace_event(&mut self, kind: TraceEventKind, cost: PlanCost, shape: String) {
        if self.opts.trace_flags & kind.flag() == 0 {
            return;
        }
        let plan_id = self.next_plan_id();
        self.trace.event(TraceEvent {
            kind,
            plan_id,
            cost,
            op_shape: shape,
        });
    }

    // ---- leaf preparation ----

    /// Builds connector handles for every base table and calibrates filter
    /// selectivity: declared stats first, then sampling when enabled, then
    /// recorded history. Rejected filters stay attached for the emitter.
    fn prepare_leaves(&mut self) -> Result<()> {
        let base_ids: Vec<TableId> = (0..self.arena.table_count() as u32)
            .map(TableId::new)
            .filter(|id| matches!(self.arena.table(*id), TableNode::Base(_)))
            .collect();

        for base_id in base_ids {
            let (handle, rejected) = self.make_leaf_handle(base_id)?;
            self.calibrate_leaf(base_id, &handle)?;
            self.leaf_handles.insert(base_id, (handle, rejected));
        }
        Ok(())
    }

    fn make_leaf_handle(&mut self, base_id: TableId) -> Result<(TableHandle, Vec<ExprId>)> {
        let (layout, columns, column_filters, plain_filters, map_as_struct) = {
            let base = match self.arena.table(base_id) {
                TableNode::Base(base) => base,
                _ => return Err(Error::Internal("not a base table".to_string())),
            };
            (
                base.layout.clone(),
                base.columns.clone(),
                base.column_filters.clone(),
                base.filter.clone(),
                base.map_as_struct.clone(),
            )
        };

        // Column handles with live subfields; map columns configured for
        // struct access get a cast target, falling back to the plain read
        // when the connector refuses it.
        let mut column_handles = Vec::new();
        let mut seen_tops = Vec::new();
        for column in &columns {
            let def = self.arena.column(*column);
            let top = def.top_column.unwrap_or(*column);
            if seen_tops.contains(&top) {
                continue;
            }
            seen_tops.push(top);
            let top_def = self.arena.column(top);
            let name = self.arena.name_str(top_def.name).to_string();

            let base = match self.arena.table(base_id) {
                TableNode::Base(base) => base,
                _ => unreachable!(),
            };
            let subfields: Vec<quarry_core::path::Subfield> = base
                .live_paths(top)
                .iter_raw()
                .map(|raw| {
                    self.arena
                        .path_ref(quarry_core::id::PathId::new(raw))
                        .clone()
                })
                .collect();

            let cast_to = if base.map_as_struct.contains(&top) {
                skyline_struct(&self.arena, base, top)
            } else {
                None
            };

            let handle = match self.catalog.create_column_handle(
                &layout,
                &name,
                subfields.clone(),
                cast_to,
            ) {
                Ok(handle) => handle,
                Err(Error::Catalog(_)) if !map_as_struct.is_empty() => {
                    // The connector refused the cast; read the plain column.
                    self.catalog
                        .create_column_handle(&layout, &name, subfields, None)?
                }
                Err(e) => return Err(e),
            };
            column_handles.push(handle);
        }

        // Pushdown filters from the extractable conjuncts.
        let mut specs = Vec::new();
        let mut spec_exprs = Vec::new();
        for expr in &column_filters {
            if let Some(spec) = self.filter_spec_for(*expr) {
                specs.push(spec);
                spec_exprs.push(*expr);
            }
        }

        let (handle, rejected_specs) =
            self.catalog
                .create_table_handle(&layout, column_handles, specs)?;

        // Filters the connector rejected are evaluated above the scan,
        // together with the never-pushable conjuncts.
        let mut rejected: Vec<ExprId> = plain_filters;
        for spec in &rejected_specs {
            if let Some(pos) = spec_exprs
                .iter()
                .position(|e| self.filter_spec_for(*e).as_ref() == Some(spec))
            {
                rejected.push(spec_exprs[pos]);
            }
        }

        Ok((handle, rejected))
    }

    /// `FilterSpec` shape of a pushable conjunct, recomputed from the
    /// interned expression.
    pub(crate) fn filter_spec_for(&self, expr: ExprId) -> Option<FilterSpec> {
        use crate::expr::ExprKind;
        use quarry_catalog::handles::FilterOp;
        use quarry_core::types::Literal;

        let (name, args) = match &self.arena.expr(expr).kind {
            ExprKind::Call { name, args } => (self.arena.name_str(*name), args.clone()),
            _ => return None,
        };
        let op = match name {
            "eq" => FilterOp::Eq,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Le,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Ge,
            "in" => FilterOp::In,
            "between" => FilterOp::Between,
            _ => return None,
        };
        let column = match args.first().map(|a| &self.arena.expr(*a).kind) {
            Some(ExprKind::Column(c)) => self.arena.name_str(self.arena.column(*c).name).to_string(),
            _ => return None,
        };
        let literals: Option<Vec<Literal>> = args[1..]
            .iter()
            .map(|a| match &self.arena.expr(*a).kind {
                ExprKind::Literal(l) => Some(l.clone()),
                _ => None,
            })
            .collect();
        Some(FilterSpec {
            column,
            op,
            literals: literals?,
        })
    }

    fn calibrate_leaf(&mut self, base_id: TableId, handle: &TableHandle) -> Result<()> {
        let fingerprint = self.leaf_fingerprint(base_id);

        // Third calibration source wins: recorded execution history.
        if let Some(entry) = self.history.lookup(&fingerprint) {
            let row_count = match self.arena.table(base_id) {
                TableNode::Base(base) => base.layout.cardinality.max(1) as f64,
                _ => 1.0,
            };
            if let TableNode::Base(base) = self.arena.table_mut(base_id) {
                base.filter_selectivity = (entry.cardinality / row_count).clamp(0.0, 1.0);
            }
            return Ok(());
        }

        // Second source: sampling, cached across queries.
        if self.opts.sample_percent > 0.0 && !handle.pushdown_filters.is_empty() {
            let selectivity = match self.history.cached_sample(&fingerprint) {
                Some(cached) => cached,
                None => {
                    let sample =
                        self.catalog
                            .sample(handle, self.opts.sample_percent as f64, &[], &[])?;
                    let selectivity = sample.selectivity();
                    self.history.cache_sample(&fingerprint, selectivity);
                    self.trace_event(
                        TraceEventKind::Sampled,
                        PlanCost::default(),
                        format!("sample {} -> {selectivity:.4}", handle.table),
                    );
                    selectivity
                }
            };
            if let TableNode::Base(base) = self.arena.table_mut(base_id) {
                base.filter_selectivity = selectivity;
            }
        }
        // Otherwise the builder's stats-based estimate stands.
        Ok(())
    }

    // ---- fingerprints ----

    /// Canonical digest of a leaf: table, layout, and filter text with
    /// correlation names stripped, so equal scans share history across
    /// queries.
    pub(crate) fn leaf_fingerprint(&self, base_id: TableId) -> String {
        match self.arena.table(base_id) {
            TableNode::Base(base) => crate::emit::leaf_fingerprint(&self.arena, base),
            _ => String::new(),
        }
    }

    /// Columns the rest of the plan still needs, given what is placed.
    pub(crate) fn downstream_columns(
        &self,
        dt: TableId,
        placed_tables: &IdSet,
        placed_conjuncts: &IdSet,
        target: &IdSet,
        aggregation_pending: bool,
    ) -> IdSet {
        let mut set = target.clone();
        let Some(dt) = self.arena.table(dt).as_derived() else {
            return set;
        };
        for conjunct in &dt.conjuncts {
            if !placed_conjuncts.contains(*conjunct) {
                set.union_with(&self.arena.expr(*conjunct).columns);
            }
        }
        for edge in &dt.join_edges {
            if !placed_tables.contains(edge.left) || !placed_tables.contains(edge.right) {
                for key in edge.left_keys.iter().chain(edge.right_keys.iter()) {
                    set.union_with(&self.arena.expr(*key).columns);
                }
                for filter in &edge.filter {
                    set.union_with(&self.arena.expr(*filter).columns);
                }
            }
        }
        if aggregation_pending {
            if let Some(agg) = &dt.aggregation {
                for expr in agg.group_by.iter().chain(agg.aggregates.iter()) {
                    set.union_with(&self.arena.expr(*expr).columns);
                }
            }
            for (expr, _) in &dt.ordering {
                set.union_with(&self.arena.expr(*expr).columns);
            }
        }
        set
    }

    /// Estimated output cardinality of a member table before planning it;
    /// drives candidate ordering only.
    pub(crate) fn table_cardinality_guess(&self, table: TableId) -> f64 {
        match self.arena.table(table) {
            TableNode::Base(base) => {
                base.layout.cardinality.max(1) as f64 * base.filter_selectivity
            }
            TableNode::Values(values) => values.rows.len().max(1) as f64,
            TableNode::Derived(dt) => {
                let mut card: f64 = dt
                    .tables
                    .iter()
                    .map(|t| self.table_cardinality_guess(*t))
                    .product();
                // Every edge is roughly a key lookup: it divides by the
                // smaller side's key domain.
                for edge in &dt.join_edges {
                    let right = self.table_cardinality_guess(edge.right);
                    card /= right.max(1.0);
                }
                if let Some(agg) = &dt.aggregation {
                    card = crate::cost::aggregation_output_cardinality(
                        &self.arena,
                        &agg.group_by,
                        card,
                    );
                }
                if let Some(limit) = dt.limit {
                    card = card.min(limit as f64);
                }
                card.max(1.0)
            }
        }
    }

    /// The column set dt's own projection depends on.
    pub(crate) fn dt_target_columns(&self, dt: TableId) -> IdSet {
        let mut set = IdSet::new();
        if let Some(dt) = self.arena.table(dt).as_derived() {
            for expr in &dt.exprs {
                set.union_with(&self.arena.expr(*expr).columns);
            }
            for (expr, _) in &dt.ordering {
                set.union_with(&self.arena.expr(*expr).columns);
            }
            if let Some(agg) = &dt.aggregation {
                for expr in agg.group_by.iter().chain(agg.aggregates.iter()) {
                    set.union_with(&self.arena.expr(*expr).columns);
                }
            }
        }
        set
    }
}

/// Struct type standing in for a map column accessed only through literal
/// keys: one member per accessed key, all of the map's value type.
fn skyline_struct(
    arena: &QueryArena,
    base: &crate::graph::BaseTable,
    column: ColumnId,
) -> Option<quarry_core::types::DataType> {
    use quarry_core::types::{DataType, Field};
    let value_type = match &arena.column(column).value.data_type {
        DataType::Map(_, value) => (**value).clone(),
        _ => return None,
    };
    let mut names: Vec<String> = Vec::new();
    for raw in base.live_paths(column).iter_raw() {
        let path = arena.path_ref(quarry_core::id::PathId::new(raw));
        if let Some(name) = path.steps().first().and_then(|s| s.skyline_name()) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        return None;
    }
    Some(DataType::Row(
        names
            .into_iter()
            .map(|n| Field::new(n, value_type.clone(), true))
            .collect(),
    ))
}
