//! The memo/search engine: dynamic-programming enumeration of join orders
//! and methods with cost-based cutoff.
//!
//! Shapes explored are left-deep probe chains with bushy build sides
//! (optionally reduced by existence semi-joins imported from the probe
//! side); right-deep probe chains are not enumerated. Subproblems are
//! memoized by (first table, table set, columns, existences).

use std::collections::HashMap;

use quarry_core::bitset::IdSet;
use quarry_core::error::{Error, Result};
use quarry_core::id::{ColumnId, ExprId, RelId, TableId};

use crate::arena::QueryArena;
use crate::cost;
use crate::graph::{DtSetOp, JoinEdge, TableNode};
use crate::optimizer::Optimization;
use crate::relation::{
    AggStep, Cost, Distribution, JoinKind, JoinMethod, PartitionKind, PlanCost, RelOp,
};
use crate::trace::TraceEventKind;

/// Memoization key: a table or derived table with a particular set of
/// reducing joins, projected columns, and existence reducers is planned
/// once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub first: TableId,
    pub tables: IdSet,
    pub columns: IdSet,
    pub existences: Vec<IdSet>,
}

/// Requested output distribution when resolving a memoized plan.
#[derive(Debug, Clone)]
pub enum DistReq {
    Any,
    Hash(Vec<ExprId>),
    Broadcast,
    Gather,
}

impl DistReq {
    fn satisfied_by(&self, dist: &Distribution) -> bool {
        match self {
            DistReq::Any => true,
            DistReq::Hash(keys) => dist.satisfies_partitioning(keys),
            DistReq::Broadcast => matches!(dist.kind, PartitionKind::Broadcast),
            DistReq::Gather => dist.is_gather(),
        }
    }
}

/// A hash build placed somewhere in the partial plan, reusable by later
/// joins that need the identical build.
#[derive(Debug, Clone)]
pub struct BuildRef {
    pub rel: RelId,
    pub key: MemoKey,
    pub kind: PartitionKind,
    pub partition: Vec<ExprId>,
    pub cardinality: f64,
}

/// A finished candidate plan in a memo slot.
#[derive(Debug, Clone)]
pub struct Plan {
    pub root: RelId,
    pub cost: PlanCost,
    pub tables: IdSet,
    pub columns: IdSet,
    pub out_cardinality: f64,
}

impl Plan {
    pub fn total(&self) -> f64 {
        self.cost.total()
    }
}

/// Non-dominated plans for one memo subproblem, plus the cost cutoff.
#[derive(Debug, Default)]
pub struct PlanSet {
    pub plans: Vec<Plan>,
    /// Cost of the best plan plus one shuffle of its output; nothing more
    /// expensive than this is worth exploring.
    pub best_with_shuffle: f64,
}

fn has_interesting_property(arena: &QueryArena, plan: &Plan) -> bool {
    let dist = &arena.rel(plan.root).distribution;
    !dist.order.is_empty() || !dist.partition.is_empty()
}

impl PlanSet {
    /// Retains `plan` if it is best so far or carries an order/partitioning
    /// the cheaper plans lack. Returns true when retained.
    pub fn add_plan(&mut self, arena: &QueryArena, plan: Plan) -> bool {
        let best = self
            .plans
            .iter()
            .map(Plan::total)
            .fold(f64::INFINITY, f64::min);

        let interesting =
            plan.total() < best || (has_interesting_property(arena, &plan) && {
                // Retained only if no cheaper plan has the same properties.
                let dist = arena.rel(plan.root).distribution.clone();
                !self.plans.iter().any(|p| {
                    p.total() <= plan.total()
                        && arena.rel(p.root).distribution.order == dist.order
                        && arena.rel(p.root).distribution.partition == dist.partition
                })
            });
        if !interesting {
            return false;
        }

        // Drop plans the new one strictly dominates.
        let new_total = plan.total();
        let plans = std::mem::take(&mut self.plans);
        self.plans = plans
            .into_iter()
            .filter(|p| p.total() < new_total || has_interesting_property(arena, p))
            .collect();
        self.plans.push(plan);
        self.update_cutoff(arena);
        true
    }

    fn update_cutoff(&mut self, arena: &QueryArena) {
        self.best_with_shuffle = self
            .plans
            .iter()
            .map(|p| {
                let row_bytes: f64 = p
                    .columns
                    .iter::<ColumnId>()
                    .map(|c| arena.column(c).value.data_type.estimated_byte_width())
                    .sum();
                p.total() + p.out_cardinality * row_bytes
            })
            .fold(f64::INFINITY, f64::min);
    }

    pub fn best(&self) -> Option<&Plan> {
        self.plans
            .iter()
            .min_by(|a, b| a.total().total_cmp(&b.total()))
    }

    /// Best plan for `req`; true when the caller must add a shuffle.
    pub fn best_for(&self, arena: &QueryArena, req: &DistReq) -> Option<(&Plan, bool)> {
        let matching = self
            .plans
            .iter()
            .filter(|p| req.satisfied_by(&arena.rel(p.root).distribution))
            .min_by(|a, b| a.total().total_cmp(&b.total()));
        match matching {
            Some(plan) => Some((plan, false)),
            None => self.best().map(|p| (p, true)),
        }
    }
}

/// Next table(s) to join: a single table, or a table with further reducing
/// joins forming a bushy build side, optionally annotated with existence
/// reducers imported from the probe side.
#[derive(Debug, Clone)]
pub struct JoinCandidate {
    pub tables: Vec<TableId>,
    /// Keys on the already-placed (probe) side; empty for a first table or
    /// a cross join.
    pub left_keys: Vec<ExprId>,
    /// Keys on the candidate side, 1:1 with `left_keys`.
    pub right_keys: Vec<ExprId>,
    pub filter: Vec<ExprId>,
    pub join_type: JoinKind,
    pub existences: Vec<IdSet>,
    pub fanout: f64,
    pub exists_fanout: f64,
}

impl JoinCandidate {
    fn first_table(first: TableId, cardinality: f64) -> Self {
        Self {
            tables: vec![first],
            left_keys: Vec::new(),
            right_keys: Vec::new(),
            filter: Vec::new(),
            join_type: JoinKind::Inner,
            existences: Vec::new(),
            fanout: cardinality,
            exists_fanout: 1.0,
        }
    }
}

/// One costed way of adding a candidate; variants on the same placed set
/// prune each other via `is_worse`.
#[derive(Debug, Clone)]
pub struct NextJoin {
    pub plan: RelId,
    pub cost: PlanCost,
    pub placed: IdSet,
    pub placed_conjuncts: IdSet,
    pub columns: IdSet,
    pub builds: Vec<BuildRef>,
}

impl NextJoin {
    /// True if `other` covers the same tables, costs less on every axis,
    /// and this plan offers no order/partitioning the other lacks.
    pub fn is_worse(&self, other: &NextJoin, arena: &QueryArena) -> bool {
        if self.placed != other.placed {
            return false;
        }
        let this_dist = &arena.rel(self.plan).distribution;
        let other_dist = &arena.rel(other.plan).distribution;
        let property_advantage = (!this_dist.order.is_empty() && other_dist.order.is_empty())
            || (!this_dist.partition.is_empty() && other_dist.partition.is_empty());
        self.cost.total() > other.cost.total()
            && self.cost.total_bytes >= other.cost.total_bytes
            && !property_advantage
    }
}

/// Mutable search state for one derived table.
pub struct PlanState {
    pub dt: TableId,
    pub placed: IdSet,
    pub placed_conjuncts: IdSet,
    pub columns: IdSet,
    pub target: IdSet,
    pub cost: PlanCost,
    pub builds: Vec<BuildRef>,
    pub has_cutoff: bool,
    pub plans: PlanSet,
}

pub struct StateSnapshot {
    placed: IdSet,
    placed_conjuncts: IdSet,
    columns: IdSet,
    cost: PlanCost,
    num_builds: usize,
}

impl PlanState {
    pub fn new(dt: TableId, target: IdSet) -> Self {
        Self {
            dt,
            placed: IdSet::new(),
            placed_conjuncts: IdSet::new(),
            columns: IdSet::new(),
            target,
            cost: PlanCost::default(),
            builds: Vec::new(),
            has_cutoff: true,
            plans: PlanSet::default(),
        }
    }

    pub fn save(&self) -> StateSnapshot {
        StateSnapshot {
            placed: self.placed.clone(),
            placed_conjuncts: self.placed_conjuncts.clone(),
            columns: self.columns.clone(),
            cost: self.cost,
            num_builds: self.builds.len(),
        }
    }

    pub fn restore(&mut self, snapshot: StateSnapshot) {
        self.placed = snapshot.placed;
        self.placed_conjuncts = snapshot.placed_conjuncts;
        self.columns = snapshot.columns;
        self.cost = snapshot.cost;
        self.builds.truncate(snapshot.num_builds);
    }

    pub fn is_over_best(&self) -> bool {
        self.has_cutoff
            && !self.plans.plans.is_empty()
            && self.cost.total() > self.plans.best_with_shuffle
    }
}

/// Cloned-out derived-table pieces so search code does not hold arena
/// borrows across mutation.
#[derive(Clone)]
pub(crate) struct DtInfo {
    pub tables: Vec<TableId>,
    pub table_set: IdSet,
    pub conjuncts: Vec<ExprId>,
    pub edges: Vec<JoinEdge>,
    pub aggregation: Option<crate::graph::AggregationSpec>,
    pub ordering: Vec<(ExprId, quarry_core::types::SortOrder)>,
    pub limit: Option<i64>,
    pub offset: i64,
    pub set_op: Option<DtSetOp>,
    pub columns: Vec<ColumnId>,
}

impl<'a> Optimization<'a> {
    pub(crate) fn dt_info(&self, dt: TableId) -> Result<DtInfo> {
        match self.arena.table(dt) {
            TableNode::Derived(d) => Ok(DtInfo {
                tables: d.tables.clone(),
                table_set: d.table_set.clone(),
                conjuncts: d.conjuncts.clone(),
                edges: d.join_edges.clone(),
                aggregation: d.aggregation.clone(),
                ordering: d.ordering.clone(),
                limit: d.limit,
                offset: d.offset,
                set_op: d.set_op,
                columns: d.columns.clone(),
            }),
            _ => Err(Error::Internal("expected a derived table".to_string())),
        }
    }

    /// Plans one derived table and returns its best plan.
    pub(crate) fn plan_derived_table(&mut self, dt: TableId) -> Result<Plan> {
        let key = self.dt_memo_key(dt)?;
        let (plan, _) = self.make_plan(key, DistReq::Any, dt)?;
        Ok(plan)
    }

    pub(crate) fn dt_memo_key(&self, dt: TableId) -> Result<MemoKey> {
        let info = self.dt_info(dt)?;
        Ok(MemoKey {
            first: dt,
            tables: IdSet::from_ids([dt]),
            columns: IdSet::from_ids(info.columns.iter().copied()),
            existences: Vec::new(),
        })
    }

    /// Retrieves or computes the plan set for `key` and picks the best plan
    /// for the requested distribution. The bool is true when the caller
    /// must add a shuffle to align the result.
    pub(crate) fn make_plan(
        &mut self,
        key: MemoKey,
        req: DistReq,
        parent_dt: TableId,
    ) -> Result<(Plan, bool)> {
        self.tick()?;
        if !self.memo.contains_key(&key) {
            let plan_set = self.plan_memo_problem(&key, parent_dt)?;
            self.memo.insert(key.clone(), plan_set);
        }
        let set = self
            .memo
            .get(&key)
            .ok_or_else(|| Error::Internal("memo slot vanished".to_string()))?;
        let (plan, needs_shuffle) = set
            .best_for(&self.arena, &req)
            .ok_or_else(|| {
                if self.budget_exhausted {
                    Error::OverBudget("no plan found within search budget".to_string())
                } else {
                    Error::Internal("memo produced no plan".to_string())
                }
            })?;
        Ok((plan.clone(), needs_shuffle))
    }

    fn plan_memo_problem(&mut self, key: &MemoKey, parent_dt: TableId) -> Result<PlanSet> {
        // A single derived table plans as itself; a multi-table bush (a
        // build side with reducing joins) plans as a synthetic dt carved out
        // of the parent.
        let dt = if key.tables.len() == 1
            && matches!(self.arena.table(key.first), TableNode::Derived(_))
        {
            key.first
        } else {
            self.build_bush_dt(key, parent_dt)?
        };

        let info = self.dt_info(dt)?;
        if info.set_op == Some(DtSetOp::UnionAll) {
            return self.plan_union(dt);
        }

        let mut target = self.dt_target_columns(dt);
        // A bush's target is the requested columns themselves.
        if key.tables.len() > 1 || !matches!(self.arena.table(key.first), TableNode::Derived(_)) {
            target = key.columns.clone();
        }

        let mut state = PlanState::new(dt, target);
        self.make_joins(None, &mut state)?;
        if state.plans.plans.is_empty() {
            if self.budget_exhausted {
                return Err(Error::OverBudget(
                    "no plan found within search budget".to_string(),
                ));
            }
            return Err(Error::Internal(format!(
                "enumeration produced no plan for dt {dt}"
            )));
        }
        Ok(std::mem::take(&mut state.plans))
    }

    /// Synthesizes a derived table for a bushy build side: the candidate
    /// tables plus inner edges among them, plus existence reducers as
    /// semi-join edges.
    fn build_bush_dt(&mut self, key: &MemoKey, parent_dt: TableId) -> Result<TableId> {
        let parent = self.dt_info(parent_dt)?;
        let tables: Vec<TableId> = {
            let mut t: Vec<TableId> = key.tables.iter().collect();
            // Keep the key's first table first for deterministic starts.
            if let Some(pos) = t.iter().position(|x| *x == key.first) {
                t.swap(0, pos);
            }
            t
        };

        let mut edges: Vec<JoinEdge> = parent
            .edges
            .iter()
            .filter(|e| key.tables.contains(e.left) && key.tables.contains(e.right))
            .cloned()
            .collect();

        for existence in &key.existences {
            for reducer in existence.iter::<TableId>() {
                for edge in &parent.edges {
                    if let Some((other, near_keys, far_keys)) = edge.other_side(reducer) {
                        if key.tables.contains(other) {
                            edges.push(JoinEdge {
                                left: other,
                                right: reducer,
                                left_keys: far_keys.to_vec(),
                                right_keys: near_keys.to_vec(),
                                filter: Vec::new(),
                                join_type: JoinKind::LeftSemi,
                            });
                        }
                    }
                }
            }
        }

        let columns: Vec<ColumnId> = key.columns.iter().collect();
        let mut exprs = Vec::with_capacity(columns.len());
        for column in &columns {
            exprs.push(self.arena.column_expr(*column));
        }

        let mut table_list = tables.clone();
        for existence in &key.existences {
            for reducer in existence.iter::<TableId>() {
                if !table_list.contains(&reducer) {
                    table_list.push(reducer);
                }
            }
        }
        let table_set = IdSet::from_ids(table_list.iter().copied());
        let cname = self.arena.name("bush");

        Ok(self.arena.add_table(|id| {
            TableNode::Derived(crate::graph::DerivedTable {
                id,
                cname,
                tables: table_list,
                table_set,
                conjuncts: Vec::new(),
                join_edges: edges,
                columns,
                exprs,
                aggregation: None,
                ordering: Vec::new(),
                limit: None,
                offset: 0,
                set_op: None,
            })
        }))
    }

    // ---- enumeration ----

    pub(crate) fn make_joins(&mut self, plan: Option<RelId>, state: &mut PlanState) -> Result<()> {
        self.tick()?;
        if self.budget_exhausted {
            return Ok(());
        }

        if let Some(current) = plan {
            if self.place_conjuncts(current, state)? {
                return Ok(());
            }

            let info = self.dt_info(state.dt)?;
            if info.table_set.is_subset_of(&state.placed) {
                let root = self.add_postprocess(current, state)?;
                let candidate = Plan {
                    root,
                    cost: state.cost,
                    tables: state.placed.clone(),
                    columns: state.columns.clone(),
                    out_cardinality: state.cost.fanout,
                };
                let cost = candidate.cost;
                let shape = self.plan_shape(root);
                if state.plans.add_plan(&self.arena, candidate) {
                    self.trace_event(TraceEventKind::Retained, cost, shape);
                }
                return Ok(());
            }

            if state.is_over_best() {
                let cost = state.cost;
                let shape = self.plan_shape(current);
                self.trace_event(TraceEventKind::ExceededBest, cost, shape);
                return Ok(());
            }
        }

        let candidates = self.next_joins(state)?;
        let mut to_try = Vec::new();
        for candidate in &candidates {
            match plan {
                None => self.place_first_table(candidate, state, &mut to_try)?,
                Some(current) => self.add_join(candidate, current, state, &mut to_try)?,
            }
        }
        self.try_next_joins(state, to_try)
    }

    fn try_next_joins(&mut self, state: &mut PlanState, to_try: Vec<NextJoin>) -> Result<()> {
        for i in 0..to_try.len() {
            let dominated = to_try
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && to_try[i].is_worse(other, &self.arena));
            if dominated {
                continue;
            }
            let next = &to_try[i];
            let snapshot = state.save();
            state.placed = next.placed.clone();
            state.placed_conjuncts = next.placed_conjuncts.clone();
            state.columns = next.columns.clone();
            state.cost = next.cost;
            state.builds = next.builds.clone();
            self.make_joins(Some(next.plan), state)?;
            state.restore(snapshot);
        }
        Ok(())
    }

    /// Places every dt conjunct whose columns are available; recurses on
    /// the filtered plan. Returns true if anything was placed.
    fn place_conjuncts(&mut self, plan: RelId, state: &mut PlanState) -> Result<bool> {
        let info = self.dt_info(state.dt)?;
        let placeable: Vec<ExprId> = info
            .conjuncts
            .iter()
            .copied()
            .filter(|c| {
                !state.placed_conjuncts.contains(*c)
                    && self.arena.expr(*c).columns.is_subset_of(&state.columns)
            })
            .collect();
        if placeable.is_empty() {
            return Ok(false);
        }

        let snapshot = state.save();
        let node = self.arena.rel(plan);
        let distribution = node.distribution.clone();
        let columns = node.columns.clone();
        let filter_cost =
            cost::filter_cost(placeable.len(), self.opts.default_fanout, state.cost.fanout);
        let filtered = self.arena.add_rel(
            RelOp::Filter {
                exprs: placeable.clone(),
            },
            vec![plan],
            distribution,
            columns,
            filter_cost,
        );
        state.cost.add(&filter_cost);
        for conjunct in &placeable {
            state.placed_conjuncts.insert(*conjunct);
        }
        self.make_joins(Some(filtered), state)?;
        state.restore(snapshot);
        Ok(true)
    }

    /// Candidate next joins, cheapest-estimated first.
    fn next_joins(&mut self, state: &mut PlanState) -> Result<Vec<JoinCandidate>> {
        let info = self.dt_info(state.dt)?;
        let mut candidates: Vec<JoinCandidate> = Vec::new();

        if state.placed.is_empty() {
            for table in &info.tables {
                let blocked = info
                    .edges
                    .iter()
                    .any(|e| e.is_non_commutative() && e.right == *table);
                if blocked {
                    continue;
                }
                candidates.push(JoinCandidate::first_table(
                    *table,
                    self.table_cardinality_guess(*table),
                ));
            }
        } else {
            let mut by_table: HashMap<TableId, JoinCandidate> = HashMap::new();
            for edge in &info.edges {
                let entry = if state.placed.contains(edge.left)
                    && !state.placed.contains(edge.right)
                {
                    Some((edge.right, edge.left_keys.clone(), edge.right_keys.clone()))
                } else if state.placed.contains(edge.right)
                    && !state.placed.contains(edge.left)
                    && !edge.is_non_commutative()
                {
                    Some((edge.left, edge.right_keys.clone(), edge.left_keys.clone()))
                } else {
                    None
                };
                let Some((table, left_keys, right_keys)) = entry else {
                    continue;
                };
                let candidate = by_table.entry(table).or_insert_with(|| JoinCandidate {
                    tables: vec![table],
                    left_keys: Vec::new(),
                    right_keys: Vec::new(),
                    filter: Vec::new(),
                    join_type: JoinKind::Inner,
                    existences: Vec::new(),
                    fanout: 1.0,
                    exists_fanout: 1.0,
                });
                candidate.left_keys.extend(left_keys);
                candidate.right_keys.extend(right_keys);
                candidate.filter.extend(edge.filter.iter().copied());
                if edge.join_type != JoinKind::Inner {
                    candidate.join_type = edge.join_type;
                }
            }

            let mut grouped: Vec<JoinCandidate> = by_table.into_values().collect();
            grouped.sort_by_key(|c| c.tables[0]);

            for mut candidate in grouped {
                let table = candidate.tables[0];
                let card = self.table_cardinality_guess(table);
                let raw = cost::join_fanout(&self.arena, card, &candidate.right_keys);
                candidate.fanout = adjust_fanout(raw, candidate.join_type)
                    * self
                        .opts
                        .default_fanout
                        .powi(candidate.filter.len() as i32);

                // Bushy build: a further reducing inner join under the
                // candidate shrinks the build before the probe sees it.
                if candidate.join_type == JoinKind::Inner {
                    for edge in &info.edges {
                        if let Some((other, _, far)) = edge.other_side(table) {
                            if edge.join_type != JoinKind::Inner
                                || state.placed.contains(other)
                                || other == table
                                || candidate.tables.contains(&other)
                            {
                                continue;
                            }
                            let reducer_fanout = cost::join_fanout(
                                &self.arena,
                                self.table_cardinality_guess(other),
                                far,
                            );
                            if reducer_fanout < 0.9 {
                                let mut bush = candidate.clone();
                                bush.tables.push(other);
                                bush.fanout *= reducer_fanout;
                                // Edges from the bush member to placed
                                // tables stay in the join condition; they
                                // also become existence imports that shrink
                                // the build.
                                for import in &info.edges {
                                    if let Some((far_side, near_keys, far_keys)) =
                                        import.other_side(other)
                                    {
                                        if state.placed.contains(far_side)
                                            && import.join_type == JoinKind::Inner
                                        {
                                            bush.left_keys.extend(far_keys.iter().copied());
                                            bush.right_keys.extend(near_keys.iter().copied());
                                            bush.existences
                                                .push(IdSet::from_ids([far_side]));
                                            bush.exists_fanout *= 0.5;
                                        }
                                    }
                                }
                                candidates.push(bush);
                            }
                        }
                    }
                }
                candidates.push(candidate);
            }

            // Cross-join fallback when nothing is connected.
            if candidates.is_empty() {
                for table in &info.tables {
                    if state.placed.contains(*table) {
                        continue;
                    }
                    let blocked = info
                        .edges
                        .iter()
                        .any(|e| e.is_non_commutative() && e.right == *table);
                    if blocked {
                        continue;
                    }
                    let mut candidate = JoinCandidate::first_table(
                        *table,
                        self.table_cardinality_guess(*table),
                    );
                    candidate.fanout = self.table_cardinality_guess(*table);
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(|a, b| a.fanout.total_cmp(&b.fanout));
        Ok(candidates)
    }

    fn place_first_table(
        &mut self,
        candidate: &JoinCandidate,
        state: &mut PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        let snapshot = state.save();
        let table = candidate.tables[0];
        let (root, _card) = match self.make_member_chain(table, state) {
            Ok(chain) => chain,
            // Budget ran out inside a nested subproblem: drop the candidate
            // and keep whatever complete plans exist.
            Err(Error::OverBudget(_)) if self.budget_exhausted => {
                state.restore(snapshot);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        state.placed.insert(table);
        let columns = self.arena.rel(root).columns.clone();
        for column in &columns {
            state.columns.insert(*column);
        }
        to_try.push(NextJoin {
            plan: root,
            cost: state.cost,
            placed: state.placed.clone(),
            placed_conjuncts: state.placed_conjuncts.clone(),
            columns: state.columns.clone(),
            builds: state.builds.clone(),
        });
        state.restore(snapshot);
        Ok(())
    }

    /// A member table as the head of the probe chain; folds its cost into
    /// `state.cost`.
    fn make_member_chain(&mut self, table: TableId, state: &mut PlanState) -> Result<(RelId, f64)> {
        match self.arena.table(table) {
            TableNode::Base(_) | TableNode::Values(_) => {
                let (rel, node_cost) = self.make_leaf_rel(table)?;
                state.cost.add(&node_cost);
                Ok((rel, node_cost.fanout))
            }
            TableNode::Derived(_) => {
                let key = self.dt_memo_key(table)?;
                let (plan, _) = self.make_plan(key, DistReq::Any, state.dt)?;
                let mut chain = plan.cost;
                let root = self.wrap_dt_projection(table, plan.root, &mut chain);
                state.cost.unit_cost += chain.unit_cost * state.cost.fanout.max(1.0);
                state.cost.setup_cost += chain.setup_cost;
                state.cost.total_bytes += chain.total_bytes;
                state.cost.transfer_bytes += chain.transfer_bytes;
                state.cost.fanout *= plan.out_cardinality;
                Ok((root, plan.out_cardinality))
            }
        }
    }

    /// The dt's declared projection above its plan, so consumers see the
    /// dt's output columns. A bush projecting the underlying columns
    /// unchanged needs none.
    fn wrap_dt_projection(&mut self, dt: TableId, root: RelId, chain: &mut PlanCost) -> RelId {
        let (columns, exprs) = match self.arena.table(dt) {
            TableNode::Derived(d) => (d.columns.clone(), d.exprs.clone()),
            _ => return root,
        };
        if columns.is_empty() || columns == self.arena.rel(root).columns {
            return root;
        }
        let project_cost = cost::project_cost(&self.arena, &self.registry, &exprs, chain.fanout);
        let distribution = self.arena.rel(root).distribution.clone();
        let rel = self.arena.add_rel(
            RelOp::Project { exprs },
            vec![root],
            distribution,
            columns,
            project_cost,
        );
        chain.add(&project_cost);
        rel
    }

    /// Scan or values node for a base table.
    pub(crate) fn make_leaf_rel(&mut self, table: TableId) -> Result<(RelId, Cost)> {
        match self.arena.table(table) {
            TableNode::Base(base) => {
                let columns = base.columns.clone();
                let layout_name = base.layout.name.clone();
                let cardinality =
                    base.layout.cardinality.max(1) as f64 * base.filter_selectivity;
                let distribution = self.scan_distribution(table);
                let node_cost = cost::leaf_cost(&self.arena, &columns, cardinality);
                let rel = self.arena.add_rel(
                    RelOp::TableScan {
                        table,
                        layout: layout_name,
                        lookup_keys: Vec::new(),
                    },
                    Vec::new(),
                    distribution,
                    columns,
                    node_cost,
                );
                Ok((rel, node_cost))
            }
            TableNode::Values(values) => {
                let columns = values.columns.clone();
                let cardinality = values.rows.len() as f64;
                let node_cost = cost::leaf_cost(&self.arena, &columns, cardinality);
                let rel = self.arena.add_rel(
                    RelOp::Values { table },
                    Vec::new(),
                    Distribution::singleton(),
                    columns,
                    node_cost,
                );
                Ok((rel, node_cost))
            }
            TableNode::Derived(_) => Err(Error::Internal(
                "derived tables are planned through the memo".to_string(),
            )),
        }
    }

    /// Scan output distribution: hash on the layout's partition columns and
    /// ordered on its sort columns when those columns are scanned.
    fn scan_distribution(&mut self, table: TableId) -> Distribution {
        let TableNode::Base(base) = self.arena.table(table) else {
            return Distribution::arbitrary();
        };
        let find_column = |name: &str| -> Option<ColumnId> {
            base.columns
                .iter()
                .copied()
                .find(|c| {
                    let def = self.arena.column(*c);
                    def.top_column.is_none() && self.arena.name_str(def.name) == name
                })
        };
        let partition: Option<Vec<ColumnId>> = base
            .layout
            .partition_columns
            .iter()
            .map(|n| find_column(n))
            .collect();
        let order: Option<Vec<ColumnId>> = base
            .layout
            .order_columns
            .iter()
            .map(|n| find_column(n))
            .collect();
        let order_type = base.layout.sort_order.clone();

        let partition = partition.unwrap_or_default();
        let order = order.unwrap_or_default();
        let partition_exprs: Vec<ExprId> = partition
            .into_iter()
            .map(|c| self.arena.column_expr(c))
            .collect();
        let order_exprs: Vec<ExprId> = order
            .into_iter()
            .map(|c| self.arena.column_expr(c))
            .collect();

        let mut dist = Distribution::hash(partition_exprs);
        if !order_exprs.is_empty() && order_exprs.len() == order_type.len() {
            dist = dist.with_order(order_exprs, order_type);
        }
        dist
    }

    // ---- join methods ----

    fn add_join(
        &mut self,
        candidate: &JoinCandidate,
        plan: RelId,
        state: &mut PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        if candidate.right_keys.is_empty() {
            return self.cross_join(candidate, plan, state, to_try);
        }
        self.join_by_index(candidate, plan, state, to_try)?;
        self.join_by_hash(candidate, plan, state, to_try)?;
        if matches!(candidate.join_type, JoinKind::Left | JoinKind::LeftSemi) {
            self.join_by_hash_right(candidate, plan, state, to_try)?;
        }
        Ok(())
    }

    /// Columns the join must output: whatever downstream still needs.
    fn join_output_columns(
        &self,
        state: &PlanState,
        placed_after: &IdSet,
        probe_columns: &[ColumnId],
        build_columns: &[ColumnId],
        existence: bool,
    ) -> Vec<ColumnId> {
        let downstream = self.downstream_columns(
            state.dt,
            placed_after,
            &state.placed_conjuncts,
            &state.target,
            true,
        );
        let mut columns: Vec<ColumnId> = probe_columns
            .iter()
            .copied()
            .filter(|c| downstream.contains(*c))
            .collect();
        if !existence {
            columns.extend(
                build_columns
                    .iter()
                    .copied()
                    .filter(|c| downstream.contains(*c)),
            );
        }
        columns
    }

    /// Build side of a hash join: a leaf chain for one base table, a
    /// memoized plan for a derived table or bush.
    fn make_build_side(
        &mut self,
        candidate: &JoinCandidate,
        state: &PlanState,
        req: DistReq,
    ) -> Result<(RelId, PlanCost, f64, MemoKey)> {
        let first = candidate.tables[0];
        let single_leaf = candidate.tables.len() == 1
            && candidate.existences.is_empty()
            && !matches!(self.arena.table(first), TableNode::Derived(_));

        if single_leaf {
            let (rel, node_cost) = self.make_leaf_rel(first)?;
            let mut chain = PlanCost::default();
            chain.add(&node_cost);
            let columns = IdSet::from_ids(self.arena.rel(rel).columns.iter().copied());
            let key = MemoKey {
                first,
                tables: IdSet::from_ids([first]),
                columns,
                existences: Vec::new(),
            };
            return Ok((rel, chain, node_cost.fanout, key));
        }

        let mut columns = IdSet::new();
        for key_expr in &candidate.right_keys {
            columns.union_with(&self.arena.expr(*key_expr).columns);
        }
        let downstream = self.downstream_columns(
            state.dt,
            &state.placed,
            &state.placed_conjuncts,
            &state.target,
            true,
        );
        for table in &candidate.tables {
            for column in self.arena.table(*table).output_columns() {
                if downstream.contains(*column) {
                    columns.insert(*column);
                }
            }
        }

        let key = MemoKey {
            first,
            tables: IdSet::from_ids(candidate.tables.iter().copied()),
            columns,
            existences: candidate.existences.clone(),
        };
        let (plan, needs_shuffle) = self.make_plan(key.clone(), req, state.dt)?;
        let mut chain = plan.cost;
        let mut root = plan.root;
        if candidate.tables.len() == 1 {
            root = self.wrap_dt_projection(first, root, &mut chain);
        }
        if needs_shuffle && !self.opts.single_node() {
            let columns = self.arena.rel(root).columns.clone();
            let rep_cost = cost::repartition_cost(&self.arena, &columns, plan.out_cardinality);
            root = self.arena.add_rel(
                RelOp::Repartition,
                vec![root],
                Distribution::arbitrary(),
                columns,
                rep_cost,
            );
            chain.add(&rep_cost);
        }
        // Existence reducers already shrank the plan through its semi edges.
        Ok((root, chain, plan.out_cardinality, key))
    }

    fn join_by_hash(
        &mut self,
        candidate: &JoinCandidate,
        plan: RelId,
        state: &mut PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        let snapshot = state.save();

        let probe_node = self.arena.rel(plan);
        let probe_columns = probe_node.columns.clone();
        let probe_dist = probe_node.distribution.clone();
        let probe_card = state.cost.fanout;
        let distributed = !self.opts.single_node()
            && !probe_dist.is_gather()
            && !matches!(probe_dist.kind, PartitionKind::Singleton);

        let (build_root, mut build_chain, build_card, build_key) =
            match self.make_build_side(candidate, state, DistReq::Any) {
                Ok(build) => build,
                Err(Error::OverBudget(_)) if self.budget_exhausted => {
                    state.restore(snapshot);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
        let build_columns = self.arena.rel(build_root).columns.clone();

        let probe_bytes = probe_card * self.arena.byte_size(&probe_columns);
        let build_bytes = build_card * self.arena.byte_size(&build_columns);
        let probe_aligned = probe_dist.satisfies_partitioning(&candidate.left_keys);
        let build_aligned = self
            .arena
            .rel(build_root)
            .distribution
            .satisfies_partitioning(&candidate.right_keys);

        // Broadcast when replicating the build moves fewer bytes than
        // re-shuffling the probe; never when the probe is already aligned.
        let broadcast = distributed
            && !probe_aligned
            && build_bytes * self.opts.num_workers as f64 * cost::BYTE_SHUFFLE
                < probe_bytes * cost::BYTE_SHUFFLE;

        let mut probe_top = plan;
        let mut build_top = build_root;
        let mut build_dist_kind = PartitionKind::Hash;

        if distributed {
            if broadcast {
                // Broadcast replicates to every worker.
                let mut rep_cost =
                    cost::repartition_cost(&self.arena, &build_columns, build_card);
                rep_cost.transfer_bytes *= self.opts.num_workers as f64;
                build_top = self.arena.add_rel(
                    RelOp::Repartition,
                    vec![build_top],
                    Distribution::broadcast(),
                    build_columns.clone(),
                    rep_cost,
                );
                build_chain.add(&rep_cost);
                build_dist_kind = PartitionKind::Broadcast;
            } else {
                if !build_aligned {
                    let rep_cost =
                        cost::repartition_cost(&self.arena, &build_columns, build_card);
                    build_top = self.arena.add_rel(
                        RelOp::Repartition,
                        vec![build_top],
                        Distribution::hash(candidate.right_keys.clone()),
                        build_columns.clone(),
                        rep_cost,
                    );
                    build_chain.add(&rep_cost);
                }
                if !probe_aligned {
                    let rep_cost =
                        cost::repartition_cost(&self.arena, &probe_columns, probe_card);
                    probe_top = self.arena.add_rel(
                        RelOp::Repartition,
                        vec![probe_top],
                        Distribution::hash(candidate.left_keys.clone()),
                        probe_columns.clone(),
                        rep_cost,
                    );
                    state.cost.add(&rep_cost);
                }
            }
        }

        // Reuse an identical build already placed in this partial plan.
        let reused = state.builds.iter().find(|b| {
            b.key == build_key && b.kind == build_dist_kind && b.partition == candidate.right_keys
        });
        let (build_node, new_build) = match reused {
            Some(build) => (build.rel, None),
            None => {
                let hb_cost = cost::hash_build_cost(
                    &self.arena,
                    &candidate.right_keys,
                    &build_columns,
                    build_card,
                );
                build_chain.add(&hb_cost);
                self.build_counter += 1;
                let hb = self.arena.add_rel(
                    RelOp::HashBuild {
                        keys: candidate.right_keys.clone(),
                        build_id: self.build_counter,
                    },
                    vec![build_top],
                    self.arena.rel(build_top).distribution.clone(),
                    build_columns.clone(),
                    hb_cost,
                );
                state.cost.add_branch(&build_chain);
                (
                    hb,
                    Some(BuildRef {
                        rel: hb,
                        key: build_key,
                        kind: build_dist_kind,
                        partition: candidate.right_keys.clone(),
                        cardinality: build_card,
                    }),
                )
            }
        };

        let mut placed_after = state.placed.clone();
        for table in &candidate.tables {
            placed_after.insert(*table);
        }

        let out_columns = self.join_output_columns(
            state,
            &placed_after,
            &probe_columns,
            &build_columns,
            candidate.join_type.is_existence(),
        );
        let fanout = candidate.fanout;
        let join_cost = cost::join_probe_cost(
            build_card,
            build_columns.len(),
            candidate.left_keys.len(),
            fanout,
            state.cost.fanout,
        );
        let join_dist = self.arena.rel(probe_top).distribution.clone();
        let join = self.arena.add_rel(
            RelOp::Join {
                method: JoinMethod::Hash,
                join_type: candidate.join_type,
                left_keys: candidate.left_keys.clone(),
                right_keys: candidate.right_keys.clone(),
                filter: candidate.filter.clone(),
            },
            vec![probe_top, build_node],
            join_dist,
            out_columns.clone(),
            join_cost,
        );
        state.cost.add(&join_cost);

        state.placed = placed_after;
        for column in &out_columns {
            state.columns.insert(*column);
        }
        for key_expr in &candidate.right_keys {
            for column in self.arena.expr(*key_expr).columns.iter::<ColumnId>() {
                state.columns.insert(column);
            }
        }
        if let Some(build) = new_build {
            state.builds.push(build);
        }

        to_try.push(NextJoin {
            plan: join,
            cost: state.cost,
            placed: state.placed.clone(),
            placed_conjuncts: state.placed_conjuncts.clone(),
            columns: state.columns.clone(),
            builds: state.builds.clone(),
        });
        state.restore(snapshot);
        Ok(())
    }

    /// Index path: the candidate table has a layout whose lookup keys are a
    /// prefix of the equi-keys; the probe streams into a batched lookup and
    /// no build is created.
    fn join_by_index(
        &mut self,
        candidate: &JoinCandidate,
        plan: RelId,
        state: &mut PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        if candidate.tables.len() != 1 || !candidate.existences.is_empty() {
            return Ok(());
        }
        let table = candidate.tables[0];
        let TableNode::Base(base) = self.arena.table(table) else {
            return Ok(());
        };

        // Right keys must be plain columns naming a lookup-key prefix.
        let right_names: Vec<Option<String>> = candidate
            .right_keys
            .iter()
            .map(|k| match &self.arena.expr(*k).kind {
                crate::expr::ExprKind::Column(c) => {
                    Some(self.arena.name_str(self.arena.column(*c).name).to_string())
                }
                _ => None,
            })
            .collect();
        if right_names.iter().any(Option::is_none) {
            return Ok(());
        }
        let right_names: Vec<String> = right_names.into_iter().flatten().collect();

        let lookup_layout = base.table.layouts.iter().find(|layout| {
            !layout.lookup_keys.is_empty()
                && layout.lookup_keys.len() <= right_names.len()
                && layout
                    .lookup_keys
                    .iter()
                    .zip(right_names.iter())
                    .all(|(a, b)| a == b)
        });
        let Some(layout) = lookup_layout else {
            return Ok(());
        };
        let layout_name = layout.name.clone();
        let layout_card = layout.cardinality.max(1) as f64;
        let table_columns = base.columns.clone();

        let snapshot = state.save();
        let probe_columns = self.arena.rel(plan).columns.clone();
        let fanout = adjust_fanout(
            cost::join_fanout(&self.arena, layout_card, &candidate.right_keys),
            candidate.join_type,
        );
        let node_cost =
            cost::index_lookup_cost(layout_card, 1.0, state.cost.fanout, fanout);

        let mut placed_after = state.placed.clone();
        placed_after.insert(table);
        let out_columns = self.join_output_columns(
            state,
            &placed_after,
            &probe_columns,
            &table_columns,
            candidate.join_type.is_existence(),
        );
        let distribution = self.arena.rel(plan).distribution.clone();
        let lookup = self.arena.add_rel(
            RelOp::TableScan {
                table,
                layout: layout_name,
                lookup_keys: candidate.left_keys.clone(),
            },
            vec![plan],
            distribution,
            out_columns.clone(),
            node_cost,
        );
        state.cost.add(&node_cost);
        state.placed = placed_after;
        for column in &out_columns {
            state.columns.insert(*column);
        }

        to_try.push(NextJoin {
            plan: lookup,
            cost: state.cost,
            placed: state.placed.clone(),
            placed_conjuncts: state.placed_conjuncts.clone(),
            columns: state.columns.clone(),
            builds: state.builds.clone(),
        });
        state.restore(snapshot);
        Ok(())
    }

    /// Right-hash variant of a left outer / left semi join: the new table
    /// streams as the probe and the partial plan becomes the build.
    fn join_by_hash_right(
        &mut self,
        candidate: &JoinCandidate,
        plan: RelId,
        state: &mut PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        if candidate.tables.len() != 1 || !candidate.existences.is_empty() {
            return Ok(());
        }
        let table = candidate.tables[0];
        if matches!(self.arena.table(table), TableNode::Derived(_)) {
            return Ok(());
        }

        let snapshot = state.save();
        let left_chain = state.cost;
        let left_card = state.cost.fanout;
        let probe_columns = self.arena.rel(plan).columns.clone();

        // The accumulated chain becomes a build side.
        let hb_cost = cost::hash_build_cost(
            &self.arena,
            &candidate.left_keys,
            &probe_columns,
            left_card,
        );
        self.build_counter += 1;
        let build = self.arena.add_rel(
            RelOp::HashBuild {
                keys: candidate.left_keys.clone(),
                build_id: self.build_counter,
            },
            vec![plan],
            self.arena.rel(plan).distribution.clone(),
            probe_columns.clone(),
            hb_cost,
        );
        let mut build_chain = left_chain;
        build_chain.add(&hb_cost);

        // Fresh probe chain from the candidate table.
        let (scan, scan_cost) = self.make_leaf_rel(table)?;
        let scan_columns = self.arena.rel(scan).columns.clone();
        state.cost = PlanCost::default();
        state.cost.add(&scan_cost);
        state.cost.add_branch(&build_chain);

        let mut placed_after = state.placed.clone();
        placed_after.insert(table);
        let out_columns = self.join_output_columns(
            state,
            &placed_after,
            &probe_columns,
            &scan_columns,
            candidate.join_type.is_existence(),
        );

        let fanout = adjust_fanout(
            cost::join_fanout(&self.arena, left_card, &candidate.left_keys),
            candidate.join_type.reversed(),
        );
        let join_cost = cost::join_probe_cost(
            left_card,
            probe_columns.len(),
            candidate.right_keys.len(),
            fanout,
            state.cost.fanout,
        );
        let join_dist = self.arena.rel(scan).distribution.clone();
        let join = self.arena.add_rel(
            RelOp::Join {
                method: JoinMethod::HashRight,
                join_type: candidate.join_type.reversed(),
                left_keys: candidate.right_keys.clone(),
                right_keys: candidate.left_keys.clone(),
                filter: candidate.filter.clone(),
            },
            vec![scan, build],
            join_dist,
            out_columns.clone(),
            join_cost,
        );
        state.cost.add(&join_cost);
        state.placed = placed_after;
        for column in &out_columns {
            state.columns.insert(*column);
        }

        to_try.push(NextJoin {
            plan: join,
            cost: state.cost,
            placed: state.placed.clone(),
            placed_conjuncts: state.placed_conjuncts.clone(),
            columns: state.columns.clone(),
            builds: state.builds.clone(),
        });
        state.restore(snapshot);
        Ok(())
    }

    /// Last resort (and the single-row subquery path): broadcast the
    /// candidate and cross-join it.
    fn cross_join(
        &mut self,
        candidate: &JoinCandidate,
        plan: RelId,
        state: &mut PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        let snapshot = state.save();
        let probe_columns = self.arena.rel(plan).columns.clone();

        let (build_root, mut build_chain, build_card, _build_key) =
            match self.make_build_side(candidate, state, DistReq::Any) {
                Ok(build) => build,
                Err(Error::OverBudget(_)) if self.budget_exhausted => {
                    state.restore(snapshot);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
        let build_columns = self.arena.rel(build_root).columns.clone();

        let mut build_top = build_root;
        if !self.opts.single_node() {
            let mut rep_cost = cost::repartition_cost(&self.arena, &build_columns, build_card);
            rep_cost.transfer_bytes *= self.opts.num_workers as f64;
            build_top = self.arena.add_rel(
                RelOp::Repartition,
                vec![build_top],
                Distribution::broadcast(),
                build_columns.clone(),
                rep_cost,
            );
            build_chain.add(&rep_cost);
        }
        state.cost.add_branch(&build_chain);

        let mut placed_after = state.placed.clone();
        for table in &candidate.tables {
            placed_after.insert(*table);
        }
        let out_columns = self.join_output_columns(
            state,
            &placed_after,
            &probe_columns,
            &build_columns,
            false,
        );
        let join_cost = Cost {
            input_cardinality: state.cost.fanout,
            fanout: build_card.max(1.0),
            unit_cost: build_columns.len() as f64 * cost::HASH_EXTRACT,
            setup_cost: 0.0,
            total_bytes: 0.0,
            transfer_bytes: 0.0,
        };
        let join_dist = self.arena.rel(plan).distribution.clone();
        let join = self.arena.add_rel(
            RelOp::Join {
                method: JoinMethod::Cross,
                join_type: JoinKind::Inner,
                left_keys: Vec::new(),
                right_keys: Vec::new(),
                filter: candidate.filter.clone(),
            },
            vec![plan, build_top],
            join_dist,
            out_columns.clone(),
            join_cost,
        );
        state.cost.add(&join_cost);
        state.placed = placed_after;
        for column in &out_columns {
            state.columns.insert(*column);
        }

        to_try.push(NextJoin {
            plan: join,
            cost: state.cost,
            placed: state.placed.clone(),
            placed_conjuncts: state.placed_conjuncts.clone(),
            columns: state.columns.clone(),
            builds: state.builds.clone(),
        });
        state.restore(snapshot);
        Ok(())
    }

    // ---- postprocess ----

    /// Attaches aggregation, ordering and limit per the derived table.
    pub(crate) fn add_postprocess(
        &mut self,
        plan: RelId,
        state: &mut PlanState,
    ) -> Result<RelId> {
        let info = self.dt_info(state.dt)?;
        let mut top = plan;

        if let Some(agg) = &info.aggregation {
            let distributed = !self.opts.single_node()
                && !self.arena.rel(top).distribution.is_gather()
                && !matches!(
                    self.arena.rel(top).distribution.kind,
                    PartitionKind::Singleton
                );
            let aligned = self
                .arena
                .rel(top)
                .distribution
                .satisfies_partitioning(&agg.group_by)
                && !agg.group_by.is_empty();

            if distributed && !aligned {
                let partial_cost = cost::aggregation_cost(
                    &self.arena,
                    &agg.group_by,
                    &agg.aggregates,
                    state.cost.fanout,
                );
                let dist = self.arena.rel(top).distribution.clone();
                top = self.arena.add_rel(
                    RelOp::Aggregation {
                        step: AggStep::Partial,
                        group_by: agg.group_by.clone(),
                        aggregates: agg.aggregates.clone(),
                    },
                    vec![top],
                    dist,
                    agg.columns.clone(),
                    partial_cost,
                );
                state.cost.add(&partial_cost);

                let rep_dist = if agg.group_by.is_empty() {
                    Distribution::gather()
                } else {
                    Distribution::hash(agg.group_by.clone())
                };
                let rep_cost =
                    cost::repartition_cost(&self.arena, &agg.columns, state.cost.fanout);
                top = self.arena.add_rel(
                    RelOp::Repartition,
                    vec![top],
                    rep_dist.clone(),
                    agg.columns.clone(),
                    rep_cost,
                );
                state.cost.add(&rep_cost);

                let final_cost = Cost {
                    input_cardinality: state.cost.fanout,
                    fanout: 1.0,
                    unit_cost: agg.group_by.len() as f64
                        * cost::hash_probe_cost(state.cost.fanout),
                    setup_cost: 0.0,
                    total_bytes: 0.0,
                    transfer_bytes: 0.0,
                };
                top = self.arena.add_rel(
                    RelOp::Aggregation {
                        step: AggStep::Final,
                        group_by: agg.group_by.clone(),
                        aggregates: agg.aggregates.clone(),
                    },
                    vec![top],
                    rep_dist,
                    agg.columns.clone(),
                    final_cost,
                );
                state.cost.add(&final_cost);
            } else {
                let agg_cost = cost::aggregation_cost(
                    &self.arena,
                    &agg.group_by,
                    &agg.aggregates,
                    state.cost.fanout,
                );
                let dist = self.arena.rel(top).distribution.clone();
                top = self.arena.add_rel(
                    RelOp::Aggregation {
                        step: AggStep::Single,
                        group_by: agg.group_by.clone(),
                        aggregates: agg.aggregates.clone(),
                    },
                    vec![top],
                    dist,
                    agg.columns.clone(),
                    agg_cost,
                );
                state.cost.add(&agg_cost);
            }
            for column in &agg.columns {
                state.columns.insert(*column);
            }
        }

        if !info.ordering.is_empty() {
            let keys: Vec<ExprId> = info.ordering.iter().map(|(e, _)| *e).collect();
            let order_type: Vec<_> = info.ordering.iter().map(|(_, o)| *o).collect();
            let columns = self.arena.rel(top).columns.clone();
            let order_cost = cost::order_by_cost(&self.arena, &columns, state.cost.fanout);
            let dist = self
                .arena
                .rel(top)
                .distribution
                .clone()
                .with_order(keys.clone(), order_type.clone());
            top = self.arena.add_rel(
                RelOp::OrderBy {
                    keys,
                    order_type,
                },
                vec![top],
                dist,
                columns,
                order_cost,
            );
            state.cost.add(&order_cost);
        }

        if info.limit.is_some() || info.offset > 0 {
            let limit = info.limit.unwrap_or(i64::MAX);
            let limit_cost = cost::limit_cost(limit, state.cost.fanout);
            let node = self.arena.rel(top);
            let dist = node.distribution.clone();
            let columns = node.columns.clone();
            top = self.arena.add_rel(
                RelOp::Limit {
                    offset: info.offset,
                    limit,
                },
                vec![top],
                dist,
                columns,
                limit_cost,
            );
            state.cost.add(&limit_cost);
        }

        Ok(top)
    }

    // ---- unions ----

    /// Union-all derived table: plan each member, sum cardinalities.
    pub(crate) fn plan_union(&mut self, dt: TableId) -> Result<PlanSet> {
        let info = self.dt_info(dt)?;
        let mut state = PlanState::new(dt, IdSet::new());
        let mut roots = Vec::with_capacity(info.tables.len());
        let mut total_card = 0.0;

        for (i, member) in info.tables.iter().enumerate() {
            let key = self.dt_memo_key(*member)?;
            let (plan, _) = self.make_plan(key, DistReq::Any, dt)?;
            let mut chain = plan.cost;
            let root = self.wrap_dt_projection(*member, plan.root, &mut chain);
            if i == 0 {
                state.cost.unit_cost += chain.unit_cost;
                state.cost.setup_cost += chain.setup_cost;
                state.cost.total_bytes += chain.total_bytes;
                state.cost.transfer_bytes += chain.transfer_bytes;
            } else {
                state.cost.add_branch(&chain);
            }
            total_card += plan.out_cardinality;
            roots.push(root);
            state.placed.insert(*member);
        }

        let union_cost = cost::union_all_cost(total_card);
        let columns = info.columns.clone();
        let union_rel = self.arena.add_rel(
            RelOp::UnionAll,
            roots,
            Distribution::arbitrary(),
            columns.clone(),
            union_cost,
        );
        state.cost.fanout = total_card;
        for column in &columns {
            state.columns.insert(*column);
        }

        let top = self.add_postprocess(union_rel, &mut state)?;
        let plan = Plan {
            root: top,
            cost: state.cost,
            tables: info.table_set.clone(),
            columns: state.columns.clone(),
            out_cardinality: state.cost.fanout,
        };
        let mut set = PlanSet::default();
        set.add_plan(&self.arena, plan);
        Ok(set)
    }

    /// Short operator-shape string for tracing.
    pub(crate) fn plan_shape(&self, rel: RelId) -> String {
        let node = self.arena.rel(rel);
        let mut parts: Vec<String> = node
            .inputs
            .iter()
            .map(|input| self.plan_shape(*input))
            .collect();
        let name = match &node.op {
            RelOp::TableScan { table, .. } => match self.arena.table(*table) {
                TableNode::Base(base) => format!("scan({})", base.table.name),
                _ => "scan".to_string(),
            },
            other => other.name().to_string(),
        };
        parts.push(name);
        parts.join(" ")
    }
}

fn adjust_fanout(raw: f64, join_type: JoinKind) -> f64 {
    match join_type {
        JoinKind::Inner => raw,
        JoinKind::Left | JoinKind::Right | JoinKind::Full => raw.max(1.0),
        JoinKind::LeftSemi | JoinKind::RightSemi => raw.min(1.0),
        JoinKind::LeftAnti => (1.0 - raw.min(1.0)).max(0.1),
        JoinKind::Mark => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ValueInfo;
    use quarry_core::types::{DataType, SortOrder};

    fn plan_with(arena: &mut QueryArena, total: f64, ordered: bool) -> Plan {
        let dist = if ordered {
            let name = arena.name("k");
            let table = arena.add_table(|id| {
                TableNode::Values(crate::graph::ValuesTable {
                    id,
                    cname: name,
                    schema: quarry_core::types::Schema::new(vec![]),
                    rows: vec![],
                    columns: vec![],
                })
            });
            let column = arena.add_column(
                name,
                table,
                ValueInfo::new(DataType::Int64, 10.0),
                None,
                None,
            );
            let key = arena.column_expr(column);
            crate::relation::Distribution::arbitrary()
                .with_order(vec![key], vec![SortOrder::ASC_NULLS_LAST])
        } else {
            crate::relation::Distribution::arbitrary()
        };
        let root = arena.add_rel(
            RelOp::UnionAll,
            vec![],
            dist,
            vec![],
            Cost::default(),
        );
        Plan {
            root,
            cost: PlanCost {
                fanout: 1.0,
                unit_cost: total,
                setup_cost: 0.0,
                total_bytes: 0.0,
                transfer_bytes: 0.0,
            },
            tables: IdSet::new(),
            columns: IdSet::new(),
            out_cardinality: 1.0,
        }
    }

    #[test]
    fn plan_set_keeps_the_cheapest() {
        let mut arena = QueryArena::new();
        let mut set = PlanSet::default();
        let plan = plan_with(&mut arena, 100.0, false);
        assert!(set.add_plan(&arena, plan));
        let plan = plan_with(&mut arena, 50.0, false);
        assert!(set.add_plan(&arena, plan));
        // Strictly worse and no interesting property: rejected.
        let plan = plan_with(&mut arena, 70.0, false);
        assert!(!set.add_plan(&arena, plan));
        assert_eq!(set.plans.len(), 1);
        assert_eq!(set.best().unwrap().total(), 50.0);
    }

    #[test]
    fn plan_set_retains_interesting_orders() {
        let mut arena = QueryArena::new();
        let mut set = PlanSet::default();
        let plan = plan_with(&mut arena, 50.0, false);
        assert!(set.add_plan(&arena, plan));
        // More expensive but ordered: retained alongside the cheapest.
        let plan = plan_with(&mut arena, 70.0, true);
        assert!(set.add_plan(&arena, plan));
        assert_eq!(set.plans.len(), 2);
        assert_eq!(set.best().unwrap().total(), 50.0);
    }

    #[test]
    fn memo_key_equality_and_hash() {
        use std::collections::HashMap;
        let key = |cols: &[u32]| MemoKey {
            first: TableId::new(1),
            tables: IdSet::from_ids([TableId::new(1), TableId::new(2)]),
            columns: IdSet::from_ids(cols.iter().map(|c| quarry_core::id::ColumnId::new(*c))),
            existences: vec![IdSet::from_ids([TableId::new(3)])],
        };
        let mut memo: HashMap<MemoKey, u32> = HashMap::new();
        memo.insert(key(&[4, 5]), 1);
        assert_eq!(memo.get(&key(&[4, 5])), Some(&1));
        assert_eq!(memo.get(&key(&[4])), None);
    }

    #[test]
    fn next_join_dominance_requires_same_tables() {
        let mut arena = QueryArena::new();
        let cheap = plan_with(&mut arena, 10.0, false);
        let costly = plan_with(&mut arena, 20.0, false);

        let next = |plan: &Plan, placed: &[u32]| NextJoin {
            plan: plan.root,
            cost: plan.cost,
            placed: IdSet::from_ids(placed.iter().map(|t| TableId::new(*t))),
            placed_conjuncts: IdSet::new(),
            columns: IdSet::new(),
            builds: Vec::new(),
        };

        let a = next(&cheap, &[1, 2]);
        let b = next(&costly, &[1, 2]);
        let c = next(&costly, &[1, 3]);
        assert!(b.is_worse(&a, &arena));
        assert!(!a.is_worse(&b, &arena));
        // Different table sets never dominate each other.
        assert!(!c.is_worse(&a, &arena));
    }

    #[test]
    fn ordered_variant_survives_dominance() {
        let mut arena = QueryArena::new();
        let cheap = plan_with(&mut arena, 10.0, false);
        let ordered = plan_with(&mut arena, 20.0, true);
        let next = |plan: &Plan| NextJoin {
            plan: plan.root,
            cost: plan.cost,
            placed: IdSet::from_ids([TableId::new(1)]),
            placed_conjuncts: IdSet::new(),
            columns: IdSet::new(),
            builds: Vec::new(),
        };
        assert!(!next(&ordered).is_worse(&next(&cheap), &arena));
    }

    #[test]
    fn fanout_adjustment_by_join_type() {
        assert_eq!(adjust_fanout(0.2, JoinKind::Inner), 0.2);
        assert_eq!(adjust_fanout(0.2, JoinKind::Left), 1.0);
        assert_eq!(adjust_fanout(3.0, JoinKind::LeftSemi), 1.0);
        assert!((adjust_fanout(0.2, JoinKind::LeftAnti) - 0.8).abs() < 1e-12);
    }
}
