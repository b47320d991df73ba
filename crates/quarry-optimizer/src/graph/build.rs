//! Lowering the logical plan into the query graph.
//!
//! Scans become base tables; filters flatten into conjuncts; projections
//! introduce synonyms resolved through a per-scope rename map; joins become
//! edges split into equi-keys and residual filters; aggregations, sorts,
//! limits and set operations either attach to the derived table being built
//! or force a fresh nested one when they cannot reorder with their parents.

use std::collections::HashMap;

use quarry_core::bitset::IdSet;
use quarry_core::config::OptimizerOptions;
use quarry_core::error::{Error, Result};
use quarry_core::id::{ColumnId, ExprId, PathId, TableId};
use quarry_core::logical::{
    AggregateCall, JoinType, LogicalExpr, LogicalOp, LogicalPlan, SetOperation, SortKey,
    SpecialForm,
};
use quarry_core::path::{Step, Subfield, SubscriptKey};
use quarry_core::types::{DataType, Literal, SortOrder};

use quarry_catalog::handles::{FilterOp, FilterSpec};
use quarry_catalog::Catalog;

use crate::arena::QueryArena;
use crate::expr::{ExprKind, FunctionRegistry, ValueInfo};
use crate::graph::subfields::SubfieldMarker;
use crate::graph::{
    AggregationSpec, BaseTable, DerivedTable, DtSetOp, JoinEdge, TableNode, ValuesTable,
};
use crate::relation::JoinKind;

/// Default distinct-count assumption for columns without statistics.
const DEFAULT_DISTINCT: u64 = 1000;

/// In-progress derived table.
struct DtBuild {
    id: TableId,
    tables: Vec<TableId>,
    conjuncts: Vec<ExprId>,
    edges: Vec<JoinEdge>,
    aggregation: Option<AggregationSpec>,
    ordering: Vec<(ExprId, SortOrder)>,
    limit: Option<i64>,
    offset: i64,
    set_op: Option<DtSetOp>,
    scope: HashMap<String, ExprId>,
}

pub struct GraphBuilder<'a> {
    arena: &'a mut QueryArena,
    catalog: &'a dyn Catalog,
    registry: &'a FunctionRegistry,
    opts: &'a OptimizerOptions,
    /// Subfield access sets keyed by (logical node id, ordinal).
    control: crate::graph::subfields::PlanSubfields,
    payload: crate::graph::subfields::PlanSubfields,
    /// (top column, path) → synthesized leaf column.
    leaf_index: HashMap<(ColumnId, PathId), ColumnId>,
    dt_stack: Vec<DtBuild>,
    name_counter: u32,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        arena: &'a mut QueryArena,
        catalog: &'a dyn Catalog,
        registry: &'a FunctionRegistry,
        opts: &'a OptimizerOptions,
    ) -> Self {
        Self {
            arena,
            catalog,
            registry,
            opts,
            control: Default::default(),
            payload: Default::default(),
            leaf_index: HashMap::new(),
            dt_stack: Vec::new(),
            name_counter: 0,
        }
    }

    /// Builds the derived-table forest for `plan` and returns the root.
    pub fn build(mut self, plan: &LogicalPlan) -> Result<TableId> {
        {
            let mut marker = SubfieldMarker::new(self.arena, self.registry);
            marker.mark_all(plan)?;
            self.control = marker.control;
            self.payload = marker.payload;
        }
        self.build_dt(plan)
    }

    fn new_cname(&mut self, prefix: &str) -> quarry_core::id::NameId {
        self.name_counter += 1;
        let name = format!("{prefix}{}", self.name_counter);
        self.arena.name(&name)
    }

    fn current(&mut self) -> &mut DtBuild {
        self.dt_stack
            .last_mut()
            .expect("graph builder has no open derived table")
    }

    // ---- derived tables ----

    fn build_dt(&mut self, node: &LogicalPlan) -> Result<TableId> {
        let cname = self.new_cname("dt");
        let dt_id = self.arena.add_table(|id| {
            TableNode::Derived(DerivedTable {
                id,
                cname,
                tables: Vec::new(),
                table_set: IdSet::new(),
                conjuncts: Vec::new(),
                join_edges: Vec::new(),
                columns: Vec::new(),
                exprs: Vec::new(),
                aggregation: None,
                ordering: Vec::new(),
                limit: None,
                offset: 0,
                set_op: None,
            })
        });

        self.dt_stack.push(DtBuild {
            id: dt_id,
            tables: Vec::new(),
            conjuncts: Vec::new(),
            edges: Vec::new(),
            aggregation: None,
            ordering: Vec::new(),
            limit: None,
            offset: 0,
            set_op: None,
            scope: HashMap::new(),
        });

        self.translate_top(node)?;

        let build = self.dt_stack.pop().ok_or_else(|| {
            Error::Internal("derived table stack underflow".to_string())
        })?;

        // Output columns follow the logical node's output schema. Columns
        // nothing upstream accesses have no scope entry and are dropped.
        let mut columns = Vec::new();
        let mut exprs = Vec::new();
        for field in &node.output_schema().fields {
            let Some(expr) = build.scope.get(&field.name).copied() else {
                continue;
            };
            let name = self.arena.name(&field.name);
            let value = self.arena.expr(expr).value.clone();
            let column = self.arena.add_column(name, dt_id, value, None, None);
            columns.push(column);
            exprs.push(expr);
        }

        let table_set = IdSet::from_ids(build.tables.iter().copied());
        if build.tables.is_empty() {
            return Err(Error::InvalidInput(
                "derived table with no source tables".to_string(),
            ));
        }

        if let TableNode::Derived(dt) = self.arena.table_mut(dt_id) {
            dt.tables = build.tables;
            dt.table_set = table_set;
            dt.conjuncts = build.conjuncts;
            dt.join_edges = build.edges;
            dt.columns = columns;
            dt.exprs = exprs;
            dt.aggregation = build.aggregation;
            dt.ordering = build.ordering;
            dt.limit = build.limit;
            dt.offset = build.offset;
            dt.set_op = build.set_op;
        }
        Ok(dt_id)
    }

    /// Handles the top chain of a derived table: sort/limit/aggregation and
    /// pass-through projections attach here instead of nesting.
    fn translate_top(&mut self, node: &LogicalPlan) -> Result<()> {
        match &node.op {
            LogicalOp::Limit {
                input,
                offset,
                limit,
            } => {
                if *limit < 0 || *offset < 0 {
                    return Err(Error::InvalidInput(format!(
                        "negative limit/offset: {limit}/{offset}"
                    )));
                }
                self.translate_top(input)?;
                let dt = self.current();
                dt.limit = Some(match dt.limit {
                    Some(existing) => existing.min(*limit),
                    None => *limit,
                });
                dt.offset = dt.offset.saturating_add(*offset);
                Ok(())
            }
            LogicalOp::Sort { input, ordering } => {
                self.translate_top(input)?;
                let keys = self.translate_sort_keys(ordering)?;
                self.current().ordering = keys;
                Ok(())
            }
            LogicalOp::Project {
                input,
                names,
                exprs,
            } => {
                self.translate_top(input)?;
                self.apply_projection(names, exprs)
            }
            LogicalOp::Aggregate { .. } => self.attach_aggregation(node),
            LogicalOp::Set { op, inputs } => self.translate_set(node, *op, inputs),
            _ => self.translate(node),
        }
    }

    /// Handles nodes inside a derived table. Anything that cannot reorder
    /// with its parents nests into a fresh derived table.
    fn translate(&mut self, node: &LogicalPlan) -> Result<()> {
        match &node.op {
            LogicalOp::Scan { table, .. } => self.add_base_table(node, table),
            LogicalOp::Values { schema, rows } => self.add_values(node, schema, rows),
            LogicalOp::Filter { input, predicate } => {
                self.translate(input)?;
                let conjuncts = flatten_and(predicate);
                for conjunct in conjuncts {
                    let expr = self.translate_expr(&conjunct)?;
                    self.place_conjunct(expr)?;
                }
                Ok(())
            }
            LogicalOp::Project {
                input,
                names,
                exprs,
            } => {
                self.translate(input)?;
                self.apply_projection(names, exprs)
            }
            LogicalOp::Join {
                join_type,
                left,
                right,
                condition,
            } => self.translate_join(*join_type, left, right, condition.as_ref()),
            LogicalOp::Unnest { .. } => Err(Error::InvalidInput(
                "unnest is not supported by the physical operator set".to_string(),
            )),
            // Blocking nodes nest.
            LogicalOp::Aggregate { .. } | LogicalOp::Sort { .. } | LogicalOp::Limit { .. }
            | LogicalOp::Set { .. } => {
                let member = self.build_dt(node)?;
                self.add_member(member);
                Ok(())
            }
        }
    }

    /// Registers a finished nested dt (or any member) in the current scope.
    fn add_member(&mut self, member: TableId) {
        let columns: Vec<(String, ColumnId)> = self
            .arena
            .table(member)
            .output_columns()
            .iter()
            .map(|c| {
                let name = self.arena.name_str(self.arena.column(*c).name).to_string();
                (name, *c)
            })
            .collect();
        for (name, column) in columns {
            let expr = self.arena.column_expr(column);
            self.current().scope.insert(name, expr);
        }
        self.current().tables.push(member);
    }

    // ---- scans and values ----

    fn add_base_table(&mut self, node: &LogicalPlan, table_name: &str) -> Result<()> {
        let table = self.catalog.find_table(table_name)?;
        let layout = table
            .scan_layout()
            .cloned()
            .ok_or_else(|| Error::Catalog(format!("no scannable layout for {table_name}")))?;

        let cname = self.new_cname("t");
        let base_id = self.arena.add_table(|id| {
            TableNode::Base(BaseTable {
                id,
                cname,
                table: table.clone(),
                layout,
                columns: Vec::new(),
                column_filters: Vec::new(),
                filter: Vec::new(),
                filter_selectivity: 1.0,
                control_subfields: HashMap::new(),
                payload_subfields: HashMap::new(),
                map_as_struct: Vec::new(),
            })
        });

        let schema = node.output_schema();
        let mut used: Vec<usize> = (0..schema.len())
            .filter(|ordinal| {
                self.control.paths(node.id, *ordinal).is_some()
                    || self.payload.paths(node.id, *ordinal).is_some()
            })
            .collect();
        if used.is_empty() {
            // Count-star style scans still need one column to drive.
            used.push(0);
        }

        let mut scan_columns = Vec::new();
        let mut control_subfields = HashMap::new();
        let mut payload_subfields = HashMap::new();
        let mut map_as_struct = Vec::new();

        for ordinal in used {
            let field = schema.field(ordinal).ok_or_else(|| {
                Error::InvalidInput(format!("scan {table_name} has no column {ordinal}"))
            })?;
            let distinct = table
                .find_column(&field.name)
                .map(|c| c.approx_num_distinct(DEFAULT_DISTINCT))
                .unwrap_or(DEFAULT_DISTINCT);
            let name = self.arena.name(&field.name);
            let value = ValueInfo::new(field.data_type.clone(), distinct as f64);
            let top = self.arena.add_column(name, base_id, value, None, None);

            let control = self
                .control
                .paths(node.id, ordinal)
                .cloned()
                .unwrap_or_default();
            let payload = self
                .payload
                .paths(node.id, ordinal)
                .cloned()
                .unwrap_or_default();

            let mut live = control.clone();
            live.union_with(&payload);
            if !control.is_empty() {
                control_subfields.insert(top, control);
            }
            if !payload.is_empty() {
                payload_subfields.insert(top, payload);
            }

            let rewrite = self.opts.pushdown_subfields
                && field.data_type.is_complex()
                && self.can_rewrite_as_leaves(&field.data_type, &live);
            if rewrite {
                if self.map_column_as_struct(table_name, &field.name, &field.data_type, &live) {
                    map_as_struct.push(top);
                }
                for raw in live.iter_raw() {
                    let path_id = PathId::new(raw);
                    let path = self.arena.path_ref(path_id).clone();
                    let leaf_type = type_at_path(&field.data_type, path.steps())
                        .unwrap_or(DataType::Boolean);
                    let leaf_name = self
                        .arena
                        .name(&format!("{}{}", field.name, path));
                    let leaf = self.arena.add_column(
                        leaf_name,
                        base_id,
                        ValueInfo::new(leaf_type, DEFAULT_DISTINCT as f64),
                        Some(top),
                        Some(path_id),
                    );
                    self.leaf_index.insert((top, path_id), leaf);
                    scan_columns.push(leaf);
                }
            } else {
                scan_columns.push(top);
            }

            let expr = self.arena.column_expr(top);
            self.current().scope.insert(field.name.clone(), expr);
        }

        if let TableNode::Base(base) = self.arena.table_mut(base_id) {
            base.columns = scan_columns;
            base.control_subfields = control_subfields;
            base.payload_subfields = payload_subfields;
            base.map_as_struct = map_as_struct;
        }

        self.current().tables.push(base_id);
        Ok(())
    }

    /// Leaf rewrite applies when every live path is non-empty and
    /// materializable (no wildcards, no cardinality probes).
    fn can_rewrite_as_leaves(&self, data_type: &DataType, live: &IdSet) -> bool {
        if live.is_empty() {
            return false;
        }
        live.iter_raw().all(|raw| {
            let path = self.arena.path_ref(PathId::new(raw));
            !path.is_empty()
                && path.steps().iter().all(|s| {
                    matches!(s, Step::Field { .. } | Step::Subscript(_))
                })
                && type_at_path(data_type, path.steps()).is_some()
        })
    }

    fn map_column_as_struct(
        &self,
        table: &str,
        column: &str,
        data_type: &DataType,
        live: &IdSet,
    ) -> bool {
        if !matches!(data_type, DataType::Map(_, _)) {
            return false;
        }
        let configured = self
            .opts
            .map_as_struct
            .get(table)
            .is_some_and(|cols| cols.iter().any(|c| c == column));
        if !configured {
            return false;
        }
        // Every access must start with a literal key.
        live.iter_raw().all(|raw| {
            matches!(
                self.arena.path_ref(PathId::new(raw)).steps().first(),
                Some(Step::Subscript(_))
            )
        })
    }

    fn add_values(
        &mut self,
        _node: &LogicalPlan,
        schema: &quarry_core::types::Schema,
        rows: &[Vec<Literal>],
    ) -> Result<()> {
        let cname = self.new_cname("v");
        let values_id = self.arena.add_table(|id| {
            TableNode::Values(ValuesTable {
                id,
                cname,
                schema: schema.clone(),
                rows: rows.to_vec(),
                columns: Vec::new(),
            })
        });

        let mut columns = Vec::new();
        for field in &schema.fields {
            let name = self.arena.name(&field.name);
            let value = ValueInfo::new(field.data_type.clone(), rows.len().max(1) as f64);
            let column = self.arena.add_column(name, values_id, value, None, None);
            columns.push(column);
            let expr = self.arena.column_expr(column);
            self.current().scope.insert(field.name.clone(), expr);
        }
        if let TableNode::Values(values) = self.arena.table_mut(values_id) {
            values.columns = columns;
        }
        self.current().tables.push(values_id);
        Ok(())
    }

    // ---- projections ----

    fn apply_projection(&mut self, names: &[String], exprs: &[LogicalExpr]) -> Result<()> {
        let mut renames = Vec::with_capacity(names.len());
        for (name, expr) in names.iter().zip(exprs.iter()) {
            renames.push((name.clone(), self.translate_expr(expr)?));
        }
        let scope = &mut self.current().scope;
        scope.clear();
        for (name, expr) in renames {
            scope.insert(name, expr);
        }
        Ok(())
    }

    // ---- filters ----

    fn place_conjunct(&mut self, expr: ExprId) -> Result<()> {
        let columns = self.arena.expr(expr).columns.clone();
        let tables = self.tables_of(&columns);

        if tables.len() == 1 {
            let table = tables[0];
            if let TableNode::Base(_) = self.arena.table(table) {
                let spec = self.filter_spec_of(expr);
                let selectivity = self.conjunct_selectivity(expr, spec.as_ref());
                if let TableNode::Base(base) = self.arena.table_mut(table) {
                    if spec.is_some() {
                        base.column_filters.push(expr);
                    } else {
                        base.filter.push(expr);
                    }
                    base.filter_selectivity *= selectivity;
                    return Ok(());
                }
            }
        }
        self.current().conjuncts.push(expr);
        Ok(())
    }

    fn tables_of(&self, columns: &IdSet) -> Vec<TableId> {
        let mut tables = Vec::new();
        for column in columns.iter::<ColumnId>() {
            let relation = self.arena.column(column).relation;
            if !tables.contains(&relation) {
                tables.push(relation);
            }
        }
        tables
    }

    /// A conjunct the catalog's filter language can express:
    /// comparison/IN/BETWEEN of one top-level scalar column against literals.
    pub(crate) fn filter_spec_of(&self, expr: ExprId) -> Option<FilterSpec> {
        let (name, args) = match &self.arena.expr(expr).kind {
            ExprKind::Call { name, args } => (self.arena.name_str(*name), args.clone()),
            _ => return None,
        };

        let column_of = |e: ExprId| -> Option<String> {
            match &self.arena.expr(e).kind {
                ExprKind::Column(c) => {
                    let col = self.arena.column(*c);
                    if col.top_column.is_some() || col.value.data_type.is_complex() {
                        None
                    } else {
                        Some(self.arena.name_str(col.name).to_string())
                    }
                }
                _ => None,
            }
        };
        let literal_of = |e: ExprId| -> Option<Literal> {
            match &self.arena.expr(e).kind {
                ExprKind::Literal(l) => Some(l.clone()),
                _ => None,
            }
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

        match op {
            FilterOp::In => {
                let column = column_of(*args.first()?)?;
                let literals: Option<Vec<Literal>> =
                    args[1..].iter().map(|a| literal_of(*a)).collect();
                Some(FilterSpec {
                    column,
                    op,
                    literals: literals?,
                })
            }
            FilterOp::Between => {
                if args.len() != 3 {
                    return None;
                }
                let column = column_of(args[0])?;
                Some(FilterSpec {
                    column,
                    op,
                    literals: vec![literal_of(args[1])?, literal_of(args[2])?],
                })
            }
            _ => {
                if args.len() != 2 {
                    return None;
                }
                if let (Some(column), Some(lit)) = (column_of(args[0]), literal_of(args[1])) {
                    return Some(FilterSpec {
                        column,
                        op,
                        literals: vec![lit],
                    });
                }
                // Literal on the left: flip the comparison.
                if let (Some(lit), Some(column)) = (literal_of(args[0]), column_of(args[1])) {
                    let flipped = match op {
                        FilterOp::Lt => FilterOp::Gt,
                        FilterOp::Le => FilterOp::Ge,
                        FilterOp::Gt => FilterOp::Lt,
                        FilterOp::Ge => FilterOp::Le,
                        other => other,
                    };
                    return Some(FilterSpec {
                        column,
                        op: flipped,
                        literals: vec![lit],
                    });
                }
                None
            }
        }
    }

    fn conjunct_selectivity(&self, expr: ExprId, spec: Option<&FilterSpec>) -> f64 {
        match spec {
            Some(spec) => {
                let ndv = self
                    .arena
                    .expr(expr)
                    .columns
                    .iter::<ColumnId>()
                    .next()
                    .map(|c| self.arena.column(c).value.cardinality)
                    .unwrap_or(DEFAULT_DISTINCT as f64)
                    .max(1.0);
                match spec.op {
                    FilterOp::Eq => 1.0 / ndv,
                    FilterOp::In => (spec.literals.len() as f64 / ndv).min(1.0),
                    FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge => 0.33,
                    FilterOp::Between => 0.25,
                }
            }
            None => self.opts.default_fanout,
        }
    }

    // ---- joins ----

    fn translate_join(
        &mut self,
        join_type: JoinType,
        left: &LogicalPlan,
        right: &LogicalPlan,
        condition: Option<&LogicalExpr>,
    ) -> Result<()> {
        // Normalize right joins to left by swapping inputs.
        let (join_kind, left, right) = match join_type {
            JoinType::Inner => (JoinKind::Inner, left, right),
            JoinType::Left => (JoinKind::Left, left, right),
            JoinType::Right => (JoinKind::Left, right, left),
            JoinType::Full => (JoinKind::Full, left, right),
        };

        // Only null-producing sides nest: the right side of a left join,
        // both sides of a full join.
        let left_tables_before = self.current().tables.len();
        self.translate_side(left, join_kind != JoinKind::Full)?;
        let left_tables: Vec<TableId> =
            self.current().tables[left_tables_before..].to_vec();

        let right_tables_before = self.current().tables.len();
        self.translate_side(right, join_kind == JoinKind::Inner)?;
        let right_tables: Vec<TableId> =
            self.current().tables[right_tables_before..].to_vec();

        let left_set = IdSet::from_ids(left_tables.iter().copied());
        let right_set = IdSet::from_ids(right_tables.iter().copied());

        let conjuncts = condition.map(flatten_and).unwrap_or_default();
        let mut edges: HashMap<(TableId, TableId), JoinEdge> = HashMap::new();
        let mut residual = Vec::new();

        for conjunct in &conjuncts {
            let expr = self.translate_expr(conjunct)?;
            if let Some((l_table, l_key, r_table, r_key)) =
                self.equi_key_of(expr, &left_set, &right_set)?
            {
                let edge = edges.entry((l_table, r_table)).or_insert_with(|| JoinEdge {
                    left: l_table,
                    right: r_table,
                    left_keys: Vec::new(),
                    right_keys: Vec::new(),
                    filter: Vec::new(),
                    join_type: join_kind,
                });
                edge.left_keys.push(l_key);
                edge.right_keys.push(r_key);
            } else {
                residual.push(expr);
            }
        }

        let mut edges: Vec<JoinEdge> = edges.into_values().collect();
        edges.sort_by_key(|e| (e.left, e.right));

        if edges.is_empty() {
            if join_kind == JoinKind::Inner {
                // Cross join: residual conjuncts place once columns exist.
                for expr in residual {
                    self.place_conjunct(expr)?;
                }
                return Ok(());
            }
            // Outer join without keys: a keyless, non-commutative edge.
            let (Some(l), Some(r)) = (left_tables.last(), right_tables.last()) else {
                return Err(Error::InvalidInput("join side with no tables".to_string()));
            };
            self.current().edges.push(JoinEdge {
                left: *l,
                right: *r,
                left_keys: Vec::new(),
                right_keys: Vec::new(),
                filter: residual,
                join_type: join_kind,
            });
            return Ok(());
        }

        // Residual conjuncts spanning both sides ride on the first edge of
        // an outer join (they are part of its condition); for inner joins
        // they are free-floating conjuncts.
        if join_kind == JoinKind::Inner {
            for expr in residual {
                self.place_conjunct(expr)?;
            }
        } else if let Some(first) = edges.first_mut() {
            first.filter.extend(residual);
        }

        for edge in &edges {
            self.check_edge(edge)?;
        }
        self.current().edges.extend(edges);
        Ok(())
    }

    /// Inner-join sides merge into the current dt; outer-join build sides
    /// nest so their filters stay inside the null-producing scope.
    fn translate_side(&mut self, side: &LogicalPlan, inline: bool) -> Result<()> {
        if inline {
            self.translate(side)
        } else {
            let member = self.build_dt(side)?;
            self.add_member(member);
            Ok(())
        }
    }

    /// `eq(a, b)` with `a` from one side and `b` from the other, each within
    /// a single member table.
    fn equi_key_of(
        &self,
        expr: ExprId,
        left_set: &IdSet,
        right_set: &IdSet,
    ) -> Result<Option<(TableId, ExprId, TableId, ExprId)>> {
        let (name, args) = match &self.arena.expr(expr).kind {
            ExprKind::Call { name, args } if args.len() == 2 => {
                (self.arena.name_str(*name), args.clone())
            }
            _ => return Ok(None),
        };
        if name != "eq" {
            return Ok(None);
        }

        let side_of = |e: ExprId| -> Option<(TableId, bool)> {
            let tables = self.tables_of(&self.arena.expr(e).columns);
            if tables.len() != 1 {
                return None;
            }
            let table = tables[0];
            if left_set.contains(table) {
                Some((table, true))
            } else if right_set.contains(table) {
                Some((table, false))
            } else {
                None
            }
        };

        match (side_of(args[0]), side_of(args[1])) {
            (Some((t0, true)), Some((t1, false))) => {
                self.check_key_types(args[0], args[1])?;
                Ok(Some((t0, args[0], t1, args[1])))
            }
            (Some((t0, false)), Some((t1, true))) => {
                self.check_key_types(args[0], args[1])?;
                Ok(Some((t1, args[1], t0, args[0])))
            }
            _ => Ok(None),
        }
    }

    fn check_key_types(&self, left: ExprId, right: ExprId) -> Result<()> {
        let l = &self.arena.expr(left).value.data_type;
        let r = &self.arena.expr(right).value.data_type;
        let compatible = l == r
            || matches!(
                (l, r),
                (DataType::Int32, DataType::Int64) | (DataType::Int64, DataType::Int32)
            );
        if !compatible {
            return Err(Error::InvalidInput(format!(
                "join key type mismatch: {l:?} vs {r:?}"
            )));
        }
        Ok(())
    }

    fn check_edge(&self, edge: &JoinEdge) -> Result<()> {
        if edge.left_keys.len() != edge.right_keys.len() {
            return Err(Error::Internal(format!(
                "join edge key arity mismatch: {} vs {}",
                edge.left_keys.len(),
                edge.right_keys.len()
            )));
        }
        Ok(())
    }

    // ---- aggregation ----

    fn attach_aggregation(&mut self, node: &LogicalPlan) -> Result<()> {
        let (input, group_names, group_by, agg_names, aggregates) = match &node.op {
            LogicalOp::Aggregate {
                input,
                group_names,
                group_by,
                agg_names,
                aggregates,
            } => (input, group_names, group_by, agg_names, aggregates),
            _ => return Err(Error::Internal("not an aggregate node".to_string())),
        };

        self.translate(input)?;

        let dt_id = self.current().id;
        let mut unique_keys: Vec<ExprId> = Vec::new();
        let mut unique_aggs: Vec<ExprId> = Vec::new();
        let mut out_columns: Vec<ColumnId> = Vec::new();
        let mut column_of: HashMap<ExprId, ColumnId> = HashMap::new();
        let mut renames: Vec<(String, ColumnId)> = Vec::new();

        for (name, key) in group_names.iter().zip(group_by.iter()) {
            let expr = self.translate_expr(key)?;
            let column = match column_of.get(&expr) {
                Some(c) => *c,
                None => {
                    unique_keys.push(expr);
                    let col_name = self.arena.name(name);
                    let value = self.arena.expr(expr).value.clone();
                    let column = self.arena.add_column(col_name, dt_id, value, None, None);
                    out_columns.push(column);
                    column_of.insert(expr, column);
                    column
                }
            };
            renames.push((name.clone(), column));
        }

        for (name, agg) in agg_names.iter().zip(aggregates.iter()) {
            let expr = self.translate_aggregate(agg)?;
            let column = match column_of.get(&expr) {
                Some(c) => *c,
                None => {
                    unique_aggs.push(expr);
                    let col_name = self.arena.name(name);
                    let value = self.arena.expr(expr).value.clone();
                    let column = self.arena.add_column(col_name, dt_id, value, None, None);
                    out_columns.push(column);
                    column_of.insert(expr, column);
                    column
                }
            };
            renames.push((name.clone(), column));
        }

        let dt = self.current();
        if dt.aggregation.is_some() {
            return Err(Error::Internal(
                "derived table already has an aggregation".to_string(),
            ));
        }
        dt.aggregation = Some(AggregationSpec {
            group_by: unique_keys,
            aggregates: unique_aggs,
            columns: out_columns,
        });

        dt.scope.clear();
        let entries: Vec<(String, ColumnId)> = renames;
        for (name, column) in entries {
            let expr = self.arena.column_expr(column);
            self.current().scope.insert(name, expr);
        }
        Ok(())
    }

    fn translate_aggregate(&mut self, agg: &AggregateCall) -> Result<ExprId> {
        let mut args = Vec::with_capacity(agg.args.len());
        for arg in &agg.args {
            args.push(self.translate_expr(arg)?);
        }
        let filter = match &agg.filter {
            Some(f) => Some(self.translate_expr(f)?),
            None => None,
        };
        let mut ordering = Vec::with_capacity(agg.ordering.len());
        for key in &agg.ordering {
            ordering.push((self.translate_expr(&key.expr)?, key.order));
        }
        let cardinality = args
            .iter()
            .map(|a| self.arena.expr(*a).value.cardinality)
            .fold(1.0, f64::max);
        let name = self.arena.name(&agg.function);
        Ok(self.arena.intern_expr(
            ExprKind::Aggregate {
                name,
                args,
                filter,
                ordering,
                distinct: agg.distinct,
            },
            ValueInfo::new(agg.data_type.clone(), cardinality),
        ))
    }

    // ---- set operations ----

    fn translate_set(
        &mut self,
        node: &LogicalPlan,
        op: SetOperation,
        inputs: &[LogicalPlan],
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::InvalidInput("set operation with no inputs".to_string()));
        }
        match op {
            SetOperation::UnionAll => {
                for input in inputs {
                    let member = self.build_dt(input)?;
                    self.current().tables.push(member);
                }
                self.current().set_op = Some(DtSetOp::UnionAll);
                // Outputs come from the first schema; scope maps each output
                // name to the first member's column (emission is by ordinal).
                let first = self.current().tables[0];
                let columns: Vec<ColumnId> =
                    self.arena.table(first).output_columns().to_vec();
                for (field, column) in node.output_schema().fields.iter().zip(columns) {
                    let expr = self.arena.column_expr(column);
                    self.current().scope.insert(field.name.clone(), expr);
                }
                Ok(())
            }
            SetOperation::Union => {
                // Distinct union: union-all wrapped under a dedup group-by.
                let mut inner = node.clone();
                inner.op = LogicalOp::Set {
                    op: SetOperation::UnionAll,
                    inputs: inputs.to_vec(),
                };
                let member = self.build_dt(&inner)?;
                self.add_member(member);
                self.dedup_aggregation(node)
            }
            SetOperation::Intersect | SetOperation::Except => {
                if inputs.len() != 2 {
                    return Err(Error::InvalidInput(
                        "intersect/except require exactly two inputs".to_string(),
                    ));
                }
                let left = self.build_dt(&inputs[0])?;
                self.add_member(left);
                let right = self.build_dt(&inputs[1])?;
                self.current().tables.push(right);

                let left_cols = self.arena.table(left).output_columns().to_vec();
                let right_cols = self.arena.table(right).output_columns().to_vec();
                if left_cols.len() != right_cols.len() {
                    return Err(Error::InvalidInput(
                        "set operation inputs have different widths".to_string(),
                    ));
                }
                let left_keys: Vec<ExprId> = left_cols
                    .iter()
                    .map(|c| self.arena.column_expr(*c))
                    .collect();
                let right_keys: Vec<ExprId> = right_cols
                    .iter()
                    .map(|c| self.arena.column_expr(*c))
                    .collect();
                self.current().edges.push(JoinEdge {
                    left,
                    right,
                    left_keys,
                    right_keys,
                    filter: Vec::new(),
                    join_type: if op == SetOperation::Intersect {
                        JoinKind::LeftSemi
                    } else {
                        JoinKind::LeftAnti
                    },
                });
                self.dedup_aggregation(node)
            }
        }
    }

    /// Group-by over every output column, no aggregates.
    fn dedup_aggregation(&mut self, node: &LogicalPlan) -> Result<()> {
        let dt_id = self.current().id;
        let schema = node.output_schema();
        let mut keys = Vec::new();
        let mut columns = Vec::new();
        let mut renames = Vec::new();
        for field in &schema.fields {
            let expr = self
                .current()
                .scope
                .get(&field.name)
                .copied()
                .ok_or_else(|| {
                    Error::InvalidInput(format!("undefined column in set op: {}", field.name))
                })?;
            keys.push(expr);
            let name = self.arena.name(&field.name);
            let value = self.arena.expr(expr).value.clone();
            let column = self.arena.add_column(name, dt_id, value, None, None);
            columns.push(column);
            renames.push((field.name.clone(), column));
        }
        let dt = self.current();
        dt.aggregation = Some(AggregationSpec {
            group_by: keys,
            aggregates: Vec::new(),
            columns: columns.clone(),
        });
        dt.scope.clear();
        for (name, column) in renames {
            let expr = self.arena.column_expr(column);
            self.current().scope.insert(name, expr);
        }
        Ok(())
    }

    // ---- expressions ----

    fn translate_sort_keys(&mut self, keys: &[SortKey]) -> Result<Vec<(ExprId, SortOrder)>> {
        keys.iter()
            .map(|k| Ok((self.translate_expr(&k.expr)?, k.order)))
            .collect()
    }

    pub(crate) fn translate_expr(&mut self, expr: &LogicalExpr) -> Result<ExprId> {
        match expr {
            LogicalExpr::InputRef { name, .. } => self
                .dt_stack
                .last()
                .and_then(|dt| dt.scope.get(name))
                .copied()
                .ok_or_else(|| Error::InvalidInput(format!("undefined name: {name}"))),
            LogicalExpr::Constant { value, .. } => Ok(self.arena.literal_expr(value.clone())),
            LogicalExpr::SpecialForm { form, args, data_type } => match form {
                SpecialForm::Dereference => {
                    let base = self.translate_expr(args.first().ok_or_else(|| {
                        Error::InvalidInput("dereference without base".to_string())
                    })?)?;
                    let field = match args.get(1) {
                        Some(LogicalExpr::Constant {
                            value: Literal::String(name),
                            ..
                        }) => name.clone(),
                        _ => {
                            return Err(Error::InvalidInput(
                                "dereference field must be a string literal".to_string(),
                            ))
                        }
                    };
                    let index = self
                        .arena
                        .expr(base)
                        .value
                        .data_type
                        .row_field_index(&field);
                    let step = Step::Field { name: field, index };
                    self.getter_expr(base, step, data_type.clone())
                }
                SpecialForm::And | SpecialForm::Or | SpecialForm::If | SpecialForm::Cast => {
                    let name = match form {
                        SpecialForm::And => "and",
                        SpecialForm::Or => "or",
                        SpecialForm::If => "if",
                        SpecialForm::Cast => "cast",
                        SpecialForm::Dereference => unreachable!(),
                    };
                    let mut translated = Vec::with_capacity(args.len());
                    for arg in args {
                        translated.push(self.translate_expr(arg)?);
                    }
                    Ok(self.arena.call_expr(name, data_type.clone(), translated))
                }
            },
            LogicalExpr::Call { name, args, data_type } => {
                // Literal subscripts normalize into getter steps so leaf
                // resolution sees one shape.
                if (name == "subscript" || name == "element_at") && args.len() == 2 {
                    let key = match &args[1] {
                        LogicalExpr::Constant {
                            value: Literal::String(s),
                            ..
                        } => Some(SubscriptKey::String(s.clone())),
                        LogicalExpr::Constant { value, .. } => {
                            value.as_i64().map(SubscriptKey::Long)
                        }
                        _ => None,
                    };
                    if let Some(key) = key {
                        let base = self.translate_expr(&args[0])?;
                        return self.getter_expr(base, Step::Subscript(key), data_type.clone());
                    }
                }
                let mut translated = Vec::with_capacity(args.len());
                for arg in args {
                    translated.push(self.translate_expr(arg)?);
                }
                Ok(self.arena.call_expr(name, data_type.clone(), translated))
            }
            LogicalExpr::Lambda { params, body } => {
                let dt_id = self.current().id;
                let mut param_columns = Vec::with_capacity(params.len());
                let mut saved = Vec::new();
                for param in params {
                    let name = self.arena.name(&param.name);
                    let column = self.arena.add_column(
                        name,
                        dt_id,
                        ValueInfo::new(param.data_type.clone(), DEFAULT_DISTINCT as f64),
                        None,
                        None,
                    );
                    param_columns.push(column);
                    let expr = self.arena.column_expr(column);
                    saved.push((
                        param.name.clone(),
                        self.current().scope.insert(param.name.clone(), expr),
                    ));
                }
                let body = self.translate_expr(body);
                // Restore shadowed names whatever the body produced.
                for (name, previous) in saved {
                    match previous {
                        Some(expr) => {
                            self.current().scope.insert(name, expr);
                        }
                        None => {
                            self.current().scope.remove(&name);
                        }
                    }
                }
                let body = body?;
                let value = self.arena.expr(body).value.clone();
                Ok(self.arena.intern_expr(
                    ExprKind::Lambda {
                        params: param_columns,
                        body,
                    },
                    value,
                ))
            }
        }
    }

    /// A getter over `base`. When the full access chain lands on a
    /// synthesized leaf column, the getter collapses to that column.
    fn getter_expr(&mut self, base: ExprId, step: Step, data_type: DataType) -> Result<ExprId> {
        if let Some((top, mut path)) = self.subfield_chain_of(base) {
            path.push(step.clone());
            let path_id = self.arena.path(Subfield::new(path));
            if let Some(leaf) = self.leaf_index.get(&(top, path_id)) {
                return Ok(self.arena.column_expr(*leaf));
            }
        }
        let cardinality = self.arena.expr(base).value.cardinality;
        Ok(self.arena.intern_expr(
            ExprKind::Field { base, step },
            ValueInfo::new(data_type, cardinality),
        ))
    }

    /// Resolves `expr` to (top base-table column, path so far) when it is a
    /// getter chain rooted at a base-table column.
    fn subfield_chain_of(&self, expr: ExprId) -> Option<(ColumnId, Vec<Step>)> {
        match &self.arena.expr(expr).kind {
            ExprKind::Column(c) => {
                let col = self.arena.column(*c);
                match (col.top_column, col.path) {
                    (Some(top), Some(path)) => {
                        Some((top, self.arena.path_ref(path).steps().to_vec()))
                    }
                    (None, None) => {
                        if matches!(self.arena.table(col.relation), TableNode::Base(_)) {
                            Some((*c, Vec::new()))
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            }
            ExprKind::Field { base, step } => {
                let (top, mut path) = self.subfield_chain_of(*base)?;
                path.push(step.clone());
                Some((top, path))
            }
            _ => None,
        }
    }
}

/// Splits nested AND forms into a flat conjunct list.
pub fn flatten_and(expr: &LogicalExpr) -> Vec<LogicalExpr> {
    match expr {
        LogicalExpr::SpecialForm {
            form: SpecialForm::And,
            args,
            ..
        } => args.iter().flat_map(flatten_and).collect(),
        other => vec![other.clone()],
    }
}

/// Result type of applying `steps` to `data_type`; None when the path does
/// not exist or is not materializable as a scalar/complex leaf.
pub fn type_at_path(data_type: &DataType, steps: &[Step]) -> Option<DataType> {
    let mut current = data_type.clone();
    for step in steps {
        current = match step {
            Step::Field { name, .. } => match &current {
                DataType::Row(fields) => fields
                    .iter()
                    .find(|f| &f.name == name)
                    .map(|f| f.data_type.clone())?,
                _ => return None,
            },
            Step::Subscript(_) => match &current {
                DataType::Array(elem) => (**elem).clone(),
                DataType::Map(_, value) => (**value).clone(),
                _ => return None,
            },
            Step::Cardinality => DataType::Int64,
            Step::AllSubscripts => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::logical::PlanBuilder;
    use quarry_core::types::Field;
    use quarry_catalog::{TableBuilder, TestCatalog};

    fn tpch_catalog() -> TestCatalog {
        TestCatalog::new()
            .with_table(
                TableBuilder::new("nation")
                    .column("n_nationkey", DataType::Int64)
                    .column("n_name", DataType::Utf8)
                    .column("n_regionkey", DataType::Int64)
                    .distinct("n_nationkey", 25)
                    .distinct("n_regionkey", 5)
                    .row_count(25),
            )
            .with_table(
                TableBuilder::new("region")
                    .column("r_regionkey", DataType::Int64)
                    .column("r_name", DataType::Utf8)
                    .distinct("r_regionkey", 5)
                    .row_count(5),
            )
    }

    fn nation_schema() -> quarry_core::types::Schema {
        quarry_core::types::Schema::new(vec![
            Field::new("n_nationkey", DataType::Int64, false),
            Field::new("n_name", DataType::Utf8, false),
            Field::new("n_regionkey", DataType::Int64, false),
        ])
    }

    fn region_schema() -> quarry_core::types::Schema {
        quarry_core::types::Schema::new(vec![
            Field::new("r_regionkey", DataType::Int64, false),
            Field::new("r_name", DataType::Utf8, false),
        ])
    }

    fn build_graph(plan: &LogicalPlan) -> (QueryArena, TableId) {
        let catalog = tpch_catalog();
        let registry = FunctionRegistry::default();
        let opts = OptimizerOptions::default();
        let mut arena = QueryArena::new();
        let root = GraphBuilder::new(&mut arena, &catalog, &registry, &opts)
            .build(plan)
            .expect("graph build");
        (arena, root)
    }

    #[test]
    fn join_condition_splits_into_edge_keys() {
        let mut b = PlanBuilder::new();
        let nation = b.scan("nation", nation_schema());
        let region = b.scan("region", region_schema());
        let cond = LogicalExpr::eq(
            LogicalExpr::column("n_regionkey", DataType::Int64),
            LogicalExpr::column("r_regionkey", DataType::Int64),
        );
        let join = b.join(JoinType::Inner, nation, region, Some(cond));
        let root = b.project(
            join,
            vec!["n_name".into()],
            vec![LogicalExpr::column("n_name", DataType::Utf8)],
        );

        let (arena, dt_id) = build_graph(&root);
        let dt = arena.table(dt_id).as_derived().unwrap();
        assert_eq!(dt.tables.len(), 2);
        assert_eq!(dt.join_edges.len(), 1);
        let edge = &dt.join_edges[0];
        assert_eq!(edge.left_keys.len(), 1);
        assert_eq!(edge.right_keys.len(), 1);
        assert_eq!(edge.join_type, JoinKind::Inner);
        assert!(dt.conjuncts.is_empty());
    }

    #[test]
    fn single_table_filters_fold_into_the_base_table() {
        let mut b = PlanBuilder::new();
        let nation = b.scan("nation", nation_schema());
        let filtered = b.filter(
            nation,
            LogicalExpr::and(
                LogicalExpr::eq(
                    LogicalExpr::column("n_nationkey", DataType::Int64),
                    LogicalExpr::constant(Literal::Int64(3)),
                ),
                LogicalExpr::call(
                    "like",
                    DataType::Boolean,
                    vec![
                        LogicalExpr::column("n_name", DataType::Utf8),
                        LogicalExpr::constant(Literal::String("A%".into())),
                    ],
                ),
            ),
        );
        let root = b.project(
            filtered,
            vec!["n_name".into()],
            vec![LogicalExpr::column("n_name", DataType::Utf8)],
        );

        let (arena, dt_id) = build_graph(&root);
        let dt = arena.table(dt_id).as_derived().unwrap();
        let base = arena.table(dt.tables[0]).as_base().unwrap();
        assert_eq!(base.column_filters.len(), 1, "eq pushes down");
        assert_eq!(base.filter.len(), 1, "like stays above the scan");
        assert!(base.filter_selectivity < 1.0 / 24.0);
        assert!(dt.conjuncts.is_empty());
    }

    #[test]
    fn aggregation_dedups_grouping_exprs_and_aggregates() {
        let mut b = PlanBuilder::new();
        let nation = b.scan("nation", nation_schema());
        let key = LogicalExpr::call(
            "plus",
            DataType::Int64,
            vec![
                LogicalExpr::column("n_nationkey", DataType::Int64),
                LogicalExpr::column("n_regionkey", DataType::Int64),
            ],
        );
        let count = AggregateCall {
            function: "count".into(),
            args: vec![],
            filter: None,
            ordering: vec![],
            distinct: false,
            data_type: DataType::Int64,
        };
        let agg = b.aggregate(
            nation,
            vec!["k1".into(), "k2".into()],
            vec![key.clone(), key],
            vec!["c1".into(), "c2".into()],
            vec![count.clone(), count],
        );
        let (arena, dt_id) = build_graph(&agg);
        let dt = arena.table(dt_id).as_derived().unwrap();
        let spec = dt.aggregation.as_ref().unwrap();
        assert_eq!(spec.group_by.len(), 1, "duplicate keys collapse");
        assert_eq!(spec.aggregates.len(), 1, "duplicate aggregates collapse");
        // The projection re-expands to the requested four outputs.
        assert_eq!(dt.columns.len(), 4);
        assert_eq!(dt.exprs[0], dt.exprs[1]);
        assert_eq!(dt.exprs[2], dt.exprs[3]);
    }

    #[test]
    fn left_join_nests_the_right_side() {
        let mut b = PlanBuilder::new();
        let nation = b.scan("nation", nation_schema());
        let region = b.scan("region", region_schema());
        let cond = LogicalExpr::eq(
            LogicalExpr::column("n_regionkey", DataType::Int64),
            LogicalExpr::column("r_regionkey", DataType::Int64),
        );
        let join = b.join(JoinType::Left, nation, region, Some(cond));
        let (arena, dt_id) = build_graph(&join);
        let dt = arena.table(dt_id).as_derived().unwrap();
        assert_eq!(dt.join_edges.len(), 1);
        let edge = &dt.join_edges[0];
        assert_eq!(edge.join_type, JoinKind::Left);
        assert!(edge.is_non_commutative());
        assert!(arena.table(edge.right).as_derived().is_some());
    }

    #[test]
    fn unnest_is_rejected() {
        let mut b = PlanBuilder::new();
        let nation = b.scan("nation", nation_schema());
        let id = nation.id + 1;
        let root = LogicalPlan {
            id,
            op: LogicalOp::Unnest {
                input: Box::new(nation),
                column: "n_name".into(),
                alias: "u".into(),
            },
        };
        let catalog = tpch_catalog();
        let registry = FunctionRegistry::default();
        let opts = OptimizerOptions::default();
        let mut arena = QueryArena::new();
        let err = GraphBuilder::new(&mut arena, &catalog, &registry, &opts)
            .build(&root)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rebuilding_the_graph_is_deterministic() {
        let mut b = PlanBuilder::new();
        let nation = b.scan("nation", nation_schema());
        let region = b.scan("region", region_schema());
        let cond = LogicalExpr::eq(
            LogicalExpr::column("n_regionkey", DataType::Int64),
            LogicalExpr::column("r_regionkey", DataType::Int64),
        );
        let join = b.join(JoinType::Inner, nation, region, Some(cond));
        let root = b.project(
            join,
            vec!["n_name".into()],
            vec![LogicalExpr::column("n_name", DataType::Utf8)],
        );

        let (arena_a, dt_a) = build_graph(&root);
        let (arena_b, dt_b) = build_graph(&root);
        assert_eq!(dt_a, dt_b);
        let a = arena_a.table(dt_a).as_derived().unwrap();
        let b2 = arena_b.table(dt_b).as_derived().unwrap();
        assert_eq!(a.tables, b2.tables);
        assert_eq!(a.columns.len(), b2.columns.len());
        assert_eq!(a.join_edges.len(), b2.join_edges.len());
        assert_eq!(a.join_edges[0].left_keys, b2.join_edges[0].left_keys);
    }
}
