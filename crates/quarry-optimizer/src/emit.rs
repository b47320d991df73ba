//! Lowering the chosen relation-op tree into an executable multi-fragment
//! plan.
//!
//! The tree is walked bottom-up; every repartition boundary starts a new
//! fragment ending in a partitioned output, and the consumer references the
//! source fragment's task prefix through an exchange. Order-by and limit
//! expand into their partial/final two-fragment patterns. Each emitted node
//! carries the optimizer's cost prediction and, where useful, a canonical
//! history key for predicted-vs-actual reporting.

use std::collections::BTreeMap;

use serde::Serialize;

use quarry_core::error::{Error, Result};
use quarry_core::hash::DigestWriter;
use quarry_core::id::{ExprId, RelId, TableId};
use quarry_core::types::SortOrder;

use quarry_catalog::handles::TableHandle;

use crate::arena::QueryArena;
use crate::graph::{BaseTable, TableNode};
use crate::optimizer::Optimization;
use crate::relation::{AggStep, Cost, JoinKind, PartitionKind, RelOp};
use crate::search::Plan;

pub const EXCHANGE_SERDE: &str = "columnar";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Gather,
    Hash,
    Broadcast,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PhysicalOp {
    TableScan {
        table: String,
        handle: TableHandle,
        lookup_keys: Vec<String>,
    },
    Values {
        rows: usize,
    },
    Filter {
        predicate: String,
    },
    Project {
        names: Vec<String>,
        exprs: Vec<String>,
    },
    HashJoin {
        join_type: JoinKind,
        left_keys: Vec<String>,
        right_keys: Vec<String>,
        filter: Option<String>,
    },
    NestedLoopJoin {
        join_type: JoinKind,
        filter: Option<String>,
    },
    Aggregation {
        step: AggStep,
        keys: Vec<String>,
        aggregates: Vec<String>,
    },
    OrderBy {
        keys: Vec<String>,
        orders: Vec<SortOrder>,
    },
    TopN {
        count: i64,
        keys: Vec<String>,
        orders: Vec<SortOrder>,
    },
    LocalMerge {
        keys: Vec<String>,
    },
    LocalPartition,
    PartialLimit {
        offset: i64,
        limit: i64,
    },
    FinalLimit {
        offset: i64,
        limit: i64,
    },
    PartitionedOutput {
        kind: OutputKind,
        keys: Vec<String>,
        num_partitions: usize,
    },
    Exchange,
    MergeExchange {
        keys: Vec<String>,
        orders: Vec<SortOrder>,
    },
    UnionAll,
}

impl PhysicalOp {
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::TableScan { lookup_keys, .. } if !lookup_keys.is_empty() => "index_lookup",
            PhysicalOp::TableScan { .. } => "table_scan",
            PhysicalOp::Values { .. } => "values",
            PhysicalOp::Filter { .. } => "filter",
            PhysicalOp::Project { .. } => "project",
            PhysicalOp::HashJoin { .. } => "hash_join",
            PhysicalOp::NestedLoopJoin { .. } => "nested_loop_join",
            PhysicalOp::Aggregation { step, .. } => match step {
                AggStep::Single => "aggregation",
                AggStep::Partial => "partial_aggregation",
                AggStep::Final => "final_aggregation",
            },
            PhysicalOp::OrderBy { .. } => "order_by",
            PhysicalOp::TopN { .. } => "top_n",
            PhysicalOp::LocalMerge { .. } => "local_merge",
            PhysicalOp::LocalPartition => "local_partition",
            PhysicalOp::PartialLimit { .. } => "partial_limit",
            PhysicalOp::FinalLimit { .. } => "final_limit",
            PhysicalOp::PartitionedOutput { .. } => "partitioned_output",
            PhysicalOp::Exchange => "exchange",
            PhysicalOp::MergeExchange { .. } => "merge_exchange",
            PhysicalOp::UnionAll => "union_all",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhysicalNode {
    pub id: String,
    pub op: PhysicalOp,
    pub output: Vec<String>,
    pub inputs: Vec<PhysicalNode>,
}

impl PhysicalNode {
    /// Operator names in execution (bottom-up, left-to-right) order.
    pub fn op_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for input in &self.inputs {
            names.extend(input.op_names());
        }
        names.push(self.op.name());
        names
    }

    pub fn find(&self, name: &str) -> Option<&PhysicalNode> {
        if self.op.name() == name {
            return Some(self);
        }
        self.inputs.iter().find_map(|i| i.find(name))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InputStage {
    pub consumer_node_id: String,
    pub task_prefix: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutableFragment {
    pub task_prefix: String,
    pub width: usize,
    pub root: PhysicalNode,
    pub input_stages: Vec<InputStage>,
    /// Node ids of table scans in this fragment (split enumeration).
    pub scans: Vec<String>,
    pub num_broadcast_destinations: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiFragmentPlan {
    /// Source fragments precede their consumers; the last is the output.
    pub fragments: Vec<ExecutableFragment>,
    pub num_workers: usize,
    pub num_drivers: usize,
    pub exchange_serde: String,
}

impl MultiFragmentPlan {
    pub fn output_fragment(&self) -> &ExecutableFragment {
        self.fragments
            .last()
            .expect("a plan always has an output fragment")
    }
}

/// Emitted plan plus per-node predictions and history keys.
#[derive(Debug, Clone, Serialize)]
pub struct PlanAndStats {
    pub plan: MultiFragmentPlan,
    pub predictions: BTreeMap<String, Cost>,
    pub history_keys: BTreeMap<String, String>,
}

struct FragmentBuild {
    task_prefix: String,
    width: usize,
    input_stages: Vec<InputStage>,
    scans: Vec<String>,
    num_broadcast_destinations: Option<usize>,
}

struct Emitter<'x, 'a> {
    opt: &'x Optimization<'a>,
    stage_counter: u32,
    id_counter: u32,
    predictions: BTreeMap<String, Cost>,
    history_keys: BTreeMap<String, String>,
}

impl<'a> Optimization<'a> {
    /// Lowers `plan` (from `best_plan`) into fragments with predictions.
    pub fn to_executable_plan(&self, plan: &Plan) -> Result<PlanAndStats> {
        let mut emitter = Emitter {
            opt: self,
            stage_counter: 0,
            id_counter: 0,
            predictions: BTreeMap::new(),
            history_keys: BTreeMap::new(),
        };
        emitter.emit(plan)
    }
}

impl<'x, 'a> Emitter<'x, 'a> {
    fn arena(&self) -> &QueryArena {
        &self.opt.arena
    }

    fn next_id(&mut self) -> String {
        let id = self.id_counter;
        self.id_counter += 1;
        id.to_string()
    }

    fn new_fragment(&mut self) -> FragmentBuild {
        self.stage_counter += 1;
        FragmentBuild {
            task_prefix: format!("stage{}", self.stage_counter),
            width: self.opt.options().num_workers.max(1),
            input_stages: Vec::new(),
            scans: Vec::new(),
            num_broadcast_destinations: None,
        }
    }

    fn finish_fragment(&self, build: FragmentBuild, root: PhysicalNode) -> ExecutableFragment {
        ExecutableFragment {
            task_prefix: build.task_prefix,
            width: build.width,
            root,
            input_stages: build.input_stages,
            scans: build.scans,
            num_broadcast_destinations: build.num_broadcast_destinations,
        }
    }

    fn columns_of(&self, rel: RelId) -> Vec<String> {
        self.arena()
            .rel(rel)
            .columns
            .iter()
            .map(|c| self.arena().column_string(*c))
            .collect()
    }

    fn expr_texts(&self, exprs: &[ExprId]) -> Vec<String> {
        exprs
            .iter()
            .map(|e| self.arena().expr_text(*e, false))
            .collect()
    }

    fn and_text(&self, exprs: &[ExprId]) -> Option<String> {
        if exprs.is_empty() {
            None
        } else {
            Some(self.expr_texts(exprs).join(" and "))
        }
    }

    /// New node with the cost prediction (and history key, when the op is a
    /// measurement point) recorded against its id.
    fn node(&mut self, rel: Option<RelId>, op: PhysicalOp, inputs: Vec<PhysicalNode>) -> PhysicalNode {
        let id = self.next_id();
        let output = rel.map(|r| self.columns_of(r)).unwrap_or_else(|| {
            inputs
                .last()
                .map(|i| i.output.clone())
                .unwrap_or_default()
        });
        if let Some(rel) = rel {
            let node = self.arena().rel(rel);
            let cost = node.cost;
            let is_measurement_point = matches!(
                node.op,
                RelOp::TableScan { .. }
                    | RelOp::Join { .. }
                    | RelOp::Aggregation { .. }
                    | RelOp::Filter { .. }
            );
            self.predictions.insert(id.clone(), cost);
            if is_measurement_point {
                self.history_keys
                    .insert(id.clone(), rel_fingerprint(self.arena(), rel));
            }
        }
        PhysicalNode {
            id,
            op,
            output,
            inputs,
        }
    }

    fn emit(&mut self, plan: &Plan) -> Result<PlanAndStats> {
        let distributed = !self.opt.options().single_node();
        let mut stages: Vec<ExecutableFragment> = Vec::new();
        let mut top = self.new_fragment();

        let root_op = self.arena().rel(plan.root).op.clone();
        let needs_gather = distributed
            && !matches!(root_op, RelOp::Limit { .. } | RelOp::OrderBy { .. })
            && !self.arena().rel(plan.root).distribution.is_gather();

        let mut root_node = if needs_gather {
            // Source fragment ending in a gather output; the top fragment
            // collects it on one worker.
            let mut source = self.new_fragment();
            let inner = self.make_fragment(plan.root, &mut source, &mut stages)?;
            let output = self.node(
                None,
                PhysicalOp::PartitionedOutput {
                    kind: OutputKind::Gather,
                    keys: Vec::new(),
                    num_partitions: 1,
                },
                vec![inner],
            );
            let prefix = source.task_prefix.clone();
            stages.push(self.finish_fragment(source, output));
            top.width = 1;
            let exchange = self.node(None, PhysicalOp::Exchange, Vec::new());
            top.input_stages.push(InputStage {
                consumer_node_id: exchange.id.clone(),
                task_prefix: prefix,
            });
            exchange
        } else {
            self.make_fragment(plan.root, &mut top, &mut stages)?
        };

        // Final projection restoring the derived table's declared outputs.
        if let Some(projection) = self.root_projection(plan)? {
            root_node = PhysicalNode {
                inputs: vec![root_node],
                ..projection
            };
        }

        stages.push(self.finish_fragment(top, root_node));
        Ok(PlanAndStats {
            plan: MultiFragmentPlan {
                fragments: stages,
                num_workers: self.opt.options().num_workers,
                num_drivers: self.opt.options().num_drivers,
                exchange_serde: EXCHANGE_SERDE.to_string(),
            },
            predictions: std::mem::take(&mut self.predictions),
            history_keys: std::mem::take(&mut self.history_keys),
        })
    }

    /// Projection mapping the root derived table's expressions to its
    /// declared output names; None when the plan already produces exactly
    /// the declared columns.
    fn root_projection(&mut self, plan: &Plan) -> Result<Option<PhysicalNode>> {
        let dt = match self.arena().table(self.opt.root_dt) {
            TableNode::Derived(dt) => dt,
            _ => return Ok(None),
        };
        if dt.exprs.is_empty() {
            return Ok(None);
        }
        let names: Vec<String> = dt
            .columns
            .iter()
            .map(|c| self.arena().name_str(self.arena().column(*c).name).to_string())
            .collect();
        let exprs: Vec<String> = dt
            .exprs
            .iter()
            .map(|e| self.arena().expr_text(*e, false))
            .collect();
        // Sorted outputs always re-project: the merge may carry sort keys
        // that are not declared outputs. Otherwise an identity projection
        // is dropped.
        if dt.ordering.is_empty() {
            let identity = plan.columns.len() == dt.columns.len()
                && dt
                    .exprs
                    .iter()
                    .zip(dt.columns.iter())
                    .all(|(e, c)| match &self.arena().expr(*e).kind {
                        crate::expr::ExprKind::Column(col) => {
                            self.arena().column(*col).name == self.arena().column(*c).name
                        }
                        _ => false,
                    });
            if identity {
                return Ok(None);
            }
        }
        let id = self.next_id();
        Ok(Some(PhysicalNode {
            id,
            op: PhysicalOp::Project {
                names: names.clone(),
                exprs,
            },
            output: names,
            inputs: Vec::new(),
        }))
    }

    fn make_fragment(
        &mut self,
        rel: RelId,
        fragment: &mut FragmentBuild,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let node = self.arena().rel(rel).clone();
        match &node.op {
            RelOp::TableScan { table, lookup_keys, .. } => {
                self.make_scan(rel, *table, lookup_keys, &node.inputs, fragment, stages)
            }
            RelOp::Values { table } => {
                let rows = match self.arena().table(*table) {
                    TableNode::Values(v) => v.rows.len(),
                    _ => 0,
                };
                Ok(self.node(Some(rel), PhysicalOp::Values { rows }, Vec::new()))
            }
            RelOp::Filter { exprs } => {
                let input = self.make_fragment(node.inputs[0], fragment, stages)?;
                let predicate = self.and_text(exprs).unwrap_or_default();
                Ok(self.node(Some(rel), PhysicalOp::Filter { predicate }, vec![input]))
            }
            RelOp::Project { exprs } => {
                let input = self.make_fragment(node.inputs[0], fragment, stages)?;
                let names = self.columns_of(rel);
                let exprs = self.expr_texts(exprs);
                Ok(self.node(Some(rel), PhysicalOp::Project { names, exprs }, vec![input]))
            }
            RelOp::HashBuild { .. } => self.make_fragment(node.inputs[0], fragment, stages),
            RelOp::Join {
                method,
                join_type,
                left_keys,
                right_keys,
                filter,
            } => {
                let left = self.make_fragment(node.inputs[0], fragment, stages)?;
                let right = self.make_fragment(node.inputs[1], fragment, stages)?;
                let filter_text = self.and_text(filter);
                if matches!(method, crate::relation::JoinMethod::Cross) {
                    return Ok(self.node(
                        Some(rel),
                        PhysicalOp::NestedLoopJoin {
                            join_type: *join_type,
                            filter: filter_text,
                        },
                        vec![left, right],
                    ));
                }
                Ok(self.node(
                    Some(rel),
                    PhysicalOp::HashJoin {
                        join_type: *join_type,
                        left_keys: self.expr_texts(left_keys),
                        right_keys: self.expr_texts(right_keys),
                        filter: filter_text,
                    },
                    vec![left, right],
                ))
            }
            RelOp::Aggregation {
                step,
                group_by,
                aggregates,
            } => {
                let input = self.make_fragment(node.inputs[0], fragment, stages)?;
                // Non-column grouping keys are evaluated once below the
                // (partial) aggregation.
                let input = if matches!(step, AggStep::Partial | AggStep::Single) {
                    self.maybe_project(group_by, input)
                } else {
                    input
                };
                Ok(self.node(
                    Some(rel),
                    PhysicalOp::Aggregation {
                        step: *step,
                        keys: self.expr_texts(group_by),
                        aggregates: self.expr_texts(aggregates),
                    },
                    vec![input],
                ))
            }
            RelOp::OrderBy { .. } => self.make_order_by(rel, None, fragment, stages),
            RelOp::Limit { offset, limit } => {
                let input_rel = node.inputs[0];
                if self.opt.options().single_node() {
                    let input = self.make_fragment(input_rel, fragment, stages)?;
                    return Ok(self.node(
                        Some(rel),
                        PhysicalOp::FinalLimit {
                            offset: *offset,
                            limit: *limit,
                        },
                        vec![input],
                    ));
                }
                if matches!(self.arena().rel(input_rel).op, RelOp::OrderBy { .. }) {
                    self.make_order_by(input_rel, Some((*offset, *limit)), fragment, stages)
                } else {
                    self.make_limit(rel, input_rel, *offset, *limit, fragment, stages)
                }
            }
            RelOp::Repartition => {
                self.make_repartition(rel, node.inputs[0], fragment, stages)
            }
            RelOp::UnionAll => self.make_union_all(rel, &node.inputs, fragment, stages),
        }
    }

    fn make_scan(
        &mut self,
        rel: RelId,
        table: TableId,
        lookup_keys: &[ExprId],
        inputs: &[RelId],
        fragment: &mut FragmentBuild,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let (handle, rejected) = self
            .opt
            .leaf_handles
            .get(&table)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no connector handle for table {table}")))?;

        let base_name = match self.arena().table(table) {
            TableNode::Base(base) => base.table.name.clone(),
            _ => return Err(Error::Internal("scan of a non-base table".to_string())),
        };

        let probe = match inputs.first() {
            Some(input) => vec![self.make_fragment(*input, fragment, stages)?],
            None => Vec::new(),
        };

        let scan = self.node(
            Some(rel),
            PhysicalOp::TableScan {
                table: base_name,
                handle,
                lookup_keys: self.expr_texts(lookup_keys),
            },
            probe,
        );
        fragment.scans.push(scan.id.clone());

        // Filters the connector rejected run right above the scan.
        let mut top = scan;
        if !rejected.is_empty() {
            let predicate = self.and_text(&rejected).unwrap_or_default();
            top = self.node(None, PhysicalOp::Filter { predicate }, vec![top]);
        }

        // Subfield pushdown: the pruned scan produces top-level columns;
        // a projection extracts each live leaf as its own column.
        if lookup_keys.is_empty() {
            if let Some(projection) = self.subfield_projection(rel, table) {
                top = PhysicalNode {
                    inputs: vec![top],
                    ..projection
                };
            }
        }
        Ok(top)
    }

    fn subfield_projection(&mut self, rel: RelId, table: TableId) -> Option<PhysicalNode> {
        let arena = self.arena();
        let columns = &arena.rel(rel).columns;
        let has_leaves = columns
            .iter()
            .any(|c| arena.column(*c).top_column.is_some());
        if !has_leaves {
            return None;
        }
        let TableNode::Base(_) = arena.table(table) else {
            return None;
        };
        let mut names = Vec::new();
        let mut exprs = Vec::new();
        for column in columns {
            let def = arena.column(*column);
            names.push(arena.column_string(*column));
            match (def.top_column, def.path) {
                (Some(top), Some(path)) => {
                    exprs.push(format!(
                        "{}{}",
                        arena.column_string(top),
                        arena.path_ref(path)
                    ));
                }
                _ => exprs.push(arena.column_string(*column)),
            }
        }
        let id = self.next_id();
        Some(PhysicalNode {
            id,
            op: PhysicalOp::Project {
                names: names.clone(),
                exprs,
            },
            output: names,
            inputs: Vec::new(),
        })
    }

    /// Distinct non-column expressions are computed once in a projection
    /// below the consumer.
    fn maybe_project(&mut self, exprs: &[ExprId], input: PhysicalNode) -> PhysicalNode {
        let complex: Vec<ExprId> = {
            let arena = self.arena();
            let mut seen = Vec::new();
            exprs
                .iter()
                .copied()
                .filter(|e| {
                    let is_column =
                        matches!(arena.expr(*e).kind, crate::expr::ExprKind::Column(_));
                    let fresh = !seen.contains(e);
                    seen.push(*e);
                    !is_column && fresh
                })
                .collect()
        };
        if complex.is_empty() {
            return input;
        }
        let mut names = input.output.clone();
        let mut projected: Vec<String> = names.clone();
        for expr in &complex {
            let text = self.arena().expr_text(*expr, false);
            names.push(text.clone());
            projected.push(text);
        }
        self.node(
            None,
            PhysicalOp::Project {
                names,
                exprs: projected,
            },
            vec![input],
        )
    }

    /// Order-by pattern: (top-n | order-by) + local merge + gather output in
    /// the source fragment; merge exchange (+ final limit) in the consumer.
    fn make_order_by(
        &mut self,
        rel: RelId,
        limit: Option<(i64, i64)>,
        fragment: &mut FragmentBuild,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let node = self.arena().rel(rel).clone();
        let (keys, orders) = match &node.op {
            RelOp::OrderBy { keys, order_type } => (keys.clone(), order_type.clone()),
            _ => return Err(Error::Internal("make_order_by on non-order-by".to_string())),
        };
        let key_texts = self.expr_texts(&keys);

        if self.opt.options().single_node() {
            let input = self.make_fragment(node.inputs[0], fragment, stages)?;
            let mut top = self.node(
                Some(rel),
                PhysicalOp::OrderBy {
                    keys: key_texts,
                    orders,
                },
                vec![input],
            );
            if let Some((offset, limit)) = limit {
                top = self.node(
                    None,
                    PhysicalOp::FinalLimit { offset, limit },
                    vec![top],
                );
            }
            return Ok(top);
        }

        let mut source = self.new_fragment();
        let input = self.make_fragment(node.inputs[0], &mut source, stages)?;

        let sorted = match limit {
            Some((offset, count)) => {
                let total = count.saturating_add(offset);
                self.node(
                    Some(rel),
                    PhysicalOp::TopN {
                        count: total,
                        keys: key_texts.clone(),
                        orders: orders.clone(),
                    },
                    vec![input],
                )
            }
            None => self.node(
                Some(rel),
                PhysicalOp::OrderBy {
                    keys: key_texts.clone(),
                    orders: orders.clone(),
                },
                vec![input],
            ),
        };
        let merged = self.node(
            None,
            PhysicalOp::LocalMerge {
                keys: key_texts.clone(),
            },
            vec![sorted],
        );
        let output = self.node(
            None,
            PhysicalOp::PartitionedOutput {
                kind: OutputKind::Gather,
                keys: Vec::new(),
                num_partitions: 1,
            },
            vec![merged],
        );
        let prefix = source.task_prefix.clone();
        stages.push(self.finish_fragment(source, output));

        fragment.width = 1;
        let exchange = self.node(
            None,
            PhysicalOp::MergeExchange {
                keys: key_texts,
                orders,
            },
            Vec::new(),
        );
        fragment.input_stages.push(InputStage {
            consumer_node_id: exchange.id.clone(),
            task_prefix: prefix,
        });

        match limit {
            Some((offset, count)) => Ok(self.node(
                None,
                PhysicalOp::FinalLimit {
                    offset,
                    limit: count,
                },
                vec![exchange],
            )),
            None => Ok(exchange),
        }
    }

    /// Limit pattern: partial limit + local partition + per-worker limit +
    /// gather output in the source; exchange + final limit in the consumer.
    /// The partial limit saturates `offset + limit`; the final keeps the
    /// original offset.
    fn make_limit(
        &mut self,
        rel: RelId,
        input_rel: RelId,
        offset: i64,
        limit: i64,
        fragment: &mut FragmentBuild,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let saturated = limit.saturating_add(offset);

        let mut source = self.new_fragment();
        let input = self.make_fragment(input_rel, &mut source, stages)?;
        let partial = self.node(
            Some(rel),
            PhysicalOp::PartialLimit {
                offset: 0,
                limit: saturated,
            },
            vec![input],
        );
        let local = self.node(None, PhysicalOp::LocalPartition, vec![partial]);
        let per_worker = self.node(
            None,
            PhysicalOp::FinalLimit {
                offset: 0,
                limit: saturated,
            },
            vec![local],
        );
        let output = self.node(
            None,
            PhysicalOp::PartitionedOutput {
                kind: OutputKind::Gather,
                keys: Vec::new(),
                num_partitions: 1,
            },
            vec![per_worker],
        );
        let prefix = source.task_prefix.clone();
        stages.push(self.finish_fragment(source, output));

        fragment.width = 1;
        let exchange = self.node(None, PhysicalOp::Exchange, Vec::new());
        fragment.input_stages.push(InputStage {
            consumer_node_id: exchange.id.clone(),
            task_prefix: prefix,
        });
        Ok(self.node(
            None,
            PhysicalOp::FinalLimit { offset, limit },
            vec![exchange],
        ))
    }

    fn make_repartition(
        &mut self,
        rel: RelId,
        input_rel: RelId,
        fragment: &mut FragmentBuild,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let dist = self.arena().rel(rel).distribution.clone();
        let mut source = self.new_fragment();
        let input = self.make_fragment(input_rel, &mut source, stages)?;

        let (kind, keys, num_partitions) = match dist.kind {
            PartitionKind::Gather | PartitionKind::Singleton => {
                (OutputKind::Gather, Vec::new(), 1)
            }
            PartitionKind::Broadcast => {
                source.num_broadcast_destinations = Some(self.opt.options().num_workers);
                (OutputKind::Broadcast, Vec::new(), self.opt.options().num_workers)
            }
            PartitionKind::Hash => (
                OutputKind::Hash,
                self.expr_texts(&dist.partition),
                self.opt.options().num_workers,
            ),
        };
        if matches!(kind, OutputKind::Gather) {
            fragment.width = 1;
        }

        let output = self.node(
            Some(rel),
            PhysicalOp::PartitionedOutput {
                kind,
                keys,
                num_partitions,
            },
            vec![input],
        );
        let prefix = source.task_prefix.clone();
        stages.push(self.finish_fragment(source, output));

        let exchange = self.node(None, PhysicalOp::Exchange, Vec::new());
        fragment.input_stages.push(InputStage {
            consumer_node_id: exchange.id.clone(),
            task_prefix: prefix,
        });
        Ok(exchange)
    }

    /// Union-all with a mix of local and remote inputs: all remote inputs
    /// feed one exchange; local inputs stay inline.
    fn make_union_all(
        &mut self,
        rel: RelId,
        inputs: &[RelId],
        fragment: &mut FragmentBuild,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let mut locals = Vec::new();
        let mut remote_prefixes = Vec::new();

        for input in inputs {
            let is_remote = matches!(self.arena().rel(*input).op, RelOp::Repartition)
                && !self.opt.options().single_node();
            if is_remote {
                let input_node = self.arena().rel(*input).clone();
                let mut source = self.new_fragment();
                let inner = self.make_fragment(input_node.inputs[0], &mut source, stages)?;
                let output = self.node(
                    Some(*input),
                    PhysicalOp::PartitionedOutput {
                        kind: OutputKind::Hash,
                        keys: Vec::new(),
                        num_partitions: self.opt.options().num_workers,
                    },
                    vec![inner],
                );
                let prefix = source.task_prefix.clone();
                stages.push(self.finish_fragment(source, output));
                remote_prefixes.push(prefix);
            } else {
                locals.push(self.make_fragment(*input, fragment, stages)?);
            }
        }

        let mut union_inputs = Vec::new();
        if !remote_prefixes.is_empty() {
            let exchange = self.node(None, PhysicalOp::Exchange, Vec::new());
            for prefix in remote_prefixes {
                fragment.input_stages.push(InputStage {
                    consumer_node_id: exchange.id.clone(),
                    task_prefix: prefix,
                });
            }
            union_inputs.push(exchange);
        }
        union_inputs.extend(locals);

        Ok(self.node(Some(rel), PhysicalOp::UnionAll, union_inputs))
    }
}

/// Canonical fingerprint of a relation op for history keys. Scans hash
/// their table/layout/filters; interior nodes fold their children.
pub(crate) fn rel_fingerprint(arena: &QueryArena, rel: RelId) -> String {
    let node = arena.rel(rel);
    if let RelOp::TableScan { table, .. } = &node.op {
        if let TableNode::Base(base) = arena.table(*table) {
            return leaf_fingerprint(arena, base);
        }
    }

    let mut writer = DigestWriter::new(node.op.name());
    match &node.op {
        RelOp::Join {
            join_type,
            left_keys,
            right_keys,
            ..
        } => {
            writer.write_str(&format!("{join_type:?}"));
            for key in left_keys.iter().chain(right_keys.iter()) {
                writer.write_str(&arena.expr_text(*key, true));
            }
        }
        RelOp::Aggregation { group_by, aggregates, .. } => {
            for expr in group_by.iter().chain(aggregates.iter()) {
                writer.write_str(&arena.expr_text(*expr, true));
            }
        }
        RelOp::Filter { exprs } => {
            for expr in exprs {
                writer.write_str(&arena.expr_text(*expr, true));
            }
        }
        _ => {}
    }
    for input in &node.inputs {
        writer.write_str(&rel_fingerprint(arena, *input));
    }
    format!("{}:{}", node.op.name(), writer.finish().short())
}

/// Canonical digest of a base-table scan shape: table, layout, and filter
/// text with correlation names stripped.
pub(crate) fn leaf_fingerprint(arena: &QueryArena, base: &BaseTable) -> String {
    let mut writer = DigestWriter::new("scan");
    writer.write_str(&base.table.name);
    writer.write_str(&base.layout.name);
    let mut filters: Vec<String> = base
        .column_filters
        .iter()
        .chain(base.filter.iter())
        .map(|e| arena.expr_text(*e, true))
        .collect();
    filters.sort();
    for filter in &filters {
        writer.write_str(filter);
    }
    format!("scan:{}:{}", base.table.name, writer.finish().short())
}
