//! Physical relation operators, distributions, and cost records.
//!
//! Relation ops live in the query arena and form a DAG (build sides may be
//! shared between plans). Each node carries its output columns, its data
//! distribution, and the cost computed when it was created.

use serde::{Deserialize, Serialize};

use quarry_core::id::{ColumnId, ExprId, RelId, TableId};
use quarry_core::types::SortOrder;

/// Extended join types; the logical plan's four input types plus the
/// derived forms the builder and enumerator introduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    LeftSemi,
    RightSemi,
    LeftAnti,
    /// Existence flag produced as a boolean column.
    Mark,
}

impl JoinKind {
    /// The mirrored join type, e.g. right outer for left outer.
    pub fn reversed(self) -> JoinKind {
        match self {
            JoinKind::Left => JoinKind::Right,
            JoinKind::Right => JoinKind::Left,
            JoinKind::LeftSemi => JoinKind::RightSemi,
            JoinKind::RightSemi => JoinKind::LeftSemi,
            other => other,
        }
    }

    /// True if the right side may not contribute rows beyond existence.
    pub fn is_existence(self) -> bool {
        matches!(
            self,
            JoinKind::LeftSemi | JoinKind::RightSemi | JoinKind::LeftAnti | JoinKind::Mark
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMethod {
    Hash,
    /// Hash join with build and probe roles swapped (right variant).
    HashRight,
    /// Index lookup into a layout whose lookup keys prefix the equi-keys.
    Index,
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    /// Hash-partitioned on the distribution's keys; empty keys mean an
    /// arbitrary (round-robin) distribution across workers.
    Hash,
    Broadcast,
    Gather,
    Singleton,
}

/// Where the rows of an operator's output live and how they are ordered.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub kind: PartitionKind,
    pub partition: Vec<ExprId>,
    pub order: Vec<ExprId>,
    pub order_type: Vec<SortOrder>,
}

impl Distribution {
    pub fn arbitrary() -> Self {
        Self {
            kind: PartitionKind::Hash,
            partition: Vec::new(),
            order: Vec::new(),
            order_type: Vec::new(),
        }
    }

    pub fn hash(partition: Vec<ExprId>) -> Self {
        Self {
            kind: PartitionKind::Hash,
            partition,
            order: Vec::new(),
            order_type: Vec::new(),
        }
    }

    pub fn broadcast() -> Self {
        Self {
            kind: PartitionKind::Broadcast,
            partition: Vec::new(),
            order: Vec::new(),
            order_type: Vec::new(),
        }
    }

    pub fn gather() -> Self {
        Self {
            kind: PartitionKind::Gather,
            partition: Vec::new(),
            order: Vec::new(),
            order_type: Vec::new(),
        }
    }

    pub fn singleton() -> Self {
        Self {
            kind: PartitionKind::Singleton,
            partition: Vec::new(),
            order: Vec::new(),
            order_type: Vec::new(),
        }
    }

    pub fn is_gather(&self) -> bool {
        matches!(self.kind, PartitionKind::Gather)
    }

    pub fn with_order(mut self, order: Vec<ExprId>, order_type: Vec<SortOrder>) -> Self {
        self.order = order;
        self.order_type = order_type;
        self
    }

    /// True if data partitioned as `self` satisfies a consumer requiring
    /// partitioning on `keys` (single-node data trivially does).
    pub fn satisfies_partitioning(&self, keys: &[ExprId]) -> bool {
        match self.kind {
            PartitionKind::Gather | PartitionKind::Singleton => true,
            PartitionKind::Broadcast => false,
            PartitionKind::Hash => !self.partition.is_empty() && self.partition == keys,
        }
    }
}

/// Planning-time cost of one operator.
///
/// For leaves, `fanout` is the output cardinality and `unit_cost` the total
/// cost. For interior nodes, `fanout` is output/input cardinality and
/// `unit_cost` the per-input-row cost, in cache-line-memcpy units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub input_cardinality: f64,
    pub fanout: f64,
    pub unit_cost: f64,
    pub setup_cost: f64,
    pub total_bytes: f64,
    pub transfer_bytes: f64,
}

impl Cost {
    pub fn output_cardinality(&self) -> f64 {
        self.input_cardinality * self.fanout
    }
}

/// Accumulated cost of a partial plan. `fanout` tracks the cardinality
/// flowing out of the plan so far; unit costs are weighted by it as
/// operators stack (leftmost-deep accumulation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanCost {
    pub fanout: f64,
    pub unit_cost: f64,
    pub setup_cost: f64,
    pub total_bytes: f64,
    pub transfer_bytes: f64,
}

impl Default for PlanCost {
    fn default() -> Self {
        Self {
            fanout: 1.0,
            unit_cost: 0.0,
            setup_cost: 0.0,
            total_bytes: 0.0,
            transfer_bytes: 0.0,
        }
    }
}

impl PlanCost {
    /// Folds one operator's cost into the running plan cost.
    pub fn add(&mut self, op: &Cost) {
        self.unit_cost += op.unit_cost * self.fanout.max(1.0);
        self.setup_cost += op.setup_cost;
        self.total_bytes += op.total_bytes;
        self.transfer_bytes += op.transfer_bytes;
        self.fanout *= op.fanout;
    }

    /// Folds in a separately-planned branch (a hash build side): its work
    /// happens once, so it lands in setup; its memory adds.
    pub fn add_branch(&mut self, branch: &PlanCost) {
        self.setup_cost += branch.unit_cost + branch.setup_cost;
        self.total_bytes += branch.total_bytes;
        self.transfer_bytes += branch.transfer_bytes;
    }

    pub fn total(&self) -> f64 {
        self.unit_cost + self.setup_cost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggStep {
    Single,
    Partial,
    Final,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelOp {
    /// Full scan when `lookup_keys` is empty; batched index lookup keyed by
    /// the probe-side exprs otherwise.
    TableScan {
        table: TableId,
        layout: String,
        lookup_keys: Vec<ExprId>,
    },
    Values {
        table: TableId,
    },
    Filter {
        exprs: Vec<ExprId>,
    },
    Project {
        exprs: Vec<ExprId>,
    },
    HashBuild {
        keys: Vec<ExprId>,
        build_id: u32,
    },
    Join {
        method: JoinMethod,
        join_type: JoinKind,
        left_keys: Vec<ExprId>,
        right_keys: Vec<ExprId>,
        filter: Vec<ExprId>,
    },
    Aggregation {
        step: AggStep,
        group_by: Vec<ExprId>,
        aggregates: Vec<ExprId>,
    },
    OrderBy {
        keys: Vec<ExprId>,
        order_type: Vec<SortOrder>,
    },
    Limit {
        offset: i64,
        limit: i64,
    },
    Repartition,
    UnionAll,
}

impl RelOp {
    pub fn name(&self) -> &'static str {
        match self {
            RelOp::TableScan { lookup_keys, .. } if !lookup_keys.is_empty() => "index_lookup",
            RelOp::TableScan { .. } => "table_scan",
            RelOp::Values { .. } => "values",
            RelOp::Filter { .. } => "filter",
            RelOp::Project { .. } => "project",
            RelOp::HashBuild { .. } => "hash_build",
            RelOp::Join { .. } => "join",
            RelOp::Aggregation { .. } => "aggregation",
            RelOp::OrderBy { .. } => "order_by",
            RelOp::Limit { .. } => "limit",
            RelOp::Repartition => "repartition",
            RelOp::UnionAll => "union_all",
        }
    }
}

/// One arena-allocated relation operator.
#[derive(Debug, Clone)]
pub struct RelNode {
    pub op: RelOp,
    pub inputs: Vec<RelId>,
    pub distribution: Distribution,
    pub columns: Vec<ColumnId>,
    pub cost: Cost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_cost_accumulates_left_deep() {
        let mut cost = PlanCost::default();
        // Leaf: 1000 rows at unit cost 5 total.
        cost.add(&Cost {
            input_cardinality: 0.0,
            fanout: 1000.0,
            unit_cost: 5.0,
            ..Default::default()
        });
        assert_eq!(cost.fanout, 1000.0);
        assert_eq!(cost.unit_cost, 5.0);

        // Filter: unit 2 per row over 1000 rows, keeps 1/10th.
        cost.add(&Cost {
            input_cardinality: 1000.0,
            fanout: 0.1,
            unit_cost: 2.0,
            ..Default::default()
        });
        assert_eq!(cost.unit_cost, 5.0 + 2000.0);
        assert_eq!(cost.fanout, 100.0);
    }

    #[test]
    fn reversed_join_kinds() {
        assert_eq!(JoinKind::Left.reversed(), JoinKind::Right);
        assert_eq!(JoinKind::LeftSemi.reversed(), JoinKind::RightSemi);
        assert_eq!(JoinKind::Inner.reversed(), JoinKind::Inner);
    }

    #[test]
    fn hash_partitioning_satisfaction() {
        use quarry_core::id::ExprId;
        let keys = vec![ExprId::new(1), ExprId::new(2)];
        assert!(Distribution::hash(keys.clone()).satisfies_partitioning(&keys));
        assert!(!Distribution::arbitrary().satisfies_partitioning(&keys));
        assert!(Distribution::gather().satisfies_partitioning(&keys));
    }
}
