//! The query graph: derived tables linked by join edges.
//!
//! The builder lowers the logical plan into this forest; the search
//! enumerates physical plans over it.

pub mod build;
pub mod subfields;

use std::collections::HashMap;
use std::sync::Arc;

use quarry_core::bitset::IdSet;
use quarry_core::id::{ColumnId, ExprId, NameId, TableId};
use quarry_core::types::{Literal, Schema, SortOrder};

use quarry_catalog::metadata::{Table, TableLayout};

use crate::relation::JoinKind;

pub use build::GraphBuilder;

/// A scan of one physical table layout. Mutated while filters are pushed in
/// during graph building; frozen before the search starts.
#[derive(Debug)]
pub struct BaseTable {
    pub id: TableId,
    /// Correlation name, e.g. `t1`.
    pub cname: NameId,
    pub table: Arc<Table>,
    pub layout: Arc<TableLayout>,
    /// Output columns of the scan: top-level columns, or synthesized leaf
    /// columns when subfield pushdown rewrote this scan.
    pub columns: Vec<ColumnId>,
    /// Single-column conjuncts the catalog may evaluate below the scan.
    pub column_filters: Vec<ExprId>,
    /// Conjuncts on this table only that stay above the scan.
    pub filter: Vec<ExprId>,
    /// Estimated fraction of rows surviving all filters.
    pub filter_selectivity: f64,
    /// Live subfield paths per top column, split by whether the access can
    /// affect which rows survive.
    pub control_subfields: HashMap<ColumnId, IdSet>,
    pub payload_subfields: HashMap<ColumnId, IdSet>,
    /// Top map columns exposed as structs of their accessed keys.
    pub map_as_struct: Vec<ColumnId>,
}

impl BaseTable {
    /// Control ∪ payload paths for `column`.
    pub fn live_paths(&self, column: ColumnId) -> IdSet {
        let mut set = self
            .control_subfields
            .get(&column)
            .cloned()
            .unwrap_or_default();
        if let Some(payload) = self.payload_subfields.get(&column) {
            set.union_with(payload);
        }
        set
    }
}

/// Literal rows inlined in the plan.
#[derive(Debug)]
pub struct ValuesTable {
    pub id: TableId,
    pub cname: NameId,
    pub schema: Schema,
    pub rows: Vec<Vec<Literal>>,
    pub columns: Vec<ColumnId>,
}

/// An equi-join (plus optional residual filter) between two sides within one
/// derived table. Sides are single member tables; candidates combine
/// parallel edges when a table joins several placed tables.
#[derive(Debug, Clone)]
pub struct JoinEdge {
    pub left: TableId,
    pub right: TableId,
    pub left_keys: Vec<ExprId>,
    pub right_keys: Vec<ExprId>,
    /// Non-equi conjuncts evaluated with the join.
    pub filter: Vec<ExprId>,
    pub join_type: JoinKind,
}

impl JoinEdge {
    /// The opposite side and the (near, far) key vectors seen from `table`.
    pub fn other_side(&self, table: TableId) -> Option<(TableId, &[ExprId], &[ExprId])> {
        if self.left == table {
            Some((self.right, &self.left_keys, &self.right_keys))
        } else if self.right == table {
            Some((self.left, &self.right_keys, &self.left_keys))
        } else {
            None
        }
    }

    /// True if the unplaced side of a non-inner edge may only be added as
    /// the right/build side (outer and existence joins do not commute).
    pub fn is_non_commutative(&self) -> bool {
        !matches!(self.join_type, JoinKind::Inner)
    }
}

/// Group-by and aggregate list attached to a derived table.
#[derive(Debug, Clone)]
pub struct AggregationSpec {
    /// Deduplicated grouping expressions.
    pub group_by: Vec<ExprId>,
    /// Deduplicated aggregate expressions.
    pub aggregates: Vec<ExprId>,
    /// Output columns: keys first, then aggregates.
    pub columns: Vec<ColumnId>,
}

/// What role a nested set operation plays, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtSetOp {
    UnionAll,
}

/// A scope of joined tables plus optional aggregation, ordering and limit.
#[derive(Debug)]
pub struct DerivedTable {
    pub id: TableId,
    pub cname: NameId,
    pub tables: Vec<TableId>,
    pub table_set: IdSet,
    /// Flattened conjuncts not absorbed into base-table filters or edges.
    pub conjuncts: Vec<ExprId>,
    pub join_edges: Vec<JoinEdge>,
    /// Projected output columns and their defining expressions, 1:1.
    pub columns: Vec<ColumnId>,
    pub exprs: Vec<ExprId>,
    pub aggregation: Option<AggregationSpec>,
    pub ordering: Vec<(ExprId, SortOrder)>,
    pub limit: Option<i64>,
    pub offset: i64,
    /// Set when this dt is a multi-input union-all over its member tables.
    pub set_op: Option<DtSetOp>,
}

impl DerivedTable {
    pub fn has_postprocess(&self) -> bool {
        self.aggregation.is_some() || !self.ordering.is_empty() || self.limit.is_some()
    }

    pub fn edges_touching(&self, table: TableId) -> impl Iterator<Item = &JoinEdge> {
        self.join_edges
            .iter()
            .filter(move |e| e.left == table || e.right == table)
    }
}

/// Arena slot for any relation the query graph references.
#[derive(Debug)]
pub enum TableNode {
    Base(BaseTable),
    Derived(DerivedTable),
    Values(ValuesTable),
}

impl TableNode {
    pub fn id(&self) -> TableId {
        match self {
            TableNode::Base(t) => t.id,
            TableNode::Derived(t) => t.id,
            TableNode::Values(t) => t.id,
        }
    }

    pub fn cname(&self) -> NameId {
        match self {
            TableNode::Base(t) => t.cname,
            TableNode::Derived(t) => t.cname,
            TableNode::Values(t) => t.cname,
        }
    }

    pub fn as_base(&self) -> Option<&BaseTable> {
        match self {
            TableNode::Base(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_derived(&self) -> Option<&DerivedTable> {
        match self {
            TableNode::Derived(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_values(&self) -> Option<&ValuesTable> {
        match self {
            TableNode::Values(t) => Some(t),
            _ => None,
        }
    }

    /// Output columns in declaration order.
    pub fn output_columns(&self) -> &[ColumnId] {
        match self {
            TableNode::Base(t) => &t.columns,
            TableNode::Derived(t) => &t.columns,
            TableNode::Values(t) => &t.columns,
        }
    }
}
