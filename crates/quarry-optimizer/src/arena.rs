//! The per-query arena.
//!
//! Owns every plan object the optimizer creates: interned names and paths,
//! deduplicated expressions, columns, base/derived tables, and relation ops.
//! All references between objects are dense ids into these vectors; the
//! arena is dropped as a whole when the `Optimization` is dropped.

use std::collections::HashMap;

use quarry_core::bitset::IdSet;
use quarry_core::id::{ColumnId, ExprId, NameId, PathId, RelId, TableId};
use quarry_core::path::Subfield;
use quarry_core::types::{DataType, Literal};

use crate::expr::{ExprKind, ExprNode, ValueInfo};
use crate::graph::TableNode;
use crate::relation::{Cost, Distribution, RelNode, RelOp};

/// A named output of a relation. `top_column`/`path` are set for leaf
/// columns synthesized by subfield pushdown.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: NameId,
    pub relation: TableId,
    pub value: ValueInfo,
    pub top_column: Option<ColumnId>,
    pub path: Option<PathId>,
}

#[derive(Default)]
pub struct QueryArena {
    names: Vec<String>,
    name_map: HashMap<String, NameId>,

    paths: Vec<Subfield>,
    path_map: HashMap<Subfield, PathId>,

    exprs: Vec<ExprNode>,
    expr_dedup: HashMap<ExprKind, ExprId>,

    columns: Vec<ColumnDef>,
    tables: Vec<TableNode>,
    rels: Vec<RelNode>,
}

impl QueryArena {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- names ----

    pub fn name(&mut self, s: &str) -> NameId {
        if let Some(id) = self.name_map.get(s) {
            return *id;
        }
        let id = NameId::new(self.names.len() as u32);
        self.names.push(s.to_string());
        self.name_map.insert(s.to_string(), id);
        id
    }

    pub fn name_str(&self, id: NameId) -> &str {
        &self.names[id.index()]
    }

    // ---- paths ----

    pub fn path(&mut self, path: Subfield) -> PathId {
        if let Some(id) = self.path_map.get(&path) {
            return *id;
        }
        let id = PathId::new(self.paths.len() as u32);
        self.paths.push(path.clone());
        self.path_map.insert(path, id);
        id
    }

    pub fn path_ref(&self, id: PathId) -> &Subfield {
        &self.paths[id.index()]
    }

    // ---- expressions ----

    /// Interns `kind`; structurally equal expressions share one id.
    pub fn intern_expr(&mut self, kind: ExprKind, value: ValueInfo) -> ExprId {
        if let Some(id) = self.expr_dedup.get(&kind) {
            return *id;
        }
        let columns = self.referenced_columns(&kind);
        let id = ExprId::new(self.exprs.len() as u32);
        self.exprs.push(ExprNode {
            kind: kind.clone(),
            value,
            columns,
        });
        self.expr_dedup.insert(kind, id);
        id
    }

    fn referenced_columns(&self, kind: &ExprKind) -> IdSet {
        let mut set = IdSet::new();
        match kind {
            ExprKind::Column(c) => {
                set.insert(*c);
            }
            ExprKind::Literal(_) => {}
            ExprKind::Call { args, .. } => {
                for arg in args {
                    set.union_with(&self.exprs[arg.index()].columns);
                }
            }
            ExprKind::Field { base, .. } => {
                set.union_with(&self.exprs[base.index()].columns);
            }
            ExprKind::Aggregate {
                args,
                filter,
                ordering,
                ..
            } => {
                for arg in args {
                    set.union_with(&self.exprs[arg.index()].columns);
                }
                if let Some(f) = filter {
                    set.union_with(&self.exprs[f.index()].columns);
                }
                for (e, _) in ordering {
                    set.union_with(&self.exprs[e.index()].columns);
                }
            }
            ExprKind::Lambda { params, body } => {
                set.union_with(&self.exprs[body.index()].columns);
                for p in params {
                    set.remove(*p);
                }
            }
        }
        set
    }

    pub fn expr(&self, id: ExprId) -> &ExprNode {
        &self.exprs[id.index()]
    }

    pub fn literal_expr(&mut self, value: Literal) -> ExprId {
        let info = ValueInfo::new(value.data_type(), 1.0);
        self.intern_expr(ExprKind::Literal(value), info)
    }

    pub fn column_expr(&mut self, column: ColumnId) -> ExprId {
        let value = self.columns[column.index()].value.clone();
        self.intern_expr(ExprKind::Column(column), value)
    }

    pub fn call_expr(&mut self, name: &str, data_type: DataType, args: Vec<ExprId>) -> ExprId {
        let cardinality = args
            .iter()
            .map(|a| self.exprs[a.index()].value.cardinality)
            .fold(1.0, f64::max);
        let name = self.name(name);
        self.intern_expr(
            ExprKind::Call { name, args },
            ValueInfo::new(data_type, cardinality),
        )
    }

    /// Product of distinct-count estimates of `keys`, capped at `cap`.
    pub fn keys_cardinality(&self, keys: &[ExprId], cap: f64) -> f64 {
        let mut product = 1.0f64;
        for key in keys {
            product *= self.exprs[key.index()].value.cardinality.max(1.0);
        }
        product.min(cap.max(1.0))
    }

    // ---- columns ----

    pub fn add_column(
        &mut self,
        name: NameId,
        relation: TableId,
        value: ValueInfo,
        top_column: Option<ColumnId>,
        path: Option<PathId>,
    ) -> ColumnId {
        let id = ColumnId::new(self.columns.len() as u32);
        self.columns.push(ColumnDef {
            name,
            relation,
            value,
            top_column,
            path,
        });
        id
    }

    pub fn column(&self, id: ColumnId) -> &ColumnDef {
        &self.columns[id.index()]
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// `cname.column` for plan printing.
    pub fn column_string(&self, id: ColumnId) -> String {
        let col = &self.columns[id.index()];
        let cname = self.tables[col.relation.index()].cname();
        format!("{}.{}", self.name_str(cname), self.name_str(col.name))
    }

    /// Estimated bytes of one row of `columns`.
    pub fn byte_size(&self, columns: &[ColumnId]) -> f64 {
        columns
            .iter()
            .map(|c| self.columns[c.index()].value.data_type.estimated_byte_width())
            .sum()
    }

    pub fn exprs_byte_size(&self, exprs: &[ExprId]) -> f64 {
        exprs
            .iter()
            .map(|e| self.exprs[e.index()].value.data_type.estimated_byte_width())
            .sum()
    }

    // ---- tables ----

    pub fn add_table(&mut self, f: impl FnOnce(TableId) -> TableNode) -> TableId {
        let id = TableId::new(self.tables.len() as u32);
        let node = f(id);
        self.tables.push(node);
        id
    }

    pub fn table(&self, id: TableId) -> &TableNode {
        &self.tables[id.index()]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut TableNode {
        &mut self.tables[id.index()]
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    // ---- relation ops ----

    pub fn add_rel(
        &mut self,
        op: RelOp,
        inputs: Vec<RelId>,
        distribution: Distribution,
        columns: Vec<ColumnId>,
        cost: Cost,
    ) -> RelId {
        let id = RelId::new(self.rels.len() as u32);
        self.rels.push(RelNode {
            op,
            inputs,
            distribution,
            columns,
            cost,
        });
        id
    }

    pub fn rel(&self, id: RelId) -> &RelNode {
        &self.rels[id.index()]
    }

    // ---- display ----

    /// Human-readable expression text. With `canonical`, correlation names
    /// are dropped and base tables print their schema name, which makes the
    /// text stable across queries for history keys.
    pub fn expr_text(&self, id: ExprId, canonical: bool) -> String {
        match &self.exprs[id.index()].kind {
            ExprKind::Column(c) => {
                let col = &self.columns[c.index()];
                if canonical {
                    let table = &self.tables[col.relation.index()];
                    match table {
                        TableNode::Base(b) => {
                            format!("{}.{}", b.table.name, self.name_str(col.name))
                        }
                        _ => self.name_str(col.name).to_string(),
                    }
                } else {
                    self.column_string(*c)
                }
            }
            ExprKind::Literal(l) => l.to_string(),
            ExprKind::Call { name, args } => {
                let args: Vec<String> = args.iter().map(|a| self.expr_text(*a, canonical)).collect();
                format!("{}({})", self.name_str(*name), args.join(", "))
            }
            ExprKind::Field { base, step } => {
                format!("{}{}", self.expr_text(*base, canonical), step)
            }
            ExprKind::Aggregate {
                name,
                args,
                filter,
                distinct,
                ..
            } => {
                let args: Vec<String> = args.iter().map(|a| self.expr_text(*a, canonical)).collect();
                let mut out = format!(
                    "{}({}{})",
                    self.name_str(*name),
                    if *distinct { "distinct " } else { "" },
                    args.join(", ")
                );
                if let Some(f) = filter {
                    out.push_str(&format!(" filter ({})", self.expr_text(*f, canonical)));
                }
                out
            }
            ExprKind::Lambda { params, body } => {
                let params: Vec<String> = params
                    .iter()
                    .map(|p| self.name_str(self.columns[p.index()].name).to_string())
                    .collect();
                format!("({}) -> {}", params.join(", "), self.expr_text(*body, canonical))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::path::Step;

    #[test]
    fn names_and_paths_intern() {
        let mut arena = QueryArena::new();
        let a = arena.name("n_name");
        let b = arena.name("n_name");
        assert_eq!(a, b);

        let p1 = arena.path(Subfield::new(vec![Step::field("a")]));
        let p2 = arena.path(Subfield::new(vec![Step::field("a")]));
        let p3 = arena.path(Subfield::new(vec![Step::field("b")]));
        assert_eq!(p1, p2);
        assert_ne!(p1, p3);
    }

    #[test]
    fn structurally_equal_exprs_share_one_node() {
        let mut arena = QueryArena::new();
        let one = arena.literal_expr(Literal::Int64(1));
        let also_one = arena.literal_expr(Literal::Int64(1));
        assert_eq!(one, also_one);

        let c1 = arena.call_expr("plus", DataType::Int64, vec![one, one]);
        let c2 = arena.call_expr("plus", DataType::Int64, vec![one, also_one]);
        assert_eq!(c1, c2);

        let c3 = arena.call_expr("minus", DataType::Int64, vec![one, one]);
        assert_ne!(c1, c3);
    }
}
