//! The logical plan the optimizer consumes.
//!
//! This is an immutable input tree produced by a frontend (SQL binder, YAML
//! DSL, test builder). Every node has a stable id and can compute its output
//! schema. The optimizer never mutates it; it lowers it into a query graph.

use serde::{Deserialize, Serialize};

use crate::types::{DataType, Field, Literal, Schema, SortOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOperation {
    Union,
    UnionAll,
    Intersect,
    Except,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialForm {
    Dereference,
    If,
    And,
    Or,
    Cast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalExpr {
    InputRef {
        name: String,
        data_type: DataType,
    },
    Constant {
        value: Literal,
        data_type: DataType,
    },
    Call {
        name: String,
        args: Vec<LogicalExpr>,
        data_type: DataType,
    },
    SpecialForm {
        form: SpecialForm,
        args: Vec<LogicalExpr>,
        data_type: DataType,
    },
    Lambda {
        params: Vec<Field>,
        body: Box<LogicalExpr>,
    },
}

impl LogicalExpr {
    pub fn data_type(&self) -> DataType {
        match self {
            LogicalExpr::InputRef { data_type, .. }
            | LogicalExpr::Constant { data_type, .. }
            | LogicalExpr::Call { data_type, .. }
            | LogicalExpr::SpecialForm { data_type, .. } => data_type.clone(),
            LogicalExpr::Lambda { body, .. } => body.data_type(),
        }
    }

    pub fn args(&self) -> &[LogicalExpr] {
        match self {
            LogicalExpr::Call { args, .. } | LogicalExpr::SpecialForm { args, .. } => args,
            _ => &[],
        }
    }

    pub fn column(name: impl Into<String>, data_type: DataType) -> Self {
        LogicalExpr::InputRef {
            name: name.into(),
            data_type,
        }
    }

    pub fn constant(value: Literal) -> Self {
        let data_type = value.data_type();
        LogicalExpr::Constant { value, data_type }
    }

    pub fn call(name: impl Into<String>, data_type: DataType, args: Vec<LogicalExpr>) -> Self {
        LogicalExpr::Call {
            name: name.into(),
            args,
            data_type,
        }
    }

    pub fn eq(left: LogicalExpr, right: LogicalExpr) -> Self {
        LogicalExpr::call("eq", DataType::Boolean, vec![left, right])
    }

    pub fn and(left: LogicalExpr, right: LogicalExpr) -> Self {
        LogicalExpr::SpecialForm {
            form: SpecialForm::And,
            args: vec![left, right],
            data_type: DataType::Boolean,
        }
    }

    /// Struct member access: `base.field`.
    pub fn dereference(base: LogicalExpr, field: impl Into<String>) -> Self {
        let field = field.into();
        let data_type = match base.data_type() {
            DataType::Row(fields) => fields
                .iter()
                .find(|f| f.name == field)
                .map(|f| f.data_type.clone())
                .unwrap_or(DataType::Boolean),
            _ => DataType::Boolean,
        };
        LogicalExpr::SpecialForm {
            form: SpecialForm::Dereference,
            args: vec![base, LogicalExpr::constant(Literal::String(field))],
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: LogicalExpr,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCall {
    pub function: String,
    pub args: Vec<LogicalExpr>,
    pub filter: Option<LogicalExpr>,
    pub ordering: Vec<SortKey>,
    pub distinct: bool,
    pub data_type: DataType,
}

/// One logical operator with a stable id assigned by the producing builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalPlan {
    pub id: u32,
    pub op: LogicalOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalOp {
    Scan {
        table: String,
        schema: Schema,
    },
    Values {
        schema: Schema,
        rows: Vec<Vec<Literal>>,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: LogicalExpr,
    },
    Project {
        input: Box<LogicalPlan>,
        names: Vec<String>,
        exprs: Vec<LogicalExpr>,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_names: Vec<String>,
        group_by: Vec<LogicalExpr>,
        agg_names: Vec<String>,
        aggregates: Vec<AggregateCall>,
    },
    Join {
        join_type: JoinType,
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        condition: Option<LogicalExpr>,
    },
    Sort {
        input: Box<LogicalPlan>,
        ordering: Vec<SortKey>,
    },
    Limit {
        input: Box<LogicalPlan>,
        offset: i64,
        limit: i64,
    },
    Set {
        op: SetOperation,
        inputs: Vec<LogicalPlan>,
    },
    Unnest {
        input: Box<LogicalPlan>,
        column: String,
        alias: String,
    },
}

impl LogicalPlan {
    pub fn inputs(&self) -> Vec<&LogicalPlan> {
        match &self.op {
            LogicalOp::Scan { .. } | LogicalOp::Values { .. } => vec![],
            LogicalOp::Filter { input, .. }
            | LogicalOp::Project { input, .. }
            | LogicalOp::Aggregate { input, .. }
            | LogicalOp::Sort { input, .. }
            | LogicalOp::Limit { input, .. }
            | LogicalOp::Unnest { input, .. } => vec![input],
            LogicalOp::Join { left, right, .. } => vec![left, right],
            LogicalOp::Set { inputs, .. } => inputs.iter().collect(),
        }
    }

    /// Output row type. Projections and aggregations name their outputs; all
    /// other nodes pass through or concatenate their inputs.
    pub fn output_schema(&self) -> Schema {
        match &self.op {
            LogicalOp::Scan { schema, .. } | LogicalOp::Values { schema, .. } => schema.clone(),
            LogicalOp::Filter { input, .. }
            | LogicalOp::Sort { input, .. }
            | LogicalOp::Limit { input, .. } => input.output_schema(),
            LogicalOp::Project { names, exprs, .. } => Schema::new(
                names
                    .iter()
                    .zip(exprs.iter())
                    .map(|(n, e)| Field::new(n.clone(), e.data_type(), true))
                    .collect(),
            ),
            LogicalOp::Aggregate {
                group_names,
                group_by,
                agg_names,
                aggregates,
                ..
            } => {
                let mut fields: Vec<Field> = group_names
                    .iter()
                    .zip(group_by.iter())
                    .map(|(n, e)| Field::new(n.clone(), e.data_type(), true))
                    .collect();
                fields.extend(
                    agg_names
                        .iter()
                        .zip(aggregates.iter())
                        .map(|(n, a)| Field::new(n.clone(), a.data_type.clone(), true)),
                );
                Schema::new(fields)
            }
            LogicalOp::Join { left, right, .. } => {
                let mut fields = left.output_schema().fields;
                fields.extend(right.output_schema().fields);
                Schema::new(fields)
            }
            LogicalOp::Set { inputs, .. } => inputs
                .first()
                .map(|i| i.output_schema())
                .unwrap_or_else(|| Schema::new(vec![])),
            LogicalOp::Unnest {
                input,
                column,
                alias,
            } => {
                let mut schema = input.output_schema();
                let elem = schema
                    .find(column)
                    .and_then(|f| f.data_type.child_at(0).cloned())
                    .unwrap_or(DataType::Boolean);
                schema.fields.push(Field::new(alias.clone(), elem, true));
                schema
            }
        }
    }
}

/// Assigns stable node ids while building plans by hand (tests, CLI DSL).
#[derive(Debug, Default)]
pub struct PlanBuilder {
    next_id: u32,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, op: LogicalOp) -> LogicalPlan {
        let id = self.next_id;
        self.next_id += 1;
        LogicalPlan { id, op }
    }

    pub fn scan(&mut self, table: impl Into<String>, schema: Schema) -> LogicalPlan {
        self.node(LogicalOp::Scan {
            table: table.into(),
            schema,
        })
    }

    pub fn values(&mut self, schema: Schema, rows: Vec<Vec<Literal>>) -> LogicalPlan {
        self.node(LogicalOp::Values { schema, rows })
    }

    pub fn filter(&mut self, input: LogicalPlan, predicate: LogicalExpr) -> LogicalPlan {
        self.node(LogicalOp::Filter {
            input: Box::new(input),
            predicate,
        })
    }

    pub fn project(
        &mut self,
        input: LogicalPlan,
        names: Vec<String>,
        exprs: Vec<LogicalExpr>,
    ) -> LogicalPlan {
        self.node(LogicalOp::Project {
            input: Box::new(input),
            names,
            exprs,
        })
    }

    pub fn aggregate(
        &mut self,
        input: LogicalPlan,
        group_names: Vec<String>,
        group_by: Vec<LogicalExpr>,
        agg_names: Vec<String>,
        aggregates: Vec<AggregateCall>,
    ) -> LogicalPlan {
        self.node(LogicalOp::Aggregate {
            input: Box::new(input),
            group_names,
            group_by,
            agg_names,
            aggregates,
        })
    }

    pub fn join(
        &mut self,
        join_type: JoinType,
        left: LogicalPlan,
        right: LogicalPlan,
        condition: Option<LogicalExpr>,
    ) -> LogicalPlan {
        self.node(LogicalOp::Join {
            join_type,
            left: Box::new(left),
            right: Box::new(right),
            condition,
        })
    }

    pub fn sort(&mut self, input: LogicalPlan, ordering: Vec<SortKey>) -> LogicalPlan {
        self.node(LogicalOp::Sort {
            input: Box::new(input),
            ordering,
        })
    }

    pub fn limit(&mut self, input: LogicalPlan, offset: i64, limit: i64) -> LogicalPlan {
        self.node(LogicalOp::Limit {
            input: Box::new(input),
            offset,
            limit,
        })
    }

    pub fn set(&mut self, op: SetOperation, inputs: Vec<LogicalPlan>) -> LogicalPlan {
        self.node(LogicalOp::Set { op, inputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nation_schema() -> Schema {
        Schema::new(vec![
            Field::new("n_nationkey", DataType::Int64, false),
            Field::new("n_name", DataType::Utf8, false),
        ])
    }

    #[test]
    fn builder_assigns_increasing_ids() {
        let mut b = PlanBuilder::new();
        let scan = b.scan("nation", nation_schema());
        let filter = b.filter(
            scan,
            LogicalExpr::eq(
                LogicalExpr::column("n_nationkey", DataType::Int64),
                LogicalExpr::constant(Literal::Int64(3)),
            ),
        );
        assert_eq!(filter.id, 1);
        assert_eq!(filter.inputs()[0].id, 0);
    }

    #[test]
    fn project_schema_uses_expr_types() {
        let mut b = PlanBuilder::new();
        let scan = b.scan("nation", nation_schema());
        let proj = b.project(
            scan,
            vec!["name".into()],
            vec![LogicalExpr::column("n_name", DataType::Utf8)],
        );
        let schema = proj.output_schema();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.fields[0].name, "name");
        assert_eq!(schema.fields[0].data_type, DataType::Utf8);
    }

    #[test]
    fn join_schema_concatenates() {
        let mut b = PlanBuilder::new();
        let l = b.scan("nation", nation_schema());
        let r = b.scan(
            "region",
            Schema::new(vec![Field::new("r_regionkey", DataType::Int64, false)]),
        );
        let join = b.join(JoinType::Inner, l, r, None);
        assert_eq!(join.output_schema().len(), 3);
    }
}
