//! Minimal YAML → logical plan parser for linear query pipelines, plus a
//! YAML catalog document for the in-memory test catalog.
//!
//! Example:
//! ```yaml
//! steps:
//!   - op: scan
//!     table: nation
//!   - op: filter
//!     column: n_regionkey
//!     cmp: eq
//!     value: 2
//!   - op: join
//!     table: region
//!     on: [["n_regionkey", "r_regionkey"]]
//!   - op: project
//!     columns: ["n_name"]
//!   - op: limit
//!     count: 10
//! ```

use serde::{Deserialize, Serialize};

use quarry_core::error::{Error, Result};
use quarry_core::logical::{
    AggregateCall, JoinType, LogicalExpr, LogicalPlan, PlanBuilder, SortKey,
};
use quarry_core::types::{DataType, Literal, Schema, SortOrder};

use quarry_catalog::{Catalog, TableBuilder, TestCatalog};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDoc {
    pub steps: Vec<StepDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StepDoc {
    Scan {
        table: String,
    },
    Filter {
        column: String,
        cmp: String,
        value: serde_yaml::Value,
    },
    Join {
        table: String,
        on: Vec<(String, String)>,
        #[serde(default)]
        kind: Option<String>,
    },
    Project {
        columns: Vec<String>,
    },
    Aggregate {
        #[serde(default)]
        group_by: Vec<String>,
        #[serde(default)]
        aggs: Vec<AggDoc>,
    },
    Sort {
        by: Vec<SortDoc>,
    },
    Limit {
        #[serde(default)]
        offset: i64,
        count: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggDoc {
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(rename = "as")]
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortDoc {
    pub column: String,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDoc {
    pub tables: Vec<TableDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDoc {
    pub name: String,
    pub rows: u64,
    pub columns: Vec<ColumnDoc>,
    #[serde(default)]
    pub partition_by: Vec<String>,
    #[serde(default)]
    pub lookup_index: Option<IndexDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub distinct: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDoc {
    pub name: String,
    pub keys: Vec<String>,
}

fn parse_dtype(s: &str) -> DataType {
    match s {
        "Boolean" | "bool" => DataType::Boolean,
        "Int32" | "i32" => DataType::Int32,
        "Int64" | "i64" => DataType::Int64,
        "Float32" | "f32" => DataType::Float32,
        "Float64" | "f64" => DataType::Float64,
        "Binary" | "bytes" => DataType::Binary,
        _ => DataType::Utf8,
    }
}

pub fn parse_catalog(yaml_src: &str) -> Result<TestCatalog> {
    let doc: CatalogDoc = serde_yaml::from_str(yaml_src)
        .map_err(|e| Error::InvalidInput(format!("catalog yaml: {e}")))?;
    let catalog = TestCatalog::new();
    for table in doc.tables {
        let mut builder = TableBuilder::new(&table.name).row_count(table.rows);
        for column in &table.columns {
            builder = builder.column(&column.name, parse_dtype(&column.data_type));
            if let Some(distinct) = column.distinct {
                builder = builder.distinct(&column.name, distinct);
            }
        }
        if !table.partition_by.is_empty() {
            let names: Vec<&str> = table.partition_by.iter().map(String::as_str).collect();
            builder = builder.partitioned_by(&names);
        }
        if let Some(index) = &table.lookup_index {
            let keys: Vec<&str> = index.keys.iter().map(String::as_str).collect();
            builder = builder.lookup_index(&index.name, &keys);
        }
        catalog.add_table(builder);
    }
    Ok(catalog)
}

fn yaml_literal(value: &serde_yaml::Value) -> Result<Literal> {
    match value {
        serde_yaml::Value::Bool(b) => Ok(Literal::Bool(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Literal::Int64(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Literal::Float64(f))
            } else {
                Err(Error::InvalidInput(format!("unsupported number: {n:?}")))
            }
        }
        serde_yaml::Value::String(s) => Ok(Literal::String(s.clone())),
        serde_yaml::Value::Null => Ok(Literal::Null),
        other => Err(Error::InvalidInput(format!(
            "unsupported literal: {other:?}"
        ))),
    }
}

fn schema_column(schema: &Schema, name: &str) -> Result<LogicalExpr> {
    let field = schema
        .find(name)
        .ok_or_else(|| Error::InvalidInput(format!("unknown column: {name}")))?;
    Ok(LogicalExpr::column(name, field.data_type.clone()))
}

/// Parses a query document against the catalog into a logical plan.
/// Linear pipelines only; the first step must be a scan.
pub fn parse_query(yaml_src: &str, catalog: &TestCatalog) -> Result<LogicalPlan> {
    let doc: QueryDoc = serde_yaml::from_str(yaml_src)
        .map_err(|e| Error::InvalidInput(format!("query yaml: {e}")))?;

    let mut builder = PlanBuilder::new();
    let mut current: Option<LogicalPlan> = None;

    for step in doc.steps {
        let next = match (step, current.take()) {
            (StepDoc::Scan { table }, None) => {
                let schema = catalog.find_table(&table)?.schema.clone();
                builder.scan(table, schema)
            }
            (StepDoc::Scan { .. }, Some(_)) => {
                return Err(Error::InvalidInput(
                    "scan after the first step; use join".to_string(),
                ));
            }
            (
                StepDoc::Filter {
                    column,
                    cmp,
                    value,
                },
                Some(input),
            ) => {
                let schema = input.output_schema();
                let column = schema_column(&schema, &column)?;
                let op = match cmp.as_str() {
                    "eq" | "lt" | "lte" | "gt" | "gte" => cmp.clone(),
                    other => {
                        return Err(Error::InvalidInput(format!(
                            "unsupported comparison: {other}"
                        )))
                    }
                };
                let predicate = LogicalExpr::call(
                    op,
                    DataType::Boolean,
                    vec![column, LogicalExpr::constant(yaml_literal(&value)?)],
                );
                builder.filter(input, predicate)
            }
            (StepDoc::Join { table, on, kind }, Some(input)) => {
                let right_schema = catalog.find_table(&table)?.schema.clone();
                let right = builder.scan(table, right_schema.clone());
                let left_schema = input.output_schema();
                let mut condition: Option<LogicalExpr> = None;
                for (l, r) in &on {
                    let eq = LogicalExpr::eq(
                        schema_column(&left_schema, l)?,
                        schema_column(&right_schema, r)?,
                    );
                    condition = Some(match condition {
                        Some(existing) => LogicalExpr::and(existing, eq),
                        None => eq,
                    });
                }
                let join_type = match kind.as_deref() {
                    None | Some("inner") => JoinType::Inner,
                    Some("left") => JoinType::Left,
                    Some("right") => JoinType::Right,
                    Some("full") => JoinType::Full,
                    Some(other) => {
                        return Err(Error::InvalidInput(format!(
                            "unsupported join kind: {other}"
                        )))
                    }
                };
                builder.join(join_type, input, right, condition)
            }
            (StepDoc::Project { columns }, Some(input)) => {
                let schema = input.output_schema();
                let exprs: Result<Vec<LogicalExpr>> = columns
                    .iter()
                    .map(|c| schema_column(&schema, c))
                    .collect();
                builder.project(input, columns, exprs?)
            }
            (StepDoc::Aggregate { group_by, aggs }, Some(input)) => {
                let schema = input.output_schema();
                let keys: Result<Vec<LogicalExpr>> = group_by
                    .iter()
                    .map(|c| schema_column(&schema, c))
                    .collect();
                let mut agg_names = Vec::new();
                let mut calls = Vec::new();
                for agg in aggs {
                    let args = match &agg.column {
                        Some(column) => vec![schema_column(&schema, column)?],
                        None => Vec::new(),
                    };
                    let data_type = match agg.function.as_str() {
                        "count" => DataType::Int64,
                        _ => args
                            .first()
                            .map(|a| a.data_type())
                            .unwrap_or(DataType::Int64),
                    };
                    agg_names.push(agg.alias.clone());
                    calls.push(AggregateCall {
                        function: agg.function,
                        args,
                        filter: None,
                        ordering: Vec::new(),
                        distinct: false,
                        data_type,
                    });
                }
                builder.aggregate(input, group_by.clone(), keys?, agg_names, calls)
            }
            (StepDoc::Sort { by }, Some(input)) => {
                let schema = input.output_schema();
                let keys: Result<Vec<SortKey>> = by
                    .iter()
                    .map(|s| {
                        Ok(SortKey {
                            expr: schema_column(&schema, &s.column)?,
                            order: if s.desc {
                                SortOrder::DESC_NULLS_LAST
                            } else {
                                SortOrder::ASC_NULLS_LAST
                            },
                        })
                    })
                    .collect();
                builder.sort(input, keys?)
            }
            (StepDoc::Limit { offset, count }, Some(input)) => {
                builder.limit(input, offset, count)
            }
            (step, None) => {
                return Err(Error::InvalidInput(format!(
                    "first step must be a scan, got {step:?}"
                )));
            }
        };
        current = Some(next);
    }

    current.ok_or_else(|| Error::InvalidInput("empty query".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
tables:
  - name: nation
    rows: 25
    columns:
      - { name: n_nationkey, type: i64, distinct: 25 }
      - { name: n_name, type: string }
      - { name: n_regionkey, type: i64, distinct: 5 }
  - name: region
    rows: 5
    columns:
      - { name: r_regionkey, type: i64, distinct: 5 }
      - { name: r_name, type: string }
"#;

    #[test]
    fn parses_scan_join_project() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let query = r#"
steps:
  - op: scan
    table: nation
  - op: join
    table: region
    on: [["n_regionkey", "r_regionkey"]]
  - op: project
    columns: ["n_name", "r_name"]
"#;
        let plan = parse_query(query, &catalog).unwrap();
        assert_eq!(plan.output_schema().len(), 2);
    }

    #[test]
    fn rejects_non_scan_start() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let query = r#"
steps:
  - op: limit
    count: 5
"#;
        assert!(parse_query(query, &catalog).is_err());
    }
}
