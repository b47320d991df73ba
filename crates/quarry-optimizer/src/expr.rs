//! Deduplicated expression nodes and per-function planning metadata.
//!
//! Expressions are owned by the query arena and referenced by id. Two
//! structurally equal expressions share one node, so expression identity is
//! id equality; this is what makes duplicate grouping keys and duplicate
//! aggregates collapse for free.

use std::collections::HashMap;

use quarry_core::bitset::IdSet;
use quarry_core::id::{ColumnId, ExprId, NameId};
use quarry_core::path::Step;
use quarry_core::types::{DataType, Literal, SortOrder};

/// Type plus estimated distinct-value cardinality.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub data_type: DataType,
    pub cardinality: f64,
}

impl ValueInfo {
    pub fn new(data_type: DataType, cardinality: f64) -> Self {
        Self {
            data_type,
            cardinality,
        }
    }
}

/// Structural identity of an expression; doubles as the dedup map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    Column(ColumnId),
    Literal(Literal),
    Call {
        name: NameId,
        args: Vec<ExprId>,
    },
    /// One step of subfield access over `base`.
    Field {
        base: ExprId,
        step: Step,
    },
    Aggregate {
        name: NameId,
        args: Vec<ExprId>,
        filter: Option<ExprId>,
        ordering: Vec<(ExprId, SortOrder)>,
        distinct: bool,
    },
    Lambda {
        params: Vec<ColumnId>,
        body: ExprId,
    },
}

#[derive(Debug, Clone)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub value: ValueInfo,
    /// Columns this expression depends on, transitively.
    pub columns: IdSet,
}

/// Planning-time metadata for a function. Absent metadata means: arguments
/// are fully consumed, constant cost.
#[derive(Default)]
pub struct FunctionMetadata {
    /// Constant per-row cost; overridden by `cost_func` when set.
    pub cost: f64,
    pub cost_func: Option<fn(arg_count: usize) -> f64>,

    /// A subfield of the result is the same subfield of this argument
    /// (identity-shaped functions).
    pub subfield_arg: Option<usize>,

    /// For constructor-like functions: maps a leading `Field` step of a path
    /// over the result to (argument ordinal, remaining path). E.g. a
    /// row-constructor where `.f2` selects the second argument.
    pub value_path_to_arg_path: Option<fn(&[Step]) -> Option<(usize, Vec<Step>)>>,

    /// For higher-order functions: per lambda argument, which container
    /// argument each lambda parameter ranges over.
    pub lambdas: Vec<LambdaInfo>,
}

#[derive(Debug, Clone)]
pub struct LambdaInfo {
    /// Ordinal of the lambda argument in the call.
    pub ordinal: usize,
    /// For each lambda parameter, the call argument it draws elements from.
    pub param_sources: Vec<usize>,
}

impl FunctionMetadata {
    pub fn has_subfield_handling(&self) -> bool {
        self.subfield_arg.is_some()
            || self.value_path_to_arg_path.is_some()
            || !self.lambdas.is_empty()
    }

    pub fn lambda_info(&self, arg_ordinal: usize) -> Option<&LambdaInfo> {
        self.lambdas.iter().find(|l| l.ordinal == arg_ordinal)
    }
}

/// Process-wide table of function metadata, keyed by function name.
pub struct FunctionRegistry {
    metadata: HashMap<String, FunctionMetadata>,
}

fn make_row_path(steps: &[Step]) -> Option<(usize, Vec<Step>)> {
    // `make_row(a, b, ...)` then `.fN` selects argument N by ordinal.
    match steps.first() {
        Some(Step::Field {
            index: Some(idx), ..
        }) => Some((*idx, steps[1..].to_vec())),
        _ => None,
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let mut metadata = HashMap::new();

        metadata.insert(
            "make_row".to_string(),
            FunctionMetadata {
                cost: 2.0,
                value_path_to_arg_path: Some(make_row_path),
                ..Default::default()
            },
        );

        // Identity-shaped on a value argument: a subfield of the result is
        // the same subfield of that argument. For `if` it is the then-branch
        // (the else-branch and condition stay fully consumed).
        metadata.insert(
            "coalesce".to_string(),
            FunctionMetadata {
                cost: 2.0,
                subfield_arg: Some(0),
                ..Default::default()
            },
        );
        metadata.insert(
            "if".to_string(),
            FunctionMetadata {
                cost: 2.0,
                subfield_arg: Some(1),
                ..Default::default()
            },
        );

        metadata.insert(
            "transform".to_string(),
            FunctionMetadata {
                cost: 20.0,
                lambdas: vec![LambdaInfo {
                    ordinal: 1,
                    param_sources: vec![0],
                }],
                ..Default::default()
            },
        );

        metadata.insert(
            "filter".to_string(),
            FunctionMetadata {
                cost: 20.0,
                lambdas: vec![LambdaInfo {
                    ordinal: 1,
                    param_sources: vec![0],
                }],
                ..Default::default()
            },
        );

        metadata.insert(
            "concat".to_string(),
            FunctionMetadata {
                cost_func: Some(|args| 5.0 * args as f64),
                ..Default::default()
            },
        );

        Self { metadata }
    }
}

impl FunctionRegistry {
    pub fn metadata(&self, name: &str) -> Option<&FunctionMetadata> {
        self.metadata.get(name)
    }

    pub fn register(&mut self, name: impl Into<String>, metadata: FunctionMetadata) {
        self.metadata.insert(name.into(), metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_row_maps_field_steps_to_args() {
        let registry = FunctionRegistry::default();
        let md = registry.metadata("make_row").unwrap();
        let steps = vec![
            Step::Field {
                name: "f1".into(),
                index: Some(1),
            },
            Step::field("x"),
        ];
        let (arg, rest) = (md.value_path_to_arg_path.unwrap())(&steps).unwrap();
        assert_eq!(arg, 1);
        assert_eq!(rest, vec![Step::field("x")]);
    }

    #[test]
    fn unknown_functions_have_no_metadata() {
        let registry = FunctionRegistry::default();
        assert!(registry.metadata("upper").is_none());
    }
}
