//! Subfield access analysis.
//!
//! Walks the logical plan and records, per (node, output ordinal), which
//! paths into complex-typed values are actually accessed. Control positions
//! are those that can affect which rows survive (filters, join/group/sort
//! keys, distinct set ops); everything else is payload. Scans later
//! materialize only the union of both.

use std::collections::HashMap;

use quarry_core::bitset::IdSet;
use quarry_core::error::{Error, Result};
use quarry_core::logical::{LogicalExpr, LogicalOp, LogicalPlan, SetOperation, SpecialForm};
use quarry_core::path::{Step, Subfield, SubscriptKey};
use quarry_core::types::{Literal, Schema};

use crate::arena::QueryArena;
use crate::expr::FunctionRegistry;

/// Accessed paths per (logical node id, output ordinal). Path sets hold
/// interned `PathId`s.
#[derive(Debug, Default)]
pub struct PlanSubfields {
    pub node_fields: HashMap<(u32, usize), IdSet>,
}

impl PlanSubfields {
    fn add(&mut self, node: u32, ordinal: usize, path: quarry_core::id::PathId) -> bool {
        self.node_fields
            .entry((node, ordinal))
            .or_default()
            .insert(path)
    }

    pub fn paths(&self, node: u32, ordinal: usize) -> Option<&IdSet> {
        self.node_fields.get(&(node, ordinal))
    }
}

/// One resolution frame: a row schema plus where its fields come from.
enum CtxSource<'p> {
    Node(&'p LogicalPlan),
    /// Fields are parameters of a lambda passed to `call` at `ordinal`.
    Lambda {
        call: &'p LogicalExpr,
        ordinal: usize,
    },
}

struct CtxFrame<'p> {
    schema: Schema,
    source: CtxSource<'p>,
}

fn frame_for<'p>(node: &'p LogicalPlan) -> CtxFrame<'p> {
    CtxFrame {
        schema: node.output_schema(),
        source: CtxSource::Node(node),
    }
}

pub struct SubfieldMarker<'a> {
    arena: &'a mut QueryArena,
    registry: &'a FunctionRegistry,
    pub control: PlanSubfields,
    pub payload: PlanSubfields,
}

impl<'a> SubfieldMarker<'a> {
    pub fn new(arena: &'a mut QueryArena, registry: &'a FunctionRegistry) -> Self {
        Self {
            arena,
            registry,
            control: PlanSubfields::default(),
            payload: PlanSubfields::default(),
        }
    }

    /// Marks control positions below `root`, then every root output as
    /// payload.
    pub fn mark_all(&mut self, root: &LogicalPlan) -> Result<()> {
        self.mark_control(root)?;
        let mut steps = Vec::new();
        let width = root.output_schema().len();
        for ordinal in 0..width {
            self.mark_field_accessed(&CtxSource::Node(root), ordinal, &mut steps, false, &[])?;
            debug_assert!(steps.is_empty());
        }
        Ok(())
    }

    /// Ordinals of `node`'s output that anything upstream accesses.
    pub fn used_channels(&self, node: &LogicalPlan) -> Vec<usize> {
        let width = node.output_schema().len();
        (0..width)
            .filter(|ordinal| {
                self.control.paths(node.id, *ordinal).is_some()
                    || self.payload.paths(node.id, *ordinal).is_some()
            })
            .collect()
    }

    fn fields(&mut self, is_control: bool) -> &mut PlanSubfields {
        if is_control {
            &mut self.control
        } else {
            &mut self.payload
        }
    }

    fn mark_control(&mut self, node: &LogicalPlan) -> Result<()> {
        match &node.op {
            LogicalOp::Join {
                left,
                right,
                condition,
                ..
            } => {
                if let Some(condition) = condition {
                    let frames = [frame_for(left), frame_for(right)];
                    let mut steps = Vec::new();
                    self.mark_subfields(condition, &mut steps, true, &frames)?;
                }
            }
            LogicalOp::Filter { input, predicate } => {
                let frames = [frame_for(input)];
                let mut steps = Vec::new();
                self.mark_subfields(predicate, &mut steps, true, &frames)?;
            }
            LogicalOp::Aggregate {
                input, group_by, ..
            } => {
                let frames = [frame_for(input)];
                let mut steps = Vec::new();
                for key in group_by {
                    self.mark_subfields(key, &mut steps, true, &frames)?;
                    debug_assert!(steps.is_empty());
                }
            }
            LogicalOp::Sort { input, ordering } => {
                let frames = [frame_for(input)];
                let mut steps = Vec::new();
                for key in ordering {
                    self.mark_subfields(&key.expr, &mut steps, true, &frames)?;
                    debug_assert!(steps.is_empty());
                }
            }
            LogicalOp::Set { op, inputs } => {
                // Distinct set ops compare whole rows; every column is
                // control.
                if *op != SetOperation::UnionAll {
                    let width = node.output_schema().len();
                    let mut steps = Vec::new();
                    for ordinal in 0..width {
                        for input in inputs {
                            self.mark_field_accessed(
                                &CtxSource::Node(input),
                                ordinal,
                                &mut steps,
                                true,
                                &[],
                            )?;
                        }
                    }
                }
            }
            _ => {}
        }

        for input in node.inputs() {
            self.mark_control(input)?;
        }
        Ok(())
    }

    fn mark_field_accessed(
        &mut self,
        source: &CtxSource<'_>,
        ordinal: usize,
        steps: &mut Vec<Step>,
        is_control: bool,
        ctx: &[CtxFrame<'_>],
    ) -> Result<()> {
        let node = match source {
            CtxSource::Lambda { call, ordinal: lambda_ordinal } => {
                // The field is a lambda parameter; the path applies to the
                // container argument of the enclosing higher-order call.
                let (name, args) = match call {
                    LogicalExpr::Call { name, args, .. } => (name.as_str(), args),
                    _ => {
                        return Err(Error::Internal(
                            "lambda context without enclosing call".to_string(),
                        ))
                    }
                };
                let metadata = self.registry.metadata(name).ok_or_else(|| {
                    Error::Internal(format!("no metadata for lambda function {name}"))
                })?;
                let info = metadata.lambda_info(*lambda_ordinal).ok_or_else(|| {
                    Error::Internal(format!("no lambda info for {name} arg {lambda_ordinal}"))
                })?;
                let nth = *info.param_sources.get(ordinal).unwrap_or(&0);
                let arg = args.get(nth).ok_or_else(|| {
                    Error::InvalidInput(format!("{name} has no argument {nth}"))
                })?;
                return self.mark_subfields(arg, steps, is_control, &ctx[1..]);
            }
            CtxSource::Node(node) => *node,
        };

        // Record the (reversed) accumulated path for this output.
        let mut path_steps = steps.clone();
        path_steps.reverse();
        let path = self.arena.path(Subfield::new(path_steps));
        if !self.fields(is_control).add(node.id, ordinal, path) {
            // Already marked.
            return Ok(());
        }

        match &node.op {
            LogicalOp::Project { input, exprs, .. } => {
                let expr = exprs.get(ordinal).ok_or_else(|| {
                    Error::InvalidInput(format!("project has no output {ordinal}"))
                })?;
                let frames = [frame_for(input)];
                self.mark_subfields(expr, steps, is_control, &frames)
            }
            LogicalOp::Aggregate {
                input,
                group_by,
                aggregates,
                ..
            } => {
                let frames = [frame_for(input)];
                let mut sub_steps = Vec::new();
                if ordinal < group_by.len() {
                    return self.mark_subfields(&group_by[ordinal], &mut sub_steps, is_control, &frames);
                }
                let agg = aggregates.get(ordinal - group_by.len()).ok_or_else(|| {
                    Error::InvalidInput(format!("aggregate has no output {ordinal}"))
                })?;
                for arg in &agg.args {
                    self.mark_subfields(arg, &mut sub_steps, is_control, &frames)?;
                }
                if let Some(filter) = &agg.filter {
                    self.mark_subfields(filter, &mut sub_steps, is_control, &frames)?;
                }
                for key in &agg.ordering {
                    self.mark_subfields(&key.expr, &mut sub_steps, is_control, &frames)?;
                }
                Ok(())
            }
            LogicalOp::Set { inputs, .. } => {
                for input in inputs {
                    self.mark_field_accessed(
                        &CtxSource::Node(input),
                        ordinal,
                        steps,
                        is_control,
                        ctx,
                    )?;
                }
                Ok(())
            }
            LogicalOp::Scan { .. } | LogicalOp::Values { .. } => Ok(()),
            _ => {
                // Pass-through nodes: resolve the output name in an input.
                let name = node
                    .output_schema()
                    .fields
                    .get(ordinal)
                    .map(|f| f.name.clone())
                    .ok_or_else(|| {
                        Error::InvalidInput(format!("node {} has no output {ordinal}", node.id))
                    })?;
                for input in node.inputs() {
                    if let Some(idx) = input.output_schema().index_of(&name) {
                        return self.mark_field_accessed(
                            &CtxSource::Node(input),
                            idx,
                            steps,
                            is_control,
                            ctx,
                        );
                    }
                }
                Err(Error::Internal(format!(
                    "no source found for column {name} of node {}",
                    node.id
                )))
            }
        }
    }

    fn mark_subfields(
        &mut self,
        expr: &LogicalExpr,
        steps: &mut Vec<Step>,
        is_control: bool,
        ctx: &[CtxFrame<'_>],
    ) -> Result<()> {
        match expr {
            LogicalExpr::InputRef { name, .. } => {
                for (i, frame) in ctx.iter().enumerate() {
                    if let Some(ordinal) = frame.schema.index_of(name) {
                        // Reborrow the frame's source; context beyond this
                        // frame stays visible for lambda resolution.
                        let rest = &ctx[i..];
                        let source = &rest[0].source;
                        return self.mark_field_accessed(source, ordinal, steps, is_control, rest);
                    }
                }
                Err(Error::InvalidInput(format!("field not found: {name}")))
            }
            LogicalExpr::Constant { .. } => Ok(()),
            LogicalExpr::SpecialForm { form, args, .. } if *form == SpecialForm::Dereference => {
                let base = args.first().ok_or_else(|| {
                    Error::InvalidInput("dereference without base".to_string())
                })?;
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
                let index = base.data_type().row_field_index(&field);
                steps.push(Step::Field { name: field, index });
                self.mark_subfields(base, steps, is_control, ctx)?;
                steps.pop();
                Ok(())
            }
            LogicalExpr::Call { name, args, .. } => {
                if name == "cardinality" && args.len() == 1 {
                    steps.push(Step::Cardinality);
                    self.mark_subfields(&args[0], steps, is_control, ctx)?;
                    steps.pop();
                    return Ok(());
                }

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
                    match key {
                        Some(key) => {
                            steps.push(Step::Subscript(key));
                        }
                        None => {
                            // Non-literal key: the key expression is its own
                            // access; the container is accessed wholesale.
                            let mut key_steps = Vec::new();
                            self.mark_subfields(&args[1], &mut key_steps, is_control, ctx)?;
                            steps.push(Step::AllSubscripts);
                        }
                    }
                    self.mark_subfields(&args[0], steps, is_control, ctx)?;
                    steps.pop();
                    return Ok(());
                }

                let metadata = self.registry.metadata(name);
                let has_handling = metadata.is_some_and(|m| m.has_subfield_handling());
                if !has_handling {
                    let mut arg_steps = Vec::new();
                    for arg in args {
                        self.mark_subfields(arg, &mut arg_steps, is_control, ctx)?;
                        debug_assert!(arg_steps.is_empty());
                    }
                    return Ok(());
                }

                // Constructor-like functions: a path over the result selects
                // one argument.
                if let Some(to_arg) = metadata.and_then(|m| m.value_path_to_arg_path) {
                    if !steps.is_empty() {
                        if let Some((nth, mut rest)) = to_arg(&reversed(steps)) {
                            if let Some(arg) = args.get(nth) {
                                rest.reverse();
                                let mut arg_steps = rest;
                                return self.mark_subfields(arg, &mut arg_steps, is_control, ctx);
                            }
                        }
                    }
                }

                let md = metadata.ok_or_else(|| {
                    Error::Internal(format!("metadata vanished for {name}"))
                })?;
                for (i, arg) in args.iter().enumerate() {
                    if md.subfield_arg == Some(i) {
                        // A subfield of the result is the same subfield of
                        // this argument.
                        self.mark_subfields(arg, steps, is_control, ctx)?;
                        continue;
                    }
                    if md.lambda_info(i).is_some() {
                        let (params, body) = match arg {
                            LogicalExpr::Lambda { params, body, .. } => (params.clone(), body),
                            _ => {
                                return Err(Error::InvalidInput(format!(
                                    "{name} argument {i} must be a lambda"
                                )))
                            }
                        };
                        let mut frames = Vec::with_capacity(ctx.len() + 1);
                        frames.push(CtxFrame {
                            schema: Schema::new(params),
                            source: CtxSource::Lambda {
                                call: expr,
                                ordinal: i,
                            },
                        });
                        frames.extend(ctx.iter().map(|f| CtxFrame {
                            schema: f.schema.clone(),
                            source: match &f.source {
                                CtxSource::Node(n) => CtxSource::Node(*n),
                                CtxSource::Lambda { call, ordinal } => CtxSource::Lambda {
                                    call: *call,
                                    ordinal: *ordinal,
                                },
                            },
                        }));
                        let mut lambda_steps = Vec::new();
                        self.mark_subfields(body, &mut lambda_steps, is_control, &frames)?;
                        debug_assert!(lambda_steps.is_empty());
                        continue;
                    }
                    let mut arg_steps = Vec::new();
                    self.mark_subfields(arg, &mut arg_steps, is_control, ctx)?;
                }
                Ok(())
            }
            LogicalExpr::SpecialForm { args, .. } => {
                let mut arg_steps = Vec::new();
                for arg in args {
                    self.mark_subfields(arg, &mut arg_steps, is_control, ctx)?;
                    debug_assert!(arg_steps.is_empty());
                }
                Ok(())
            }
            LogicalExpr::Lambda { body, .. } => {
                // Bare lambda outside a higher-order call: parameters cannot
                // be resolved, but free references still mark.
                let mut body_steps = Vec::new();
                self.mark_subfields(body, &mut body_steps, is_control, ctx)
            }
        }
    }
}

/// Steps accumulate outermost-first while descending; access order is the
/// reverse.
fn reversed(steps: &[Step]) -> Vec<Step> {
    let mut out = steps.to_vec();
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::logical::PlanBuilder;
    use quarry_core::types::{DataType, Field};

    fn address_type() -> DataType {
        DataType::Row(vec![
            Field::new("city", DataType::Utf8, true),
            Field::new("zip", DataType::Int64, true),
        ])
    }

    fn customer_schema() -> Schema {
        Schema::new(vec![
            Field::new("c_custkey", DataType::Int64, false),
            Field::new("c_address", address_type(), true),
        ])
    }

    #[test]
    fn filter_dereference_is_control() {
        let mut b = PlanBuilder::new();
        let scan = b.scan("customer", customer_schema());
        let scan_id = scan.id;
        let pred = LogicalExpr::eq(
            LogicalExpr::dereference(
                LogicalExpr::column("c_address", address_type()),
                "city",
            ),
            LogicalExpr::constant(Literal::String("oulu".into())),
        );
        let filtered = b.filter(scan, pred);
        let root = b.project(
            filtered,
            vec!["k".into()],
            vec![LogicalExpr::column("c_custkey", DataType::Int64)],
        );

        let mut arena = QueryArena::new();
        let registry = FunctionRegistry::default();
        let mut marker = SubfieldMarker::new(&mut arena, &registry);
        marker.mark_all(&root).unwrap();

        // Ordinal 1 is c_address; the control set must contain `.city`.
        let paths = marker.control.paths(scan_id, 1).expect("address accessed");
        let wanted: Vec<Subfield> = paths
            .iter_raw()
            .map(|raw| marker.arena.path_ref(quarry_core::id::PathId::new(raw)).clone())
            .collect();
        assert!(wanted
            .iter()
            .any(|p| p.to_string() == ".city"), "got {wanted:?}");

        // The key column is payload-marked through the projection.
        assert!(marker.payload.paths(scan_id, 0).is_some());
        // The address column is not a payload access.
        assert!(marker.payload.paths(scan_id, 1).is_none());
    }

    #[test]
    fn projected_subfield_path_reaches_scan() {
        let mut b = PlanBuilder::new();
        let scan = b.scan("customer", customer_schema());
        let scan_id = scan.id;
        let root = b.project(
            scan,
            vec!["zip".into()],
            vec![LogicalExpr::dereference(
                LogicalExpr::column("c_address", address_type()),
                "zip",
            )],
        );

        let mut arena = QueryArena::new();
        let registry = FunctionRegistry::default();
        let mut marker = SubfieldMarker::new(&mut arena, &registry);
        marker.mark_all(&root).unwrap();

        let paths = marker.payload.paths(scan_id, 1).expect("address accessed");
        assert_eq!(paths.len(), 1);
        let raw = paths.iter_raw().next().unwrap();
        assert_eq!(
            marker.arena.path_ref(quarry_core::id::PathId::new(raw)).to_string(),
            ".zip"
        );
        assert_eq!(marker.used_channels(&root), vec![0]);
    }

    #[test]
    fn lambda_body_marks_container_argument() {
        let lines = DataType::Array(Box::new(address_type()));
        let schema = Schema::new(vec![Field::new("c_lines", lines.clone(), true)]);

        let mut b = PlanBuilder::new();
        let scan = b.scan("customer", schema);
        let scan_id = scan.id;
        // transform(c_lines, x -> x.zip)
        let lambda = LogicalExpr::Lambda {
            params: vec![Field::new("x", address_type(), true)],
            body: Box::new(LogicalExpr::dereference(
                LogicalExpr::column("x", address_type()),
                "zip",
            )),
        };
        let call = LogicalExpr::call(
            "transform",
            DataType::Array(Box::new(DataType::Int64)),
            vec![LogicalExpr::column("c_lines", lines), lambda],
        );
        let root = b.project(scan, vec!["zips".into()], vec![call]);

        let mut arena = QueryArena::new();
        let registry = FunctionRegistry::default();
        let mut marker = SubfieldMarker::new(&mut arena, &registry);
        marker.mark_all(&root).unwrap();

        let paths = marker.payload.paths(scan_id, 0).expect("lines accessed");
        let texts: Vec<String> = paths
            .iter_raw()
            .map(|raw| arena.path_ref(quarry_core::id::PathId::new(raw)).to_string())
            .collect();
        assert!(texts.contains(&".zip".to_string()), "got {texts:?}");
    }
}
