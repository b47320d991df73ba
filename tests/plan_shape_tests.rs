//! End-to-end plan shape tests: logical plan → optimizer → fragment shapes.

mod support;

use quarry::logical::{AggregateCall, JoinType, SortKey};
use quarry::{
    DataType, FileHistory, LogicalExpr, Optimization, OptimizerOptions, PlanBuilder, SortOrder,
};

use support::*;

fn options(workers: usize) -> OptimizerOptions {
    OptimizerOptions {
        num_workers: workers,
        num_drivers: 4,
        ..OptimizerOptions::default()
    }
}

fn plan_with(
    plan: &quarry::LogicalPlan,
    opts: OptimizerOptions,
) -> (quarry::PlanAndStats, f64) {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let mut optimization =
        Optimization::new(plan, &catalog, &history, opts).expect("optimization builds");
    let best = optimization.best_plan().expect("a plan is found");
    let out_cardinality = best.out_cardinality;
    let executable = optimization
        .to_executable_plan(&best)
        .expect("plan emission succeeds");
    (executable, out_cardinality)
}

#[test]
fn limit_splits_into_partial_and_final_fragments() {
    // SELECT n_name FROM nation LIMIT 10 with 4 workers x 4 drivers.
    let mut b = PlanBuilder::new();
    let project = select_n_name(&mut b);
    let root = b.limit(project, 0, 10);

    let (executable, _) = plan_with(&root, options(4));
    assert_eq!(executable.plan.fragments.len(), 2);

    let source = &executable.plan.fragments[0];
    assert_eq!(source.width, 4);
    assert_eq!(
        source.root.op_names(),
        vec![
            "table_scan",
            "partial_limit",
            "local_partition",
            "final_limit",
            "partitioned_output"
        ]
    );
    assert_eq!(source.scans.len(), 1);

    let top = executable.plan.output_fragment();
    assert_eq!(top.width, 1);
    assert_eq!(top.root.op_names(), vec!["exchange", "final_limit"]);
    assert_eq!(top.input_stages.len(), 1);
    assert_eq!(top.input_stages[0].task_prefix, source.task_prefix);
}

#[test]
fn order_by_with_limit_uses_top_n_and_merge_exchange() {
    // SELECT n_name FROM nation ORDER BY n_name DESC LIMIT 10.
    let mut b = PlanBuilder::new();
    let project = select_n_name(&mut b);
    let sorted = b.sort(
        project,
        vec![SortKey {
            expr: col("n_name", DataType::Utf8),
            order: SortOrder::DESC_NULLS_LAST,
        }],
    );
    let root = b.limit(sorted, 0, 10);

    let (executable, _) = plan_with(&root, options(4));
    assert_eq!(executable.plan.fragments.len(), 2);

    let source = &executable.plan.fragments[0];
    assert_eq!(
        source.root.op_names(),
        vec!["table_scan", "top_n", "local_merge", "partitioned_output"]
    );
    let top_n = source.root.find("top_n").expect("top-n present");
    match &top_n.op {
        quarry::PhysicalOp::TopN { count, orders, .. } => {
            assert_eq!(*count, 10);
            assert!(!orders[0].ascending);
        }
        other => panic!("expected top-n, found {other:?}"),
    }

    let top = executable.plan.output_fragment();
    assert_eq!(top.width, 1);
    assert_eq!(
        top.root.op_names(),
        vec!["merge_exchange", "final_limit", "project"]
    );
}

#[test]
fn offset_only_limit_saturates() {
    // OFFSET 5 with no limit.
    let mut b = PlanBuilder::new();
    let project = select_n_name(&mut b);
    let root = b.limit(project, 5, i64::MAX);

    let (executable, _) = plan_with(&root, options(4));
    let source = &executable.plan.fragments[0];
    let partial = source.root.find("partial_limit").expect("partial limit");
    match &partial.op {
        quarry::PhysicalOp::PartialLimit { offset, limit } => {
            assert_eq!(*offset, 0);
            assert_eq!(*limit, i64::MAX, "offset+limit saturates at i64::MAX");
        }
        other => panic!("expected partial limit, found {other:?}"),
    }
    let top = executable.plan.output_fragment();
    let final_limit = top.root.find("final_limit").expect("final limit");
    match &final_limit.op {
        quarry::PhysicalOp::FinalLimit { offset, limit } => {
            assert_eq!(*offset, 5);
            assert_eq!(*limit, i64::MAX);
        }
        other => panic!("expected final limit, found {other:?}"),
    }
}

#[test]
fn duplicate_grouping_exprs_collapse() {
    // count(1), count(1) GROUP BY a+b, a+b.
    let mut b = PlanBuilder::new();
    let scan = b.scan("nation", nation_schema());
    let key = LogicalExpr::call(
        "plus",
        DataType::Int64,
        vec![
            col("n_nationkey", DataType::Int64),
            col("n_regionkey", DataType::Int64),
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
    let root = b.aggregate(
        scan,
        vec!["k1".into(), "k2".into()],
        vec![key.clone(), key],
        vec!["c1".into(), "c2".into()],
        vec![count.clone(), count],
    );

    let (executable, _) = plan_with(&root, options(4));
    let top = executable.plan.output_fragment();

    // The aggregation runs over one key and one aggregate; the final
    // projection re-expands to the four requested columns, and the grouping
    // expression is evaluated once in a projection below the aggregation.
    let source = &executable.plan.fragments[0];
    let agg = source
        .root
        .find("partial_aggregation")
        .expect("partial aggregation in source fragment");
    match &agg.op {
        quarry::PhysicalOp::Aggregation { keys, aggregates, .. } => {
            assert_eq!(keys.len(), 1);
            assert_eq!(aggregates.len(), 1);
        }
        other => panic!("expected aggregation, found {other:?}"),
    }
    assert!(
        agg.inputs[0].op.name() == "project",
        "grouping expression evaluated once below the aggregation"
    );

    let project = top.root.find("project").expect("re-expanding projection");
    match &project.op {
        quarry::PhysicalOp::Project { names, exprs } => {
            assert_eq!(names.len(), 4);
            assert_eq!(exprs[0], exprs[1], "k1 and k2 share one column");
            assert_eq!(exprs[2], exprs[3], "c1 and c2 share one column");
        }
        other => panic!("expected project, found {other:?}"),
    }
}

#[test]
fn duplicate_filtered_aggregates_collapse() {
    // sum(p) FILTER (k>0) AS s1, sum(p) FILTER (k<0) AS s2,
    // sum(p) FILTER (k>0) AS s3 -> two aggregates; s3 maps to s1.
    let mut b = PlanBuilder::new();
    let scan = b.scan("orders", orders_schema());
    let positive = LogicalExpr::call(
        "gt",
        DataType::Boolean,
        vec![
            col("o_custkey", DataType::Int64),
            LogicalExpr::constant(quarry::Literal::Int64(0)),
        ],
    );
    let negative = LogicalExpr::call(
        "lt",
        DataType::Boolean,
        vec![
            col("o_custkey", DataType::Int64),
            LogicalExpr::constant(quarry::Literal::Int64(0)),
        ],
    );
    let sum = |filter: LogicalExpr| AggregateCall {
        function: "sum".into(),
        args: vec![col("o_totalprice", DataType::Float64)],
        filter: Some(filter),
        ordering: vec![],
        distinct: false,
        data_type: DataType::Float64,
    };
    let root = b.aggregate(
        scan,
        vec![],
        vec![],
        vec!["s1".into(), "s2".into(), "s3".into()],
        vec![sum(positive.clone()), sum(negative), sum(positive)],
    );

    let (executable, _) = plan_with(&root, options(4));
    let source = &executable.plan.fragments[0];
    let agg = source
        .root
        .find("partial_aggregation")
        .expect("partial aggregation");
    match &agg.op {
        quarry::PhysicalOp::Aggregation { aggregates, .. } => {
            assert_eq!(aggregates.len(), 2, "identical masks computed once");
        }
        other => panic!("expected aggregation, found {other:?}"),
    }

    let top = executable.plan.output_fragment();
    let project = top.root.find("project").expect("re-expanding projection");
    match &project.op {
        quarry::PhysicalOp::Project { names, exprs } => {
            assert_eq!(names, &["s1", "s2", "s3"]);
            assert_eq!(exprs[0], exprs[2], "s3 reuses s1's aggregate");
            assert_ne!(exprs[0], exprs[1]);
        }
        other => panic!("expected project, found {other:?}"),
    }
}

#[test]
fn lookup_prefix_layout_becomes_index_join() {
    // orders join customer on o_custkey = c_custkey; customer has a lookup
    // layout keyed on c_custkey.
    let mut b = PlanBuilder::new();
    let orders = b.scan("orders", orders_schema());
    let filtered = b.filter(
        orders,
        LogicalExpr::eq(
            col("o_orderkey", DataType::Int64),
            LogicalExpr::constant(quarry::Literal::Int64(42)),
        ),
    );
    let customer = b.scan("customer", customer_schema());
    let cond = LogicalExpr::eq(
        col("o_custkey", DataType::Int64),
        col("c_custkey", DataType::Int64),
    );
    let join = b.join(JoinType::Inner, filtered, customer, Some(cond));
    let root = b.project(
        join,
        vec!["o_orderkey".into(), "c_name".into()],
        vec![
            col("o_orderkey", DataType::Int64),
            col("c_name", DataType::Utf8),
        ],
    );

    let (executable, _) = plan_with(&root, options(4));
    let names: Vec<&str> = executable
        .plan
        .fragments
        .iter()
        .flat_map(|f| f.root.op_names())
        .collect();
    assert!(
        names.contains(&"index_lookup"),
        "index path chosen, got {names:?}"
    );
    assert!(
        !names.contains(&"hash_join"),
        "no hash build on the index path, got {names:?}"
    );
}

#[test]
fn single_node_plans_have_one_fragment() {
    let mut b = PlanBuilder::new();
    let project = select_n_name(&mut b);
    let root = b.limit(project, 0, 10);

    let (executable, _) = plan_with(&root, options(1));
    assert_eq!(executable.plan.fragments.len(), 1);
    let top = executable.plan.output_fragment();
    assert_eq!(top.root.op_names(), vec!["table_scan", "final_limit"]);
}

#[test]
fn values_queries_emit_a_values_leaf() {
    let mut b = PlanBuilder::new();
    let root = b.values(
        region_schema(),
        vec![vec![
            quarry::Literal::Int64(1),
            quarry::Literal::String("europe".into()),
        ]],
    );
    let (executable, out_cardinality) = plan_with(&root, options(4));
    let names: Vec<&str> = executable
        .plan
        .fragments
        .iter()
        .flat_map(|f| f.root.op_names())
        .collect();
    assert!(names.contains(&"values"), "got {names:?}");
    assert_eq!(out_cardinality, 1.0);
}

#[test]
fn predictions_cover_scans_and_carry_history_keys() {
    let mut b = PlanBuilder::new();
    let project = select_n_name(&mut b);
    let root = b.limit(project, 0, 10);

    let (executable, _) = plan_with(&root, options(4));
    let source = &executable.plan.fragments[0];
    let scan_id = &source.scans[0];
    let prediction = executable
        .predictions
        .get(scan_id)
        .expect("scan has a prediction");
    assert_eq!(prediction.fanout, 25.0, "nation scan cardinality");
    assert!(executable
        .history_keys
        .get(scan_id)
        .is_some_and(|k| k.starts_with("scan:nation:")));
}
