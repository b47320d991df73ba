//! Optimizer-level invariants: output coverage, key arity, fragment DAG
//! ordering, budget and cancellation behavior, fingerprint stability.

mod support;

use std::sync::atomic::Ordering;

use quarry::logical::JoinType;
use quarry::{
    DataType, Error, FileHistory, LogicalExpr, Optimization, OptimizerOptions, PlanBuilder,
};

use support::*;

fn join_query() -> quarry::LogicalPlan {
    let mut b = PlanBuilder::new();
    let nation = b.scan("nation", nation_schema());
    let region = b.scan("region", region_schema());
    let cond = LogicalExpr::eq(
        col("n_regionkey", DataType::Int64),
        col("r_regionkey", DataType::Int64),
    );
    let join = b.join(JoinType::Inner, nation, region, Some(cond));
    b.project(
        join,
        vec!["n_name".into(), "r_name".into()],
        vec![
            col("n_name", DataType::Utf8),
            col("r_name", DataType::Utf8),
        ],
    )
}

fn three_way_join() -> quarry::LogicalPlan {
    let mut b = PlanBuilder::new();
    let customer = b.scan("customer", customer_schema());
    let nation = b.scan("nation", nation_schema());
    let cn = b.join(
        JoinType::Inner,
        customer,
        nation,
        Some(LogicalExpr::eq(
            col("c_nationkey", DataType::Int64),
            col("n_nationkey", DataType::Int64),
        )),
    );
    let orders = b.scan("orders", orders_schema());
    let join = b.join(
        JoinType::Inner,
        orders,
        cn,
        Some(LogicalExpr::eq(
            col("o_custkey", DataType::Int64),
            col("c_custkey", DataType::Int64),
        )),
    );
    b.project(
        join,
        vec!["o_orderkey".into(), "n_name".into()],
        vec![
            col("o_orderkey", DataType::Int64),
            col("n_name", DataType::Utf8),
        ],
    )
}

#[test]
fn emitted_joins_have_matching_key_arity() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let plan = three_way_join();
    let mut optimization =
        Optimization::new(&plan, &catalog, &history, OptimizerOptions::default()).unwrap();
    let best = optimization.best_plan().unwrap();
    let executable = optimization.to_executable_plan(&best).unwrap();

    fn check(node: &quarry::PhysicalNode) {
        if let quarry::PhysicalOp::HashJoin {
            left_keys,
            right_keys,
            ..
        } = &node.op
        {
            assert_eq!(left_keys.len(), right_keys.len());
            assert!(!left_keys.is_empty());
        }
        for input in &node.inputs {
            check(input);
        }
    }
    for fragment in &executable.plan.fragments {
        check(&fragment.root);
    }
}

#[test]
fn fragments_reference_earlier_stages_only() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let plan = three_way_join();
    let mut optimization =
        Optimization::new(&plan, &catalog, &history, OptimizerOptions::default()).unwrap();
    let best = optimization.best_plan().unwrap();
    let executable = optimization.to_executable_plan(&best).unwrap();

    let mut seen = Vec::new();
    for fragment in &executable.plan.fragments {
        for stage in &fragment.input_stages {
            assert!(
                seen.contains(&stage.task_prefix),
                "fragment {} references later stage {}",
                fragment.task_prefix,
                stage.task_prefix
            );
        }
        seen.push(fragment.task_prefix.clone());
    }
    // The last fragment is the query output.
    assert_eq!(
        executable.plan.output_fragment().task_prefix,
        seen.last().cloned().unwrap()
    );
}

#[test]
fn best_plan_covers_requested_columns() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let plan = join_query();
    let mut optimization =
        Optimization::new(&plan, &catalog, &history, OptimizerOptions::default()).unwrap();
    let best = optimization.best_plan().unwrap();

    // Every column the query projects is produced by the plan.
    let executable = optimization.to_executable_plan(&best).unwrap();
    let output = &executable.plan.output_fragment().root.output;
    assert_eq!(output, &["n_name".to_string(), "r_name".to_string()]);
}

#[test]
fn search_budget_returns_over_budget_when_too_small() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let plan = three_way_join();
    let opts = OptimizerOptions {
        search_node_budget: 2,
        ..OptimizerOptions::default()
    };
    let mut optimization = Optimization::new(&plan, &catalog, &history, opts).unwrap();
    match optimization.best_plan() {
        Err(Error::OverBudget(_)) => {}
        other => panic!("expected OverBudget, got {other:?}"),
    }
}

#[test]
fn generous_budget_still_finds_a_plan() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let plan = three_way_join();
    let opts = OptimizerOptions {
        search_node_budget: 100_000,
        ..OptimizerOptions::default()
    };
    let mut optimization = Optimization::new(&plan, &catalog, &history, opts).unwrap();
    assert!(optimization.best_plan().is_ok());
}

#[test]
fn cancellation_aborts_the_search() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let plan = three_way_join();
    let mut optimization =
        Optimization::new(&plan, &catalog, &history, OptimizerOptions::default()).unwrap();
    optimization.cancellation_flag().store(true, Ordering::SeqCst);
    match optimization.best_plan() {
        Err(Error::OverBudget(reason)) => assert!(reason.contains("cancelled")),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn history_keys_are_stable_across_optimizations() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let plan = join_query();

    let run = || {
        let mut optimization =
            Optimization::new(&plan, &catalog, &history, OptimizerOptions::default()).unwrap();
        let best = optimization.best_plan().unwrap();
        optimization.to_executable_plan(&best).unwrap()
    };
    let first = run();
    let second = run();

    let keys = |plan: &quarry::PlanAndStats| {
        let mut keys: Vec<String> = plan.history_keys.values().cloned().collect();
        keys.sort();
        keys
    };
    assert_eq!(keys(&first), keys(&second));
    assert!(!first.history_keys.is_empty());
}

#[test]
fn empty_set_operation_is_invalid_input() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let mut b = PlanBuilder::new();
    let root = b.set(quarry::logical::SetOperation::UnionAll, vec![]);
    match Optimization::new(&root, &catalog, &history, OptimizerOptions::default()) {
        Err(Error::InvalidInput(_)) => {}
        other => panic!("expected InvalidInput, got {:?}", other.err()),
    }
}

#[test]
fn unknown_table_is_a_catalog_error() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let mut b = PlanBuilder::new();
    let root = b.scan("no_such_table", nation_schema());
    match Optimization::new(&root, &catalog, &history, OptimizerOptions::default()) {
        Err(Error::Catalog(_)) => {}
        other => panic!("expected Catalog error, got {:?}", other.err()),
    }
}

#[test]
fn union_all_collects_remote_inputs_into_one_exchange() {
    let catalog = tpch_catalog();
    let history = FileHistory::new();
    let mut b = PlanBuilder::new();
    let left = {
        let scan = b.scan("nation", nation_schema());
        b.project(
            scan,
            vec!["name".into()],
            vec![col("n_name", DataType::Utf8)],
        )
    };
    let right = {
        let scan = b.scan("region", region_schema());
        b.project(
            scan,
            vec!["name".into()],
            vec![col("r_name", DataType::Utf8)],
        )
    };
    let root = b.set(quarry::logical::SetOperation::UnionAll, vec![left, right]);

    let mut optimization =
        Optimization::new(&root, &catalog, &history, OptimizerOptions::default()).unwrap();
    let best = optimization.best_plan().unwrap();
    let executable = optimization.to_executable_plan(&best).unwrap();

    let union_fragment = executable
        .plan
        .fragments
        .iter()
        .find(|f| f.root.find("union_all").is_some())
        .expect("a fragment contains the union");
    let union = union_fragment.root.find("union_all").unwrap();
    assert!(!union.inputs.is_empty());
}
