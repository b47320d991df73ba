use criterion::{criterion_group, criterion_main, Criterion};

use quarry::logical::JoinType;
use quarry::{
    DataType, Field, FileHistory, LogicalExpr, LogicalPlan, Optimization, OptimizerOptions,
    PlanBuilder, Schema, TableBuilder, TestCatalog,
};

fn star_catalog() -> TestCatalog {
    let mut catalog = TestCatalog::new().with_table(
        TableBuilder::new("fact")
            .column("f_id", DataType::Int64)
            .column("f_d1", DataType::Int64)
            .column("f_d2", DataType::Int64)
            .column("f_d3", DataType::Int64)
            .column("f_d4", DataType::Int64)
            .column("f_value", DataType::Float64)
            .distinct("f_id", 6_000_000)
            .distinct("f_d1", 100_000)
            .distinct("f_d2", 10_000)
            .distinct("f_d3", 1_000)
            .distinct("f_d4", 100)
            .row_count(6_000_000),
    );
    for (i, rows) in [(1u32, 100_000u64), (2, 10_000), (3, 1_000), (4, 100)] {
        let table = TableBuilder::new(&format!("dim{i}"))
            .column(&format!("d{i}_key"), DataType::Int64)
            .column(&format!("d{i}_name"), DataType::Utf8)
            .distinct(&format!("d{i}_key"), rows)
            .row_count(rows);
        catalog = catalog.with_table(table);
    }
    catalog
}

fn star_query() -> LogicalPlan {
    let mut b = PlanBuilder::new();
    let mut plan = b.scan(
        "fact",
        Schema::new(vec![
            Field::new("f_id", DataType::Int64, false),
            Field::new("f_d1", DataType::Int64, false),
            Field::new("f_d2", DataType::Int64, false),
            Field::new("f_d3", DataType::Int64, false),
            Field::new("f_d4", DataType::Int64, false),
            Field::new("f_value", DataType::Float64, false),
        ]),
    );
    for i in 1..=4u32 {
        let dim = b.scan(
            format!("dim{i}"),
            Schema::new(vec![
                Field::new(format!("d{i}_key"), DataType::Int64, false),
                Field::new(format!("d{i}_name"), DataType::Utf8, false),
            ]),
        );
        let cond = LogicalExpr::eq(
            LogicalExpr::column(format!("f_d{i}"), DataType::Int64),
            LogicalExpr::column(format!("d{i}_key"), DataType::Int64),
        );
        plan = b.join(JoinType::Inner, plan, dim, Some(cond));
    }
    b.project(
        plan,
        vec!["f_id".into(), "d1_name".into(), "d4_name".into()],
        vec![
            LogicalExpr::column("f_id", DataType::Int64),
            LogicalExpr::column("d1_name", DataType::Utf8),
            LogicalExpr::column("d4_name", DataType::Utf8),
        ],
    )
}

fn bench_star_join(c: &mut Criterion) {
    let catalog = star_catalog();
    let history = FileHistory::new();
    let plan = star_query();

    c.bench_function("optimize_star_join", |b| {
        b.iter(|| {
            let mut optimization =
                Optimization::new(&plan, &catalog, &history, OptimizerOptions::default())
                    .expect("optimization builds");
            let best = optimization.best_plan().expect("plan found");
            let executable = optimization
                .to_executable_plan(&best)
                .expect("emission succeeds");
            assert!(!executable.plan.fragments.is_empty());
        })
    });
}

criterion_group!(optimizer, bench_star_join);
criterion_main!(optimizer);
