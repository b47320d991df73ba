//! Shared fixtures: a TPC-H-flavored catalog and plan builders.
#![allow(dead_code)]

use quarry::{
    DataType, Field, LogicalExpr, LogicalPlan, PlanBuilder, Schema, TableBuilder, TestCatalog,
};

pub fn nation_schema() -> Schema {
    Schema::new(vec![
        Field::new("n_nationkey", DataType::Int64, false),
        Field::new("n_name", DataType::Utf8, false),
        Field::new("n_regionkey", DataType::Int64, false),
    ])
}

pub fn region_schema() -> Schema {
    Schema::new(vec![
        Field::new("r_regionkey", DataType::Int64, false),
        Field::new("r_name", DataType::Utf8, false),
    ])
}

pub fn orders_schema() -> Schema {
    Schema::new(vec![
        Field::new("o_orderkey", DataType::Int64, false),
        Field::new("o_custkey", DataType::Int64, false),
        Field::new("o_totalprice", DataType::Float64, false),
    ])
}

pub fn customer_schema() -> Schema {
    Schema::new(vec![
        Field::new("c_custkey", DataType::Int64, false),
        Field::new("c_name", DataType::Utf8, false),
        Field::new("c_nationkey", DataType::Int64, false),
    ])
}

pub fn tpch_catalog() -> TestCatalog {
    TestCatalog::new()
        .with_table(
            TableBuilder::new("nation")
                .column("n_nationkey", DataType::Int64)
                .column("n_name", DataType::Utf8)
                .column("n_regionkey", DataType::Int64)
                .distinct("n_nationkey", 25)
                .distinct("n_name", 25)
                .distinct("n_regionkey", 5)
                .row_count(25),
        )
        .with_table(
            TableBuilder::new("region")
                .column("r_regionkey", DataType::Int64)
                .column("r_name", DataType::Utf8)
                .distinct("r_regionkey", 5)
                .row_count(5),
        )
        .with_table(
            TableBuilder::new("orders")
                .column("o_orderkey", DataType::Int64)
                .column("o_custkey", DataType::Int64)
                .column("o_totalprice", DataType::Float64)
                .distinct("o_orderkey", 1_500_000)
                .distinct("o_custkey", 100_000)
                .row_count(1_500_000),
        )
        .with_table(
            TableBuilder::new("customer")
                .column("c_custkey", DataType::Int64)
                .column("c_name", DataType::Utf8)
                .column("c_nationkey", DataType::Int64)
                .distinct("c_custkey", 150_000)
                .distinct("c_nationkey", 25)
                .row_count(150_000)
                .lookup_index("customer_pk", &["c_custkey"]),
        )
}

/// `SELECT n_name FROM nation` with optional trailing pieces added by the
/// caller through the returned builder.
pub fn select_n_name(b: &mut PlanBuilder) -> LogicalPlan {
    let scan = b.scan("nation", nation_schema());
    b.project(
        scan,
        vec!["n_name".into()],
        vec![LogicalExpr::column("n_name", DataType::Utf8)],
    )
}

pub fn col(name: &str, data_type: DataType) -> LogicalExpr {
    LogicalExpr::column(name, data_type)
}
