//! The cost model.
//!
//! The base unit is the time to memcpy one cache line within a large memcpy
//! on one core (~10ns at ~6GB/s); every constant below is a multiple of it.
//! Leaf nodes report their cardinality as `fanout` and their total cost as
//! `unit_cost`; interior nodes report per-input-row cost and an
//! output/input cardinality ratio.

use quarry_core::bitset::IdSet;
use quarry_core::id::{ColumnId, ExprId};
use quarry_core::types::DataType;

use crate::arena::QueryArena;
use crate::expr::{ExprKind, FunctionRegistry};
use crate::relation::Cost;

/// Per-byte cost of moving data across the network (~500MB/s).
pub const BYTE_SHUFFLE: f64 = 12.0;
/// Find, decode and compare one key in a probe (~30 instructions).
pub const KEY_COMPARE: f64 = 6.0;
/// Direct-addressed probe (~10 instructions).
pub const ARRAY_PROBE: f64 = 2.0;
/// Hash probe staying in cache (~50 instructions).
pub const SMALL_HASH: f64 = 10.0;
/// Hash probe at ~2 LLC misses.
pub const LARGE_HASH: f64 = 40.0;
/// Per-row-per-column copy.
pub const COLUMN_ROW: f64 = 5.0;
/// Per-byte-above-8 copy.
pub const COLUMN_BYTE: f64 = 0.1;
/// Hash one column of input.
pub const HASH_COLUMN: f64 = 0.5;
/// Extract one column from a hash table.
pub const HASH_EXTRACT: f64 = 0.5;
/// Minimal cost of one filter expression.
pub const MIN_FILTER: f64 = 2.0;

/// Rows looked up per index batch.
pub const LOOKUP_BATCH: f64 = 10_000.0;

pub fn hash_probe_cost(cardinality: f64) -> f64 {
    if cardinality < 10_000.0 {
        ARRAY_PROBE
    } else if cardinality < 500_000.0 {
        SMALL_HASH
    } else {
        LARGE_HASH
    }
}

/// Cost of one key lookup over a sorted/index run of `range` rows.
/// The +2 keeps a same-row hit from costing zero (log(1) == 0).
pub fn lookup_cost(range: f64) -> f64 {
    KEY_COMPARE * ((range + 2.0).ln() / 2f64.ln())
}

fn leaf_row_cost(arena: &QueryArena, columns: &[ColumnId]) -> f64 {
    let num_columns = columns.len() as f64;
    let bytes = arena.byte_size(columns);
    num_columns * COLUMN_ROW + (bytes - 8.0 * num_columns).max(0.0) * COLUMN_BYTE
}

/// Full scan / values leaf. `cardinality` is the post-filter estimate.
pub fn leaf_cost(arena: &QueryArena, columns: &[ColumnId], cardinality: f64) -> Cost {
    Cost {
        input_cardinality: 0.0,
        fanout: cardinality,
        unit_cost: cardinality * leaf_row_cost(arena, columns),
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: 0.0,
    }
}

/// Batched index lookup. `order_selectivity` > 1 when the probe arrives in
/// an order matching a prefix of the index order, shrinking the per-key
/// search distance.
pub fn index_lookup_cost(
    layout_cardinality: f64,
    order_selectivity: f64,
    input_cardinality: f64,
    fanout: f64,
) -> Cost {
    let range = layout_cardinality.max(1.0);
    let batch = input_cardinality.min(LOOKUP_BATCH).max(1.0);
    let per_key_range = if order_selectivity <= 1.0 {
        range / batch
    } else {
        range / order_selectivity.max(1.0)
    };
    let batch_cost = lookup_cost(range) + lookup_cost(per_key_range) * batch.max(1.0);
    Cost {
        input_cardinality,
        fanout,
        unit_cost: batch_cost / batch,
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: 0.0,
    }
}

/// Until calibrated from sampling or history, each conjunct keeps
/// `default_fanout` of its input; the weak default lets better-known scan
/// and join selectivities dominate plan cardinality.
pub fn filter_cost(num_exprs: usize, default_fanout: f64, input_cardinality: f64) -> Cost {
    Cost {
        input_cardinality,
        fanout: default_fanout.powi(num_exprs as i32),
        unit_cost: MIN_FILTER * num_exprs as f64,
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: 0.0,
    }
}

pub fn project_cost(
    arena: &QueryArena,
    registry: &FunctionRegistry,
    exprs: &[ExprId],
    input_cardinality: f64,
) -> Cost {
    let unit: f64 = exprs
        .iter()
        .filter(|e| !matches!(arena.expr(**e).kind, ExprKind::Column(_)))
        .map(|e| cost_with_children(arena, registry, *e, &IdSet::new()))
        .sum();
    Cost {
        input_cardinality,
        fanout: 1.0,
        unit_cost: unit,
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: 0.0,
    }
}

/// Output cardinality of a group-by: `d − d·(1−1/d)^N` where `d` is the
/// product of per-key distinct counts. Approaches `d` as `N` grows; with
/// zero keys the output is one row.
pub fn aggregation_output_cardinality(
    arena: &QueryArena,
    group_by: &[ExprId],
    input_cardinality: f64,
) -> f64 {
    if group_by.is_empty() {
        return 1.0;
    }
    let d = arena.keys_cardinality(group_by, 1e12);
    let n = input_cardinality.max(0.0);
    d - d * (1.0 - 1.0 / d).powf(n)
}

pub fn aggregation_cost(
    arena: &QueryArena,
    group_by: &[ExprId],
    aggregates: &[ExprId],
    input_cardinality: f64,
) -> Cost {
    let n_out = aggregation_output_cardinality(arena, group_by, input_cardinality);
    let fanout = if input_cardinality > 0.0 {
        n_out / input_cardinality
    } else {
        1.0
    };
    let row_bytes = arena.exprs_byte_size(group_by) + arena.exprs_byte_size(aggregates);
    Cost {
        input_cardinality,
        fanout,
        unit_cost: group_by.len() as f64 * hash_probe_cost(n_out),
        setup_cost: 0.0,
        total_bytes: n_out * row_bytes,
        transfer_bytes: 0.0,
    }
}

pub fn repartition_cost(arena: &QueryArena, columns: &[ColumnId], input_cardinality: f64) -> Cost {
    let size = arena.byte_size(columns);
    Cost {
        input_cardinality,
        fanout: 1.0,
        unit_cost: size,
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: input_cardinality * size * BYTE_SHUFFLE,
    }
}

pub fn hash_build_cost(
    arena: &QueryArena,
    keys: &[ExprId],
    input_columns: &[ColumnId],
    input_cardinality: f64,
) -> Cost {
    Cost {
        input_cardinality,
        fanout: 1.0,
        unit_cost: keys.len() as f64 * HASH_COLUMN
            + hash_probe_cost(input_cardinality)
            + input_columns.len() as f64 * HASH_EXTRACT * 2.0,
        setup_cost: 0.0,
        total_bytes: input_cardinality * arena.byte_size(input_columns),
        transfer_bytes: 0.0,
    }
}

pub fn join_probe_cost(
    build_cardinality: f64,
    build_column_count: usize,
    left_key_count: usize,
    fanout: f64,
    input_cardinality: f64,
) -> Cost {
    let row_cost = build_column_count as f64 * HASH_EXTRACT;
    Cost {
        input_cardinality,
        fanout,
        unit_cost: hash_probe_cost(build_cardinality)
            + fanout * row_cost
            + left_key_count as f64 * HASH_COLUMN,
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: 0.0,
    }
}

/// Hits on the right side per probe row: right cardinality over the
/// distinct-count of the right keys.
pub fn join_fanout(arena: &QueryArena, right_cardinality: f64, right_keys: &[ExprId]) -> f64 {
    let distinct = arena.keys_cardinality(right_keys, right_cardinality);
    (right_cardinality / distinct.max(1.0)).max(1e-6)
}

pub fn limit_cost(limit: i64, input_cardinality: f64) -> Cost {
    let fanout = if input_cardinality <= limit as f64 || input_cardinality <= 0.0 {
        1.0
    } else {
        limit as f64 / input_cardinality
    };
    Cost {
        input_cardinality,
        fanout,
        unit_cost: 0.01,
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: 0.0,
    }
}

pub fn order_by_cost(arena: &QueryArena, columns: &[ColumnId], input_cardinality: f64) -> Cost {
    // One sorted-run insertion per row.
    Cost {
        input_cardinality,
        fanout: 1.0,
        unit_cost: lookup_cost(input_cardinality),
        setup_cost: 0.0,
        total_bytes: input_cardinality * arena.byte_size(columns),
        transfer_bytes: 0.0,
    }
}

pub fn union_all_cost(input_cardinality_sum: f64) -> Cost {
    Cost {
        input_cardinality: input_cardinality_sum,
        fanout: 1.0,
        unit_cost: 0.0,
        setup_cost: 0.0,
        total_bytes: 0.0,
        transfer_bytes: 0.0,
    }
}

/// Cost of evaluating one expression node, not counting children.
pub fn self_cost(arena: &QueryArena, registry: &FunctionRegistry, expr: ExprId) -> f64 {
    match &arena.expr(expr).kind {
        ExprKind::Column(_) => {
            let kind = &arena.expr(expr).value.data_type;
            if matches!(kind, DataType::Array(_) | DataType::Map(_, _)) {
                200.0
            } else {
                10.0
            }
        }
        ExprKind::Call { name, args } => {
            let name = arena.name_str(*name);
            match registry.metadata(name) {
                Some(md) => match md.cost_func {
                    Some(f) => f(args.len()),
                    None => md.cost,
                },
                None => 5.0,
            }
        }
        _ => 5.0,
    }
}

/// Expression cost including children, skipping anything in `not_counting`
/// (already-computed columns, shared subexpressions).
pub fn cost_with_children(
    arena: &QueryArena,
    registry: &FunctionRegistry,
    expr: ExprId,
    not_counting: &IdSet,
) -> f64 {
    if not_counting.contains(expr) {
        return 0.0;
    }
    match &arena.expr(expr).kind {
        ExprKind::Column(_) => self_cost(arena, registry, expr),
        ExprKind::Call { args, .. } => {
            let mut cost = self_cost(arena, registry, expr);
            for arg in args.clone() {
                cost += cost_with_children(arena, registry, arg, not_counting);
            }
            cost
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::types::Literal;

    #[test]
    fn probe_cost_tiers() {
        assert_eq!(hash_probe_cost(100.0), ARRAY_PROBE);
        assert_eq!(hash_probe_cost(100_000.0), SMALL_HASH);
        assert_eq!(hash_probe_cost(1_000_000.0), LARGE_HASH);
    }

    #[test]
    fn zero_key_aggregation_collapses_to_one_row() {
        let arena = QueryArena::new();
        let card = aggregation_output_cardinality(&arena, &[], 1000.0);
        assert_eq!(card, 1.0);
        let cost = aggregation_cost(&arena, &[], &[], 1000.0);
        assert!((cost.fanout - 0.001).abs() < 1e-12);
    }

    #[test]
    fn aggregation_saturates_at_key_domain() {
        let mut arena = QueryArena::new();
        // A key with 10 distinct values.
        let lit = arena.literal_expr(Literal::Int64(1));
        let key = arena.call_expr("mod10", DataType::Int64, vec![lit]);
        // Force the cardinality estimate.
        // (Call cardinality defaults to max of args = 1; emulate via keys_cardinality cap.)
        let d = arena.keys_cardinality(&[key], 10.0);
        assert!(d <= 10.0);
        let out = aggregation_output_cardinality(&arena, &[key], 1e9);
        assert!(out <= 1.0 + 1e-6, "degenerate key estimate stays small: {out}");
    }

    #[test]
    fn limit_fanout() {
        assert_eq!(limit_cost(10, 5.0).fanout, 1.0);
        assert!((limit_cost(10, 1000.0).fanout - 0.01).abs() < 1e-12);
    }

    #[test]
    fn lookup_cost_is_positive_for_tiny_ranges() {
        assert!(lookup_cost(1.0) > 0.0);
        assert!(lookup_cost(1_000_000.0) > lookup_cost(1_000.0));
    }
}
