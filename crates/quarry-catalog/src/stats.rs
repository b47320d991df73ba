//! Column statistics. All fields optional; absent means unknown.

use serde::{Deserialize, Serialize};

use quarry_core::types::Literal;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    /// Count of non-null values the stats were computed over.
    pub num_values: u64,

    /// Observed fraction of nulls in [0, 1]. 0 does not prove none exist.
    pub null_fraction: f64,

    /// Estimated number of distinct values. Not kept for complex types.
    pub num_distinct: Option<u64>,

    /// Min/max for comparable scalar columns.
    pub min: Option<Literal>,
    pub max: Option<Literal>,

    /// Average bytes per value; overrides the type-based estimate.
    pub avg_byte_width: Option<f64>,

    /// For complex columns: child stats. Arrays have one entry ("element"),
    /// maps have "key"/"value", structs one entry per member, flat maps may
    /// have one entry per key.
    pub children: Vec<(String, ColumnStatistics)>,
}

impl ColumnStatistics {
    pub fn with_distinct(num_distinct: u64) -> Self {
        Self {
            num_distinct: Some(num_distinct),
            ..Default::default()
        }
    }

    /// Distinct-value estimate with a fallback when no stats were recorded.
    pub fn approx_num_distinct(&self, default_value: u64) -> u64 {
        self.num_distinct.unwrap_or(default_value)
    }

    pub fn child(&self, name: &str) -> Option<&ColumnStatistics> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_distinct_falls_back() {
        let stats = ColumnStatistics::default();
        assert_eq!(stats.approx_num_distinct(1000), 1000);
        let stats = ColumnStatistics::with_distinct(25);
        assert_eq!(stats.approx_num_distinct(1000), 25);
    }
}
