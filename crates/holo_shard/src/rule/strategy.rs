//! Sharding strategies: which column(s) feed which algorithm.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::algorithm::{
    ComplexShardingAlgorithm, ComplexShardingValue, HintShardingAlgorithm, HintShardingValue,
    PreciseShardingValue, RangeShardingValue, StandardShardingAlgorithm,
};
use crate::error::Result;
use crate::value::{ConditionValue, SqlValue};

/// How one dimension (database or table) of a logical table is sharded.
#[derive(Clone, Default)]
pub enum ShardingStrategy {
    Standard {
        column: String,
        algorithm: Arc<dyn StandardShardingAlgorithm>,
    },
    Complex {
        columns: Vec<String>,
        algorithm: Arc<dyn ComplexShardingAlgorithm>,
    },
    Hint {
        algorithm: Arc<dyn HintShardingAlgorithm>,
    },
    #[default]
    None,
}

impl fmt::Debug for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingStrategy::Standard { column, algorithm } => f
                .debug_struct("Standard")
                .field("column", column)
                .field("algorithm", &algorithm.kind())
                .finish(),
            ShardingStrategy::Complex { columns, algorithm } => f
                .debug_struct("Complex")
                .field("columns", columns)
                .field("algorithm", &algorithm.kind())
                .finish(),
            ShardingStrategy::Hint { algorithm } => f
                .debug_struct("Hint")
                .field("algorithm", &algorithm.kind())
                .finish(),
            ShardingStrategy::None => f.write_str("None"),
        }
    }
}

fn find_condition<'a>(
    values: &'a BTreeMap<String, ConditionValue>,
    column: &str,
) -> Option<&'a ConditionValue> {
    values
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(column))
        .map(|(_, value)| value)
}

/// Keeps `targets` that appear in `chosen`, in candidate order, without duplicates.
fn in_candidate_order(targets: &[String], chosen: &[String]) -> Vec<String> {
    targets
        .iter()
        .filter(|target| chosen.iter().any(|c| c.eq_ignore_ascii_case(target)))
        .cloned()
        .collect()
}

impl ShardingStrategy {
    pub fn is_none(&self) -> bool {
        matches!(self, ShardingStrategy::None)
    }

    pub fn is_hint(&self) -> bool {
        matches!(self, ShardingStrategy::Hint { .. })
    }

    /// Columns whose predicates feed this strategy.
    pub fn sharding_columns(&self) -> Vec<&str> {
        match self {
            ShardingStrategy::Standard { column, .. } => vec![column.as_str()],
            ShardingStrategy::Complex { columns, .. } => {
                columns.iter().map(String::as_str).collect()
            }
            ShardingStrategy::Hint { .. } | ShardingStrategy::None => Vec::new(),
        }
    }

    /// Returns `true` when predicates in `values` can narrow this strategy.
    pub fn is_conditioned(&self, values: &BTreeMap<String, ConditionValue>) -> bool {
        self.sharding_columns()
            .iter()
            .any(|column| find_condition(values, column).is_some())
    }

    /// Narrows `targets` to the names the strategy selects.
    ///
    /// A dimension without usable values keeps every candidate. The result
    /// preserves candidate order.
    pub fn do_sharding(
        &self,
        targets: &[String],
        logic_table: &str,
        values: &BTreeMap<String, ConditionValue>,
        hint_values: Option<&[SqlValue]>,
    ) -> Result<Vec<String>> {
        match self {
            ShardingStrategy::None => Ok(targets.to_vec()),
            ShardingStrategy::Standard { column, algorithm } => {
                match find_condition(values, column) {
                    None => Ok(targets.to_vec()),
                    Some(ConditionValue::Values(list)) => {
                        let mut chosen = Vec::with_capacity(list.len());
                        for value in list {
                            let precise = PreciseShardingValue {
                                logic_table,
                                column,
                                value,
                            };
                            if let Some(target) = algorithm.do_precise(targets, &precise)? {
                                chosen.push(target);
                            }
                        }
                        Ok(in_candidate_order(targets, &chosen))
                    }
                    Some(ConditionValue::Range(range)) => {
                        let range = RangeShardingValue {
                            logic_table,
                            column,
                            range,
                        };
                        let chosen = algorithm.do_range(targets, &range)?;
                        Ok(in_candidate_order(targets, &chosen))
                    }
                }
            }
            ShardingStrategy::Complex { columns, algorithm } => {
                let relevant: BTreeMap<String, ConditionValue> = columns
                    .iter()
                    .filter_map(|column| {
                        find_condition(values, column).map(|value| (column.clone(), value.clone()))
                    })
                    .collect();
                if relevant.is_empty() {
                    return Ok(targets.to_vec());
                }
                let chosen = algorithm.do_sharding(
                    targets,
                    &ComplexShardingValue {
                        logic_table,
                        values: &relevant,
                    },
                )?;
                Ok(in_candidate_order(targets, &chosen))
            }
            ShardingStrategy::Hint { algorithm } => match hint_values {
                None => Ok(targets.to_vec()),
                Some(hints) => {
                    let chosen = algorithm.do_sharding(
                        targets,
                        &HintShardingValue {
                            logic_table,
                            values: hints,
                        },
                    )?;
                    Ok(in_candidate_order(targets, &chosen))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::builtin::ModShardingAlgorithm;
    use crate::algorithm::AlgorithmProps;
    use crate::value::ValueRange;

    fn mod4() -> ShardingStrategy {
        ShardingStrategy::Standard {
            column: "order_id".to_string(),
            algorithm: Arc::new(
                ModShardingAlgorithm::new(&AlgorithmProps::new().with("sharding-count", "4"))
                    .expect("mod"),
            ),
        }
    }

    fn tables() -> Vec<String> {
        (0..4).map(|i| format!("t_order_{i}")).collect()
    }

    #[test]
    fn unconditioned_column_keeps_all_candidates() {
        let chosen = mod4()
            .do_sharding(&tables(), "t_order", &BTreeMap::new(), None)
            .expect("shard");
        assert_eq!(chosen, tables());
    }

    #[test]
    fn values_route_in_candidate_order_without_duplicates() {
        let mut values = BTreeMap::new();
        values.insert(
            "ORDER_ID".to_string(),
            ConditionValue::Values(vec![SqlValue::Int(7), SqlValue::Int(1), SqlValue::Int(5)]),
        );
        let chosen = mod4()
            .do_sharding(&tables(), "t_order", &values, None)
            .expect("shard");
        assert_eq!(chosen, vec!["t_order_1", "t_order_3"]);
    }

    #[test]
    fn range_delegates_to_algorithm() {
        let mut values = BTreeMap::new();
        values.insert(
            "order_id".to_string(),
            ConditionValue::Range(ValueRange::closed(SqlValue::Int(2), SqlValue::Int(3))),
        );
        let chosen = mod4()
            .do_sharding(&tables(), "t_order", &values, None)
            .expect("shard");
        assert_eq!(chosen, vec!["t_order_2", "t_order_3"]);
    }

    #[test]
    fn none_strategy_is_identity() {
        let chosen = ShardingStrategy::None
            .do_sharding(&tables(), "t_order", &BTreeMap::new(), None)
            .expect("shard");
        assert_eq!(chosen.len(), 4);
        assert!(ShardingStrategy::None.sharding_columns().is_empty());
    }
}
