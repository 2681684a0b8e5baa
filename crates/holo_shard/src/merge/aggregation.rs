//! Aggregation units combining per-shard aggregate values of one group.

use std::cmp::Ordering;

use crate::error::{Result, ShardingError};
use crate::rewrite::AggregationColumn;
use crate::sql::AggregateFunc;
use crate::value::SqlValue;

use super::order_by::resolve_key;

/// Aggregate column with its shard row positions resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedAggregation {
    pub index: usize,
    pub func: AggregateFunc,
    /// `(SUM, COUNT)` positions backing an `AVG`.
    pub avg_inputs: Option<(usize, usize)>,
}

impl ResolvedAggregation {
    pub fn resolve(column: &AggregationColumn, labels: &[String]) -> Result<Self> {
        let avg_inputs = match &column.avg_inputs {
            Some((sum, count)) => Some((resolve_key(sum, labels)?, resolve_key(count, labels)?)),
            None => None,
        };
        if column.func == AggregateFunc::Avg && avg_inputs.is_none() {
            return Err(ShardingError::Merge(
                "AVG column has no derived SUM and COUNT columns".to_string(),
            ));
        }
        Ok(Self {
            index: resolve_key(&column.key, labels)?,
            func: column.func,
            avg_inputs,
        })
    }
}

/// Running state of one aggregate over the rows of a group.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AggregationUnit {
    Count(Option<SqlValue>),
    Sum(Option<SqlValue>),
    Max(Option<SqlValue>),
    Min(Option<SqlValue>),
    Avg {
        sum: Option<SqlValue>,
        count: Option<SqlValue>,
    },
}

impl AggregationUnit {
    pub fn new(func: AggregateFunc) -> Self {
        match func {
            AggregateFunc::Count => AggregationUnit::Count(None),
            AggregateFunc::Sum => AggregationUnit::Sum(None),
            AggregateFunc::Max => AggregationUnit::Max(None),
            AggregateFunc::Min => AggregationUnit::Min(None),
            AggregateFunc::Avg => AggregationUnit::Avg {
                sum: None,
                count: None,
            },
        }
    }

    /// Folds one shard row into the unit.
    pub fn merge(&mut self, column: &ResolvedAggregation, row: &[SqlValue]) -> Result<()> {
        let cell = |index: usize| {
            row.get(index).ok_or_else(|| {
                ShardingError::Merge(format!(
                    "aggregate column {index} is missing from a row of {} columns",
                    row.len()
                ))
            })
        };
        match self {
            AggregationUnit::Count(acc) | AggregationUnit::Sum(acc) => {
                add_into(acc, cell(column.index)?, column.func)
            }
            AggregationUnit::Max(acc) => extreme_into(acc, cell(column.index)?, Ordering::Greater),
            AggregationUnit::Min(acc) => extreme_into(acc, cell(column.index)?, Ordering::Less),
            AggregationUnit::Avg { sum, count } => {
                let Some((sum_index, count_index)) = column.avg_inputs else {
                    return Err(ShardingError::Merge(
                        "AVG column has no derived SUM and COUNT columns".to_string(),
                    ));
                };
                add_into(sum, cell(sum_index)?, AggregateFunc::Sum)?;
                add_into(count, cell(count_index)?, AggregateFunc::Count)
            }
        }
    }

    pub fn result(&self) -> Result<SqlValue> {
        match self {
            AggregationUnit::Count(acc) => Ok(acc.clone().unwrap_or(SqlValue::Int(0))),
            AggregationUnit::Sum(acc) | AggregationUnit::Max(acc) | AggregationUnit::Min(acc) => {
                Ok(acc.clone().unwrap_or(SqlValue::Null))
            }
            AggregationUnit::Avg { sum, count } => {
                let count = count.as_ref().and_then(SqlValue::as_f64).unwrap_or(0.0);
                if count == 0.0 {
                    return Ok(SqlValue::Null);
                }
                match sum {
                    None | Some(SqlValue::Null) => Ok(SqlValue::Null),
                    Some(value) => {
                        let sum = value.as_f64().ok_or_else(|| {
                            ShardingError::Merge(format!(
                                "AVG sum has non-numeric type {}",
                                value.type_name()
                            ))
                        })?;
                        Ok(SqlValue::Float(sum / count))
                    }
                }
            }
        }
    }
}

fn add_into(acc: &mut Option<SqlValue>, value: &SqlValue, func: AggregateFunc) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let next = match acc {
        None => value.clone(),
        Some(current) => current.checked_add(value).ok_or_else(|| {
            ShardingError::Merge(format!(
                "cannot add {} and {} for {func}: overflow or incompatible types",
                current.type_name(),
                value.type_name()
            ))
        })?,
    };
    *acc = Some(next);
    Ok(())
}

fn extreme_into(acc: &mut Option<SqlValue>, value: &SqlValue, keep: Ordering) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    match acc {
        None => *acc = Some(value.clone()),
        Some(current) => {
            let ordering = value.compare(current).ok_or_else(|| {
                ShardingError::Merge(format!(
                    "cannot compare {} with {}",
                    value.type_name(),
                    current.type_name()
                ))
            })?;
            if ordering == keep {
                *acc = Some(value.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(func: AggregateFunc, index: usize, avg: Option<(usize, usize)>) -> ResolvedAggregation {
        ResolvedAggregation {
            index,
            func,
            avg_inputs: avg,
        }
    }

    #[test]
    fn avg_is_recomputed_from_derived_sum_and_count() {
        let avg = column(AggregateFunc::Avg, 0, Some((2, 1)));
        let mut unit = AggregationUnit::new(AggregateFunc::Avg);
        unit.merge(&avg, &[SqlValue::Float(10.0), SqlValue::Int(3), SqlValue::Int(30)])
            .expect("shard a");
        unit.merge(&avg, &[SqlValue::Float(10.0), SqlValue::Int(7), SqlValue::Int(70)])
            .expect("shard b");
        assert_eq!(unit.result().expect("avg"), SqlValue::Float(10.0));

        let empty = AggregationUnit::new(AggregateFunc::Avg);
        assert_eq!(empty.result().expect("avg"), SqlValue::Null);
    }

    #[test]
    fn count_sum_max_min_combine_shard_values() {
        let rows: Vec<Vec<SqlValue>> = vec![
            vec![2.into(), 5.into(), 9.into(), 1.into()],
            vec![3.into(), SqlValue::Null, 4.into(), SqlValue::Null],
            vec![0.into(), 7.into(), 12.into(), 0.into()],
        ];
        let columns = [
            column(AggregateFunc::Count, 0, None),
            column(AggregateFunc::Sum, 1, None),
            column(AggregateFunc::Max, 2, None),
            column(AggregateFunc::Min, 3, None),
        ];
        let mut units: Vec<AggregationUnit> =
            columns.iter().map(|c| AggregationUnit::new(c.func)).collect();
        for row in &rows {
            for (unit, column) in units.iter_mut().zip(&columns) {
                unit.merge(column, row).expect("merge");
            }
        }
        let results: Vec<SqlValue> = units.iter().map(|u| u.result().expect("result")).collect();
        assert_eq!(
            results,
            vec![SqlValue::Int(5), SqlValue::Int(12), SqlValue::Int(12), SqlValue::Int(0)]
        );
    }

    #[test]
    fn overflow_and_type_mismatch_are_merge_errors() {
        let sum = column(AggregateFunc::Sum, 0, None);
        let mut unit = AggregationUnit::new(AggregateFunc::Sum);
        unit.merge(&sum, &[SqlValue::Int(i64::MAX)]).expect("first");
        let err = unit.merge(&sum, &[SqlValue::Int(1)]).expect_err("overflow");
        assert!(matches!(err, ShardingError::Merge(_)));

        let max = column(AggregateFunc::Max, 0, None);
        let mut unit = AggregationUnit::new(AggregateFunc::Max);
        unit.merge(&max, &[SqlValue::Int(1)]).expect("first");
        assert!(unit.merge(&max, &[SqlValue::Text("x".into())]).is_err());
    }
}
