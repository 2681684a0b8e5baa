//! Sharding condition extraction.
//!
//! Only top-level conjuncts of WHERE (and JOIN ... ON) are considered: a term
//! narrows a sharding column when it is `col = v`, `col IN (...)`,
//! `col BETWEEN a AND b` or a comparison against a literal or parameter.
//! Every other term (OR, NOT, functions, column-to-column) leaves the columns
//! it mentions unconditioned unless another conjunct narrows them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{Result, ShardingError};
use crate::rule::ShardingRule;
use crate::sql::{BinaryOp, ColumnRef, Expr, InsertStatement, Statement, StatementContext};
use crate::value::{ConditionValue, SqlValue, ValueRange};

/// Value constraints for the sharding columns of one logical table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardingCondition {
    pub logic_table: String,
    /// Lowercased column name → constraint.
    pub values: BTreeMap<String, ConditionValue>,
    /// Sharding columns mentioned only by non-extractable predicates.
    pub unconditioned: BTreeSet<String>,
    /// Source row for INSERT conditions.
    pub insert_row: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShardingConditions {
    pub conditions: Vec<ShardingCondition>,
    /// Some conjunct set provably admits no row.
    pub always_false: bool,
}

impl ShardingConditions {
    /// Statement-level condition for `logic_table`.
    pub fn for_table(&self, logic_table: &str) -> Option<&ShardingCondition> {
        self.conditions
            .iter()
            .find(|condition| condition.insert_row.is_none() && condition.logic_table == logic_table)
    }

    /// Per-row INSERT conditions, ordered by row.
    pub fn insert_rows(&self) -> impl Iterator<Item = &ShardingCondition> {
        self.conditions
            .iter()
            .filter(|condition| condition.insert_row.is_some())
    }
}

/// Keys generated for an INSERT that omitted the table's key column.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedKeys {
    pub logic_table: String,
    pub column: String,
    /// One value per INSERT row.
    pub values: Vec<SqlValue>,
}

/// Generates key values when the INSERT column list lacks the key column.
pub fn generate_keys(ctx: &StatementContext, rule: &ShardingRule) -> Result<Option<GeneratedKeys>> {
    let Statement::Insert(insert) = ctx.statement() else {
        return Ok(None);
    };
    let logic_table = insert.table.logic_name();
    let Some(key) = rule
        .table_rule(&logic_table)
        .and_then(|table| table.key_generate.as_ref())
    else {
        return Ok(None);
    };
    if insert.columns.is_empty() || insert.column_index(&key.column).is_some() {
        return Ok(None);
    }
    let values = insert
        .rows
        .iter()
        .map(|_| key.generator.generate_key())
        .collect::<Result<Vec<_>>>()?;
    debug!(table = %logic_table, column = %key.column, rows = values.len(), "generated keys");
    Ok(Some(GeneratedKeys {
        logic_table,
        column: key.column.clone(),
        values,
    }))
}

/// Extracts sharding conditions for every table the rule shards.
pub fn extract(
    ctx: &StatementContext,
    parameters: &[SqlValue],
    rule: &ShardingRule,
    generated: Option<&GeneratedKeys>,
) -> Result<ShardingConditions> {
    match ctx.statement() {
        Statement::Insert(insert) => extract_insert(insert, parameters, rule, generated),
        Statement::Select(select) => {
            let terms: Vec<&Expr> = select
                .join_conditions
                .iter()
                .chain(select.selection.iter())
                .collect();
            extract_where(ctx, &terms, parameters, rule)
        }
        statement => {
            let terms: Vec<&Expr> = statement.selection().into_iter().collect();
            extract_where(ctx, &terms, parameters, rule)
        }
    }
}

fn collect_conjuncts<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        Expr::Nested(inner) if matches!(inner.as_ref(), Expr::Binary { op: BinaryOp::And, .. }) => {
            collect_conjuncts(inner, out)
        }
        _ => out.push(expr),
    }
}

pub(crate) fn resolve_value(expr: &Expr, parameters: &[SqlValue]) -> Result<Option<SqlValue>> {
    match expr {
        Expr::Literal(value) => Ok(Some(value.clone())),
        Expr::Param { index, .. } => parameters
            .get(*index)
            .cloned()
            .map(Some)
            .ok_or(ShardingError::ParameterOutOfRange {
                index: *index,
                len: parameters.len(),
            }),
        Expr::Nested(inner) => resolve_value(inner, parameters),
        _ => Ok(None),
    }
}

fn as_column(expr: &Expr) -> Option<&ColumnRef> {
    match expr {
        Expr::Column(column) => Some(column),
        Expr::Nested(inner) => as_column(inner),
        _ => None,
    }
}

/// Parses one conjunct into `(column, constraint)`.
fn extract_term<'a>(
    term: &'a Expr,
    parameters: &[SqlValue],
) -> Result<Option<(&'a ColumnRef, ConditionValue)>> {
    match term {
        Expr::Binary { left, op, right } => {
            let (column, op, value_expr) = match (as_column(left), as_column(right)) {
                (Some(column), None) => (column, *op, right.as_ref()),
                (None, Some(column)) => (column, op.flipped(), left.as_ref()),
                _ => return Ok(None),
            };
            let Some(value) = resolve_value(value_expr, parameters)? else {
                return Ok(None);
            };
            let condition = match op {
                BinaryOp::Eq if value.is_null() => ConditionValue::Values(Vec::new()),
                BinaryOp::Eq => ConditionValue::Values(vec![value]),
                _ if value.is_null() => return Ok(None),
                BinaryOp::Lt => ConditionValue::Range(ValueRange::at_most(value, false)),
                BinaryOp::LtEq => ConditionValue::Range(ValueRange::at_most(value, true)),
                BinaryOp::Gt => ConditionValue::Range(ValueRange::at_least(value, false)),
                BinaryOp::GtEq => ConditionValue::Range(ValueRange::at_least(value, true)),
                _ => return Ok(None),
            };
            Ok(Some((column, condition)))
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let Some(column) = as_column(expr) else {
                return Ok(None);
            };
            let mut values = Vec::with_capacity(list.len());
            for item in list {
                match resolve_value(item, parameters)? {
                    Some(value) if value.is_null() => {}
                    Some(value) => {
                        if !values.iter().any(|existing: &SqlValue| existing.sql_eq(&value)) {
                            values.push(value);
                        }
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((column, ConditionValue::Values(values))))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated: false,
        } => {
            let Some(column) = as_column(expr) else {
                return Ok(None);
            };
            let (Some(low), Some(high)) = (
                resolve_value(low, parameters)?,
                resolve_value(high, parameters)?,
            ) else {
                return Ok(None);
            };
            Ok(Some((
                column,
                ConditionValue::Range(ValueRange::closed(low, high)),
            )))
        }
        Expr::Nested(inner) => extract_term(inner, parameters),
        _ => Ok(None),
    }
}

/// Logical tables a column reference may belong to.
fn owning_tables(ctx: &StatementContext, rule: &ShardingRule, column: &ColumnRef) -> Vec<String> {
    match &column.owner {
        Some(owner) => ctx
            .resolve_owner(&owner.value)
            .map(|table| vec![table.logic_name()])
            .unwrap_or_default(),
        None => ctx
            .table_names()
            .into_iter()
            .filter(|table| {
                rule.table_rule(table)
                    .is_some_and(|table_rule| table_rule.is_sharding_column(&column.name))
            })
            .collect(),
    }
}

fn extract_where(
    ctx: &StatementContext,
    predicates: &[&Expr],
    parameters: &[SqlValue],
    rule: &ShardingRule,
) -> Result<ShardingConditions> {
    let mut terms = Vec::new();
    for predicate in predicates {
        collect_conjuncts(predicate, &mut terms);
    }

    let mut by_table: BTreeMap<String, ShardingCondition> = BTreeMap::new();
    let mut mentioned: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for term in terms {
        match extract_term(term, parameters)? {
            Some((column, value)) => {
                for table in owning_tables(ctx, rule, column) {
                    let Some(table_rule) = rule.table_rule(&table) else {
                        continue;
                    };
                    if !table_rule.is_sharding_column(&column.name) {
                        continue;
                    }
                    let condition = by_table.entry(table.clone()).or_insert_with(|| {
                        ShardingCondition {
                            logic_table: table.clone(),
                            ..Default::default()
                        }
                    });
                    let key = column.name.to_ascii_lowercase();
                    let combined = match condition.values.remove(&key) {
                        Some(existing) => existing.and(value.clone()),
                        None => value.clone(),
                    };
                    condition.values.insert(key, combined);
                }
            }
            None => {
                term.visit_columns(&mut |column| {
                    for table in owning_tables(ctx, rule, column) {
                        mentioned
                            .entry(table)
                            .or_default()
                            .insert(column.name.to_ascii_lowercase());
                    }
                });
            }
        }
    }

    for (table, columns) in mentioned {
        let Some(table_rule) = rule.table_rule(&table) else {
            continue;
        };
        let unconditioned: BTreeSet<String> = columns
            .into_iter()
            .filter(|column| table_rule.is_sharding_column(column))
            .filter(|column| {
                by_table
                    .get(&table)
                    .map_or(true, |condition| !condition.values.contains_key(column))
            })
            .collect();
        if unconditioned.is_empty() {
            continue;
        }
        debug!(table = %table, columns = ?unconditioned, "sharding columns left unconditioned");
        by_table
            .entry(table.clone())
            .or_insert_with(|| ShardingCondition {
                logic_table: table.clone(),
                ..Default::default()
            })
            .unconditioned
            .extend(unconditioned);
    }

    let always_false = by_table
        .values()
        .any(|condition| condition.values.values().any(ConditionValue::is_empty));
    Ok(ShardingConditions {
        conditions: by_table.into_values().collect(),
        always_false,
    })
}

fn extract_insert(
    insert: &InsertStatement,
    parameters: &[SqlValue],
    rule: &ShardingRule,
    generated: Option<&GeneratedKeys>,
) -> Result<ShardingConditions> {
    let logic_table = insert.table.logic_name();
    let Some(table_rule) = rule.table_rule(&logic_table) else {
        return Ok(ShardingConditions::default());
    };
    let sharding_columns = table_rule.sharding_columns();

    let mut conditions = Vec::with_capacity(insert.rows.len());
    for (row_index, row) in insert.rows.iter().enumerate() {
        let mut condition = ShardingCondition {
            logic_table: logic_table.clone(),
            insert_row: Some(row_index),
            ..Default::default()
        };
        for column in &sharding_columns {
            let value = match insert.column_index(column) {
                Some(index) => match row.values.get(index) {
                    Some(expr) => resolve_value(expr, parameters)?,
                    None => None,
                },
                None => generated
                    .filter(|keys| keys.column.eq_ignore_ascii_case(column))
                    .and_then(|keys| keys.values.get(row_index).cloned()),
            };
            match value {
                Some(value) => {
                    condition
                        .values
                        .insert(column.clone(), ConditionValue::Values(vec![value]));
                }
                None => {
                    condition.unconditioned.insert(column.clone());
                }
            }
        }
        conditions.push(condition);
    }
    Ok(ShardingConditions {
        conditions,
        always_false: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::tests::order_rule;

    fn conditions(sql: &str, params: &[SqlValue]) -> ShardingConditions {
        let ctx = StatementContext::parse(sql).expect("parse");
        extract(&ctx, params, &order_rule(), None).expect("extract")
    }

    #[test]
    fn equality_and_in_lists_become_value_sets() {
        let result = conditions(
            "SELECT * FROM t_order WHERE order_id IN (1, 2, 3) AND order_id = ? AND status = 'x'",
            &[SqlValue::Int(2)],
        );
        let condition = result.for_table("t_order").expect("t_order");
        assert_eq!(
            condition.values.get("order_id"),
            Some(&ConditionValue::Values(vec![SqlValue::Int(2)]))
        );
        assert!(!result.always_false);
    }

    #[test]
    fn disjunction_leaves_column_unconditioned() {
        let result = conditions(
            "SELECT * FROM t_order WHERE order_id = 1 OR order_id = 2",
            &[],
        );
        let condition = result.for_table("t_order").expect("t_order");
        assert!(condition.values.is_empty());
        assert!(condition.unconditioned.contains("order_id"));
    }

    #[test]
    fn function_wrapped_column_is_not_extracted() {
        let result = conditions("SELECT * FROM t_order WHERE ABS(order_id) = 5", &[]);
        let condition = result.for_table("t_order").expect("t_order");
        assert!(condition.values.is_empty());
        assert!(condition.unconditioned.contains("order_id"));
    }

    #[test]
    fn ranges_tighten_and_detect_contradictions() {
        let result = conditions(
            "SELECT * FROM t_order WHERE order_id > 3 AND order_id BETWEEN 1 AND 10 AND 8 >= order_id",
            &[],
        );
        let condition = result.for_table("t_order").expect("t_order");
        let Some(ConditionValue::Range(range)) = condition.values.get("order_id") else {
            panic!("expected range");
        };
        assert_eq!(range.integer_bounds(), (Some(4), Some(8)));

        let contradiction = conditions(
            "SELECT * FROM t_order WHERE order_id = 1 AND order_id = 2",
            &[],
        );
        assert!(contradiction.always_false);
    }

    #[test]
    fn unqualified_columns_attach_to_every_sharded_table() {
        let result = conditions(
            "SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id WHERE order_id = 7",
            &[],
        );
        assert!(result.for_table("t_order").is_some());
        assert!(result.for_table("t_order_item").is_some());

        let qualified = conditions(
            "SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id WHERE i.order_id = 7",
            &[],
        );
        assert!(qualified
            .for_table("t_order")
            .map_or(true, |condition| condition.values.is_empty()));
        assert!(qualified.for_table("t_order_item").is_some());
    }

    #[test]
    fn missing_parameter_is_reported() {
        let ctx = StatementContext::parse("SELECT * FROM t_order WHERE order_id = ?").expect("parse");
        let err = extract(&ctx, &[], &order_rule(), None).expect_err("missing");
        assert!(matches!(
            err,
            ShardingError::ParameterOutOfRange { index: 0, len: 0 }
        ));
    }

    #[test]
    fn insert_rows_get_one_condition_each() {
        let result = conditions(
            "INSERT INTO t_order (order_id, status) VALUES (5, 'a'), (?, 'b')",
            &[SqlValue::Int(6)],
        );
        let rows: Vec<_> = result.insert_rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1].values.get("order_id"),
            Some(&ConditionValue::Values(vec![SqlValue::Int(6)]))
        );
    }

    #[test]
    fn generated_keys_feed_insert_conditions() {
        let ctx = StatementContext::parse("INSERT INTO t_order (status) VALUES ('a')").expect("parse");
        let keys = GeneratedKeys {
            logic_table: "t_order".to_string(),
            column: "order_id".to_string(),
            values: vec![SqlValue::Int(9)],
        };
        let result = extract(&ctx, &[], &order_rule(), Some(&keys)).expect("extract");
        let row = result.insert_rows().next().expect("row");
        assert_eq!(
            row.values.get("order_id"),
            Some(&ConditionValue::Values(vec![SqlValue::Int(9)]))
        );
    }
}
