//! Token generation and the merge-facing description of a SELECT.

use std::collections::BTreeMap;

use tracing::debug;

use crate::condition::GeneratedKeys;
use crate::error::{Result, ShardingError};
use crate::route::RouteContext;
use crate::rule::ShardingRule;
use crate::sql::{
    AggregateFunc, ColumnRef, Expr, Ident, InsertStatement, LimitKind, LimitValue, NullsOrder,
    OrderDirection, OrderItem, OrderKey, ProjectionKind, SelectStatement, Span, Statement,
    StatementContext,
};
use crate::value::SqlValue;

use super::parameter::ParameterBuilder;
use super::token::{DerivedProjection, InsertValueRow, ItemText, RowParam, SqlToken};

/// Where the merge engine finds a column in shard results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKey {
    Index(usize),
    /// Looked up among the shard's column labels (statements with `*`).
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByColumn {
    pub key: ColumnKey,
    pub direction: OrderDirection,
    pub nulls: NullsOrder,
}

impl OrderByColumn {
    /// Nulls sort first ascending and last descending unless stated.
    pub fn new(key: ColumnKey, direction: OrderDirection, nulls: Option<NullsOrder>) -> Self {
        let nulls = nulls.unwrap_or(match direction {
            OrderDirection::Asc => NullsOrder::First,
            OrderDirection::Desc => NullsOrder::Last,
        });
        Self {
            key,
            direction,
            nulls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationColumn {
    pub key: ColumnKey,
    pub func: AggregateFunc,
    /// Derived `(SUM, COUNT)` columns of an `AVG`.
    pub avg_inputs: Option<(ColumnKey, ColumnKey)>,
}

/// Logical pagination, applied once after the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u64,
    pub row_count: Option<u64>,
}

/// What the merge engine needs to know about a multi-shard SELECT.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectContext {
    pub distinct: bool,
    pub order_by: Vec<OrderByColumn>,
    pub group_by: Vec<OrderByColumn>,
    pub aggregations: Vec<AggregationColumn>,
    /// Shard rows arrive sorted by the group key.
    pub group_order_matches: bool,
    pub pagination: Option<Pagination>,
    /// Hidden columns appended after the client-visible ones.
    pub derived_columns: usize,
}

impl SelectContext {
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregations.is_empty()
    }
}

pub(crate) struct Generated {
    pub tokens: Vec<SqlToken>,
    pub select: Option<SelectContext>,
    pub parameters: ParameterBuilder,
}

pub(crate) fn generate(
    ctx: &StatementContext,
    route: &RouteContext,
    parameters: &[SqlValue],
    rule: &ShardingRule,
    generated: Option<&GeneratedKeys>,
) -> Result<Generated> {
    let mut tokens = Vec::new();
    table_tokens(ctx, rule, &mut tokens);

    let mut replacements = BTreeMap::new();
    let mut select_context = None;
    match ctx.statement() {
        Statement::Select(select) if !route.is_single() => {
            let builder = SelectBuilder::new(ctx, rule, select);
            select_context = Some(builder.build(parameters, &mut tokens, &mut replacements)?);
        }
        Statement::Ddl(ddl) => {
            if let (Some(index), Some(table)) = (&ddl.index, ddl.tables.first()) {
                let logic_table = table.logic_name();
                if rule.table_rule(&logic_table).is_some() {
                    tokens.push(SqlToken::Index {
                        span: index.span,
                        logic_table,
                        ident: index.clone(),
                    });
                }
            }
        }
        Statement::Insert(insert) => insert_tokens(ctx, insert, route, rule, generated, &mut tokens),
        _ => {}
    }

    let parameters = match ctx.statement() {
        Statement::Insert(insert) => ParameterBuilder::grouped(insert, parameters)?,
        _ => ParameterBuilder::standard(parameters, replacements),
    };
    debug!(tokens = tokens.len(), "generated sql tokens");
    Ok(Generated {
        tokens,
        select: select_context,
        parameters,
    })
}

/// Logical table an owner qualifier names directly (not through an alias).
fn sharded_owner(ctx: &StatementContext, rule: &ShardingRule, owner: &Ident) -> Option<String> {
    let table = ctx.resolve_owner(&owner.value)?;
    if table.alias.is_some() {
        return None;
    }
    let logic_table = table.logic_name();
    rule.table_rule(&logic_table).map(|_| logic_table)
}

fn table_tokens(ctx: &StatementContext, rule: &ShardingRule, tokens: &mut Vec<SqlToken>) {
    let statement = ctx.statement();
    for table in statement.tables() {
        if let Some(schema) = &table.schema {
            tokens.push(SqlToken::Remove {
                span: Span::new(schema.span.start, table.name.span.start),
            });
        }
        let logic_table = table.logic_name();
        if rule.table_rule(&logic_table).is_some() {
            tokens.push(SqlToken::Table {
                span: table.name.span,
                logic_table,
                ident: table.name.clone(),
            });
        }
    }

    let mut owners: Vec<&Ident> = Vec::new();
    statement.visit_columns(&mut |column| {
        if let Some(owner) = &column.owner {
            owners.push(owner);
        }
    });
    if let Statement::Select(select) = statement {
        for projection in &select.projections {
            if let ProjectionKind::Wildcard { owner: Some(owner) } = &projection.kind {
                owners.push(owner);
            }
        }
    }
    for owner in owners {
        if let Some(logic_table) = sharded_owner(ctx, rule, owner) {
            tokens.push(SqlToken::Table {
                span: owner.span,
                logic_table,
                ident: owner.clone(),
            });
        }
    }
}

fn insert_tokens(
    ctx: &StatementContext,
    insert: &InsertStatement,
    route: &RouteContext,
    rule: &ShardingRule,
    generated: Option<&GeneratedKeys>,
    tokens: &mut Vec<SqlToken>,
) {
    let logic_table = insert.table.logic_name();
    if rule.table_rule(&logic_table).is_none() {
        return;
    }
    let keys = generated.filter(|keys| keys.logic_table == logic_table);
    if let (Some(keys), Some(close)) = (keys, insert.columns_close) {
        tokens.push(SqlToken::GeneratedKeyColumn {
            at: close,
            column: keys.column.clone(),
        });
    }
    if keys.is_none() && route.is_single() {
        return;
    }

    let rows = insert
        .rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut params = Vec::new();
            for value in &row.values {
                value.visit_params(&mut |index, span| {
                    params.push(RowParam {
                        index,
                        span,
                        numbered: ctx.sql().get(span.start..).is_some_and(|s| s.starts_with('$')),
                    })
                });
            }
            InsertValueRow {
                span: row.span,
                params,
                generated_key: keys.and_then(|keys| keys.values.get(i).cloned()),
            }
        })
        .collect();
    tokens.push(SqlToken::InsertValues {
        span: insert.values_span,
        rows,
    });
}

struct SelectBuilder<'a> {
    ctx: &'a StatementContext,
    rule: &'a ShardingRule,
    select: &'a SelectStatement,
    /// No `*` in the select list, so column positions are known.
    fixed: bool,
    derived: Vec<DerivedProjection>,
    /// Normalized text of derived expressions and their keys.
    derived_keys: Vec<(String, ColumnKey)>,
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

impl<'a> SelectBuilder<'a> {
    fn new(ctx: &'a StatementContext, rule: &'a ShardingRule, select: &'a SelectStatement) -> Self {
        let fixed = !select
            .projections
            .iter()
            .any(|projection| matches!(projection.kind, ProjectionKind::Wildcard { .. }));
        Self {
            ctx,
            rule,
            select,
            fixed,
            derived: Vec::new(),
            derived_keys: Vec::new(),
        }
    }

    fn build(
        mut self,
        parameters: &[SqlValue],
        tokens: &mut Vec<SqlToken>,
        replacements: &mut BTreeMap<usize, SqlValue>,
    ) -> Result<SelectContext> {
        let select = self.select;
        if select.having.is_some() {
            return Err(ShardingError::Unsupported(
                "HAVING over multiple shards".to_string(),
            ));
        }

        let mut aggregations = Vec::new();
        for (i, projection) in select.projections.iter().enumerate() {
            let ProjectionKind::Aggregate {
                func,
                distinct,
                arg,
                args,
            } = &projection.kind
            else {
                continue;
            };
            if *distinct {
                return Err(ShardingError::Unsupported(format!(
                    "{func}(DISTINCT ...) over multiple shards"
                )));
            }
            let avg_inputs = if *func == AggregateFunc::Avg {
                let count = self.aggregate_text("COUNT", arg, args);
                let count = self.derive("AVG_DERIVED_COUNT", count);
                let sum = self.aggregate_text("SUM", arg, args);
                let sum = self.derive("AVG_DERIVED_SUM", sum);
                Some((sum, count))
            } else {
                None
            };
            aggregations.push(AggregationColumn {
                key: self.key_at(i),
                func: *func,
                avg_inputs,
            });
        }

        let mut order_by = Vec::with_capacity(select.order_by.len());
        for item in &select.order_by {
            let key = self.resolve(item, "ORDER_BY_DERIVED")?;
            order_by.push(OrderByColumn::new(key, item.direction, item.nulls));
        }
        let mut group_by = Vec::with_capacity(select.group_by.len());
        for item in &select.group_by {
            let key = self.resolve(item, "GROUP_BY_DERIVED")?;
            group_by.push(OrderByColumn::new(key, item.direction, item.nulls));
        }

        if order_by.is_empty() && !group_by.is_empty() {
            // GROUP BY implies ordering; shards must return rows sorted by the group key.
            tokens.push(SqlToken::OrderBy {
                at: select.order_by_insert_at,
                items: select.group_by.iter().map(|item| self.item_text(item)).collect(),
            });
            order_by = group_by.clone();
        }
        let group_order_matches = !group_by.is_empty() && order_by == group_by;

        let pagination = match &select.limit {
            Some(limit) => {
                let offset = match &limit.offset {
                    Some(value) => limit_value(value, parameters)?,
                    None => 0,
                };
                let row_count = match &limit.row_count {
                    Some(value) => Some(limit_value(value, parameters)?),
                    None => None,
                };
                if let Some(value) = &limit.offset {
                    rewrite_limit(value, 0, tokens, replacements, true);
                }
                if let (Some(value), Some(count)) = (&limit.row_count, row_count) {
                    let max_row_count = !group_by.is_empty() && !group_order_matches;
                    let shard_count = if max_row_count {
                        i64::MAX as u64
                    } else {
                        offset.saturating_add(count)
                    };
                    rewrite_limit(value, shard_count, tokens, replacements, false);
                }
                Some(Pagination { offset, row_count })
            }
            None => None,
        };

        let derived_columns = self.derived.len();
        if !self.derived.is_empty() {
            tokens.push(SqlToken::Projections {
                at: select.projections_end,
                items: std::mem::take(&mut self.derived),
            });
        }

        Ok(SelectContext {
            distinct: select.distinct,
            order_by,
            group_by,
            aggregations,
            group_order_matches,
            pagination,
            derived_columns,
        })
    }

    fn key_at(&self, index: usize) -> ColumnKey {
        if self.fixed {
            ColumnKey::Index(index)
        } else {
            ColumnKey::Label(self.select.projections[index].label())
        }
    }

    fn derive(&mut self, prefix: &str, expression: ItemText) -> ColumnKey {
        let normalized = normalize(&expression.render(&Default::default()));
        if let Some((_, key)) = self.derived_keys.iter().find(|(text, _)| *text == normalized) {
            return key.clone();
        }
        let ordinal = self
            .derived
            .iter()
            .filter(|item| item.alias.starts_with(prefix))
            .count();
        let alias = format!("{prefix}_{ordinal}");
        let key = if self.fixed {
            ColumnKey::Index(self.select.projections.len() + self.derived.len())
        } else {
            ColumnKey::Label(alias.clone())
        };
        self.derived.push(DerivedProjection { expression, alias });
        self.derived_keys.push((normalized, key.clone()));
        key
    }

    fn column_text(&self, prefix: &str, column: &ColumnRef, suffix: &str) -> ItemText {
        let sql = self.ctx.sql();
        match &column.owner {
            Some(owner) => match sharded_owner(self.ctx, self.rule, owner) {
                Some(logic_table) => ItemText {
                    prefix: prefix.to_string(),
                    owner: Some((logic_table, owner.clone())),
                    rest: format!(
                        "{}{suffix}",
                        sql.get(owner.span.end..column.span.end).unwrap_or_default()
                    ),
                },
                None => ItemText::plain(format!("{prefix}{}{suffix}", column.span.slice(sql))),
            },
            None => ItemText::plain(format!("{prefix}{}{suffix}", column.span.slice(sql))),
        }
    }

    fn aggregate_text(&self, func: &str, arg: &str, args: &[Expr]) -> ItemText {
        match args {
            [Expr::Column(column)] => self.column_text(&format!("{func}("), column, ")"),
            _ => ItemText::plain(format!("{func}({arg})")),
        }
    }

    fn item_text(&self, item: &OrderItem) -> ItemText {
        match &item.key {
            OrderKey::Column(column) => self.column_text("", column, ""),
            _ => ItemText::plain(item.text.clone()),
        }
    }

    fn resolve(&mut self, item: &OrderItem, prefix: &str) -> Result<ColumnKey> {
        let select = self.select;
        let projections = &select.projections;
        match &item.key {
            OrderKey::Position(position) => {
                if *position == 0 || (self.fixed && *position > projections.len()) {
                    return Err(ShardingError::Unsupported(format!(
                        "position {position} is not in the select list"
                    )));
                }
                Ok(ColumnKey::Index(position - 1))
            }
            OrderKey::Column(column) => {
                for (i, projection) in projections.iter().enumerate() {
                    let same_column = match &projection.kind {
                        ProjectionKind::Column(projected) => {
                            projected.name.eq_ignore_ascii_case(&column.name)
                                && match (&projected.owner, &column.owner) {
                                    (Some(left), Some(right)) => left.matches(&right.value),
                                    _ => true,
                                }
                        }
                        _ => false,
                    };
                    let same_alias = column.owner.is_none()
                        && projection
                            .alias
                            .as_deref()
                            .is_some_and(|alias| alias.eq_ignore_ascii_case(&column.name));
                    if same_column || same_alias {
                        return Ok(self.key_at(i));
                    }
                }
                let covered = projections.iter().any(|projection| match &projection.kind {
                    ProjectionKind::Wildcard { owner: None } => true,
                    ProjectionKind::Wildcard { owner: Some(owner) } => column
                        .owner
                        .as_ref()
                        .map_or(true, |column_owner| owner.matches(&column_owner.value)),
                    _ => false,
                });
                if covered {
                    return Ok(ColumnKey::Label(column.name.clone()));
                }
                let text = self.item_text(item);
                Ok(self.derive(prefix, text))
            }
            OrderKey::Expression(_) => {
                let normalized = normalize(&item.text);
                for (i, projection) in projections.iter().enumerate() {
                    let same_text = normalize(&projection.text) == normalized;
                    let same_alias = projection
                        .alias
                        .as_deref()
                        .is_some_and(|alias| alias.eq_ignore_ascii_case(item.text.trim()));
                    if same_text || same_alias {
                        return Ok(self.key_at(i));
                    }
                }
                Ok(self.derive(prefix, ItemText::plain(item.text.clone())))
            }
        }
    }
}

fn limit_value(value: &LimitValue, parameters: &[SqlValue]) -> Result<u64> {
    match value.kind {
        LimitKind::Literal(n) => Ok(n),
        LimitKind::Param(index) => {
            let param = parameters
                .get(index)
                .ok_or(ShardingError::ParameterOutOfRange {
                    index,
                    len: parameters.len(),
                })?;
            param
                .as_i64()
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| ShardingError::Rewrite {
                    token: "pagination",
                    start: value.span.start,
                    stop: value.span.end,
                    reason: format!("expected a non-negative integer, got `{param}`"),
                })
        }
    }
}

fn rewrite_limit(
    value: &LimitValue,
    rewritten: u64,
    tokens: &mut Vec<SqlToken>,
    replacements: &mut BTreeMap<usize, SqlValue>,
    offset: bool,
) {
    match value.kind {
        LimitKind::Literal(_) if offset => tokens.push(SqlToken::Offset {
            span: value.span,
            value: rewritten,
        }),
        LimitKind::Literal(_) => tokens.push(SqlToken::RowCount {
            span: value.span,
            value: rewritten,
        }),
        LimitKind::Param(index) => {
            let rewritten = i64::try_from(rewritten).unwrap_or(i64::MAX);
            replacements.insert(index, SqlValue::Int(rewritten));
        }
    }
}
