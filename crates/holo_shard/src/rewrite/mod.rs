//! Rewrite engine: one physical statement per route unit table mapping.
//!
//! Tokens are generated once per statement; rendering copies the original
//! text and substitutes every token span with its unit-specific text.

pub mod generator;
pub mod parameter;
pub mod token;

use tracing::debug;

use crate::condition::GeneratedKeys;
use crate::error::{Result, ShardingError};
use crate::route::{RouteContext, RouteUnit, TableMapping};
use crate::rule::ShardingRule;
use crate::sql::StatementContext;
use crate::value::SqlValue;

pub use generator::{
    AggregationColumn, ColumnKey, OrderByColumn, Pagination, SelectContext,
};
pub use parameter::ParameterBuilder;
pub use token::{RenderContext, SqlToken};

/// A physical statement ready for the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUnit {
    pub data_source: String,
    pub sql: String,
    pub parameters: Vec<SqlValue>,
    pub table_mapping: TableMapping,
}

/// Original text, ordered tokens and the parameter builder of one statement.
#[derive(Debug, Clone)]
pub struct SqlRewriteContext {
    sql: String,
    tokens: Vec<SqlToken>,
    parameters: ParameterBuilder,
    select: Option<SelectContext>,
}

impl SqlRewriteContext {
    pub fn new(
        ctx: &StatementContext,
        route: &RouteContext,
        parameters: &[SqlValue],
        rule: &ShardingRule,
        generated: Option<&GeneratedKeys>,
    ) -> Result<Self> {
        let generated = generator::generate(ctx, route, parameters, rule, generated)?;
        let tokens = order_tokens(generated.tokens)?;
        Ok(Self {
            sql: ctx.sql().to_string(),
            tokens,
            parameters: generated.parameters,
            select: generated.select,
        })
    }

    /// Merge description for multi-shard SELECTs.
    pub fn select_context(&self) -> Option<&SelectContext> {
        self.select.as_ref()
    }

    /// Renders the statement for one mapping of one unit.
    pub fn render(
        &self,
        unit: &RouteUnit,
        mapping: &TableMapping,
        insert_rows: Option<&[usize]>,
    ) -> Result<String> {
        let ctx = RenderContext {
            sql: &self.sql,
            data_source: &unit.data_source,
            mapping,
            insert_rows,
        };
        let mut out = String::with_capacity(self.sql.len() + 16);
        let mut cursor = 0;
        for token in &self.tokens {
            let between = self.sql.get(cursor..token.start()).ok_or_else(|| ShardingError::Rewrite {
                token: token.kind(),
                start: token.start(),
                stop: token.stop(),
                reason: "span is outside the statement".to_string(),
            })?;
            out.push_str(between);
            out.push_str(&token.render(&ctx)?);
            cursor = token.stop();
        }
        out.push_str(self.sql.get(cursor..).unwrap_or_default());
        Ok(out)
    }

    /// Execution units for every mapping of every route unit, in route order.
    pub fn execution_units(&self, route: &RouteContext) -> Result<Vec<ExecutionUnit>> {
        let mut units = Vec::with_capacity(route.execution_unit_count());
        for unit in route.units() {
            for mapping in &unit.table_mappings {
                let rows = if route.insert_row_nodes().is_empty() {
                    None
                } else {
                    Some(route.insert_rows_for(&unit.data_source, mapping))
                };
                let sql = self.render(unit, mapping, rows.as_deref())?;
                let parameters = self.parameters.parameters_for(rows.as_deref());
                debug!(data_source = %unit.data_source, sql = %sql, "rewrote statement");
                units.push(ExecutionUnit {
                    data_source: unit.data_source.clone(),
                    sql,
                    parameters,
                    table_mapping: mapping.clone(),
                });
            }
        }
        Ok(units)
    }
}

/// Sorts tokens by start offset and rejects overlaps.
fn order_tokens(mut tokens: Vec<SqlToken>) -> Result<Vec<SqlToken>> {
    tokens.sort_by_key(|token| (token.start(), token.stop()));
    tokens.dedup();
    for pair in tokens.windows(2) {
        let (previous, next) = (&pair[0], &pair[1]);
        if next.start() < previous.stop() {
            return Err(ShardingError::Rewrite {
                token: next.kind(),
                start: next.start(),
                stop: next.stop(),
                reason: format!(
                    "overlaps {} token at [{}, {})",
                    previous.kind(),
                    previous.start(),
                    previous.stop()
                ),
            });
        }
    }
    Ok(tokens)
}
