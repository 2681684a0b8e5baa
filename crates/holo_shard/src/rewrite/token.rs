//! SQL tokens: spans of the original text replaced per execution unit.

use crate::error::{Result, ShardingError};
use crate::route::TableMapping;
use crate::sql::{Ident, Span};
use crate::value::SqlValue;

/// Per-unit rendering inputs.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub sql: &'a str,
    pub data_source: &'a str,
    pub mapping: &'a TableMapping,
    /// INSERT rows routed to this unit; `None` keeps every row.
    pub insert_rows: Option<&'a [usize]>,
}

/// Text copied from the statement whose leading owner may name a sharded table.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemText {
    /// Text before the owner, such as `SUM(`.
    pub prefix: String,
    /// Logical table and the owner identifier that refers to it by name.
    pub owner: Option<(String, Ident)>,
    /// Remaining text after the owner (`.col`), or the whole text.
    pub rest: String,
}

impl ItemText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            prefix: String::new(),
            owner: None,
            rest: text.into(),
        }
    }

    pub fn render(&self, mapping: &TableMapping) -> String {
        match &self.owner {
            Some((logic_table, owner)) => {
                let owner = match mapping.actual(logic_table) {
                    Some(actual) => owner.render(actual),
                    None => owner.render(&owner.value),
                };
                format!("{}{owner}{}", self.prefix, self.rest)
            }
            None => format!("{}{}", self.prefix, self.rest),
        }
    }
}

/// A projection appended for the merge engine and hidden from the client.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedProjection {
    pub expression: ItemText,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowParam {
    pub index: usize,
    pub span: Span,
    /// Written as `$n` rather than `?`.
    pub numbered: bool,
}

/// One row of a multi-row VALUES list.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertValueRow {
    /// `(` to `)` inclusive.
    pub span: Span,
    pub params: Vec<RowParam>,
    pub generated_key: Option<SqlValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlToken {
    /// Logical table name → physical name of the unit.
    Table {
        span: Span,
        logic_table: String,
        ident: Ident,
    },
    /// Index name → `<index>_<physical table>`.
    Index {
        span: Span,
        logic_table: String,
        ident: Ident,
    },
    /// Text dropped from every physical statement (schema qualifiers).
    Remove { span: Span },
    /// Derived projections inserted after the select list.
    Projections {
        at: usize,
        items: Vec<DerivedProjection>,
    },
    /// ORDER BY clause inserted when GROUP BY implies ordering.
    OrderBy { at: usize, items: Vec<ItemText> },
    Offset { span: Span, value: u64 },
    RowCount { span: Span, value: u64 },
    /// Generated key column appended to the INSERT column list.
    GeneratedKeyColumn { at: usize, column: String },
    /// VALUES rows, filtered to the rows routed to the unit.
    InsertValues {
        span: Span,
        rows: Vec<InsertValueRow>,
    },
}

impl SqlToken {
    pub fn kind(&self) -> &'static str {
        match self {
            SqlToken::Table { .. } => "table",
            SqlToken::Index { .. } => "index",
            SqlToken::Remove { .. } => "remove",
            SqlToken::Projections { .. } => "projections",
            SqlToken::OrderBy { .. } => "order-by",
            SqlToken::Offset { .. } => "offset",
            SqlToken::RowCount { .. } => "row-count",
            SqlToken::GeneratedKeyColumn { .. } => "generated-key-column",
            SqlToken::InsertValues { .. } => "insert-values",
        }
    }

    pub fn start(&self) -> usize {
        match self {
            SqlToken::Table { span, .. }
            | SqlToken::Index { span, .. }
            | SqlToken::Remove { span }
            | SqlToken::Offset { span, .. }
            | SqlToken::RowCount { span, .. }
            | SqlToken::InsertValues { span, .. } => span.start,
            SqlToken::Projections { at, .. }
            | SqlToken::OrderBy { at, .. }
            | SqlToken::GeneratedKeyColumn { at, .. } => *at,
        }
    }

    /// Exclusive end; equal to `start` for insertions.
    pub fn stop(&self) -> usize {
        match self {
            SqlToken::Table { span, .. }
            | SqlToken::Index { span, .. }
            | SqlToken::Remove { span }
            | SqlToken::Offset { span, .. }
            | SqlToken::RowCount { span, .. }
            | SqlToken::InsertValues { span, .. } => span.end,
            SqlToken::Projections { at, .. }
            | SqlToken::OrderBy { at, .. }
            | SqlToken::GeneratedKeyColumn { at, .. } => *at,
        }
    }

    fn error(&self, reason: impl Into<String>) -> ShardingError {
        ShardingError::Rewrite {
            token: self.kind(),
            start: self.start(),
            stop: self.stop(),
            reason: reason.into(),
        }
    }

    /// Text replacing `[start, stop)` for one execution unit.
    pub fn render(&self, ctx: &RenderContext<'_>) -> Result<String> {
        match self {
            SqlToken::Table {
                logic_table, ident, ..
            } => Ok(match ctx.mapping.actual(logic_table) {
                Some(actual) => ident.render(actual),
                None => ident.render(&ident.value),
            }),
            SqlToken::Index {
                logic_table, ident, ..
            } => Ok(match ctx.mapping.actual(logic_table) {
                Some(actual) => ident.render(&format!("{}_{actual}", ident.value)),
                None => ident.render(&ident.value),
            }),
            SqlToken::Remove { .. } => Ok(String::new()),
            SqlToken::Projections { items, .. } => Ok(items
                .iter()
                .map(|item| format!(", {} AS {}", item.expression.render(ctx.mapping), item.alias))
                .collect()),
            SqlToken::OrderBy { items, .. } => {
                let items: Vec<String> = items.iter().map(|item| item.render(ctx.mapping)).collect();
                Ok(format!(" ORDER BY {}", items.join(", ")))
            }
            SqlToken::Offset { value, .. } | SqlToken::RowCount { value, .. } => Ok(value.to_string()),
            SqlToken::GeneratedKeyColumn { column, .. } => Ok(format!(", {column}")),
            SqlToken::InsertValues { rows, .. } => self.render_rows(rows, ctx),
        }
    }

    fn render_rows(&self, rows: &[InsertValueRow], ctx: &RenderContext<'_>) -> Result<String> {
        let selected: Vec<&InsertValueRow> = match ctx.insert_rows {
            Some(indexes) => indexes
                .iter()
                .map(|&row| {
                    rows.get(row)
                        .ok_or_else(|| self.error(format!("row {row} does not exist")))
                })
                .collect::<Result<_>>()?,
            None => rows.iter().collect(),
        };
        if selected.is_empty() {
            return Err(self.error(format!(
                "no rows route to data source `{}`",
                ctx.data_source
            )));
        }

        let mut out = String::new();
        // Position of the next marker in this unit's parameter list.
        let mut position = 0usize;
        for (i, row) in selected.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let mut cursor = row.span.start;
            for param in &row.params {
                out.push_str(slice(ctx.sql, cursor, param.span.start).map_err(|r| self.error(r))?);
                position += 1;
                if param.numbered {
                    out.push_str(&format!("${position}"));
                } else {
                    out.push('?');
                }
                cursor = param.span.end;
            }
            match &row.generated_key {
                Some(key) => {
                    let body = slice(ctx.sql, cursor, row.span.end.saturating_sub(1))
                        .map_err(|r| self.error(r))?;
                    out.push_str(body);
                    out.push_str(", ");
                    out.push_str(&key.to_sql_literal());
                    out.push(')');
                }
                None => {
                    out.push_str(slice(ctx.sql, cursor, row.span.end).map_err(|r| self.error(r))?)
                }
            }
        }
        Ok(out)
    }
}

fn slice(sql: &str, start: usize, end: usize) -> std::result::Result<&str, String> {
    sql.get(start..end)
        .ok_or_else(|| format!("span [{start}, {end}) is outside the statement"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(value: &str, quote: Option<char>, start: usize) -> Ident {
        let width = value.len() + if quote.is_some() { 2 } else { 0 };
        Ident {
            value: value.to_string(),
            quote,
            span: Span::new(start, start + width),
        }
    }

    #[test]
    fn table_token_keeps_quoting_and_falls_back_to_logical_name() {
        let token = SqlToken::Table {
            span: Span::new(14, 23),
            logic_table: "t_order".to_string(),
            ident: ident("t_order", Some('`'), 14),
        };
        let mapping = TableMapping::single("t_order", "t_order_3");
        let ctx = RenderContext {
            sql: "SELECT * FROM `t_order`",
            data_source: "ds_1",
            mapping: &mapping,
            insert_rows: None,
        };
        assert_eq!(token.render(&ctx).expect("render"), "`t_order_3`");

        let empty = TableMapping::new();
        let ctx = RenderContext {
            mapping: &empty,
            ..ctx
        };
        assert_eq!(token.render(&ctx).expect("render"), "`t_order`");
    }

    #[test]
    fn index_token_appends_physical_table() {
        let token = SqlToken::Index {
            span: Span::new(13, 23),
            logic_table: "t_order".to_string(),
            ident: ident("idx_status", None, 13),
        };
        let mapping = TableMapping::single("t_order", "t_order_0");
        let ctx = RenderContext {
            sql: "CREATE INDEX idx_status ON t_order (status)",
            data_source: "ds_0",
            mapping: &mapping,
            insert_rows: None,
        };
        assert_eq!(token.render(&ctx).expect("render"), "idx_status_t_order_0");
    }

    #[test]
    fn insert_rows_are_filtered_and_renumbered() {
        let sql = "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)";
        let row = |start: usize| InsertValueRow {
            span: Span::new(start, start + 8),
            params: vec![
                RowParam {
                    index: 0,
                    span: Span::new(start + 1, start + 3),
                    numbered: true,
                },
                RowParam {
                    index: 1,
                    span: Span::new(start + 5, start + 7),
                    numbered: true,
                },
            ],
            generated_key: Some(SqlValue::Int(42)),
        };
        let token = SqlToken::InsertValues {
            span: Span::new(28, 46),
            rows: vec![row(28), row(38)],
        };
        let mapping = TableMapping::new();
        let ctx = RenderContext {
            sql,
            data_source: "ds_0",
            mapping: &mapping,
            insert_rows: Some(&[1]),
        };
        assert_eq!(token.render(&ctx).expect("render"), "($1, $2, 42)");

        let ctx = RenderContext {
            insert_rows: Some(&[]),
            ..ctx
        };
        let err = token.render(&ctx).expect_err("no rows");
        assert!(err.to_string().starts_with("cannot render insert-values token at [28, 46)"));
    }
}
