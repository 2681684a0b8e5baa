//! Lowers `sqlparser` statements into the routing view in [`super::ast`].
//!
//! Single-level statements only: subqueries, derived tables, common table
//! expressions and set operations are unsupported. Identifier, literal and
//! parameter positions come from the parser's spans; clause boundaries
//! (projection items, ORDER BY and GROUP BY items, VALUES rows) are located
//! on the token stream of the same text.

use sqlparser::ast as sql;
use sqlparser::ast::{
    AssignmentTarget, BinaryOperator, Distinct, DuplicateTreatment, FromTable, FunctionArg,
    FunctionArgExpr, FunctionArguments, GroupByExpr, JoinConstraint, JoinOperator, LimitClause,
    ObjectName, ObjectType, OrderByKind, SelectItem, SetExpr, ShowCreateObject,
    ShowStatementFilter, ShowStatementFilterPosition, TableFactor, TableObject, TableWithJoins,
    UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::{Result, ShardingError};
use crate::value::SqlValue;

use super::ast::{
    AggregateFunc, Assignment, BinaryOp, ColumnRef, DalStatement, DdlKind, DdlStatement,
    DeleteStatement, Expr, Ident, InsertRow, InsertStatement, Limit, LimitKind, LimitValue,
    NullsOrder, OrderDirection, OrderItem, OrderKey, Projection, ProjectionKind, SelectStatement,
    Span, Statement, TableRef, TclStatement, UnaryOp, UpdateStatement,
};
use super::source::SourceText;

const PROJECTION_END: &[Keyword] = &[
    Keyword::FROM,
    Keyword::WHERE,
    Keyword::GROUP,
    Keyword::HAVING,
    Keyword::WINDOW,
    Keyword::QUALIFY,
    Keyword::ORDER,
    Keyword::LIMIT,
    Keyword::OFFSET,
    Keyword::FETCH,
    Keyword::FOR,
    Keyword::INTO,
    Keyword::UNION,
    Keyword::EXCEPT,
    Keyword::INTERSECT,
];

const GROUP_BY_END: &[Keyword] = &[
    Keyword::HAVING,
    Keyword::WINDOW,
    Keyword::QUALIFY,
    Keyword::ORDER,
    Keyword::LIMIT,
    Keyword::OFFSET,
    Keyword::FETCH,
    Keyword::FOR,
];

const ORDER_BY_END: &[Keyword] = &[Keyword::LIMIT, Keyword::OFFSET, Keyword::FETCH, Keyword::FOR];

/// Parses `text` into a statement tree and reports the number of parameters
/// the statement expects.
pub(crate) fn parse_statement(text: &str) -> Result<(Statement, usize)> {
    let dialect = GenericDialect {};
    let source = SourceText::tokenize(&dialect, text)?;
    let mut statements =
        Parser::parse_sql(&dialect, text).map_err(|err| source.parse_error(err))?;
    let statement = match statements.len() {
        1 => statements.remove(0),
        0 => {
            return Err(ShardingError::Parse {
                position: 0,
                message: "empty statement".to_string(),
            })
        }
        count => {
            return Err(ShardingError::Unsupported(format!(
                "{count} statements in one request"
            )))
        }
    };
    let lowered = Lowering { source: &source }.statement(&statement)?;
    Ok((lowered, source.parameter_count()))
}

struct Lowering<'s, 'a> {
    source: &'s SourceText<'a>,
}

impl Lowering<'_, '_> {
    fn statement(&self, statement: &sql::Statement) -> Result<Statement> {
        match statement {
            sql::Statement::Query(query) => Ok(Statement::Select(self.select(query)?)),
            sql::Statement::Insert(insert) => Ok(Statement::Insert(self.insert(insert)?)),
            sql::Statement::Update {
                table,
                assignments,
                from,
                selection,
                ..
            } => {
                if from.is_some() {
                    return Err(ShardingError::Unsupported("UPDATE ... FROM".to_string()));
                }
                Ok(Statement::Update(UpdateStatement {
                    table: self.single_table(table, "UPDATE")?,
                    assignments: assignments
                        .iter()
                        .map(|assignment| self.assignment(assignment))
                        .collect::<Result<_>>()?,
                    selection: self.optional_expr(selection.as_ref())?,
                }))
            }
            sql::Statement::Delete(delete) => {
                if !delete.order_by.is_empty() || delete.limit.is_some() {
                    return Err(ShardingError::Unsupported(
                        "DELETE with ORDER BY or LIMIT".to_string(),
                    ));
                }
                let tables = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => {
                        tables
                    }
                };
                let [table] = tables.as_slice() else {
                    return Err(ShardingError::Unsupported(
                        "DELETE from more than one table".to_string(),
                    ));
                };
                Ok(Statement::Delete(DeleteStatement {
                    table: self.single_table(table, "DELETE")?,
                    selection: self.optional_expr(delete.selection.as_ref())?,
                }))
            }
            sql::Statement::CreateTable(create) => Ok(ddl(
                DdlKind::CreateTable,
                vec![self.table_name(&create.name, None)?],
                None,
            )),
            sql::Statement::CreateIndex(create) => {
                let index = match &create.name {
                    Some(name) => Some(self.object_leaf(name)?),
                    None => None,
                };
                Ok(ddl(
                    DdlKind::CreateIndex,
                    vec![self.table_name(&create.table_name, None)?],
                    index,
                ))
            }
            sql::Statement::AlterTable { name, .. } => Ok(ddl(
                DdlKind::AlterTable,
                vec![self.table_name(name, None)?],
                None,
            )),
            sql::Statement::Drop {
                object_type: ObjectType::Table,
                names,
                ..
            } => Ok(ddl(
                DdlKind::DropTable,
                names
                    .iter()
                    .map(|name| self.table_name(name, None))
                    .collect::<Result<_>>()?,
                None,
            )),
            sql::Statement::Drop {
                object_type: ObjectType::Index,
                names,
                table,
                ..
            } => {
                let [index] = names.as_slice() else {
                    return Err(ShardingError::Unsupported(
                        "DROP INDEX with more than one index".to_string(),
                    ));
                };
                let tables = match table {
                    Some(table) => vec![self.table_name(table, None)?],
                    None => Vec::new(),
                };
                Ok(ddl(DdlKind::DropIndex, tables, Some(self.object_leaf(index)?)))
            }
            sql::Statement::Truncate { table_names, .. } => Ok(ddl(
                DdlKind::TruncateTable,
                table_names
                    .iter()
                    .map(|target| self.table_name(&target.name, None))
                    .collect::<Result<_>>()?,
                None,
            )),
            sql::Statement::ShowTables { show_options, .. } => {
                let like = match &show_options.filter_position {
                    Some(ShowStatementFilterPosition::Infix(ShowStatementFilter::Like(pattern)))
                    | Some(ShowStatementFilterPosition::Suffix(ShowStatementFilter::Like(
                        pattern,
                    ))) => Some(pattern.clone()),
                    _ => None,
                };
                Ok(Statement::Dal(DalStatement::ShowTables { like }))
            }
            sql::Statement::ShowCreate {
                obj_type: ShowCreateObject::Table,
                obj_name,
                ..
            } => Ok(Statement::Dal(DalStatement::ShowCreateTable(
                self.table_name(obj_name, None)?,
            ))),
            sql::Statement::ExplainTable { table_name, .. } => Ok(Statement::Dal(
                DalStatement::Describe(self.table_name(table_name, None)?),
            )),
            sql::Statement::ShowColumns { show_options, .. } => {
                let name = show_options
                    .show_in
                    .as_ref()
                    .and_then(|show_in| show_in.parent_name.as_ref())
                    .ok_or_else(|| {
                        ShardingError::Unsupported("SHOW COLUMNS without a table".to_string())
                    })?;
                Ok(Statement::Dal(DalStatement::Describe(
                    self.table_name(name, None)?,
                )))
            }
            sql::Statement::ShowVariable { variable } => self.show_index(variable),
            sql::Statement::Set(_) => Ok(Statement::Dal(DalStatement::Set)),
            sql::Statement::StartTransaction { .. } => Ok(Statement::Tcl(TclStatement::Begin)),
            sql::Statement::Commit { .. } => Ok(Statement::Tcl(TclStatement::Commit)),
            sql::Statement::Rollback { .. } => Ok(Statement::Tcl(TclStatement::Rollback)),
            _ => Err(ShardingError::Unsupported(format!(
                "statement starting with `{}`",
                self.source.leading_word()
            ))),
        }
    }

    // ---- SELECT ----

    fn select(&self, query: &sql::Query) -> Result<SelectStatement> {
        if query.with.is_some() {
            return Err(ShardingError::Unsupported(
                "common table expressions".to_string(),
            ));
        }
        if query.fetch.is_some() {
            return Err(ShardingError::Unsupported("FETCH clauses".to_string()));
        }
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            SetExpr::SetOperation { .. } => {
                return Err(ShardingError::Unsupported("set operations".to_string()))
            }
            _ => return Err(ShardingError::Unsupported("nested queries".to_string())),
        };
        let distinct = match &select.distinct {
            None => false,
            Some(Distinct::On(_)) => {
                return Err(ShardingError::Unsupported("DISTINCT ON".to_string()))
            }
            Some(distinct) => matches!(distinct, Distinct::Distinct),
        };

        let mut from = Vec::new();
        let mut join_conditions = Vec::new();
        for table in &select.from {
            from.push(self.table_factor(&table.relation)?);
            for join in &table.joins {
                from.push(self.table_factor(&join.relation)?);
                if let Some(JoinConstraint::On(on)) = join_constraint(&join.join_operator) {
                    join_conditions.push(self.expr(on)?);
                }
            }
        }

        let source = self.source;
        let select_at = source
            .find_top_level(0, |index| source.is_keyword(index, Keyword::SELECT))
            .ok_or_else(|| self.missing("SELECT keyword"))?;
        let mut first = select_at + 1;
        if source.is_keyword(first, Keyword::DISTINCT) || source.is_keyword(first, Keyword::ALL) {
            first += 1;
        }
        let list_end = source
            .find_top_level(first, |index| {
                source.is_any_keyword(index, PROJECTION_END)
                    || source.is_token(index, &Token::SemiColon)
            })
            .unwrap_or(source.tokens().len());
        let items = source.split_items(first, list_end);
        if items.len() != select.projection.len() {
            return Err(self.missing("projection items"));
        }
        let projections = select
            .projection
            .iter()
            .zip(items)
            .map(|(item, range)| self.projection(item, range))
            .collect::<Result<Vec<_>>>()?;
        let projections_end = source.end_before(Some(list_end));

        let group_by = match &select.group_by {
            GroupByExpr::Expressions(exprs, modifiers) => {
                if !modifiers.is_empty() {
                    return Err(ShardingError::Unsupported("GROUP BY modifiers".to_string()));
                }
                let items = self.clause_items(list_end, Keyword::GROUP, GROUP_BY_END, exprs.len())?;
                exprs
                    .iter()
                    .zip(items)
                    .map(|(expr, range)| self.order_item(expr, None, None, range))
                    .collect::<Result<Vec<_>>>()?
            }
            GroupByExpr::All(_) => {
                return Err(ShardingError::Unsupported("GROUP BY ALL".to_string()))
            }
        };

        let order_at = source.find_clause(list_end, Keyword::ORDER);
        let order_by = match &query.order_by {
            None => Vec::new(),
            Some(order_by) => {
                let OrderByKind::Expressions(exprs) = &order_by.kind else {
                    return Err(ShardingError::Unsupported("ORDER BY ALL".to_string()));
                };
                let items = self.clause_items(list_end, Keyword::ORDER, ORDER_BY_END, exprs.len())?;
                exprs
                    .iter()
                    .zip(items)
                    .map(|(expr, range)| {
                        let direction = match expr.options.asc {
                            Some(false) => OrderDirection::Desc,
                            _ => OrderDirection::Asc,
                        };
                        let nulls = expr.options.nulls_first.map(|first| {
                            if first {
                                NullsOrder::First
                            } else {
                                NullsOrder::Last
                            }
                        });
                        self.order_item(&expr.expr, Some(direction), nulls, range)
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };
        let insert_before = order_at.or_else(|| {
            source.find_top_level(list_end, |index| {
                source.is_any_keyword(index, ORDER_BY_END)
                    || source.is_token(index, &Token::SemiColon)
            })
        });

        Ok(SelectStatement {
            distinct,
            projections,
            projections_end,
            from,
            join_conditions,
            selection: self.optional_expr(select.selection.as_ref())?,
            group_by,
            having: self.optional_expr(select.having.as_ref())?,
            order_by,
            limit: self.limit(query.limit_clause.as_ref())?,
            order_by_insert_at: source.end_before(insert_before),
        })
    }

    fn projection(&self, item: &SelectItem, (start, end): (usize, usize)) -> Result<Projection> {
        let source = self.source;
        match item {
            SelectItem::Wildcard(_) => {
                let span = source.range_span(start, end);
                Ok(Projection {
                    kind: ProjectionKind::Wildcard { owner: None },
                    alias: None,
                    span,
                    text: span.slice(source.sql()).to_string(),
                })
            }
            SelectItem::QualifiedWildcard(..) => {
                let owner = end
                    .checked_sub(3)
                    .filter(|&at| at >= start)
                    .and_then(|at| match &source.tokens()[at].token {
                        Token::Word(word) => Some(Ident {
                            value: word.value.clone(),
                            quote: word.quote_style,
                            span: source.tokens()[at].span,
                        }),
                        _ => None,
                    })
                    .ok_or_else(|| self.missing("wildcard qualifier"))?;
                let span = source.range_span(start, end);
                Ok(Projection {
                    kind: ProjectionKind::Wildcard { owner: Some(owner) },
                    alias: None,
                    span,
                    text: span.slice(source.sql()).to_string(),
                })
            }
            SelectItem::UnnamedExpr(expr) => self.expression_projection(expr, None, start, end),
            SelectItem::ExprWithAlias { expr, alias } => {
                let alias_span = source.located(alias.span, "alias")?;
                let mut expr_end = source
                    .position(alias_span.start)
                    .filter(|&at| at > start && at < end)
                    .ok_or_else(|| self.missing("projection alias"))?;
                if expr_end - start > 1 && source.is_keyword(expr_end - 1, Keyword::AS) {
                    expr_end -= 1;
                }
                self.expression_projection(expr, Some(alias.value.clone()), start, expr_end)
            }
        }
    }

    fn expression_projection(
        &self,
        expr: &sql::Expr,
        alias: Option<String>,
        start: usize,
        end: usize,
    ) -> Result<Projection> {
        let span = self.source.range_span(start, end);
        let text = span.slice(self.source.sql()).to_string();
        let kind = match self.expr(expr)? {
            Expr::Column(column) => ProjectionKind::Column(column),
            Expr::Function {
                name,
                args,
                distinct,
                star,
            } => match AggregateFunc::from_name(&name) {
                Some(func) => ProjectionKind::Aggregate {
                    func,
                    distinct,
                    arg: aggregate_argument_text(&text, distinct),
                    args,
                },
                None => ProjectionKind::Expression(Expr::Function {
                    name,
                    args,
                    distinct,
                    star,
                }),
            },
            other => ProjectionKind::Expression(other),
        };
        Ok(Projection {
            kind,
            alias,
            span,
            text,
        })
    }

    /// Token ranges of the items of the `keyword BY` clause after `from`.
    fn clause_items(
        &self,
        from: usize,
        keyword: Keyword,
        terminators: &[Keyword],
        expected: usize,
    ) -> Result<Vec<(usize, usize)>> {
        if expected == 0 {
            return Ok(Vec::new());
        }
        let source = self.source;
        let clause = source
            .find_clause(from, keyword)
            .ok_or_else(|| self.missing("clause keyword"))?;
        let end = source
            .find_top_level(clause + 2, |index| {
                source.is_any_keyword(index, terminators)
                    || source.is_token(index, &Token::SemiColon)
            })
            .unwrap_or(source.tokens().len());
        let items = source.split_items(clause + 2, end);
        if items.len() != expected {
            return Err(self.missing("clause items"));
        }
        Ok(items)
    }

    fn order_item(
        &self,
        expr: &sql::Expr,
        direction: Option<OrderDirection>,
        nulls: Option<NullsOrder>,
        (start, mut end): (usize, usize),
    ) -> Result<OrderItem> {
        let source = self.source;
        if nulls.is_some() && end - start > 2 && source.is_keyword(end - 2, Keyword::NULLS) {
            end -= 2;
        }
        if end - start > 1 && source.is_any_keyword(end - 1, &[Keyword::ASC, Keyword::DESC]) {
            end -= 1;
        }
        let span = source.range_span(start, end);
        let key = match self.expr(expr)? {
            Expr::Column(column) => OrderKey::Column(column),
            Expr::Literal(SqlValue::Int(position)) if position > 0 => {
                OrderKey::Position(position as usize)
            }
            other => OrderKey::Expression(other),
        };
        Ok(OrderItem {
            key,
            direction: direction.unwrap_or_default(),
            nulls,
            span,
            text: span.slice(source.sql()).to_string(),
        })
    }

    fn limit(&self, clause: Option<&LimitClause>) -> Result<Option<Limit>> {
        let Some(clause) = clause else {
            return Ok(None);
        };
        let limit = match clause {
            LimitClause::LimitOffset {
                limit,
                offset,
                limit_by,
            } => {
                if !limit_by.is_empty() {
                    return Err(ShardingError::Unsupported("LIMIT BY".to_string()));
                }
                Limit {
                    offset: match offset {
                        Some(offset) => Some(self.limit_value(&offset.value)?),
                        None => None,
                    },
                    row_count: match limit {
                        Some(limit) => Some(self.limit_value(limit)?),
                        None => None,
                    },
                }
            }
            LimitClause::OffsetCommaLimit { offset, limit } => Limit {
                offset: Some(self.limit_value(offset)?),
                row_count: Some(self.limit_value(limit)?),
            },
        };
        Ok(Some(limit))
    }

    fn limit_value(&self, expr: &sql::Expr) -> Result<LimitValue> {
        let sql::Expr::Value(value) = expr else {
            return Err(ShardingError::Unsupported(format!(
                "pagination expression `{expr}`"
            )));
        };
        let span = self.source.located(value.span, "pagination value")?;
        let kind = match &value.value {
            Value::Number(text, _) => text.parse().ok().map(LimitKind::Literal),
            Value::Placeholder(_) => Some(LimitKind::Param(self.param_index(span)?)),
            _ => None,
        };
        let kind = kind.ok_or_else(|| ShardingError::Parse {
            position: span.start,
            message: "expected a non-negative integer or parameter marker".to_string(),
        })?;
        Ok(LimitValue { kind, span })
    }

    // ---- DML ----

    fn insert(&self, insert: &sql::Insert) -> Result<InsertStatement> {
        let TableObject::TableName(name) = &insert.table else {
            return Err(ShardingError::Unsupported(
                "INSERT into a table function".to_string(),
            ));
        };
        if insert.on.is_some() {
            return Err(ShardingError::Unsupported(
                "INSERT ... ON DUPLICATE KEY UPDATE".to_string(),
            ));
        }
        let Some(query) = &insert.source else {
            return Err(ShardingError::Unsupported("INSERT ... SET".to_string()));
        };
        let SetExpr::Values(values) = query.body.as_ref() else {
            return Err(ShardingError::Unsupported("INSERT ... SELECT".to_string()));
        };
        let table = self.table_name(name, None)?;
        let columns = insert
            .columns
            .iter()
            .map(|column| self.source.ident(column))
            .collect::<Result<Vec<_>>>()?;

        let source = self.source;
        let tokens = source.tokens();
        let after_table = source
            .position(table.name.span.start)
            .ok_or_else(|| self.missing("INSERT table"))?;
        let mut columns_close = None;
        let mut search_from = after_table + 1;
        if let Some(last) = columns.last() {
            let last_at = source
                .position(last.span.start)
                .ok_or_else(|| self.missing("INSERT column"))?;
            let close = source
                .find_top_level(last_at, |index| tokens[index].token == Token::RParen)
                .ok_or_else(|| self.missing("column list"))?;
            columns_close = Some(tokens[close].span.start);
            search_from = close + 1;
        }
        let values_at = source
            .find_top_level(search_from, |index| {
                source.is_any_keyword(index, &[Keyword::VALUES, Keyword::VALUE])
            })
            .ok_or_else(|| self.missing("VALUES keyword"))?;

        let mut rows = Vec::with_capacity(values.rows.len());
        let mut next = values_at + 1;
        for row in &values.rows {
            let open = source
                .find_top_level(next, |index| tokens[index].token == Token::LParen)
                .ok_or_else(|| self.missing("VALUES row"))?;
            let close = source
                .find_top_level(open + 1, |index| tokens[index].token == Token::RParen)
                .ok_or_else(|| self.missing("VALUES row"))?;
            let span = Span::new(tokens[open].span.start, tokens[close].span.end);
            next = close + 1;

            if !columns.is_empty() && row.len() != columns.len() {
                return Err(ShardingError::Parse {
                    position: span.start,
                    message: format!(
                        "row has {} values but {} columns were listed",
                        row.len(),
                        columns.len()
                    ),
                });
            }
            let values = row
                .iter()
                .map(|value| self.expr(value))
                .collect::<Result<Vec<_>>>()?;
            let mut params = Vec::new();
            for value in &values {
                value.collect_params(&mut params);
            }
            rows.push(InsertRow {
                values,
                span,
                params,
            });
        }

        let values_span = Span::new(
            rows.first().map(|row| row.span.start).unwrap_or_default(),
            rows.last().map(|row| row.span.end).unwrap_or_default(),
        );
        Ok(InsertStatement {
            table,
            columns,
            columns_close,
            rows,
            values_span,
        })
    }

    fn assignment(&self, assignment: &sql::Assignment) -> Result<Assignment> {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(ShardingError::Unsupported(
                "tuple assignments in UPDATE".to_string(),
            ));
        };
        let parts = object_parts(name)?;
        Ok(Assignment {
            column: self.column(&parts)?,
            value: self.expr(&assignment.value)?,
        })
    }

    fn show_index(&self, words: &[sql::Ident]) -> Result<Statement> {
        let is_one_of = |ident: &sql::Ident, candidates: &[&str]| {
            ident.quote_style.is_none()
                && candidates
                    .iter()
                    .any(|candidate| ident.value.eq_ignore_ascii_case(candidate))
        };
        let (table, schema) = match words {
            [kind, from, rest @ ..]
                if is_one_of(kind, &["INDEX", "INDEXES", "KEYS"])
                    && is_one_of(from, &["FROM", "IN"]) =>
            {
                match rest {
                    [table] => (table, None),
                    [schema, table] => (table, Some(schema)),
                    _ => return Err(ShardingError::Unsupported("SHOW INDEX target".to_string())),
                }
            }
            _ => return Err(ShardingError::Unsupported("SHOW variant".to_string())),
        };
        Ok(Statement::Dal(DalStatement::ShowIndex(TableRef {
            name: self.source.ident(table)?,
            schema: schema.map(|schema| self.source.ident(schema)).transpose()?,
            alias: None,
        })))
    }

    // ---- tables ----

    fn single_table(&self, table: &TableWithJoins, statement: &str) -> Result<TableRef> {
        if !table.joins.is_empty() {
            return Err(ShardingError::Unsupported(format!("joins in {statement}")));
        }
        self.table_factor(&table.relation)
    }

    fn table_factor(&self, factor: &TableFactor) -> Result<TableRef> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                self.table_name(name, alias.as_ref().map(|alias| alias.name.value.clone()))
            }
            TableFactor::Derived { .. } => {
                Err(ShardingError::Unsupported("derived tables".to_string()))
            }
            _ => Err(ShardingError::Unsupported(format!("table factor `{factor}`"))),
        }
    }

    fn table_name(&self, name: &ObjectName, alias: Option<String>) -> Result<TableRef> {
        let parts = object_parts(name)?;
        let (schema, table) = match parts.as_slice() {
            [table] => (None, *table),
            [schema, table] => (Some(*schema), *table),
            _ => {
                return Err(ShardingError::Unsupported(format!(
                    "table name `{name}` with more than one qualifier"
                )))
            }
        };
        Ok(TableRef {
            name: self.source.ident(table)?,
            schema: schema.map(|schema| self.source.ident(schema)).transpose()?,
            alias,
        })
    }

    fn object_leaf(&self, name: &ObjectName) -> Result<Ident> {
        let parts = object_parts(name)?;
        let leaf = parts
            .last()
            .ok_or_else(|| ShardingError::Unsupported(format!("object name `{name}`")))?;
        self.source.ident(leaf)
    }

    // ---- expressions ----

    fn optional_expr(&self, expr: Option<&sql::Expr>) -> Result<Option<Expr>> {
        expr.map(|expr| self.expr(expr)).transpose()
    }

    fn expr(&self, expr: &sql::Expr) -> Result<Expr> {
        Ok(match expr {
            sql::Expr::Identifier(ident) => Expr::Column(self.column(&[ident])?),
            sql::Expr::CompoundIdentifier(idents) => {
                let parts: Vec<&sql::Ident> = idents.iter().collect();
                Expr::Column(self.column(&parts)?)
            }
            sql::Expr::Value(value) => self.value(value)?,
            sql::Expr::BinaryOp { left, op, right } => Expr::Binary {
                left: Box::new(self.expr(left)?),
                op: binary_op(op)?,
                right: Box::new(self.expr(right)?),
            },
            sql::Expr::UnaryOp { op, expr } => match op {
                UnaryOperator::Not => Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(self.expr(expr)?),
                },
                UnaryOperator::Minus => match self.expr(expr)? {
                    Expr::Literal(SqlValue::Int(value)) => Expr::Literal(SqlValue::Int(-value)),
                    Expr::Literal(SqlValue::Float(value)) => {
                        Expr::Literal(SqlValue::Float(-value))
                    }
                    other => Expr::Unary {
                        op: UnaryOp::Minus,
                        expr: Box::new(other),
                    },
                },
                UnaryOperator::Plus => self.expr(expr)?,
                other => {
                    return Err(ShardingError::Unsupported(format!("operator `{other}`")));
                }
            },
            sql::Expr::Nested(inner) => Expr::Nested(Box::new(self.expr(inner)?)),
            sql::Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(self.expr(expr)?),
                list: list
                    .iter()
                    .map(|item| self.expr(item))
                    .collect::<Result<_>>()?,
                negated: *negated,
            },
            sql::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => Expr::Between {
                expr: Box::new(self.expr(expr)?),
                low: Box::new(self.expr(low)?),
                high: Box::new(self.expr(high)?),
                negated: *negated,
            },
            sql::Expr::IsNull(inner) => Expr::IsNull {
                expr: Box::new(self.expr(inner)?),
                negated: false,
            },
            sql::Expr::IsNotNull(inner) => Expr::IsNull {
                expr: Box::new(self.expr(inner)?),
                negated: true,
            },
            sql::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => Expr::Like {
                expr: Box::new(self.expr(expr)?),
                pattern: Box::new(self.expr(pattern)?),
                negated: *negated,
            },
            sql::Expr::Function(function) => self.function(function)?,
            sql::Expr::Cast { expr, .. } => Expr::Function {
                name: "CAST".to_string(),
                args: vec![self.expr(expr)?],
                distinct: false,
                star: false,
            },
            sql::Expr::InSubquery { .. } | sql::Expr::Subquery(_) | sql::Expr::Exists { .. } => {
                return Err(ShardingError::Unsupported("subqueries".to_string()));
            }
            other => {
                return Err(ShardingError::Unsupported(format!("expression `{other}`")));
            }
        })
    }

    fn column(&self, parts: &[&sql::Ident]) -> Result<ColumnRef> {
        match parts {
            [name] => Ok(ColumnRef {
                owner: None,
                name: name.value.clone(),
                span: self.source.ident(name)?.span,
            }),
            [owner, name] => {
                let owner = self.source.ident(owner)?;
                let end = self.source.ident(name)?.span.end;
                Ok(ColumnRef {
                    span: Span::new(owner.span.start, end),
                    owner: Some(owner),
                    name: name.value.clone(),
                })
            }
            _ => Err(ShardingError::Unsupported(
                "column references with more than one qualifier".to_string(),
            )),
        }
    }

    fn value(&self, value: &ValueWithSpan) -> Result<Expr> {
        let literal = match &value.value {
            Value::Number(text, _) => number(text)?,
            Value::SingleQuotedString(text) | Value::DoubleQuotedString(text) => {
                SqlValue::Text(text.clone())
            }
            Value::Boolean(flag) => SqlValue::Bool(*flag),
            Value::Null => SqlValue::Null,
            Value::Placeholder(_) => {
                let span = self.source.located(value.span, "parameter marker")?;
                return Ok(Expr::Param {
                    index: self.param_index(span)?,
                    span,
                });
            }
            other => return Err(ShardingError::Unsupported(format!("literal `{other}`"))),
        };
        Ok(Expr::Literal(literal))
    }

    fn function(&self, function: &sql::Function) -> Result<Expr> {
        if function.over.is_some() {
            return Err(ShardingError::Unsupported("window functions".to_string()));
        }
        let mut args = Vec::new();
        let mut distinct = false;
        let mut star = false;
        match &function.args {
            FunctionArguments::None => {}
            FunctionArguments::Subquery(_) => {
                return Err(ShardingError::Unsupported("subqueries".to_string()));
            }
            FunctionArguments::List(list) => {
                distinct = matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct));
                for arg in &list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
                            args.push(self.expr(expr)?)
                        }
                        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => star = true,
                        other => {
                            return Err(ShardingError::Unsupported(format!(
                                "function argument `{other}`"
                            )));
                        }
                    }
                }
            }
        }
        Ok(Expr::Function {
            name: function.name.to_string(),
            args,
            distinct,
            star,
        })
    }

    fn param_index(&self, span: Span) -> Result<usize> {
        self.source
            .param_index(span.start)
            .ok_or_else(|| ShardingError::Parse {
                position: span.start,
                message: "unrecognized parameter marker".to_string(),
            })
    }

    fn missing(&self, what: &str) -> ShardingError {
        ShardingError::Unsupported(format!(
            "cannot locate {what} in `{}`",
            self.source.sql()
        ))
    }
}

fn ddl(kind: DdlKind, tables: Vec<TableRef>, index: Option<Ident>) -> Statement {
    Statement::Ddl(DdlStatement {
        kind,
        tables,
        index,
    })
}

fn object_parts(name: &ObjectName) -> Result<Vec<&sql::Ident>> {
    name.0
        .iter()
        .map(|part| {
            part.as_ident()
                .ok_or_else(|| ShardingError::Unsupported(format!("object name `{name}`")))
        })
        .collect()
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => Some(constraint),
        _ => None,
    }
}

fn binary_op(op: &BinaryOperator) -> Result<BinaryOp> {
    Ok(match op {
        BinaryOperator::And => BinaryOp::And,
        BinaryOperator::Or => BinaryOp::Or,
        BinaryOperator::Eq => BinaryOp::Eq,
        BinaryOperator::NotEq => BinaryOp::NotEq,
        BinaryOperator::Lt => BinaryOp::Lt,
        BinaryOperator::LtEq => BinaryOp::LtEq,
        BinaryOperator::Gt => BinaryOp::Gt,
        BinaryOperator::GtEq => BinaryOp::GtEq,
        BinaryOperator::Plus => BinaryOp::Plus,
        BinaryOperator::Minus => BinaryOp::Minus,
        BinaryOperator::Multiply => BinaryOp::Multiply,
        BinaryOperator::Divide => BinaryOp::Divide,
        BinaryOperator::Modulo => BinaryOp::Modulo,
        BinaryOperator::StringConcat => BinaryOp::Concat,
        other => return Err(ShardingError::Unsupported(format!("operator `{other}`"))),
    })
}

fn number(text: &str) -> Result<SqlValue> {
    if let Ok(value) = text.parse::<i64>() {
        return Ok(SqlValue::Int(value));
    }
    text.parse::<f64>()
        .map(SqlValue::Float)
        .map_err(|_| ShardingError::Unsupported(format!("numeric literal `{text}`")))
}

/// Argument text of an aggregate call, e.g. `DISTINCT user_id` gives `user_id`.
fn aggregate_argument_text(text: &str, distinct: bool) -> String {
    let inner = match (text.find('('), text.rfind(')')) {
        (Some(open), Some(close)) if open < close => &text[open + 1..close],
        _ => text,
    };
    let inner = inner.trim();
    if distinct && inner.len() >= 8 && inner[..8].eq_ignore_ascii_case("DISTINCT") {
        inner[8..].trim().to_string()
    } else {
        inner.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(text: &str) -> SelectStatement {
        match parse_statement(text).expect("parse").0 {
            Statement::Select(select) => select,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn select_with_join_grouping_and_limit() {
        let text = "SELECT o.user_id, AVG(o.price) AS avg_price FROM db.t_order o \
                    JOIN t_order_item i ON o.order_id = i.order_id \
                    WHERE o.user_id IN (?, ?) GROUP BY o.user_id LIMIT ?, 10";
        let select = select(text);
        assert_eq!(select.projections.len(), 2);
        assert_eq!(select.projections[1].label(), "avg_price");
        assert_eq!(select.projections[1].text, "AVG(o.price)");
        assert!(matches!(
            select.projections[1].kind,
            ProjectionKind::Aggregate {
                func: AggregateFunc::Avg,
                ref arg,
                ..
            } if arg == "o.price"
        ));
        assert_eq!(select.from.len(), 2);
        assert_eq!(
            select.from[0].schema.as_ref().map(|s| s.value.as_str()),
            Some("db")
        );
        assert_eq!(select.from[0].alias.as_deref(), Some("o"));
        assert_eq!(select.join_conditions.len(), 1);
        assert_eq!(select.group_by.len(), 1);
        assert_eq!(select.group_by[0].text, "o.user_id");
        let limit = select.limit.expect("limit");
        assert_eq!(limit.offset.map(|v| v.kind), Some(LimitKind::Param(2)));
        assert_eq!(limit.row_count.map(|v| v.kind), Some(LimitKind::Literal(10)));
        assert_eq!(
            &text[select.order_by_insert_at..select.order_by_insert_at + 6],
            " LIMIT"
        );
    }

    #[test]
    fn projection_end_and_spans_point_into_original_text() {
        let text =
            "SELECT `order_id`, COUNT(*) FROM `t_order` ORDER BY order_id DESC NULLS LAST";
        let select = select(text);
        assert_eq!(&text[..select.projections_end], "SELECT `order_id`, COUNT(*)");
        assert_eq!(select.projections[1].label(), "COUNT(*)");
        assert_eq!(select.from[0].name.span.slice(text), "`t_order`");
        assert_eq!(select.from[0].name.quote, Some('`'));
        assert_eq!(select.order_by[0].direction, OrderDirection::Desc);
        assert_eq!(select.order_by[0].nulls, Some(NullsOrder::Last));
        assert_eq!(select.order_by[0].span.slice(text), "order_id");
        assert_eq!(select.order_by_insert_at, text.find(" ORDER").expect("order"));
    }

    #[test]
    fn spans_survive_comments_and_line_breaks() {
        let text = "SELECT  *  FROM\n   t_order WHERE order_id = ? -- tail";
        let select = select(text);
        assert_eq!(select.from[0].name.span.slice(text), "t_order");
        let mut params = Vec::new();
        select
            .selection
            .as_ref()
            .expect("where")
            .visit_params(&mut |index, span| params.push((index, span.slice(text).to_string())));
        assert_eq!(params, vec![(0, "?".to_string())]);
        assert_eq!(&text[..select.order_by_insert_at], "SELECT  *  FROM\n   t_order WHERE order_id = ?");
    }

    #[test]
    fn insert_rows_record_params_and_spans() {
        let text = "INSERT INTO t_order (user_id, status) VALUES (?, ?), (?, 'done')";
        let (statement, count) = parse_statement(text).expect("parse");
        assert_eq!(count, 3);
        let Statement::Insert(insert) = statement else {
            panic!("expected insert");
        };
        assert_eq!(insert.rows.len(), 2);
        assert_eq!(insert.rows[0].params, vec![0, 1]);
        assert_eq!(insert.rows[1].params, vec![2]);
        assert_eq!(insert.rows[1].span.slice(text), "(?, 'done')");
        assert_eq!(insert.values_span.slice(text), "(?, ?), (?, 'done')");
        assert_eq!(&text[insert.columns_close.expect("close")..][..1], ")");
    }

    #[test]
    fn numbered_markers_map_to_zero_based_indexes() {
        let (statement, count) =
            parse_statement("INSERT INTO t (a, b) VALUES ($2, $1)").expect("parse");
        assert_eq!(count, 2);
        let Statement::Insert(insert) = statement else {
            panic!("expected insert");
        };
        assert_eq!(insert.rows[0].params, vec![1, 0]);
    }

    #[test]
    fn postgres_offset_form() {
        let select = select("SELECT * FROM t_order LIMIT 2 OFFSET 3");
        let limit = select.limit.expect("limit");
        assert_eq!(limit.row_count.map(|v| v.kind), Some(LimitKind::Literal(2)));
        assert_eq!(limit.offset.map(|v| v.kind), Some(LimitKind::Literal(3)));
    }

    #[test]
    fn update_and_delete_keep_target_and_predicate() {
        let (statement, _) =
            parse_statement("UPDATE t_order SET status = 'x' WHERE order_id = 5").expect("parse");
        let Statement::Update(update) = statement else {
            panic!("expected update");
        };
        assert_eq!(update.table.logic_name(), "t_order");
        assert_eq!(update.assignments[0].column.name, "status");
        assert!(update.selection.is_some());

        let (statement, _) = parse_statement("DELETE FROM t_order o WHERE o.order_id = 5")
            .expect("parse");
        let Statement::Delete(delete) = statement else {
            panic!("expected delete");
        };
        assert_eq!(delete.table.alias.as_deref(), Some("o"));
    }

    #[test]
    fn ddl_dal_and_tcl_statements() {
        let (statement, _) =
            parse_statement("CREATE INDEX idx_status ON t_order (status)").expect("parse");
        let Statement::Ddl(ddl) = statement else {
            panic!("expected ddl");
        };
        assert_eq!(ddl.kind, DdlKind::CreateIndex);
        assert_eq!(ddl.index.map(|i| i.value), Some("idx_status".to_string()));

        let (statement, _) = parse_statement("DROP TABLE t_order, t_order_item").expect("parse");
        assert!(matches!(
            statement,
            Statement::Ddl(DdlStatement { kind: DdlKind::DropTable, ref tables, .. })
                if tables.len() == 2
        ));

        let (statement, _) = parse_statement("SHOW TABLES LIKE 't_%'").expect("parse");
        assert_eq!(
            statement,
            Statement::Dal(DalStatement::ShowTables {
                like: Some("t_%".to_string())
            })
        );
        let (statement, _) = parse_statement("DESCRIBE t_order").expect("parse");
        assert!(matches!(statement, Statement::Dal(DalStatement::Describe(_))));
        let (statement, _) = parse_statement("set autocommit = 1").expect("parse");
        assert_eq!(statement, Statement::Dal(DalStatement::Set));
        let (statement, _) = parse_statement("BEGIN").expect("parse");
        assert_eq!(statement, Statement::Tcl(TclStatement::Begin));
    }

    #[test]
    fn subqueries_are_unsupported() {
        let err = parse_statement("SELECT * FROM t WHERE id IN (SELECT id FROM u)")
            .expect_err("must fail");
        assert!(matches!(err, ShardingError::Unsupported(_)));
    }

    #[test]
    fn trailing_garbage_is_a_parse_error() {
        let err = parse_statement("SELECT a FROM t t2 t3").expect_err("must fail");
        assert!(matches!(err, ShardingError::Parse { .. }));
    }
}
