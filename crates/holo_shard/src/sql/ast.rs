//! Statement tree consumed by condition extraction, routing and rewriting.
//!
//! Nodes that the rewrite engine may replace keep the byte span they were
//! parsed from. Spans are half-open (`start..end`) offsets into the original
//! statement text.

use std::fmt;

use crate::value::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// Identifier as written, with the quote character if it was quoted.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub value: String,
    pub quote: Option<char>,
    /// Span including the quotes.
    pub span: Span,
}

impl Ident {
    /// Renders `name` using the same quoting as this identifier.
    pub fn render(&self, name: &str) -> String {
        match self.quote {
            Some(quote) => format!("{quote}{name}{quote}"),
            None => name.to_string(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.value.eq_ignore_ascii_case(name)
    }
}

/// A table reference in FROM/JOIN, INSERT INTO, UPDATE, DDL or DAL.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: Ident,
    /// Schema qualifier; removed when the statement is rewritten.
    pub schema: Option<Ident>,
    pub alias: Option<String>,
}

impl TableRef {
    /// Lowercased logical table name.
    pub fn logic_name(&self) -> String {
        self.name.value.to_ascii_lowercase()
    }

    /// Returns `true` when `qualifier` refers to this table by alias or by name.
    pub fn is_referenced_by(&self, qualifier: &str) -> bool {
        match &self.alias {
            Some(alias) => alias.eq_ignore_ascii_case(qualifier),
            None => self.name.matches(qualifier),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub owner: Option<Ident>,
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

impl BinaryOp {
    /// Operator with swapped operands (`a < b` is `b > a`).
    pub fn flipped(self) -> BinaryOp {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtEq => BinaryOp::GtEq,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtEq => BinaryOp::LtEq,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
    Plus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(SqlValue),
    Param {
        index: usize,
        span: Span,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
        star: bool,
    },
    Nested(Box<Expr>),
}

impl Expr {
    /// Calls `f` for every column reference in the tree.
    pub fn visit_columns<'a>(&'a self, f: &mut dyn FnMut(&'a ColumnRef)) {
        match self {
            Expr::Column(column) => f(column),
            Expr::Literal(_) | Expr::Param { .. } => {}
            Expr::Binary { left, right, .. } => {
                left.visit_columns(f);
                right.visit_columns(f);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Nested(expr) => {
                expr.visit_columns(f)
            }
            Expr::InList { expr, list, .. } => {
                expr.visit_columns(f);
                for item in list {
                    item.visit_columns(f);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.visit_columns(f);
                low.visit_columns(f);
                high.visit_columns(f);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.visit_columns(f);
                pattern.visit_columns(f);
            }
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.visit_columns(f);
                }
            }
        }
    }

    /// Calls `f` with the index and span of every parameter marker, in textual order.
    pub fn visit_params(&self, f: &mut dyn FnMut(usize, Span)) {
        match self {
            Expr::Param { index, span } => f(*index, *span),
            Expr::Column(_) | Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.visit_params(f);
                right.visit_params(f);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } | Expr::Nested(expr) => {
                expr.visit_params(f)
            }
            Expr::InList { expr, list, .. } => {
                expr.visit_params(f);
                for item in list {
                    item.visit_params(f);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.visit_params(f);
                low.visit_params(f);
                high.visit_params(f);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.visit_params(f);
                pattern.visit_params(f);
            }
            Expr::Function { args, .. } => {
                for arg in args {
                    arg.visit_params(f);
                }
            }
        }
    }

    /// Collects parameter indexes in textual order.
    pub fn collect_params(&self, out: &mut Vec<usize>) {
        self.visit_params(&mut |index, _| out.push(index));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunc::Count),
            "SUM" => Some(AggregateFunc::Sum),
            "AVG" => Some(AggregateFunc::Avg),
            "MAX" => Some(AggregateFunc::Max),
            "MIN" => Some(AggregateFunc::Min),
            _ => None,
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Max => "MAX",
            AggregateFunc::Min => "MIN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionKind {
    /// `*` or `t.*`.
    Wildcard { owner: Option<Ident> },
    Column(ColumnRef),
    Aggregate {
        func: AggregateFunc,
        distinct: bool,
        /// Argument text as written (`*` for `COUNT(*)`).
        arg: String,
        args: Vec<Expr>,
    },
    Expression(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub kind: ProjectionKind,
    pub alias: Option<String>,
    /// Span of the expression, excluding any alias.
    pub span: Span,
    /// Expression text as written.
    pub text: String,
}

impl Projection {
    /// Column label a shard returns for this projection.
    pub fn label(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.kind {
            ProjectionKind::Column(column) => column.name.clone(),
            _ => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => f.write_str("ASC"),
            OrderDirection::Desc => f.write_str("DESC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

/// What an ORDER BY / GROUP BY item refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderKey {
    Column(ColumnRef),
    /// 1-based projection position.
    Position(usize),
    Expression(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub key: OrderKey,
    pub direction: OrderDirection,
    pub nulls: Option<NullsOrder>,
    /// Span of the key expression.
    pub span: Span,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Literal(u64),
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitValue {
    pub kind: LimitKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limit {
    pub offset: Option<LimitValue>,
    pub row_count: Option<LimitValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub projections: Vec<Projection>,
    /// Byte offset right after the last projection item (alias included).
    pub projections_end: usize,
    /// FROM tables followed by joined tables, in textual order.
    pub from: Vec<TableRef>,
    pub join_conditions: Vec<Expr>,
    pub selection: Option<Expr>,
    pub group_by: Vec<OrderItem>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<Limit>,
    /// Offset where an ORDER BY clause can be inserted when the statement has none.
    pub order_by_insert_at: usize,
}

impl SelectStatement {
    pub fn has_aggregation(&self) -> bool {
        self.projections
            .iter()
            .any(|projection| matches!(projection.kind, ProjectionKind::Aggregate { .. }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub values: Vec<Expr>,
    /// Span from `(` to `)` inclusive.
    pub span: Span,
    /// Parameter indexes appearing in this row, in textual order.
    pub params: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: TableRef,
    pub columns: Vec<Ident>,
    /// Offset of the `)` closing the column list, when there is one.
    pub columns_close: Option<usize>,
    pub rows: Vec<InsertRow>,
    /// Span covering every row of the VALUES list.
    pub values_span: Span,
}

impl InsertStatement {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|ident| ident.matches(column))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: ColumnRef,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: TableRef,
    pub assignments: Vec<Assignment>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: TableRef,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    CreateTable,
    AlterTable,
    DropTable,
    TruncateTable,
    CreateIndex,
    DropIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DdlStatement {
    pub kind: DdlKind,
    pub tables: Vec<TableRef>,
    pub index: Option<Ident>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DalStatement {
    ShowTables { like: Option<String> },
    ShowCreateTable(TableRef),
    /// `DESCRIBE t`, `DESC t`, `SHOW COLUMNS FROM t`.
    Describe(TableRef),
    ShowIndex(TableRef),
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TclStatement {
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Ddl(DdlStatement),
    Dal(DalStatement),
    Tcl(TclStatement),
}

impl Statement {
    /// Every table referenced by the statement, in textual order.
    pub fn tables(&self) -> Vec<&TableRef> {
        match self {
            Statement::Select(select) => select.from.iter().collect(),
            Statement::Insert(insert) => vec![&insert.table],
            Statement::Update(update) => vec![&update.table],
            Statement::Delete(delete) => vec![&delete.table],
            Statement::Ddl(ddl) => ddl.tables.iter().collect(),
            Statement::Dal(DalStatement::ShowCreateTable(table))
            | Statement::Dal(DalStatement::Describe(table))
            | Statement::Dal(DalStatement::ShowIndex(table)) => vec![table],
            Statement::Dal(_) | Statement::Tcl(_) => Vec::new(),
        }
    }

    /// The WHERE predicate, for statements that have one.
    pub fn selection(&self) -> Option<&Expr> {
        match self {
            Statement::Select(select) => select.selection.as_ref(),
            Statement::Update(update) => update.selection.as_ref(),
            Statement::Delete(delete) => delete.selection.as_ref(),
            _ => None,
        }
    }

    /// Calls `f` for every column reference anywhere in the statement.
    pub fn visit_columns<'a>(&'a self, f: &mut dyn FnMut(&'a ColumnRef)) {
        match self {
            Statement::Select(select) => {
                for projection in &select.projections {
                    match &projection.kind {
                        ProjectionKind::Column(column) => f(column),
                        ProjectionKind::Aggregate { args, .. } => {
                            for arg in args {
                                arg.visit_columns(f);
                            }
                        }
                        ProjectionKind::Expression(expr) => expr.visit_columns(f),
                        ProjectionKind::Wildcard { .. } => {}
                    }
                }
                for expr in select
                    .join_conditions
                    .iter()
                    .chain(select.selection.iter())
                    .chain(select.having.iter())
                {
                    expr.visit_columns(f);
                }
                for item in select.group_by.iter().chain(select.order_by.iter()) {
                    match &item.key {
                        OrderKey::Column(column) => f(column),
                        OrderKey::Expression(expr) => expr.visit_columns(f),
                        OrderKey::Position(_) => {}
                    }
                }
            }
            Statement::Update(update) => {
                for assignment in &update.assignments {
                    f(&assignment.column);
                    assignment.value.visit_columns(f);
                }
                if let Some(selection) = &update.selection {
                    selection.visit_columns(f);
                }
            }
            Statement::Delete(delete) => {
                if let Some(selection) = &delete.selection {
                    selection.visit_columns(f);
                }
            }
            Statement::Insert(insert) => {
                for row in &insert.rows {
                    for value in &row.values {
                        value.visit_columns(f);
                    }
                }
            }
            Statement::Ddl(_) | Statement::Dal(_) | Statement::Tcl(_) => {}
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Statement::Select(_) => "select",
            Statement::Insert(_) => "insert",
            Statement::Update(_) => "update",
            Statement::Delete(_) => "delete",
            Statement::Ddl(_) => "ddl",
            Statement::Dal(_) => "dal",
            Statement::Tcl(_) => "tcl",
        }
    }
}
