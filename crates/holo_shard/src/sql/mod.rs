//! Statement context: the parsed statement plus the text it was parsed from.
//!
//! Statements are parsed with `sqlparser` and lowered into the subset of
//! statement structure the sharding pipeline needs, keeping byte spans so
//! rewrites can splice the original text.

pub mod ast;
mod convert;
mod source;

use crate::error::Result;

pub use ast::*;

/// A parsed statement bound to its original SQL text.
#[derive(Debug, Clone)]
pub struct StatementContext {
    sql: String,
    statement: Statement,
    parameter_count: usize,
}

impl StatementContext {
    pub fn parse(sql: &str) -> Result<Self> {
        let (statement, parameter_count) = convert::parse_statement(sql)?;
        Ok(Self {
            sql: sql.to_string(),
            statement,
            parameter_count,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// Number of parameters referenced by markers in the statement text.
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn tables(&self) -> Vec<&TableRef> {
        self.statement.tables()
    }

    /// Distinct lowercased logical table names, in first-reference order.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for table in self.tables() {
            let name = table.logic_name();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Resolves a column qualifier (alias or table name) to a table reference.
    pub fn resolve_owner(&self, owner: &str) -> Option<&TableRef> {
        self.tables()
            .into_iter()
            .find(|table| table.is_referenced_by(owner))
    }

    pub fn as_select(&self) -> Option<&SelectStatement> {
        match &self.statement {
            Statement::Select(select) => Some(select),
            _ => None,
        }
    }
}
