//! Execution seam between the rewrite and merge engines.
//!
//! The core never talks to a database itself; a [`StatementExecutor`] runs
//! each physical statement and hands back a cursor or an update count.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ShardingError};
use crate::merge::{MemoryQueryResult, QueryResult};
use crate::rewrite::ExecutionUnit;
use crate::sql::{DalStatement, Statement, StatementContext};
use crate::value::SqlValue;

/// Outcome of one physical statement.
pub enum ExecuteResult {
    Query(Box<dyn QueryResult>),
    Update(u64),
}

impl std::fmt::Debug for ExecuteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteResult::Query(cursor) => f
                .debug_tuple("Query")
                .field(&cursor.column_labels())
                .finish(),
            ExecuteResult::Update(count) => f.debug_tuple("Update").field(count).finish(),
        }
    }
}

#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, unit: &ExecutionUnit) -> Result<ExecuteResult>;
}

/// Rows of one physical table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryTable {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<SqlValue>>,
}

/// Serves canned rows per `(data source, physical table)` and records every
/// statement it is asked to run.
///
/// Queries return the rows of the first physical table of the unit, whatever
/// the WHERE clause says. INSERT reports one affected row per VALUES row;
/// other DML reports the count set with [`MemoryExecutor::set_update_count`].
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    tables: BTreeMap<(String, String), MemoryTable>,
    update_counts: BTreeMap<String, u64>,
    failing: Vec<String>,
    executed: Mutex<Vec<ExecutionUnit>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(
        mut self,
        data_source: &str,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<SqlValue>>,
    ) -> Self {
        self.tables.insert(
            (data_source.to_string(), table.to_ascii_lowercase()),
            MemoryTable {
                columns: columns.iter().map(|column| column.to_string()).collect(),
                rows,
            },
        );
        self
    }

    /// Loads tables from JSON keyed by `<data source>.<table>`.
    pub fn load_from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read table data from {}", path.display()))?;
        let tables: BTreeMap<String, MemoryTable> = serde_json::from_str(&text)
            .with_context(|| format!("parse table data in {}", path.display()))?;
        let mut executor = Self::new();
        for (node, table) in tables {
            let (data_source, name) = node
                .split_once('.')
                .with_context(|| format!("table key `{node}` is not <data source>.<table>"))?;
            executor
                .tables
                .insert((data_source.to_string(), name.to_ascii_lowercase()), table);
        }
        Ok(executor)
    }

    /// Affected-row count reported by UPDATE/DELETE on `data_source`.
    pub fn set_update_count(&mut self, data_source: &str, count: u64) {
        self.update_counts.insert(data_source.to_string(), count);
    }

    /// Makes every statement sent to `data_source` fail.
    pub fn fail_data_source(&mut self, data_source: &str) {
        self.failing.push(data_source.to_string());
    }

    /// Every unit executed so far, in call order.
    pub fn executed(&self) -> Vec<ExecutionUnit> {
        self.executed.lock().clone()
    }

    pub fn executed_sql(&self) -> Vec<(String, String)> {
        self.executed
            .lock()
            .iter()
            .map(|unit| (unit.data_source.clone(), unit.sql.clone()))
            .collect()
    }

    fn show_tables(&self, unit: &ExecutionUnit) -> ExecuteResult {
        let rows = self
            .tables
            .keys()
            .filter(|(data_source, _)| *data_source == unit.data_source)
            .map(|(_, table)| vec![SqlValue::Text(table.clone())])
            .collect();
        let label = format!("Tables_in_{}", unit.data_source);
        ExecuteResult::Query(Box::new(MemoryQueryResult::new(vec![label], rows)))
    }

    /// Rows of the first known table among the unit's physical tables, then
    /// the tables named in the physical statement.
    fn query(&self, unit: &ExecutionUnit, ctx: &StatementContext) -> Result<ExecuteResult> {
        let table = unit
            .table_mapping
            .iter()
            .map(|(_, actual)| actual.to_string())
            .chain(ctx.table_names())
            .find_map(|actual| {
                self.tables
                    .get(&(unit.data_source.clone(), actual.to_ascii_lowercase()))
            });
        let result = match table {
            Some(table) => MemoryQueryResult::new(table.columns.clone(), table.rows.clone()),
            None => MemoryQueryResult::default(),
        };
        Ok(ExecuteResult::Query(Box::new(result)))
    }
}

#[async_trait]
impl StatementExecutor for MemoryExecutor {
    async fn execute(&self, unit: &ExecutionUnit) -> Result<ExecuteResult> {
        self.executed.lock().push(unit.clone());
        if self.failing.contains(&unit.data_source) {
            return Err(ShardingError::cursor(format!(
                "data source `{}` is unavailable",
                unit.data_source
            )));
        }
        let ctx = StatementContext::parse(&unit.sql)?;
        debug!(data_source = %unit.data_source, sql = %unit.sql, "memory executor");
        match ctx.statement() {
            Statement::Select(_) => self.query(unit, &ctx),
            Statement::Dal(DalStatement::Set) => Ok(ExecuteResult::Update(0)),
            Statement::Dal(DalStatement::ShowTables { .. }) => Ok(self.show_tables(unit)),
            Statement::Dal(_) => self.query(unit, &ctx),
            Statement::Insert(insert) => Ok(ExecuteResult::Update(insert.rows.len() as u64)),
            Statement::Update(_) | Statement::Delete(_) => Ok(ExecuteResult::Update(
                self.update_counts
                    .get(&unit.data_source)
                    .copied()
                    .unwrap_or(0),
            )),
            Statement::Ddl(_) | Statement::Tcl(_) => Ok(ExecuteResult::Update(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::TableMapping;

    fn unit(data_source: &str, sql: &str, table: Option<(&str, &str)>) -> ExecutionUnit {
        ExecutionUnit {
            data_source: data_source.to_string(),
            sql: sql.to_string(),
            parameters: Vec::new(),
            table_mapping: table
                .map(|(logic, actual)| TableMapping::single(logic, actual))
                .unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn serves_rows_of_the_mapped_table() {
        let executor = MemoryExecutor::new().with_table(
            "ds_0",
            "t_order_1",
            &["order_id"],
            vec![vec![SqlValue::Int(5)]],
        );
        let result = executor
            .execute(&unit("ds_0", "SELECT order_id FROM t_order_1", Some(("t_order", "t_order_1"))))
            .await
            .expect("query");
        let ExecuteResult::Query(mut cursor) = result else {
            panic!("expected a cursor");
        };
        assert!(cursor.next().await.expect("row"));
        assert_eq!(cursor.value(0).expect("value"), SqlValue::Int(5));
        assert_eq!(executor.executed_sql()[0].1, "SELECT order_id FROM t_order_1");
    }

    #[tokio::test]
    async fn insert_counts_rows_and_failures_surface_as_cursor_errors() {
        let mut executor = MemoryExecutor::new();
        let result = executor
            .execute(&unit("ds_1", "INSERT INTO t_order_2 (order_id) VALUES (2), (6)", None))
            .await
            .expect("insert");
        assert!(matches!(result, ExecuteResult::Update(2)));

        executor.fail_data_source("ds_1");
        let err = executor
            .execute(&unit("ds_1", "DELETE FROM t_order_2", None))
            .await
            .expect_err("down");
        assert!(matches!(err, ShardingError::Cursor(_)));
    }

    #[test]
    fn loads_tables_from_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tables.json");
        std::fs::write(
            &path,
            r#"{ "ds_0.t_order_0": { "columns": ["order_id", "status"], "rows": [[4, "paid"], [8, null]] } }"#,
        )
        .expect("write");
        let executor = MemoryExecutor::load_from_path(&path).expect("load");
        let table = &executor.tables[&("ds_0".to_string(), "t_order_0".to_string())];
        assert_eq!(table.rows[1], vec![SqlValue::Int(8), SqlValue::Null]);
    }
}
