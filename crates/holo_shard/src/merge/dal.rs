//! Catalog statements: physical names in shard results become logical ones.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;

use crate::error::Result;
use crate::rule::ShardingRule;
use crate::value::SqlValue;

use super::stream::RowSource;

/// Physical table → logical table, keyed lowercase.
pub(crate) fn actual_to_logic(rule: &ShardingRule) -> BTreeMap<String, String> {
    let mut names = BTreeMap::new();
    for table in rule.table_rules() {
        for node in &table.data_nodes {
            names
                .entry(node.table.to_ascii_lowercase())
                .or_insert_with(|| table.logic_table.clone());
        }
    }
    names
}

/// `SHOW TABLES` across data sources: first column renamed to the logical
/// table, identical rows emitted once.
pub(crate) struct ShowTablesSource {
    inner: Box<dyn RowSource>,
    names: BTreeMap<String, String>,
    seen: HashSet<String>,
}

impl ShowTablesSource {
    pub fn new(inner: Box<dyn RowSource>, names: BTreeMap<String, String>) -> Self {
        Self {
            inner,
            names,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl RowSource for ShowTablesSource {
    fn labels(&self) -> &[String] {
        self.inner.labels()
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        while let Some(mut row) = self.inner.next_row().await? {
            if let Some(SqlValue::Text(table)) = row.first() {
                if let Some(logic) = self.names.get(&table.to_ascii_lowercase()) {
                    row[0] = SqlValue::Text(logic.clone());
                }
            }
            let mut key = String::new();
            for value in &row {
                value.encode_key(&mut key);
            }
            if self.seen.insert(key) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// `SHOW CREATE TABLE` / `SHOW INDEX`: every text cell has the unit's physical
/// names rewritten to logical ones.
pub(crate) struct LogicalNameSource {
    inner: Box<dyn RowSource>,
    /// `(actual, logic)` pairs of the unit's table mapping.
    tables: Vec<(String, String)>,
}

impl LogicalNameSource {
    pub fn new(inner: Box<dyn RowSource>, tables: Vec<(String, String)>) -> Self {
        Self { inner, tables }
    }
}

#[async_trait]
impl RowSource for LogicalNameSource {
    fn labels(&self) -> &[String] {
        self.inner.labels()
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        let Some(mut row) = self.inner.next_row().await? else {
            return Ok(None);
        };
        for value in row.iter_mut() {
            if let SqlValue::Text(text) = value {
                for (actual, logic) in &self.tables {
                    *text = logical_text(text, actual, logic);
                }
            }
        }
        Ok(Some(row))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

fn is_ident(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Replaces whole-identifier occurrences of `actual` with `logic`, and drops
/// `_<actual>` suffixes that rendering added to index names.
pub(crate) fn logical_text(text: &str, actual: &str, logic: &str) -> String {
    if actual.is_empty() || !text.contains(actual) {
        return text.to_string();
    }
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for (start, _) in text.match_indices(actual) {
        if start < copied {
            continue;
        }
        let end = start + actual.len();
        if bytes.get(end).is_some_and(|&b| is_ident(b)) {
            continue;
        }
        match start.checked_sub(1).map(|i| bytes[i]) {
            None => {
                out.push_str(&text[copied..start]);
                out.push_str(logic);
            }
            Some(b) if !is_ident(b) => {
                out.push_str(&text[copied..start]);
                out.push_str(logic);
            }
            Some(b'_') if start - 1 > copied => {
                out.push_str(&text[copied..start - 1]);
            }
            Some(_) => continue,
        }
        copied = end;
    }
    out.push_str(&text[copied..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::stream::{drain, BufferedSource};
    use crate::rule::tests::order_rule;

    #[test]
    fn physical_names_become_logical() {
        let ddl = "CREATE TABLE `t_order_1` (\n  KEY `idx_status_t_order_1` (`status`)\n) -- t_order_10";
        assert_eq!(
            logical_text(ddl, "t_order_1", "t_order"),
            "CREATE TABLE `t_order` (\n  KEY `idx_status` (`status`)\n) -- t_order_10"
        );
        assert_eq!(logical_text("t_order_1", "t_order_1", "t_order"), "t_order");
    }

    #[tokio::test]
    async fn show_tables_is_deduplicated_by_logical_name() {
        let names = actual_to_logic(&order_rule());
        let rows = ["t_order_0", "t_order_1", "t_order_item_0", "t_config", "t_order_2"]
            .iter()
            .map(|name| vec![SqlValue::from(*name)])
            .collect();
        let inner = BufferedSource::new(vec!["Tables_in_ds".to_string()], rows);
        let mut source = ShowTablesSource::new(Box::new(inner), names);
        let tables: Vec<SqlValue> = drain(&mut source)
            .await
            .expect("rows")
            .into_iter()
            .map(|mut row| row.remove(0))
            .collect();
        assert_eq!(
            tables,
            vec![
                SqlValue::from("t_order"),
                SqlValue::from("t_order_item"),
                SqlValue::from("t_config"),
            ]
        );
    }
}
