//! Out-of-band sharding values supplied by the session.

use std::collections::BTreeMap;

use crate::value::SqlValue;

/// Session hint values.
///
/// When a table has hint values they replace its WHERE conditions: a
/// [`ShardingStrategy::Hint`](crate::rule::ShardingStrategy::Hint) receives
/// them directly, any other strategy sees them as an `IN` list on its
/// sharding columns. A forced datasource bypasses sharding altogether.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HintManager {
    database_values: BTreeMap<String, Vec<SqlValue>>,
    table_values: BTreeMap<String, Vec<SqlValue>>,
    data_source: Option<String>,
}

impl HintManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database_value(&mut self, logic_table: &str, value: impl Into<SqlValue>) {
        self.database_values
            .entry(logic_table.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn add_table_value(&mut self, logic_table: &str, value: impl Into<SqlValue>) {
        self.table_values
            .entry(logic_table.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Sends every statement to `data_source` with table names left logical.
    pub fn set_data_source(&mut self, data_source: impl Into<String>) {
        self.data_source = Some(data_source.into());
    }

    pub fn data_source(&self) -> Option<&str> {
        self.data_source.as_deref()
    }

    pub fn database_values(&self, logic_table: &str) -> Option<&[SqlValue]> {
        self.database_values
            .get(&logic_table.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    pub fn table_values(&self, logic_table: &str) -> Option<&[SqlValue]> {
        self.table_values
            .get(&logic_table.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    /// Returns `true` when hint values override routing for `logic_table`.
    pub fn covers(&self, logic_table: &str) -> bool {
        self.database_values(logic_table).is_some() || self.table_values(logic_table).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.database_values.is_empty() && self.table_values.is_empty() && self.data_source.is_none()
    }

    pub fn clear(&mut self) {
        self.database_values.clear();
        self.table_values.clear();
        self.data_source = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_keyed_case_insensitively() {
        let mut hint = HintManager::new();
        hint.add_table_value("T_Order", 3);
        hint.add_table_value("t_order", 7);
        assert!(hint.covers("t_order"));
        assert!(!hint.covers("t_order_item"));
        assert_eq!(
            hint.table_values("T_ORDER"),
            Some(&[SqlValue::Int(3), SqlValue::Int(7)][..])
        );
        assert!(hint.database_values("t_order").is_none());

        hint.clear();
        assert!(hint.is_empty());
    }
}
