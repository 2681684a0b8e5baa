//! Route model: which physical tables in which datasources a statement touches.
//!
//! A [`RouteContext`] holds at most one [`RouteUnit`] per datasource. A unit
//! may carry several [`TableMapping`]s when more than one physical table of
//! the same datasource is hit; each mapping becomes one physical statement.

pub mod engine;
pub mod hint;

use std::collections::BTreeMap;
use std::fmt;

use crate::rule::DataNode;

pub use engine::RouteEngine;
pub use hint::HintManager;

/// Logical → physical table names for one physical statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableMapping {
    tables: BTreeMap<String, String>,
}

impl TableMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(logic_table: &str, actual_table: &str) -> Self {
        let mut mapping = Self::new();
        mapping.insert(logic_table, actual_table);
        mapping
    }

    pub fn insert(&mut self, logic_table: &str, actual_table: &str) {
        self.tables
            .insert(logic_table.to_ascii_lowercase(), actual_table.to_string());
    }

    /// Physical name for `logic_table`, if this mapping carries one.
    pub fn actual(&self, logic_table: &str) -> Option<&str> {
        self.tables
            .get(&logic_table.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables
            .iter()
            .map(|(logic, actual)| (logic.as_str(), actual.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Union of two mappings; `None` when they disagree on a shared table.
    pub(crate) fn merged(&self, other: &TableMapping) -> Option<TableMapping> {
        let mut merged = self.clone();
        for (logic, actual) in other.iter() {
            match merged.actual(logic) {
                Some(existing) if existing != actual => return None,
                Some(_) => {}
                None => merged.insert(logic, actual),
            }
        }
        Some(merged)
    }
}

impl fmt::Display for TableMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (logic, actual) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{logic}->{actual}")?;
        }
        Ok(())
    }
}

/// One physical datasource and the table mappings executed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUnit {
    pub data_source: String,
    /// Never empty; an empty mapping keeps every table name logical.
    pub table_mappings: Vec<TableMapping>,
}

impl RouteUnit {
    /// Physical tables this unit maps `logic_table` to.
    pub fn actual_tables(&self, logic_table: &str) -> Vec<&str> {
        let mut tables: Vec<&str> = Vec::new();
        for mapping in &self.table_mappings {
            if let Some(actual) = mapping.actual(logic_table) {
                if !tables.contains(&actual) {
                    tables.push(actual);
                }
            }
        }
        tables
    }
}

/// How a statement was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    /// Sharding strategies narrowed the data nodes.
    Standard,
    /// Every data node of the statement's tables (DDL).
    TableBroadcast,
    /// Every datasource, tables untouched (TCL, SET, SHOW TABLES, broadcast writes).
    DatabaseBroadcast,
    /// One node picked from a set of equivalent nodes.
    Unicast,
    /// Tables without a rule, sent to the default datasource.
    Default,
    /// Session hint values replaced WHERE conditions.
    Hint,
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteType::Standard => "standard",
            RouteType::TableBroadcast => "table-broadcast",
            RouteType::DatabaseBroadcast => "database-broadcast",
            RouteType::Unicast => "unicast",
            RouteType::Default => "default",
            RouteType::Hint => "hint",
        };
        f.write_str(name)
    }
}

/// Routing result for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteContext {
    route_type: RouteType,
    units: Vec<RouteUnit>,
    /// Data node of each INSERT row, in row order.
    insert_row_nodes: Vec<DataNode>,
}

impl RouteContext {
    pub fn new(route_type: RouteType) -> Self {
        Self {
            route_type,
            units: Vec::new(),
            insert_row_nodes: Vec::new(),
        }
    }

    /// Adds a mapping, merging it into the datasource's existing unit.
    pub fn add(&mut self, data_source: &str, mapping: TableMapping) {
        match self
            .units
            .iter_mut()
            .find(|unit| unit.data_source == data_source)
        {
            Some(unit) => {
                if mapping.is_empty() {
                    return;
                }
                unit.table_mappings.retain(|existing| !existing.is_empty());
                if !unit.table_mappings.contains(&mapping) {
                    unit.table_mappings.push(mapping);
                }
            }
            None => self.units.push(RouteUnit {
                data_source: data_source.to_string(),
                table_mappings: vec![mapping],
            }),
        }
    }

    pub fn route_type(&self) -> RouteType {
        self.route_type
    }

    pub fn units(&self) -> &[RouteUnit] {
        &self.units
    }

    pub fn data_sources(&self) -> Vec<&str> {
        self.units
            .iter()
            .map(|unit| unit.data_source.as_str())
            .collect()
    }

    /// Physical statements this route produces.
    pub fn execution_unit_count(&self) -> usize {
        self.units.iter().map(|unit| unit.table_mappings.len()).sum()
    }

    /// Exactly one physical statement.
    pub fn is_single(&self) -> bool {
        self.execution_unit_count() == 1
    }

    pub fn insert_row_nodes(&self) -> &[DataNode] {
        &self.insert_row_nodes
    }

    pub(crate) fn set_insert_row_nodes(&mut self, nodes: Vec<DataNode>) {
        self.insert_row_nodes = nodes;
    }

    /// Rows of an INSERT that land on `data_source` with `mapping`.
    pub fn insert_rows_for(&self, data_source: &str, mapping: &TableMapping) -> Vec<usize> {
        self.insert_row_nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| {
                node.data_source == data_source
                    && mapping
                        .iter()
                        .any(|(_, actual)| actual.eq_ignore_ascii_case(&node.table))
            })
            .map(|(row, _)| row)
            .collect()
    }
}

impl fmt::Display for RouteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.route_type)?;
        for (i, unit) in self.units.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}:", unit.data_source)?;
            for (j, mapping) in unit.table_mappings.iter().enumerate() {
                if j > 0 {
                    f.write_str(" |")?;
                }
                write!(f, " {mapping}")?;
            }
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_unit_per_data_source() {
        let mut route = RouteContext::new(RouteType::Standard);
        route.add("ds_0", TableMapping::single("t_order", "t_order_0"));
        route.add("ds_1", TableMapping::single("t_order", "t_order_2"));
        route.add("ds_0", TableMapping::single("t_order", "t_order_1"));
        route.add("ds_0", TableMapping::single("t_order", "t_order_1"));

        assert_eq!(route.units().len(), 2);
        assert_eq!(route.execution_unit_count(), 3);
        assert_eq!(
            route.units()[0].actual_tables("T_ORDER"),
            vec!["t_order_0", "t_order_1"]
        );
        assert_eq!(
            route.to_string(),
            "standard [ds_0: t_order->t_order_0 | t_order->t_order_1; ds_1: t_order->t_order_2]"
        );
    }

    #[test]
    fn empty_mapping_is_replaced_by_real_mapping() {
        let mut route = RouteContext::new(RouteType::Default);
        route.add("ds_0", TableMapping::new());
        route.add("ds_0", TableMapping::new());
        assert_eq!(route.execution_unit_count(), 1);
        route.add("ds_0", TableMapping::single("t_order", "t_order_0"));
        assert_eq!(route.execution_unit_count(), 1);
        assert!(!route.units()[0].table_mappings[0].is_empty());
    }

    #[test]
    fn mappings_merge_unless_they_conflict() {
        let left = TableMapping::single("a", "a_0");
        let right = TableMapping::single("b", "b_1");
        let merged = left.merged(&right).expect("disjoint");
        assert_eq!(merged.actual("b"), Some("b_1"));
        assert!(merged.merged(&TableMapping::single("a", "a_1")).is_none());
    }
}
