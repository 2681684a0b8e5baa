//! Rule model: logical tables, their data nodes and sharding strategies.
//!
//! A [`ShardingRule`] is built once from configuration and shared read-only by
//! every statement; configuration changes install a whole new rule through
//! [`RuleStore`].

pub mod config;
pub mod store;
pub mod strategy;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::algorithm::KeyGenerator;
use crate::error::{Result, ShardingError};

pub use config::{
    AlgorithmConfig, KeyGenerateConfig, ShardingRuleConfig, StrategyConfig, TableRuleConfig,
};
pub use store::RuleStore;
pub use strategy::ShardingStrategy;

/// One physical table in one physical datasource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataNode {
    pub data_source: String,
    pub table: String,
}

impl DataNode {
    pub fn new(data_source: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            table: table.into(),
        }
    }

    /// Parses `ds.table`.
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().split_once('.') {
            Some((ds, table)) if !ds.is_empty() && !table.is_empty() && !table.contains('.') => {
                Ok(Self::new(ds, table))
            }
            _ => Err(ShardingError::Config(format!(
                "invalid data node `{text}`, expected `<data-source>.<table>`"
            ))),
        }
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.data_source, self.table)
    }
}

/// Key column plus the generator filling it on INSERT.
#[derive(Clone)]
pub struct KeyGenerateStrategy {
    pub column: String,
    pub generator: Arc<dyn KeyGenerator>,
}

impl fmt::Debug for KeyGenerateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerateStrategy")
            .field("column", &self.column)
            .field("generator", &self.generator.kind())
            .finish()
    }
}

/// Mapping of one logical table onto its configured data nodes.
#[derive(Debug, Clone)]
pub struct TableRule {
    pub logic_table: String,
    /// Configured nodes; the only nodes routing may produce.
    pub data_nodes: Vec<DataNode>,
    pub database_strategy: ShardingStrategy,
    pub table_strategy: ShardingStrategy,
    pub key_generate: Option<KeyGenerateStrategy>,
}

impl TableRule {
    /// Distinct datasource names in configuration order.
    pub fn data_source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for node in &self.data_nodes {
            if !names.contains(&node.data_source) {
                names.push(node.data_source.clone());
            }
        }
        names
    }

    /// Distinct physical table names in configuration order.
    pub fn actual_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for node in &self.data_nodes {
            if !names.contains(&node.table) {
                names.push(node.table.clone());
            }
        }
        names
    }

    /// Physical tables configured in `data_source`, in configuration order.
    pub fn actual_tables_in(&self, data_source: &str) -> Vec<String> {
        self.data_nodes
            .iter()
            .filter(|node| node.data_source == data_source)
            .map(|node| node.table.clone())
            .collect()
    }

    /// Position of `table` among the tables of `data_source`.
    pub fn actual_table_index(&self, data_source: &str, table: &str) -> Option<usize> {
        self.actual_tables_in(data_source)
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(table))
    }

    pub fn is_single(&self) -> bool {
        self.data_nodes.len() == 1
    }

    /// Columns used by either strategy, lowercased.
    pub fn sharding_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for column in self
            .database_strategy
            .sharding_columns()
            .into_iter()
            .chain(self.table_strategy.sharding_columns())
        {
            let column = column.to_ascii_lowercase();
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns
    }

    pub fn is_sharding_column(&self, column: &str) -> bool {
        self.sharding_columns()
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(column))
    }
}

/// The complete, validated rule snapshot.
#[derive(Debug, Clone)]
pub struct ShardingRule {
    data_sources: Vec<String>,
    tables: BTreeMap<String, TableRule>,
    broadcast_tables: BTreeSet<String>,
    binding_groups: Vec<Vec<String>>,
    default_data_source: Option<String>,
}

impl ShardingRule {
    /// Validates and assembles a rule. Table names are matched case-insensitively.
    pub fn new(
        data_sources: Vec<String>,
        tables: Vec<TableRule>,
        broadcast_tables: Vec<String>,
        binding_groups: Vec<Vec<String>>,
        default_data_source: Option<String>,
    ) -> Result<Self> {
        if data_sources.is_empty() {
            return Err(ShardingError::Config(
                "at least one data source must be configured".to_string(),
            ));
        }

        let mut table_map = BTreeMap::new();
        for mut table in tables {
            table.logic_table = table.logic_table.to_ascii_lowercase();
            if table.data_nodes.is_empty() {
                return Err(ShardingError::Config(format!(
                    "logical table `{}` has no data nodes",
                    table.logic_table
                )));
            }
            if let Some(node) = table
                .data_nodes
                .iter()
                .find(|node| !data_sources.contains(&node.data_source))
            {
                return Err(ShardingError::Config(format!(
                    "data node `{node}` of `{}` references an unknown data source",
                    table.logic_table
                )));
            }
            let mut seen = BTreeSet::new();
            if let Some(node) = table.data_nodes.iter().find(|node| !seen.insert(*node)) {
                return Err(ShardingError::Config(format!(
                    "data node `{node}` is listed twice for `{}`",
                    table.logic_table
                )));
            }
            if table_map.contains_key(&table.logic_table) {
                return Err(ShardingError::Config(format!(
                    "logical table `{}` is configured twice",
                    table.logic_table
                )));
            }
            table_map.insert(table.logic_table.clone(), table);
        }

        let broadcast_tables: BTreeSet<String> = broadcast_tables
            .into_iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        if let Some(name) = broadcast_tables.iter().find(|name| table_map.contains_key(*name)) {
            return Err(ShardingError::Config(format!(
                "`{name}` cannot be both a sharded and a broadcast table"
            )));
        }

        let mut groups = Vec::with_capacity(binding_groups.len());
        for group in binding_groups {
            let group: Vec<String> = group.iter().map(|name| name.to_ascii_lowercase()).collect();
            let Some(primary) = group.first() else {
                continue;
            };
            let primary_rule = table_map.get(primary).ok_or_else(|| {
                ShardingError::Config(format!("binding table `{primary}` has no table rule"))
            })?;
            for name in &group[1..] {
                let rule = table_map.get(name).ok_or_else(|| {
                    ShardingError::Config(format!("binding table `{name}` has no table rule"))
                })?;
                let consistent = rule.data_source_names() == primary_rule.data_source_names()
                    && primary_rule.data_source_names().iter().all(|ds| {
                        rule.actual_tables_in(ds).len() == primary_rule.actual_tables_in(ds).len()
                    });
                if !consistent {
                    return Err(ShardingError::Config(format!(
                        "binding tables `{primary}` and `{name}` must have the same data node layout"
                    )));
                }
            }
            groups.push(group);
        }

        if let Some(ds) = &default_data_source {
            if !data_sources.contains(ds) {
                return Err(ShardingError::Config(format!(
                    "default data source `{ds}` is not configured"
                )));
            }
        }

        Ok(Self {
            data_sources,
            tables: table_map,
            broadcast_tables,
            binding_groups: groups,
            default_data_source,
        })
    }

    pub fn data_source_names(&self) -> &[String] {
        &self.data_sources
    }

    pub fn table_rule(&self, logic_table: &str) -> Option<&TableRule> {
        self.tables.get(&logic_table.to_ascii_lowercase())
    }

    pub fn table_rules(&self) -> impl Iterator<Item = &TableRule> {
        self.tables.values()
    }

    pub fn is_broadcast(&self, logic_table: &str) -> bool {
        self.broadcast_tables
            .contains(&logic_table.to_ascii_lowercase())
    }

    pub fn broadcast_tables(&self) -> impl Iterator<Item = &String> {
        self.broadcast_tables.iter()
    }

    /// Binding group containing `logic_table`.
    fn binding_group(&self, logic_table: &str) -> Option<&[String]> {
        let name = logic_table.to_ascii_lowercase();
        self.binding_groups
            .iter()
            .find(|group| group.contains(&name))
            .map(Vec::as_slice)
    }

    pub fn are_binding(&self, left: &str, right: &str) -> bool {
        self.binding_group(left)
            .is_some_and(|group| group.contains(&right.to_ascii_lowercase()))
    }

    /// Datasource for tables this rule does not govern.
    pub fn default_data_source(&self) -> Option<&str> {
        match &self.default_data_source {
            Some(ds) => Some(ds.as_str()),
            None if self.data_sources.len() == 1 => self.data_sources.first().map(String::as_str),
            None => None,
        }
    }
}
