//! Serializable rule configuration and its translation into a [`ShardingRule`].
//!
//! Example (JSON, kebab-case keys):
//!
//! ```json
//! {
//!   "data-sources": ["ds_${0..1}"],
//!   "tables": {
//!     "t_order": {
//!       "actual-data-nodes": "ds_0.t_order_${0..1},ds_1.t_order_${2..3}",
//!       "table-strategy": {
//!         "type": "standard",
//!         "sharding-column": "order_id",
//!         "sharding-algorithm-name": "order_mod"
//!       },
//!       "key-generate-strategy": { "column": "order_id", "key-generator-name": "snowflake" }
//!     }
//!   },
//!   "broadcast-tables": ["t_config"],
//!   "sharding-algorithms": {
//!     "order_mod": { "type": "MOD", "props": { "sharding-count": 4 } }
//!   },
//!   "key-generators": { "snowflake": { "type": "SNOWFLAKE" } }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::algorithm::inline::expand;
use crate::algorithm::{AlgorithmProps, AlgorithmRegistry, KeyGenerator, ShardingAlgorithm};
use crate::error::{Result, ShardingError};

use super::{DataNode, KeyGenerateStrategy, ShardingRule, ShardingStrategy, TableRule};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ShardingRuleConfig {
    /// Datasource names; inline expressions are expanded.
    pub data_sources: Vec<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableRuleConfig>,
    #[serde(default)]
    pub broadcast_tables: Vec<String>,
    /// Each entry is a comma-separated group of logical table names.
    #[serde(default)]
    pub binding_tables: Vec<String>,
    #[serde(default)]
    pub default_database_strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub default_table_strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub default_key_generate_strategy: Option<KeyGenerateConfig>,
    #[serde(default)]
    pub default_data_source: Option<String>,
    #[serde(default)]
    pub sharding_algorithms: BTreeMap<String, AlgorithmConfig>,
    #[serde(default)]
    pub key_generators: BTreeMap<String, AlgorithmConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TableRuleConfig {
    /// Inline expression of `ds.table` nodes. Defaults to the logical table in
    /// every datasource.
    #[serde(default)]
    pub actual_data_nodes: Option<String>,
    #[serde(default)]
    pub database_strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub table_strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub key_generate_strategy: Option<KeyGenerateConfig>,
}

/// Strategy declaration; `{"type": "none"}` overrides a rule-level default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StrategyConfig {
    #[serde(rename_all = "kebab-case")]
    Standard {
        sharding_column: String,
        sharding_algorithm_name: String,
    },
    #[serde(rename_all = "kebab-case")]
    Complex {
        /// Comma-separated column names.
        sharding_columns: String,
        sharding_algorithm_name: String,
    },
    #[serde(rename_all = "kebab-case")]
    Hint { sharding_algorithm_name: String },
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KeyGenerateConfig {
    pub column: String,
    pub key_generator_name: String,
}

impl ShardingRuleConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| ShardingError::Config(format!("invalid rule configuration: {err}")))
    }

    /// Resolves algorithms through `registry`, expands inline expressions and
    /// validates the result.
    pub fn build(&self, registry: &AlgorithmRegistry) -> Result<ShardingRule> {
        let mut data_sources = Vec::new();
        for entry in &self.data_sources {
            for name in expand(entry)? {
                if !data_sources.contains(&name) {
                    data_sources.push(name);
                }
            }
        }

        let mut algorithms: BTreeMap<&str, ShardingAlgorithm> = BTreeMap::new();
        for (name, config) in &self.sharding_algorithms {
            let props = AlgorithmProps::from_json(&config.props);
            algorithms.insert(name.as_str(), registry.create_sharding(&config.kind, &props)?);
        }
        let mut generators: BTreeMap<&str, Arc<dyn KeyGenerator>> = BTreeMap::new();
        for (name, config) in &self.key_generators {
            let props = AlgorithmProps::from_json(&config.props);
            generators.insert(
                name.as_str(),
                registry.create_key_generator(&config.kind, &props)?,
            );
        }

        let mut tables = Vec::with_capacity(self.tables.len());
        for (logic_table, config) in &self.tables {
            let data_nodes = match &config.actual_data_nodes {
                Some(expression) => expand(expression)?
                    .iter()
                    .map(|node| DataNode::parse(node))
                    .collect::<Result<Vec<_>>>()?,
                None => data_sources
                    .iter()
                    .map(|ds| DataNode::new(ds.clone(), logic_table.clone()))
                    .collect(),
            };
            let database_strategy = resolve_strategy(
                config
                    .database_strategy
                    .as_ref()
                    .or(self.default_database_strategy.as_ref()),
                &algorithms,
                logic_table,
            )?;
            let table_strategy = resolve_strategy(
                config
                    .table_strategy
                    .as_ref()
                    .or(self.default_table_strategy.as_ref()),
                &algorithms,
                logic_table,
            )?;
            let key_generate = match config
                .key_generate_strategy
                .as_ref()
                .or(self.default_key_generate_strategy.as_ref())
            {
                Some(key) => {
                    let generator = generators.get(key.key_generator_name.as_str()).ok_or_else(|| {
                        ShardingError::Config(format!(
                            "table `{logic_table}` references undefined key generator `{}`",
                            key.key_generator_name
                        ))
                    })?;
                    Some(KeyGenerateStrategy {
                        column: key.column.clone(),
                        generator: Arc::clone(generator),
                    })
                }
                None => None,
            };
            tables.push(TableRule {
                logic_table: logic_table.clone(),
                data_nodes,
                database_strategy,
                table_strategy,
                key_generate,
            });
        }

        let binding_groups = self
            .binding_tables
            .iter()
            .map(|group| {
                group
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();

        ShardingRule::new(
            data_sources,
            tables,
            self.broadcast_tables.clone(),
            binding_groups,
            self.default_data_source.clone(),
        )
    }
}

fn resolve_strategy(
    config: Option<&StrategyConfig>,
    algorithms: &BTreeMap<&str, ShardingAlgorithm>,
    logic_table: &str,
) -> Result<ShardingStrategy> {
    let Some(config) = config else {
        return Ok(ShardingStrategy::None);
    };
    let lookup = |name: &str| {
        algorithms.get(name).ok_or_else(|| {
            ShardingError::Config(format!(
                "table `{logic_table}` references undefined sharding algorithm `{name}`"
            ))
        })
    };
    let mismatch = |name: &str, algorithm: &ShardingAlgorithm, wanted: &str| {
        ShardingError::Config(format!(
            "algorithm `{name}` ({}) is a {} algorithm and cannot back a {wanted} strategy on `{logic_table}`",
            algorithm.kind(),
            algorithm.capability()
        ))
    };
    match config {
        StrategyConfig::None => Ok(ShardingStrategy::None),
        StrategyConfig::Standard {
            sharding_column,
            sharding_algorithm_name,
        } => match lookup(sharding_algorithm_name)? {
            ShardingAlgorithm::Standard(algorithm) => Ok(ShardingStrategy::Standard {
                column: sharding_column.to_ascii_lowercase(),
                algorithm: Arc::clone(algorithm),
            }),
            other => Err(mismatch(sharding_algorithm_name, other, "standard")),
        },
        StrategyConfig::Complex {
            sharding_columns,
            sharding_algorithm_name,
        } => match lookup(sharding_algorithm_name)? {
            ShardingAlgorithm::Complex(algorithm) => {
                let columns: Vec<String> = sharding_columns
                    .split(',')
                    .map(|column| column.trim().to_ascii_lowercase())
                    .filter(|column| !column.is_empty())
                    .collect();
                if columns.is_empty() {
                    return Err(ShardingError::Config(format!(
                        "complex strategy on `{logic_table}` lists no sharding columns"
                    )));
                }
                Ok(ShardingStrategy::Complex {
                    columns,
                    algorithm: Arc::clone(algorithm),
                })
            }
            other => Err(mismatch(sharding_algorithm_name, other, "complex")),
        },
        StrategyConfig::Hint {
            sharding_algorithm_name,
        } => match lookup(sharding_algorithm_name)? {
            ShardingAlgorithm::Hint(algorithm) => Ok(ShardingStrategy::Hint {
                algorithm: Arc::clone(algorithm),
            }),
            other => Err(mismatch(sharding_algorithm_name, other, "hint")),
        },
    }
}
