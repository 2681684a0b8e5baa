#![allow(dead_code)]

use std::io::Write;

use anyhow::{Context, Result};
use holo_shard::merge::collect_rows;
use holo_shard::{
    AlgorithmRegistry, HoloShardConfig, MemoryExecutor, ShardingEngine, ShardingResult, SqlValue,
};
use tempfile::NamedTempFile;

/// `t_order`/`t_order_item` over two data sources, `order_id mod 4` picking
/// the table: ds_0 holds suffixes 0-1, ds_1 holds 2-3.
pub const ORDER_RULES: &str = r#"{
  "data-sources": ["ds_${0..1}"],
  "tables": {
    "t_order": {
      "actual-data-nodes": "ds_0.t_order_${0..1},ds_1.t_order_${2..3}",
      "table-strategy": {
        "type": "standard",
        "sharding-column": "order_id",
        "sharding-algorithm-name": "order_mod"
      },
      "key-generate-strategy": { "column": "order_id", "key-generator-name": "snowflake" }
    },
    "t_order_item": {
      "actual-data-nodes": "ds_0.t_order_item_${0..1},ds_1.t_order_item_${2..3}",
      "table-strategy": {
        "type": "standard",
        "sharding-column": "order_id",
        "sharding-algorithm-name": "order_mod"
      }
    }
  },
  "binding-tables": ["t_order,t_order_item"],
  "broadcast-tables": ["t_config"],
  "default-data-source": "ds_0",
  "sharding-algorithms": {
    "order_mod": { "type": "MOD", "props": { "sharding-count": 4 } }
  },
  "key-generators": { "snowflake": { "type": "SNOWFLAKE" } }
}"#;

/// Writes the rule file and builds an engine from it; the rule is read once,
/// so the file may go away afterwards.
pub fn engine_with(config: HoloShardConfig) -> Result<ShardingEngine> {
    let mut file = NamedTempFile::new().context("create rule file")?;
    file.write_all(ORDER_RULES.as_bytes())
        .context("write rule file")?;
    let config = HoloShardConfig {
        rules_path: Some(file.path().to_path_buf()),
        ..config
    };
    ShardingEngine::from_config(&config, &AlgorithmRegistry::with_builtins())
}

pub fn engine() -> Result<ShardingEngine> {
    engine_with(HoloShardConfig::default())
}

/// `t_order_<n>` holds the order ids congruent to `n` mod 4, below 10.
pub fn order_tables() -> MemoryExecutor {
    let rows = |suffix: i64| -> Vec<Vec<SqlValue>> {
        (0..10)
            .filter(|id| id % 4 == suffix)
            .map(|id| {
                vec![
                    SqlValue::Int(id),
                    SqlValue::Int(100 + id % 2),
                    SqlValue::from(if id % 3 == 0 { "paid" } else { "open" }),
                ]
            })
            .collect()
    };
    let columns = ["order_id", "user_id", "status"];
    MemoryExecutor::new()
        .with_table("ds_0", "t_order_0", &columns, rows(0))
        .with_table("ds_0", "t_order_1", &columns, rows(1))
        .with_table("ds_1", "t_order_2", &columns, rows(2))
        .with_table("ds_1", "t_order_3", &columns, rows(3))
}

pub async fn query_rows(result: ShardingResult) -> Result<Vec<Vec<SqlValue>>> {
    match result {
        ShardingResult::Query(mut merged) => Ok(collect_rows(merged.as_mut()).await?),
        ShardingResult::Update(count) => anyhow::bail!("expected rows, got update count {count}"),
    }
}

pub fn first_column(rows: &[Vec<SqlValue>]) -> Vec<i64> {
    rows.iter().filter_map(|row| row.first()?.as_i64()).collect()
}
