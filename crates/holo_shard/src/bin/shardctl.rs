//! Offline inspection of sharding rules: validate a rule file, show how a
//! statement routes and rewrites, or run it against in-memory tables.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use holo_shard::merge::collect_rows;
use holo_shard::{
    AlgorithmRegistry, HintManager, HoloShardConfig, MemoryExecutor, RuleStore, ShardingEngine,
    ShardingResult, SqlValue,
};

#[derive(Parser)]
#[command(name = "shardctl")]
#[command(about = "Inspect sharding rules and statement routing", long_about = None)]
struct Args {
    /// Rule file (JSON); defaults to HOLO_SHARD_RULES_PATH.
    #[arg(long, global = true)]
    rules: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the rule file, then print its tables.
    Check,
    /// Print the route and the rewritten physical statements.
    Route {
        sql: String,
        /// Positional parameter value; JSON literals are decoded, anything else is text.
        #[arg(long = "param")]
        params: Vec<String>,
        /// Force every statement to one data source.
        #[arg(long)]
        hint_data_source: Option<String>,
    },
    /// Execute against in-memory tables and print the merged rows.
    Run {
        sql: String,
        /// Table data keyed by `<data source>.<table>` (JSON).
        #[arg(long)]
        data: PathBuf,
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long)]
        hint_data_source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "holo_shard=info,warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = HoloShardConfig::from_env()?;
    if let Some(rules) = args.rules {
        config.rules_path = Some(rules);
    }
    let registry = AlgorithmRegistry::with_builtins();

    match args.command {
        Command::Check => {
            let path = config
                .rules_path
                .as_ref()
                .context("pass --rules or set HOLO_SHARD_RULES_PATH")?;
            let store = RuleStore::load_from_path(path, &registry)?;
            let rule = store.snapshot();
            println!("data sources: {}", rule.data_source_names().join(", "));
            for table in rule.table_rules() {
                let nodes: Vec<String> = table.data_nodes.iter().map(ToString::to_string).collect();
                println!("{}: {}", table.logic_table, nodes.join(", "));
            }
            for table in rule.broadcast_tables() {
                println!("{table}: broadcast");
            }
        }
        Command::Route {
            sql,
            params,
            hint_data_source,
        } => {
            let engine = ShardingEngine::from_config(&config, &registry)?;
            let prepared = engine.prepare(&sql, &parse_params(&params), &hint(hint_data_source))?;
            println!("route: {}", prepared.route);
            println!("merge: {:?}", prepared.merge_kind());
            for unit in &prepared.units {
                println!("{}: {} {:?}", unit.data_source, unit.sql, unit.parameters);
            }
        }
        Command::Run {
            sql,
            data,
            params,
            hint_data_source,
        } => {
            let engine = ShardingEngine::from_config(&config, &registry)?;
            let executor = MemoryExecutor::load_from_path(&data)?;
            let result = engine
                .execute_sql(&sql, &parse_params(&params), &hint(hint_data_source), &executor)
                .await?;
            match result {
                ShardingResult::Update(count) => println!("updated {count}"),
                ShardingResult::Query(mut merged) => {
                    println!("{}", merged.column_labels().join("\t"));
                    for row in collect_rows(merged.as_mut()).await? {
                        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
                        println!("{}", cells.join("\t"));
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_params(raw: &[String]) -> Vec<SqlValue> {
    raw.iter()
        .map(|value| {
            serde_json::from_str::<SqlValue>(value).unwrap_or_else(|_| SqlValue::Text(value.clone()))
        })
        .collect()
}

fn hint(data_source: Option<String>) -> HintManager {
    let mut hint = HintManager::new();
    if let Some(data_source) = data_source {
        hint.set_data_source(data_source);
    }
    hint
}
