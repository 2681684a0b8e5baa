//! HoloShard: routing, rewriting and result merging for sharded SQL datasources.
//!
//! A logical statement flows through:
//! - the condition extractor (sharding values from the predicate tree),
//! - the routing engine (rule + conditions + hints → route units),
//! - the rewrite engine (one physical statement per table mapping),
//! - an external executor (one cursor or update count per physical statement),
//! - the merge engine (one logical result).
//!
//! [`ShardingEngine`] is the composition root tying these stages to the
//! active rule snapshot.

pub mod algorithm;
pub mod condition;
pub mod config;
pub mod error;
pub mod executor;
pub mod merge;
pub mod metrics;
pub mod rewrite;
pub mod route;
pub mod rule;
pub mod sql;
pub mod value;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{info, warn};

pub use crate::algorithm::AlgorithmRegistry;
pub use crate::config::HoloShardConfig;
pub use crate::error::{ErrorCategory, Result, ShardingError};
pub use crate::executor::{ExecuteResult, MemoryExecutor, StatementExecutor};
pub use crate::merge::{MergedResult, QueryResult};
pub use crate::route::{HintManager, RouteContext, RouteEngine};
pub use crate::rule::{RuleStore, ShardingRule};
pub use crate::value::SqlValue;

use crate::condition::{GeneratedKeys, ShardingConditions};
use crate::merge::{merge_update_counts, MergeEngine, MergeKind};
use crate::metrics::{ShardingMetrics, ShardingMetricsSnapshot};
use crate::rewrite::{ExecutionUnit, SqlRewriteContext};
use crate::sql::StatementContext;

/// Everything derived from one logical statement before execution.
#[derive(Debug)]
pub struct PreparedStatement {
    pub context: StatementContext,
    pub parameters: Vec<SqlValue>,
    /// Rule snapshot the statement was routed against.
    pub rule: Arc<ShardingRule>,
    pub generated_keys: Option<GeneratedKeys>,
    pub conditions: ShardingConditions,
    pub route: RouteContext,
    pub rewrite: SqlRewriteContext,
    pub units: Vec<ExecutionUnit>,
}

impl PreparedStatement {
    /// Merge the statement will receive once its cursors are open.
    pub fn merge_kind(&self) -> MergeKind {
        MergeEngine::new(&self.rule).kind(
            &self.context,
            self.rewrite.select_context(),
            self.units.len(),
        )
    }
}

/// Result handed back for one logical statement.
pub enum ShardingResult {
    Query(Box<dyn MergedResult>),
    Update(u64),
}

impl std::fmt::Debug for ShardingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardingResult::Query(result) => f
                .debug_tuple("Query")
                .field(&result.column_labels())
                .finish(),
            ShardingResult::Update(count) => f.debug_tuple("Update").field(count).finish(),
        }
    }
}

/// Sharding pipeline bound to a rule store.
pub struct ShardingEngine {
    rules: RuleStore,
    route_engine: RouteEngine,
    sql_show: bool,
    metrics: Arc<ShardingMetrics>,
}

impl ShardingEngine {
    pub fn new(rules: RuleStore, config: &HoloShardConfig) -> Self {
        Self {
            rules,
            route_engine: config.route_engine(),
            sql_show: config.sql_show,
            metrics: Arc::new(ShardingMetrics::default()),
        }
    }

    /// Builds an engine from `HOLO_SHARD_RULES_PATH`.
    pub fn from_config(config: &HoloShardConfig, registry: &AlgorithmRegistry) -> anyhow::Result<Self> {
        let path = config
            .rules_path
            .as_ref()
            .context("HOLO_SHARD_RULES_PATH is not set")?;
        let rules = RuleStore::load_from_path(path, registry)?;
        Ok(Self::new(rules, config))
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn metrics(&self) -> ShardingMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Parses, routes and rewrites one statement against the current rule.
    pub fn prepare(
        &self,
        sql: &str,
        parameters: &[SqlValue],
        hint: &HintManager,
    ) -> Result<PreparedStatement> {
        let rule = self.rules.snapshot();
        let context = StatementContext::parse(sql)?;
        let generated_keys = condition::generate_keys(&context, &rule)?;
        let conditions = condition::extract(&context, parameters, &rule, generated_keys.as_ref())?;
        let route = self
            .route_engine
            .route(&rule, &context, parameters, &conditions, hint)?;
        let rewrite = SqlRewriteContext::new(&context, &route, parameters, &rule, generated_keys.as_ref())?;
        let units = rewrite.execution_units(&route)?;
        self.metrics.record_route(route.route_type(), units.len());

        if self.sql_show {
            info!(sql = %sql, parameters = ?parameters, route = %route, "logic SQL");
            for unit in &units {
                info!(
                    data_source = %unit.data_source,
                    sql = %unit.sql,
                    parameters = ?unit.parameters,
                    "actual SQL"
                );
            }
        }

        Ok(PreparedStatement {
            context,
            parameters: parameters.to_vec(),
            rule,
            generated_keys,
            conditions,
            route,
            rewrite,
            units,
        })
    }

    /// Runs every execution unit concurrently and merges the results.
    ///
    /// When any unit fails, the cursors other units already opened are closed
    /// before the first error is returned.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        executor: &dyn StatementExecutor,
    ) -> Result<ShardingResult> {
        let outcome = self.execute_units(prepared, executor).await;
        if outcome.is_err() {
            self.metrics.record_merge_failure();
        }
        outcome
    }

    /// [`prepare`](Self::prepare) followed by [`execute`](Self::execute).
    pub async fn execute_sql(
        &self,
        sql: &str,
        parameters: &[SqlValue],
        hint: &HintManager,
        executor: &dyn StatementExecutor,
    ) -> Result<ShardingResult> {
        let prepared = self.prepare(sql, parameters, hint)?;
        self.execute(&prepared, executor).await
    }

    async fn execute_units(
        &self,
        prepared: &PreparedStatement,
        executor: &dyn StatementExecutor,
    ) -> Result<ShardingResult> {
        let outcomes = join_all(prepared.units.iter().map(|unit| executor.execute(unit))).await;

        let mut cursors = Vec::with_capacity(outcomes.len());
        let mut counts = Vec::new();
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(ExecuteResult::Query(cursor)) => cursors.push(cursor),
                Ok(ExecuteResult::Update(count)) => counts.push(count),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if failure.is_none() && !cursors.is_empty() && !counts.is_empty() {
            failure = Some(ShardingError::Merge(
                "execution units returned both cursors and update counts".to_string(),
            ));
        }
        if let Some(err) = failure {
            for cursor in cursors.iter_mut() {
                if let Err(close_err) = cursor.close().await {
                    warn!(error = %close_err, "closing cursor after failed execution");
                }
            }
            return Err(err);
        }

        if cursors.is_empty() {
            return Ok(ShardingResult::Update(merge_update_counts(&counts)));
        }
        let merged = MergeEngine::new(&prepared.rule)
            .merge(
                &prepared.context,
                prepared.rewrite.select_context(),
                &prepared.units,
                cursors,
            )
            .await?;
        Ok(ShardingResult::Query(Box::new(CountingMergedResult {
            inner: merged,
            metrics: Arc::clone(&self.metrics),
        })))
    }
}

/// Feeds merged row counts into the engine metrics.
struct CountingMergedResult {
    inner: Box<dyn MergedResult>,
    metrics: Arc<ShardingMetrics>,
}

#[async_trait]
impl MergedResult for CountingMergedResult {
    fn column_labels(&self) -> &[String] {
        self.inner.column_labels()
    }

    async fn next(&mut self) -> Result<bool> {
        match self.inner.next().await {
            Ok(true) => {
                self.metrics.record_merged_rows(1);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                self.metrics.record_merge_failure();
                Err(err)
            }
        }
    }

    fn value(&self, index: usize) -> Result<SqlValue> {
        self.inner.value(index)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
