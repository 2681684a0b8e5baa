//! Merge engine: combines shard cursors into one logical result.
//!
//! The variant is picked from the statement and the [`SelectContext`] the
//! rewrite produced. Multi-stage merges are built as a pipeline of row
//! sources (k-way order, grouping, distinct, pagination) whose visible prefix
//! is handed to the caller.

pub mod aggregation;
pub mod dal;
pub mod group_by;
pub mod order_by;
pub mod pagination;
pub mod result;
pub mod stream;

use tracing::debug;

use crate::error::{Result, ShardingError};
use crate::rewrite::{ExecutionUnit, SelectContext};
use crate::rule::ShardingRule;
use crate::sql::{DalStatement, Statement, StatementContext};

use self::dal::{actual_to_logic, LogicalNameSource, ShowTablesSource};
use self::group_by::{group_in_memory, DistinctSource, GroupByStreamSource};
use self::order_by::OrderByStreamSource;
use self::pagination::PaginationSource;
use self::result::close_unmerged;
use self::stream::{IteratorSource, PipelineMergedResult, RowSource};

pub use result::{collect_rows, CloseCount, MemoryQueryResult, MergedResult, QueryResult};
pub use stream::TransparentMergedResult;

/// Which merge a statement received; reported in logs and by `shardctl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Transparent,
    Iterator,
    OrderByStream,
    GroupByStream,
    GroupByMemory,
    ShowTables,
    LogicalNames,
}

pub struct MergeEngine<'a> {
    rule: &'a ShardingRule,
}

impl<'a> MergeEngine<'a> {
    pub fn new(rule: &'a ShardingRule) -> Self {
        Self { rule }
    }

    /// Picks the merge for a statement without touching any cursor.
    pub fn kind(
        &self,
        ctx: &StatementContext,
        select: Option<&SelectContext>,
        shard_count: usize,
    ) -> MergeKind {
        match ctx.statement() {
            Statement::Dal(DalStatement::ShowTables { .. }) => MergeKind::ShowTables,
            Statement::Dal(DalStatement::ShowCreateTable(_))
            | Statement::Dal(DalStatement::ShowIndex(_)) => MergeKind::LogicalNames,
            _ => match select {
                Some(select) if !select.group_by.is_empty() && select.group_order_matches => {
                    MergeKind::GroupByStream
                }
                Some(select) if select.is_grouped() => MergeKind::GroupByMemory,
                Some(select) if !select.order_by.is_empty() => MergeKind::OrderByStream,
                _ if shard_count == 1 => MergeKind::Transparent,
                _ => MergeKind::Iterator,
            },
        }
    }

    /// Merges the cursors of `units`, one cursor per unit in the same order.
    pub async fn merge(
        &self,
        ctx: &StatementContext,
        select: Option<&SelectContext>,
        units: &[ExecutionUnit],
        mut results: Vec<Box<dyn QueryResult>>,
    ) -> Result<Box<dyn MergedResult>> {
        if results.is_empty() {
            return Err(ShardingError::Merge("no shard results to merge".to_string()));
        }
        let kind = self.kind(ctx, select, results.len());
        debug!(?kind, shards = results.len(), "merging shard results");

        let base: Box<dyn RowSource> = match kind {
            MergeKind::Transparent => {
                let cursor = results.remove(0);
                return Ok(Box::new(TransparentMergedResult::new(cursor)));
            }
            MergeKind::ShowTables => Box::new(ShowTablesSource::new(
                Box::new(IteratorSource::new(results)),
                actual_to_logic(self.rule),
            )),
            MergeKind::LogicalNames => {
                let tables = units
                    .iter()
                    .flat_map(|unit| unit.table_mapping.iter())
                    .map(|(logic, actual)| (actual.to_string(), logic.to_string()))
                    .collect();
                Box::new(LogicalNameSource::new(
                    Box::new(IteratorSource::new(results)),
                    tables,
                ))
            }
            MergeKind::Iterator => Box::new(IteratorSource::new(results)),
            MergeKind::OrderByStream | MergeKind::GroupByStream | MergeKind::GroupByMemory => {
                let Some(select) = select else {
                    close_unmerged(results).await;
                    return Err(ShardingError::Merge(format!(
                        "{kind:?} merge needs a select context"
                    )));
                };
                select_pipeline(kind, select, results).await?
            }
        };

        let select = select.filter(|_| {
            !matches!(kind, MergeKind::ShowTables | MergeKind::LogicalNames)
        });
        let derived = select.map(|select| select.derived_columns).unwrap_or(0);
        let mut source = base;
        if let Some(select) = select {
            if select.distinct {
                source = Box::new(DistinctSource::new(source, derived));
            }
            if let Some(pagination) = select.pagination {
                source = Box::new(PaginationSource::new(source, pagination));
            }
        }
        Ok(Box::new(PipelineMergedResult::new(source, derived)))
    }
}

async fn select_pipeline(
    kind: MergeKind,
    select: &SelectContext,
    results: Vec<Box<dyn QueryResult>>,
) -> Result<Box<dyn RowSource>> {
    Ok(match kind {
        MergeKind::GroupByStream => {
            let ordered = OrderByStreamSource::new(results, &select.group_by);
            Box::new(GroupByStreamSource::new(Box::new(ordered), select))
        }
        MergeKind::GroupByMemory => {
            Box::new(group_in_memory(Box::new(IteratorSource::new(results)), select).await?)
        }
        _ => Box::new(OrderByStreamSource::new(results, &select.order_by)),
    })
}

/// DML results: the sum of every unit's update count.
pub fn merge_update_counts(counts: &[u64]) -> u64 {
    counts.iter().fold(0u64, |total, count| total.saturating_add(*count))
}
