//! Group merging: streaming over key-sorted input, or buffered in memory.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Result, ShardingError};
use crate::rewrite::SelectContext;
use crate::value::SqlValue;

use super::aggregation::{AggregationUnit, ResolvedAggregation};
use super::order_by::{compare_rows, SortKey};
use super::stream::{drain, BufferedSource, RowSource};

/// Per-group accumulator: the first row of the group plus one unit per aggregate.
struct GroupState {
    row: Vec<SqlValue>,
    units: Vec<AggregationUnit>,
}

impl GroupState {
    fn start(row: Vec<SqlValue>, aggregations: &[ResolvedAggregation]) -> Result<Self> {
        let mut state = Self {
            units: aggregations
                .iter()
                .map(|aggregation| AggregationUnit::new(aggregation.func))
                .collect(),
            row,
        };
        let first = state.row.clone();
        state.fold(&first, aggregations)?;
        Ok(state)
    }

    fn fold(&mut self, row: &[SqlValue], aggregations: &[ResolvedAggregation]) -> Result<()> {
        for (unit, aggregation) in self.units.iter_mut().zip(aggregations) {
            unit.merge(aggregation, row)?;
        }
        Ok(())
    }

    fn finish(mut self, aggregations: &[ResolvedAggregation]) -> Result<Vec<SqlValue>> {
        for (unit, aggregation) in self.units.iter().zip(aggregations) {
            let slot = self.row.get_mut(aggregation.index).ok_or_else(|| {
                ShardingError::Merge(format!("aggregate column {} is out of range", aggregation.index))
            })?;
            *slot = unit.result()?;
        }
        Ok(self.row)
    }
}

fn resolve_aggregations(select: &SelectContext, labels: &[String]) -> Result<Vec<ResolvedAggregation>> {
    select
        .aggregations
        .iter()
        .map(|column| ResolvedAggregation::resolve(column, labels))
        .collect()
}

fn same_group(keys: &[SortKey], left: &[SqlValue], right: &[SqlValue]) -> bool {
    keys.iter().all(|key| match (left.get(key.index), right.get(key.index)) {
        (Some(l), Some(r)) => l.sql_eq(r),
        _ => false,
    })
}

/// Groups rows that arrive sorted by the group key; one group is held at a time.
pub(crate) struct GroupByStreamSource {
    inner: Box<dyn RowSource>,
    labels: Vec<String>,
    select: SelectContext,
    /// Group keys and aggregations are resolved when the first row arrives.
    resolved: bool,
    group_keys: Vec<SortKey>,
    aggregations: Vec<ResolvedAggregation>,
    lookahead: Option<Vec<SqlValue>>,
    exhausted: bool,
}

impl GroupByStreamSource {
    pub fn new(inner: Box<dyn RowSource>, select: &SelectContext) -> Self {
        let labels = inner.labels().to_vec();
        Self {
            inner,
            labels,
            select: select.clone(),
            resolved: false,
            group_keys: Vec::new(),
            aggregations: Vec::new(),
            lookahead: None,
            exhausted: false,
        }
    }

    async fn resolve(&mut self) -> Result<()> {
        if self.resolved {
            return Ok(());
        }
        let resolved = SortKey::resolve_all(&self.select.group_by, &self.labels)
            .and_then(|keys| Ok((keys, resolve_aggregations(&self.select, &self.labels)?)));
        match resolved {
            Ok((group_keys, aggregations)) => {
                self.resolved = true;
                self.group_keys = group_keys;
                self.aggregations = aggregations;
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = self.inner.close().await {
                    warn!(error = %close_err, "closing shards after a merge failure also failed");
                }
                Err(err)
            }
        }
    }

    async fn pull(&mut self) -> Result<Option<Vec<SqlValue>>> {
        if let Some(row) = self.lookahead.take() {
            return Ok(Some(row));
        }
        if self.exhausted {
            return Ok(None);
        }
        let row = self.inner.next_row().await?;
        self.exhausted = row.is_none();
        Ok(row)
    }
}

#[async_trait]
impl RowSource for GroupByStreamSource {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        let Some(first) = self.pull().await? else {
            return Ok(None);
        };
        self.resolve().await?;
        let mut group = GroupState::start(first, &self.aggregations)?;
        while let Some(row) = self.pull().await? {
            if !same_group(&self.group_keys, &group.row, &row) {
                self.lookahead = Some(row);
                break;
            }
            group.fold(&row, &self.aggregations)?;
        }
        group.finish(&self.aggregations).map(Some)
    }

    async fn close(&mut self) -> Result<()> {
        self.lookahead = None;
        self.inner.close().await
    }
}

/// Buffers every shard row, groups by key in first-seen order, then sorts the
/// groups by the statement's ORDER BY. Keys are resolved after the shards are
/// drained, so empty shards without labels yield no groups.
pub(crate) async fn group_in_memory(
    mut inner: Box<dyn RowSource>,
    select: &SelectContext,
) -> Result<BufferedSource> {
    let labels = inner.labels().to_vec();
    let rows = drain(inner.as_mut()).await?;
    if rows.is_empty() {
        return Ok(BufferedSource::new(labels, rows));
    }
    let group_keys = SortKey::resolve_all(&select.group_by, &labels)?;
    let aggregations = resolve_aggregations(select, &labels)?;
    let order_keys = SortKey::resolve_all(&select.order_by, &labels)?;

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<GroupState> = Vec::new();
    for row in rows {
        let mut key = String::new();
        for sort_key in &group_keys {
            if let Some(value) = row.get(sort_key.index) {
                value.encode_key(&mut key);
            }
        }
        match index.get(&key) {
            Some(&position) => groups[position].fold(&row, &aggregations)?,
            None => {
                index.insert(key, groups.len());
                groups.push(GroupState::start(row, &aggregations)?);
            }
        }
    }

    let mut merged = groups
        .into_iter()
        .map(|group| group.finish(&aggregations))
        .collect::<Result<Vec<_>>>()?;
    if !order_keys.is_empty() {
        let mut failure = None;
        merged.sort_by(|left, right| {
            compare_rows(&order_keys, left, right).unwrap_or_else(|err| {
                failure.get_or_insert(err);
                std::cmp::Ordering::Equal
            })
        });
        if let Some(err) = failure {
            return Err(err);
        }
    }
    debug!(groups = merged.len(), "grouped shard rows in memory");
    Ok(BufferedSource::new(labels, merged))
}

/// `SELECT DISTINCT`: drops rows whose visible columns were already emitted.
pub(crate) struct DistinctSource {
    inner: Box<dyn RowSource>,
    visible: usize,
    seen: HashSet<String>,
}

impl DistinctSource {
    pub fn new(inner: Box<dyn RowSource>, derived_columns: usize) -> Self {
        let visible = inner.labels().len().saturating_sub(derived_columns);
        Self {
            inner,
            visible,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl RowSource for DistinctSource {
    fn labels(&self) -> &[String] {
        self.inner.labels()
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        while let Some(row) = self.inner.next_row().await? {
            let mut key = String::new();
            for value in row.iter().take(self.visible) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::result::{MemoryQueryResult, QueryResult};
    use crate::merge::order_by::OrderByStreamSource;
    use crate::merge::stream::IteratorSource;
    use crate::rewrite::{AggregationColumn, ColumnKey, OrderByColumn};
    use crate::sql::{AggregateFunc, OrderDirection};

    fn shard(rows: Vec<(&str, i64)>) -> Box<dyn QueryResult> {
        Box::new(MemoryQueryResult::from_labels(
            &["status", "c"],
            rows.into_iter()
                .map(|(status, count)| vec![SqlValue::from(status), SqlValue::Int(count)])
                .collect(),
        ))
    }

    fn by_status() -> SelectContext {
        let status = OrderByColumn::new(ColumnKey::Index(0), OrderDirection::Asc, None);
        SelectContext {
            order_by: vec![status.clone()],
            group_by: vec![status],
            aggregations: vec![AggregationColumn {
                key: ColumnKey::Index(1),
                func: AggregateFunc::Count,
                avg_inputs: None,
            }],
            group_order_matches: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stream_groups_adjacent_keys() {
        let select = by_status();
        let inner = OrderByStreamSource::new(
            vec![
                shard(vec![("a", 1), ("b", 2)]),
                shard(vec![("a", 3), ("c", 4)]),
            ],
            &select.order_by,
        );
        let mut source = GroupByStreamSource::new(Box::new(inner), &select);
        let rows = drain(&mut source).await.expect("rows");
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::from("a"), SqlValue::Int(4)],
                vec![SqlValue::from("b"), SqlValue::Int(2)],
                vec![SqlValue::from("c"), SqlValue::Int(4)],
            ]
        );
    }

    #[tokio::test]
    async fn memory_groups_then_orders_by_aggregate() {
        let mut select = by_status();
        select.order_by = vec![OrderByColumn::new(ColumnKey::Index(1), OrderDirection::Desc, None)];
        select.group_order_matches = false;
        let inner = IteratorSource::new(vec![
            shard(vec![("b", 2), ("a", 1)]),
            shard(vec![("c", 1), ("a", 5)]),
        ]);
        let mut source = group_in_memory(Box::new(inner), &select).await.expect("grouped");
        let rows = drain(&mut source).await.expect("rows");
        let statuses: Vec<&str> = rows.iter().filter_map(|row| row[0].as_str()).collect();
        assert_eq!(statuses, vec!["a", "b", "c"]);
        assert_eq!(rows[0][1], SqlValue::Int(6));
    }

    #[tokio::test]
    async fn empty_shards_without_labels_yield_no_groups() {
        let select = by_status();
        let empty = || Box::new(MemoryQueryResult::default()) as Box<dyn QueryResult>;

        let ordered = OrderByStreamSource::new(vec![empty(), empty()], &select.group_by);
        let mut streamed = GroupByStreamSource::new(Box::new(ordered), &select);
        assert!(drain(&mut streamed).await.expect("streamed").is_empty());

        let inner = IteratorSource::new(vec![empty(), empty()]);
        let mut buffered = group_in_memory(Box::new(inner), &select).await.expect("buffered");
        assert!(drain(&mut buffered).await.expect("buffered rows").is_empty());
    }

    #[tokio::test]
    async fn distinct_ignores_hidden_columns() {
        let inner = IteratorSource::new(vec![
            shard(vec![("a", 1), ("b", 2)]),
            shard(vec![("a", 3), ("b", 2)]),
        ]);
        let mut source = DistinctSource::new(Box::new(inner), 1);
        let rows = drain(&mut source).await.expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], SqlValue::from("b"));
    }
}
