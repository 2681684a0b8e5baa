//! K-way merge of shard cursors that are each sorted by the same keys.

use std::cmp::Ordering;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Result, ShardingError};
use crate::rewrite::{ColumnKey, OrderByColumn};
use crate::sql::{NullsOrder, OrderDirection};
use crate::value::SqlValue;

use super::result::{read_row, QueryResult, ShardCursors};
use super::stream::RowSource;

/// Position of a merge key within shard rows.
pub(crate) fn resolve_key(key: &ColumnKey, labels: &[String]) -> Result<usize> {
    match key {
        ColumnKey::Index(index) if *index < labels.len() => Ok(*index),
        ColumnKey::Index(index) => Err(ShardingError::Merge(format!(
            "merge column {index} is out of range for {} shard columns",
            labels.len()
        ))),
        ColumnKey::Label(label) => labels
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(label))
            .ok_or_else(|| ShardingError::Merge(format!("shard results have no column `{label}`"))),
    }
}

/// An ORDER BY item with its position resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SortKey {
    pub index: usize,
    pub direction: OrderDirection,
    pub nulls: NullsOrder,
}

impl SortKey {
    pub fn resolve_all(columns: &[OrderByColumn], labels: &[String]) -> Result<Vec<SortKey>> {
        columns
            .iter()
            .map(|column| {
                Ok(SortKey {
                    index: resolve_key(&column.key, labels)?,
                    direction: column.direction,
                    nulls: column.nulls,
                })
            })
            .collect()
    }
}

/// Compares two rows key by key.
pub(crate) fn compare_rows(keys: &[SortKey], left: &[SqlValue], right: &[SqlValue]) -> Result<Ordering> {
    for key in keys {
        let (Some(l), Some(r)) = (left.get(key.index), right.get(key.index)) else {
            return Err(ShardingError::Merge(format!(
                "sort column {} is missing from a shard row",
                key.index
            )));
        };
        // Nulls placement is absolute; direction only reverses non-null comparisons.
        let ordering = match (l.is_null(), r.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => match key.nulls {
                NullsOrder::First => Ordering::Less,
                NullsOrder::Last => Ordering::Greater,
            },
            (false, true) => match key.nulls {
                NullsOrder::First => Ordering::Greater,
                NullsOrder::Last => Ordering::Less,
            },
            (false, false) => {
                let ordering = l.compare(r).ok_or_else(|| {
                    ShardingError::Merge(format!(
                        "cannot order {} against {}",
                        l.type_name(),
                        r.type_name()
                    ))
                })?;
                match key.direction {
                    OrderDirection::Asc => ordering,
                    OrderDirection::Desc => ordering.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}

/// Streams the globally ordered union of pre-sorted shard cursors.
///
/// Holds one head row per shard. Each step emits the smallest head (ties go
/// to the lower shard index) and refills only the shard it came from. Sort
/// keys are resolved once the heads are primed, so shards that are all empty
/// merge to nothing even when they report no labels.
pub(crate) struct OrderByStreamSource {
    shards: ShardCursors,
    labels: Vec<String>,
    order_by: Vec<OrderByColumn>,
    keys: Vec<SortKey>,
    heads: Vec<Option<Vec<SqlValue>>>,
    primed: bool,
}

impl OrderByStreamSource {
    pub fn new(cursors: Vec<Box<dyn QueryResult>>, order_by: &[OrderByColumn]) -> Self {
        let shards = ShardCursors::new(cursors);
        let labels = shards.labels();
        let heads = vec![None; shards.len()];
        Self {
            shards,
            labels,
            order_by: order_by.to_vec(),
            keys: Vec::new(),
            heads,
            primed: false,
        }
    }

    async fn prime(&mut self) -> Result<()> {
        for shard in 0..self.heads.len() {
            self.refill(shard).await?;
        }
        if self.heads.iter().any(Option::is_some) {
            self.keys = SortKey::resolve_all(&self.order_by, &self.labels)?;
        }
        Ok(())
    }

    async fn refill(&mut self, shard: usize) -> Result<()> {
        self.heads[shard] = if self.shards.advance(shard).await? {
            match self.shards.get(shard) {
                Some(cursor) => Some(read_row(cursor)?),
                None => None,
            }
        } else {
            None
        };
        Ok(())
    }

    fn smallest(&self) -> Result<Option<usize>> {
        let mut best: Option<usize> = None;
        for (shard, head) in self.heads.iter().enumerate() {
            let Some(row) = head else { continue };
            best = match best {
                Some(current) => {
                    let current_row = self.heads[current].as_deref().unwrap_or_default();
                    if compare_rows(&self.keys, row, current_row)? == Ordering::Less {
                        Some(shard)
                    } else {
                        Some(current)
                    }
                }
                None => Some(shard),
            };
        }
        Ok(best)
    }

    async fn abort(&mut self, err: ShardingError) -> ShardingError {
        self.heads.iter_mut().for_each(|head| *head = None);
        if let Err(close_err) = self.shards.close_all().await {
            warn!(error = %close_err, "closing shards after a merge failure also failed");
        }
        err
    }
}

#[async_trait]
impl RowSource for OrderByStreamSource {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        self.shards.ensure_live()?;
        if !self.primed {
            self.primed = true;
            if let Err(err) = self.prime().await {
                return Err(self.abort(err).await);
            }
        }
        let shard = match self.smallest() {
            Ok(Some(shard)) => shard,
            Ok(None) => return Ok(None),
            Err(err) => return Err(self.abort(err).await),
        };
        let row = self.heads[shard].take();
        self.refill(shard).await?;
        Ok(row)
    }

    async fn close(&mut self) -> Result<()> {
        self.heads.iter_mut().for_each(|head| *head = None);
        self.shards.close_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::result::MemoryQueryResult;
    use crate::merge::stream::drain;

    fn shard(rows: &[(i64, Option<&str>)]) -> Box<dyn QueryResult> {
        Box::new(MemoryQueryResult::from_labels(
            &["order_id", "status"],
            rows.iter()
                .map(|(id, status)| {
                    vec![
                        SqlValue::Int(*id),
                        status.map(SqlValue::from).unwrap_or(SqlValue::Null),
                    ]
                })
                .collect(),
        ))
    }

    fn ids(rows: &[Vec<SqlValue>]) -> Vec<i64> {
        rows.iter().filter_map(|row| row[0].as_i64()).collect()
    }

    #[tokio::test]
    async fn merges_three_ascending_shards() {
        let cursors = vec![
            shard(&[(1, None), (4, None), (9, None)]),
            shard(&[(2, None), (3, None), (10, None)]),
            shard(&[(5, None)]),
        ];
        let order = [OrderByColumn::new(ColumnKey::Index(0), OrderDirection::Asc, None)];
        let mut source = OrderByStreamSource::new(cursors, &order);
        let rows = drain(&mut source).await.expect("rows");
        assert_eq!(ids(&rows), vec![1, 2, 3, 4, 5, 9, 10]);
    }

    #[tokio::test]
    async fn descending_keys_with_nulls_last_and_label_lookup() {
        let cursors = vec![
            shard(&[(1, Some("b")), (2, None)]),
            shard(&[(3, Some("c")), (4, Some("a")), (5, None)]),
        ];
        let order = [OrderByColumn::new(
            ColumnKey::Label("STATUS".to_string()),
            OrderDirection::Desc,
            None,
        )];
        let mut source = OrderByStreamSource::new(cursors, &order);
        let rows = drain(&mut source).await.expect("rows");
        // Equal (null) keys keep the lower shard first.
        assert_eq!(ids(&rows), vec![3, 1, 4, 2, 5]);
    }

    #[tokio::test]
    async fn incomparable_keys_fail_the_merge() {
        let text = MemoryQueryResult::from_labels(&["k"], vec![vec!["x".into()]]);
        let int = MemoryQueryResult::from_labels(&["k"], vec![vec![1.into()]]);
        let order = [OrderByColumn::new(ColumnKey::Index(0), OrderDirection::Asc, None)];
        let mut source = OrderByStreamSource::new(vec![Box::new(text), Box::new(int)], &order);
        let err = source.next_row().await.expect_err("type mismatch");
        assert!(matches!(err, ShardingError::Merge(_)));
    }

    #[tokio::test]
    async fn empty_unlabelled_shards_merge_to_nothing() {
        let cursors: Vec<Box<dyn QueryResult>> = (0..3)
            .map(|_| Box::new(MemoryQueryResult::default()) as Box<dyn QueryResult>)
            .collect();
        let order = [OrderByColumn::new(
            ColumnKey::Label("order_id".to_string()),
            OrderDirection::Asc,
            None,
        )];
        let mut source = OrderByStreamSource::new(cursors, &order);
        assert_eq!(drain(&mut source).await.expect("rows"), Vec::<Vec<SqlValue>>::new());
    }

    #[tokio::test]
    async fn unresolvable_key_closes_every_shard_once() {
        let cursors: Vec<MemoryQueryResult> = (0..4)
            .map(|id| MemoryQueryResult::from_labels(&["x"], vec![vec![SqlValue::Int(id)]]))
            .collect();
        let closes: Vec<_> = cursors.iter().map(MemoryQueryResult::close_count).collect();
        let order = [OrderByColumn::new(
            ColumnKey::Label("order_id".to_string()),
            OrderDirection::Asc,
            None,
        )];
        let mut source = OrderByStreamSource::new(
            cursors
                .into_iter()
                .map(|cursor| Box::new(cursor) as Box<dyn QueryResult>)
                .collect(),
            &order,
        );
        let err = source.next_row().await.expect_err("unknown column");
        assert!(matches!(err, ShardingError::Merge(_)));
        source.close().await.expect("close after failure");
        assert!(closes.iter().all(|count| count.get() == 1));
    }

    #[test]
    fn unknown_label_is_reported() {
        let labels = vec!["a".to_string()];
        assert!(resolve_key(&ColumnKey::Label("b".to_string()), &labels).is_err());
        assert_eq!(resolve_key(&ColumnKey::Label("A".to_string()), &labels).expect("a"), 0);
    }
}
