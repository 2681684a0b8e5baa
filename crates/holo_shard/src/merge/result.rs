//! Cursor traits shared by shard results and merged results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Result, ShardingError};
use crate::value::SqlValue;

/// Forward-only cursor over one physical statement's rows.
#[async_trait]
pub trait QueryResult: Send {
    fn column_labels(&self) -> &[String];

    /// Moves to the next row; `false` once exhausted.
    async fn next(&mut self) -> Result<bool>;

    /// Value of the current row.
    fn value(&self, index: usize) -> Result<SqlValue>;

    async fn close(&mut self) -> Result<()>;
}

/// The single logical cursor handed back to the caller.
#[async_trait]
pub trait MergedResult: Send {
    /// Client-visible columns only.
    fn column_labels(&self) -> &[String];

    async fn next(&mut self) -> Result<bool>;

    fn value(&self, index: usize) -> Result<SqlValue>;

    /// Closes every underlying cursor still open. Safe to call repeatedly.
    async fn close(&mut self) -> Result<()>;
}

/// Drains a merged result into rows of visible values and closes it.
pub async fn collect_rows(result: &mut dyn MergedResult) -> Result<Vec<Vec<SqlValue>>> {
    let width = result.column_labels().len();
    let mut rows = Vec::new();
    let drained = async {
        while result.next().await? {
            let row = (0..width)
                .map(|index| result.value(index))
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }
        Ok::<_, ShardingError>(())
    }
    .await;
    let closed = result.close().await;
    drained?;
    closed?;
    Ok(rows)
}

/// Reads every column of the current row.
pub(crate) fn read_row(cursor: &dyn QueryResult) -> Result<Vec<SqlValue>> {
    (0..cursor.column_labels().len())
        .map(|index| cursor.value(index))
        .collect()
}

pub(crate) fn column_out_of_range(index: usize, width: usize) -> ShardingError {
    ShardingError::Merge(format!(
        "column index {index} is out of range for {width} visible columns"
    ))
}

/// Shard cursors with exactly-once close and abort-on-error bookkeeping.
pub(crate) struct ShardCursors {
    cursors: Vec<Box<dyn QueryResult>>,
    closed: Vec<bool>,
    aborted: bool,
}

impl ShardCursors {
    pub fn new(cursors: Vec<Box<dyn QueryResult>>) -> Self {
        let closed = vec![false; cursors.len()];
        Self {
            cursors,
            closed,
            aborted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn get(&self, shard: usize) -> Option<&dyn QueryResult> {
        self.cursors.get(shard).map(|cursor| cursor.as_ref())
    }

    /// Labels of the first shard that reports any; every shard runs the
    /// same projection, but an empty result may carry no labels.
    pub fn labels(&self) -> Vec<String> {
        self.cursors
            .iter()
            .map(|cursor| cursor.column_labels())
            .find(|labels| !labels.is_empty())
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.aborted {
            return Err(ShardingError::Merge(
                "merged result was aborted by an earlier shard failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Advances one shard. A failure closes every shard and poisons the merge.
    pub async fn advance(&mut self, shard: usize) -> Result<bool> {
        self.ensure_live()?;
        if self.closed.get(shard).copied().unwrap_or(true) {
            return Ok(false);
        }
        let outcome = match self.cursors.get_mut(shard) {
            Some(cursor) => cursor.next().await,
            None => Ok(false),
        };
        match outcome {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.close_one(shard).await;
                Ok(false)
            }
            Err(err) => {
                warn!(shard, error = %err, "shard cursor failed, aborting merged result");
                self.aborted = true;
                if let Err(close_err) = self.close_all().await {
                    warn!(shard, error = %close_err, "closing shards after a failure also failed");
                }
                Err(err)
            }
        }
    }

    async fn close_one(&mut self, shard: usize) -> Option<ShardingError> {
        if self.closed.get(shard).copied().unwrap_or(true) {
            return None;
        }
        self.closed[shard] = true;
        let cursor = self.cursors.get_mut(shard)?;
        match cursor.close().await {
            Ok(()) => None,
            Err(err) => {
                warn!(shard, error = %err, "closing shard cursor failed");
                Some(err)
            }
        }
    }

    /// Closes every open shard and reports the first close failure.
    pub async fn close_all(&mut self) -> Result<()> {
        let mut first = None;
        for shard in 0..self.cursors.len() {
            if let Some(err) = self.close_one(shard).await {
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Closes cursors that never made it into a merged result.
pub(crate) async fn close_unmerged(cursors: Vec<Box<dyn QueryResult>>) {
    for (shard, mut cursor) in cursors.into_iter().enumerate() {
        if let Err(err) = cursor.close().await {
            warn!(shard, error = %err, "closing unmerged shard cursor failed");
        }
    }
}

/// Number of `close` calls a [`MemoryQueryResult`] received, readable after
/// the cursor itself has been handed to a merge.
#[derive(Debug, Clone, Default)]
pub struct CloseCount(Arc<AtomicUsize>);

impl CloseCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Rows held in memory, used by the in-memory executor and tests.
///
/// Clones share one [`CloseCount`].
#[derive(Debug, Clone, Default)]
pub struct MemoryQueryResult {
    labels: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    /// Index of the current row plus one; 0 before the first `next`.
    position: usize,
    closed: bool,
    closes: CloseCount,
    fail_at: Option<usize>,
}

impl MemoryQueryResult {
    pub fn new(labels: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            labels,
            rows,
            ..Default::default()
        }
    }

    pub fn from_labels(labels: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        Self::new(labels.iter().map(|label| label.to_string()).collect(), rows)
    }

    /// Makes the `n`th call to `next` (zero-based) fail.
    pub fn failing_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    pub fn close_count(&self) -> CloseCount {
        self.closes.clone()
    }
}

#[async_trait]
impl QueryResult for MemoryQueryResult {
    fn column_labels(&self) -> &[String] {
        &self.labels
    }

    async fn next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(ShardingError::cursor("cursor is closed"));
        }
        if self.fail_at == Some(self.position) {
            return Err(ShardingError::cursor(format!(
                "injected failure at row {}",
                self.position
            )));
        }
        if self.position >= self.rows.len() {
            return Ok(false);
        }
        self.position += 1;
        Ok(true)
    }

    fn value(&self, index: usize) -> Result<SqlValue> {
        let row = self
            .position
            .checked_sub(1)
            .and_then(|row| self.rows.get(row))
            .ok_or_else(|| ShardingError::Merge("cursor is not positioned on a row".to_string()))?;
        row.get(index)
            .cloned()
            .ok_or_else(|| column_out_of_range(index, row.len()))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.closes.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shard_failure_closes_every_cursor_once() {
        let ok = MemoryQueryResult::from_labels(&["id"], vec![vec![1.into()], vec![2.into()]]);
        let bad = MemoryQueryResult::from_labels(&["id"], vec![vec![3.into()]]).failing_at(0);
        let closes = [ok.close_count(), bad.close_count()];
        let mut shards = ShardCursors::new(vec![Box::new(ok), Box::new(bad)]);

        assert!(shards.advance(0).await.expect("first row"));
        let err = shards.advance(1).await.expect_err("injected");
        assert!(matches!(err, ShardingError::Cursor(_)));
        assert!(shards.ensure_live().is_err());
        shards.close_all().await.expect("already closed");
        assert!(shards.advance(0).await.is_err());
        assert_eq!(closes.iter().map(CloseCount::get).collect::<Vec<_>>(), vec![1, 1]);
    }

    #[tokio::test]
    async fn exhausted_shard_is_closed_once() {
        let cursor = MemoryQueryResult::from_labels(&["id"], vec![vec![1.into()]]);
        let closes = cursor.close_count();
        let mut shards = ShardCursors::new(vec![Box::new(cursor)]);
        assert!(shards.advance(0).await.expect("row"));
        assert!(!shards.advance(0).await.expect("end"));
        assert!(!shards.advance(0).await.expect("still ended"));
        shards.close_all().await.expect("close");
        assert_eq!(closes.get(), 1);
    }

    #[tokio::test]
    async fn unmerged_cursors_are_closed() {
        let cursors: Vec<MemoryQueryResult> = (0..3)
            .map(|_| MemoryQueryResult::from_labels(&["id"], Vec::new()))
            .collect();
        let closes: Vec<CloseCount> = cursors.iter().map(MemoryQueryResult::close_count).collect();
        close_unmerged(
            cursors
                .into_iter()
                .map(|cursor| Box::new(cursor) as Box<dyn QueryResult>)
                .collect(),
        )
        .await;
        assert!(closes.iter().all(|count| count.get() == 1));
    }
}
