//! Transparent and concatenating merges, and the row pipeline they feed.

use async_trait::async_trait;

use crate::error::{Result, ShardingError};
use crate::value::SqlValue;

use super::result::{column_out_of_range, read_row, MergedResult, QueryResult, ShardCursors};

/// Full-width rows (derived columns included) flowing between merge stages.
#[async_trait]
pub(crate) trait RowSource: Send {
    fn labels(&self) -> &[String];

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>>;

    async fn close(&mut self) -> Result<()>;
}

/// Exposes the visible prefix of a row pipeline as a merged result.
pub(crate) struct PipelineMergedResult {
    source: Box<dyn RowSource>,
    visible: Vec<String>,
    current: Option<Vec<SqlValue>>,
    closed: bool,
}

impl PipelineMergedResult {
    pub fn new(source: Box<dyn RowSource>, derived_columns: usize) -> Self {
        let labels = source.labels();
        let visible = labels[..labels.len().saturating_sub(derived_columns)].to_vec();
        Self {
            source,
            visible,
            current: None,
            closed: false,
        }
    }
}

#[async_trait]
impl MergedResult for PipelineMergedResult {
    fn column_labels(&self) -> &[String] {
        &self.visible
    }

    async fn next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(ShardingError::Merge("merged result is closed".to_string()));
        }
        self.current = self.source.next_row().await?;
        Ok(self.current.is_some())
    }

    fn value(&self, index: usize) -> Result<SqlValue> {
        if index >= self.visible.len() {
            return Err(column_out_of_range(index, self.visible.len()));
        }
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| ShardingError::Merge("merged result is not positioned on a row".to_string()))?;
        row.get(index)
            .cloned()
            .ok_or_else(|| column_out_of_range(index, row.len()))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        self.source.close().await
    }
}

/// One shard cursor handed through untouched.
pub struct TransparentMergedResult {
    cursor: Box<dyn QueryResult>,
    closed: bool,
}

impl TransparentMergedResult {
    pub fn new(cursor: Box<dyn QueryResult>) -> Self {
        Self {
            cursor,
            closed: false,
        }
    }
}

#[async_trait]
impl MergedResult for TransparentMergedResult {
    fn column_labels(&self) -> &[String] {
        self.cursor.column_labels()
    }

    async fn next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(ShardingError::Merge("merged result is closed".to_string()));
        }
        self.cursor.next().await
    }

    fn value(&self, index: usize) -> Result<SqlValue> {
        self.cursor.value(index)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursor.close().await
    }
}

/// Shard rows concatenated in route order.
pub(crate) struct IteratorSource {
    shards: ShardCursors,
    labels: Vec<String>,
    shard: usize,
}

impl IteratorSource {
    pub fn new(cursors: Vec<Box<dyn QueryResult>>) -> Self {
        let shards = ShardCursors::new(cursors);
        let labels = shards.labels();
        Self {
            shards,
            labels,
            shard: 0,
        }
    }
}

#[async_trait]
impl RowSource for IteratorSource {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        while self.shard < self.shards.len() {
            if self.shards.advance(self.shard).await? {
                let cursor = self
                    .shards
                    .get(self.shard)
                    .ok_or_else(|| ShardingError::Merge(format!("shard {} vanished", self.shard)))?;
                return Ok(Some(read_row(cursor)?));
            }
            self.shard += 1;
        }
        self.shards.ensure_live()?;
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.shards.close_all().await
    }
}

/// Rows produced up front, such as buffered groups.
pub(crate) struct BufferedSource {
    labels: Vec<String>,
    rows: std::vec::IntoIter<Vec<SqlValue>>,
}

impl BufferedSource {
    pub fn new(labels: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            labels,
            rows: rows.into_iter(),
        }
    }
}

#[async_trait]
impl RowSource for BufferedSource {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        Ok(self.rows.next())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drains a source completely; the source is closed either way.
pub(crate) async fn drain(source: &mut dyn RowSource) -> Result<Vec<Vec<SqlValue>>> {
    let mut rows = Vec::new();
    loop {
        match source.next_row().await {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break,
            Err(err) => {
                let _ = source.close().await;
                return Err(err);
            }
        }
    }
    source.close().await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::result::{collect_rows, MemoryQueryResult};

    fn shard(ids: &[i64]) -> Box<dyn QueryResult> {
        Box::new(MemoryQueryResult::from_labels(
            &["id"],
            ids.iter().map(|id| vec![SqlValue::Int(*id)]).collect(),
        ))
    }

    #[tokio::test]
    async fn iterator_concatenates_in_route_order() {
        let source = IteratorSource::new(vec![shard(&[3, 1]), shard(&[]), shard(&[2])]);
        let mut merged = PipelineMergedResult::new(Box::new(source), 0);
        let rows = collect_rows(&mut merged).await.expect("rows");
        assert_eq!(
            rows,
            vec![vec![SqlValue::Int(3)], vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]]
        );
        merged.close().await.expect("idempotent close");
    }

    #[tokio::test]
    async fn derived_columns_are_hidden() {
        let cursor = MemoryQueryResult::from_labels(
            &["status", "ORDER_BY_DERIVED_0"],
            vec![vec!["paid".into(), 1.into()]],
        );
        let source = IteratorSource::new(vec![Box::new(cursor)]);
        let mut merged = PipelineMergedResult::new(Box::new(source), 1);
        assert_eq!(merged.column_labels(), ["status".to_string()]);
        assert!(merged.next().await.expect("row"));
        assert_eq!(merged.value(0).expect("status"), SqlValue::Text("paid".into()));
        assert!(merged.value(1).is_err());
    }

    #[tokio::test]
    async fn cursor_error_aborts_the_merge() {
        let bad = MemoryQueryResult::from_labels(&["id"], vec![vec![1.into()], vec![2.into()]])
            .failing_at(1);
        let source = IteratorSource::new(vec![Box::new(bad), shard(&[5])]);
        let mut merged = PipelineMergedResult::new(Box::new(source), 0);
        assert!(merged.next().await.expect("first"));
        let err = merged.next().await.expect_err("shard failure");
        assert_eq!(err.category(), crate::error::ErrorCategory::Merge);
        assert!(merged.next().await.is_err());
    }
}
