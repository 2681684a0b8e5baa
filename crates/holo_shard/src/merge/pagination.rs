//! Logical LIMIT/OFFSET applied once over the merged stream.

use async_trait::async_trait;

use crate::error::Result;
use crate::rewrite::Pagination;
use crate::value::SqlValue;

use super::stream::RowSource;

pub(crate) struct PaginationSource {
    inner: Box<dyn RowSource>,
    pagination: Pagination,
    skipped: bool,
    emitted: u64,
}

impl PaginationSource {
    pub fn new(inner: Box<dyn RowSource>, pagination: Pagination) -> Self {
        Self {
            inner,
            pagination,
            skipped: false,
            emitted: 0,
        }
    }
}

#[async_trait]
impl RowSource for PaginationSource {
    fn labels(&self) -> &[String] {
        self.inner.labels()
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        if !self.skipped {
            self.skipped = true;
            for _ in 0..self.pagination.offset {
                if self.inner.next_row().await?.is_none() {
                    return Ok(None);
                }
            }
        }
        if self
            .pagination
            .row_count
            .is_some_and(|row_count| self.emitted >= row_count)
        {
            return Ok(None);
        }
        let row = self.inner.next_row().await?;
        if row.is_some() {
            self.emitted += 1;
        }
        Ok(row)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::stream::{drain, BufferedSource};

    fn numbers(count: i64) -> Box<dyn RowSource> {
        Box::new(BufferedSource::new(
            vec!["n".to_string()],
            (1..=count).map(|n| vec![SqlValue::Int(n)]).collect(),
        ))
    }

    #[tokio::test]
    async fn offset_then_row_count() {
        let mut source = PaginationSource::new(
            numbers(10),
            Pagination {
                offset: 3,
                row_count: Some(2),
            },
        );
        let rows = drain(&mut source).await.expect("rows");
        assert_eq!(rows, vec![vec![SqlValue::Int(4)], vec![SqlValue::Int(5)]]);
    }

    #[tokio::test]
    async fn offset_past_the_end_is_empty() {
        let mut source = PaginationSource::new(
            numbers(2),
            Pagination {
                offset: 5,
                row_count: None,
            },
        );
        assert!(drain(&mut source).await.expect("rows").is_empty());
    }
}
