//! Error taxonomy for routing, rewriting and merging.
//!
//! Every failure surfaced by the core maps onto one [`ErrorCategory`] so the
//! caller (protocol layer, driver) can decide how to present it. Nothing in
//! this crate retries on any category.

use thiserror::Error;

/// Boxed error produced by an external collaborator (executor, cursor).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of [`ShardingError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The statement text could not be turned into a statement context.
    Parse,
    /// A rule, strategy or algorithm is missing or inconsistent.
    Configuration,
    /// A sharding value could not be evaluated by its algorithm.
    Condition,
    /// A token could not be rendered for an execution target.
    Rewrite,
    /// Shard results could not be combined, or a shard cursor failed.
    Merge,
}

/// Errors raised by the sharding core.
#[derive(Debug, Error)]
pub enum ShardingError {
    #[error("sql parse error at byte {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sharding algorithm type `{0}` is not registered")]
    AlgorithmNotFound(String),

    #[error("key generate algorithm type `{0}` is not registered")]
    KeyGeneratorNotFound(String),

    #[error("no route for logical table `{0}`: table has no rule and no default data source is configured")]
    NoRoute(String),

    #[error("sharding values of logical table `{0}` match no configured data node")]
    NoDataNode(String),

    #[error("tables {tables:?} do not share any physical data source")]
    CrossDataSourceJoin { tables: Vec<String> },

    #[error("statement produced {units} execution units, limit is {limit}")]
    TooManyExecutionUnits { units: usize, limit: usize },

    #[error("invalid sharding value for `{table}`.`{column}`: {message}")]
    Condition {
        table: String,
        column: String,
        message: String,
    },

    #[error("parameter index {index} is out of range, {len} parameters were supplied")]
    ParameterOutOfRange { index: usize, len: usize },

    #[error("insert row {row} of `{table}` routes to {nodes} data nodes, expected exactly one")]
    InsertRoutedToMultipleNodes {
        table: String,
        row: usize,
        nodes: usize,
    },

    #[error("cannot change the sharding value of `{table}`.`{column}` with UPDATE")]
    ShardingValueUpdate { table: String, column: String },

    #[error("cannot render {token} token at [{start}, {stop}): {reason}")]
    Rewrite {
        token: &'static str,
        start: usize,
        stop: usize,
        reason: String,
    },

    #[error("merge error: {0}")]
    Merge(String),

    #[error("shard cursor failed: {0}")]
    Cursor(#[source] BoxError),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ShardingError {
    /// Wraps an executor/cursor failure.
    pub fn cursor<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ShardingError::Cursor(err.into())
    }

    pub(crate) fn condition(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ShardingError::Condition {
            table: table.into(),
            column: column.into(),
            message: message.into(),
        }
    }

    /// Returns the taxonomy bucket for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ShardingError::Parse { .. } | ShardingError::Unsupported(_) => ErrorCategory::Parse,
            ShardingError::Config(_)
            | ShardingError::AlgorithmNotFound(_)
            | ShardingError::KeyGeneratorNotFound(_)
            | ShardingError::NoRoute(_)
            | ShardingError::CrossDataSourceJoin { .. }
            | ShardingError::TooManyExecutionUnits { .. } => ErrorCategory::Configuration,
            ShardingError::Condition { .. }
            | ShardingError::NoDataNode(_)
            | ShardingError::ParameterOutOfRange { .. }
            | ShardingError::InsertRoutedToMultipleNodes { .. }
            | ShardingError::ShardingValueUpdate { .. } => ErrorCategory::Condition,
            ShardingError::Rewrite { .. } => ErrorCategory::Rewrite,
            ShardingError::Merge(_) | ShardingError::Cursor(_) => ErrorCategory::Merge,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ShardingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_errors_are_merge_category_and_keep_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection reset");
        let err = ShardingError::cursor(io);
        assert_eq!(err.category(), ErrorCategory::Merge);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn rewrite_error_reports_token_and_span() {
        let err = ShardingError::Rewrite {
            token: "insert-values",
            start: 12,
            stop: 40,
            reason: "no rows route to ds_1".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Rewrite);
        assert_eq!(
            err.to_string(),
            "cannot render insert-values token at [12, 40): no rows route to ds_1"
        );
    }
}
