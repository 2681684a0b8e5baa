//! In-process counters for routing and merging.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::route::RouteType;

/// Aggregated counters updated by the sharding engine.
#[derive(Debug, Default)]
pub struct ShardingMetrics {
    /// Statements that produced a route.
    statements_routed: AtomicU64,
    /// Physical statements produced by rewriting.
    execution_units: AtomicU64,
    /// Routes that fan out to every data source or every data node.
    broadcast_routes: AtomicU64,
    /// Routes forced by a hint.
    hint_routes: AtomicU64,
    /// Rows returned from merged results.
    merged_rows: AtomicU64,
    /// Statements whose execution or merge failed.
    merge_failures: AtomicU64,
}

/// Immutable snapshot view of [`ShardingMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShardingMetricsSnapshot {
    pub statements_routed: u64,
    pub execution_units: u64,
    pub broadcast_routes: u64,
    pub hint_routes: u64,
    pub merged_rows: u64,
    pub merge_failures: u64,
}

impl ShardingMetrics {
    /// Records one routed statement and the units it was rewritten into.
    pub fn record_route(&self, route_type: RouteType, units: usize) {
        self.statements_routed.fetch_add(1, Ordering::Relaxed);
        self.execution_units.fetch_add(units as u64, Ordering::Relaxed);
        match route_type {
            RouteType::TableBroadcast | RouteType::DatabaseBroadcast => {
                self.broadcast_routes.fetch_add(1, Ordering::Relaxed);
            }
            RouteType::Hint => {
                self.hint_routes.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_merged_rows(&self, rows: u64) {
        self.merged_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_merge_failure(&self) {
        self.merge_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ShardingMetricsSnapshot {
        ShardingMetricsSnapshot {
            statements_routed: self.statements_routed.load(Ordering::Relaxed),
            execution_units: self.execution_units.load(Ordering::Relaxed),
            broadcast_routes: self.broadcast_routes.load(Ordering::Relaxed),
            hint_routes: self.hint_routes.load(Ordering::Relaxed),
            merged_rows: self.merged_rows.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_and_hint_routes_are_counted_separately() {
        let metrics = ShardingMetrics::default();
        metrics.record_route(RouteType::Standard, 1);
        metrics.record_route(RouteType::DatabaseBroadcast, 2);
        metrics.record_route(RouteType::Hint, 1);
        metrics.record_merged_rows(7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.statements_routed, 3);
        assert_eq!(snapshot.execution_units, 4);
        assert_eq!(snapshot.broadcast_routes, 1);
        assert_eq!(snapshot.hint_routes, 1);
        assert_eq!(snapshot.merged_rows, 7);
        assert_eq!(snapshot.merge_failures, 0);
    }
}
