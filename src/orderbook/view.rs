//! Read-only observer handle over an aggregator.

use std::sync::Arc;

use super::aggregator::OrderBookAggregator;
use super::types::{BookSnapshot, DerivedStats, Side};

/// Cloneable, read-only access to one instrument's aggregated book.
///
/// Observers hold this instead of the aggregator so only the feed session can
/// mutate the book.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    aggregator: Arc<OrderBookAggregator>,
}

impl SnapshotView {
    /// Wrap an aggregator.
    pub fn new(aggregator: Arc<OrderBookAggregator>) -> Self {
        Self { aggregator }
    }

    /// Instrument symbol.
    pub fn symbol(&self) -> &str {
        self.aggregator.symbol()
    }

    /// Point-in-time, internally consistent export of the book.
    pub fn snapshot(&self) -> BookSnapshot {
        self.aggregator.snapshot()
    }

    /// Export limited to the best `depth` levels per side.
    pub fn snapshot_with_depth(&self, depth: Option<usize>) -> BookSnapshot {
        match depth {
            Some(depth) => self.snapshot().truncated(depth),
            None => self.snapshot(),
        }
    }

    /// Statistics for one side.
    pub fn stats_for(&self, side: Side) -> DerivedStats {
        self.aggregator.stats_for(side)
    }
}
