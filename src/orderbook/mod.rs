//! Order book module for aggregated market data.
//!
//! This module handles:
//! - Order book types and data structures
//! - Per-side price-level maps with price normalization
//! - Snapshot/incremental application and statistics
//! - Read-only views for observers

pub mod aggregator;
pub mod level_book;
pub mod types;
pub mod view;

pub use aggregator::{AggregationPolicy, OrderBookAggregator};
pub use level_book::{normalize_price, PriceLevelBook};
pub use types::{BookSnapshot, DerivedStats, PriceLevel, Side};
pub use view::SnapshotView;
