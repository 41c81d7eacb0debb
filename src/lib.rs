//! Live level-2 order book aggregation.
//!
//! A feed session authenticates against the market-data service, subscribes
//! to the level-2 topic of a symbol and streams updates into an in-memory
//! aggregator. Prices are normalized to a fixed number of fractional digits,
//! so near-equal prices share one level, and every read returns a consistent
//! book with its total size and volume-weighted average price per side.
//!
//! ```text
//! Transport -> FeedSession -> OrderBookAggregator -> SnapshotView -> observers
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`orderbook`]: Price-level books, aggregation and statistics
//! - [`feed`]: Auth, transport, message decoding and the session state machine
//! - [`service`]: Registry of tracked symbols
//! - [`api`]: HTTP API for health, metrics and books
//! - [`metrics`]: Prometheus metric names and helpers
//! - [`utils`]: Utility functions

pub mod api;
pub mod config;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod orderbook;
pub mod service;
pub mod utils;

pub use config::Config;
pub use error::{FeedError, Result};
