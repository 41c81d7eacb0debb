//! Order book aggregation: snapshot and incremental application plus statistics.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use super::level_book::{check_totals, normalize_price, validate_level, PriceLevelBook};
use super::types::{BookSnapshot, DerivedStats, PriceLevel, Side};
use crate::error::BookError;

/// How raw levels that round to the same price inside one message are combined.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AggregationPolicy {
    /// Sizes in the same bucket are summed, then written as the level's new size.
    #[default]
    Sum,
    /// The last size seen for a bucket wins.
    Last,
}

/// Collapse one side of a message into `normalized price -> size`.
///
/// Every level is validated before anything is returned, so a bad entry
/// rejects the whole batch. A bucket whose size or notional does not fit in a
/// `Decimal` counts as a bad entry.
pub fn aggregate_batch(
    levels: &[PriceLevel],
    precision: u32,
    policy: AggregationPolicy,
) -> Result<BTreeMap<Decimal, Decimal>, BookError> {
    let mut buckets = BTreeMap::new();

    for level in levels {
        validate_level(level.price, level.size)?;

        let price = normalize_price(level.price, precision);
        let overflow = || BookError::InvalidLevel {
            price: level.price,
            size: level.size,
        };
        let size = match policy {
            AggregationPolicy::Sum => buckets
                .get(&price)
                .copied()
                .unwrap_or(Decimal::ZERO)
                .checked_add(level.size)
                .ok_or_else(overflow)?,
            AggregationPolicy::Last => level.size,
        };
        price.checked_mul(size).ok_or_else(overflow)?;
        buckets.insert(price, size);
    }

    Ok(buckets)
}

#[derive(Debug)]
struct BookState {
    bids: PriceLevelBook,
    asks: PriceLevelBook,
    last_update_sequence: u64,
    updated_at_ms: Option<i64>,
}

impl BookState {
    fn new() -> Self {
        Self {
            bids: PriceLevelBook::new(Side::Bid),
            asks: PriceLevelBook::new(Side::Ask),
            last_update_sequence: 0,
            updated_at_ms: None,
        }
    }

    fn book(&self, side: Side) -> &PriceLevelBook {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    fn write_batch(
        &mut self,
        side: Side,
        batch: BTreeMap<Decimal, Decimal>,
        precision: u32,
    ) -> Result<(), BookError> {
        let book = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        for (price, size) in batch {
            book.upsert(price, size, precision)?;
        }
        Ok(())
    }

    fn touch(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.updated_at_ms = Some((now.unix_timestamp_nanos() / 1_000_000) as i64);
    }
}

/// Aggregated bid and ask books for one instrument.
///
/// Every operation takes the internal lock only for the in-memory work, so a
/// reader always sees a book either before or after a whole update.
#[derive(Debug)]
pub struct OrderBookAggregator {
    symbol: String,
    precision: u32,
    policy: AggregationPolicy,
    state: RwLock<BookState>,
}

impl OrderBookAggregator {
    /// Create an empty aggregator.
    pub fn new(symbol: impl Into<String>, precision: u32, policy: AggregationPolicy) -> Self {
        Self {
            symbol: symbol.into(),
            precision,
            policy,
            state: RwLock::new(BookState::new()),
        }
    }

    /// Instrument symbol.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Price rounding precision (fractional digits).
    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Batch aggregation policy.
    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Last applied incremental sequence (0 after a reset or an unsequenced snapshot).
    pub fn last_update_sequence(&self) -> u64 {
        self.read().last_update_sequence
    }

    /// Replace both books with a full snapshot.
    pub fn apply_snapshot(&self, bids: &[PriceLevel], asks: &[PriceLevel]) -> Result<(), BookError> {
        self.apply_snapshot_at(0, bids, asks)
    }

    /// Replace both books with a snapshot taken at `sequence`.
    ///
    /// The next accepted incremental is `sequence + 1`.
    #[instrument(skip(self, bids, asks), fields(symbol = %self.symbol, bids = bids.len(), asks = asks.len()))]
    pub fn apply_snapshot_at(
        &self,
        sequence: u64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
    ) -> Result<(), BookError> {
        let bid_batch = aggregate_batch(bids, self.precision, self.policy)?;
        let ask_batch = aggregate_batch(asks, self.precision, self.policy)?;

        check_totals(&bid_batch)?;
        check_totals(&ask_batch)?;

        let mut state = self.write();
        state.bids.clear();
        state.asks.clear();
        state.write_batch(Side::Bid, bid_batch, self.precision)?;
        state.write_batch(Side::Ask, ask_batch, self.precision)?;
        state.last_update_sequence = sequence;
        state.touch();

        debug!(
            bid_levels = state.bids.len(),
            ask_levels = state.asks.len(),
            "Applied snapshot"
        );
        Ok(())
    }

    /// Apply an incremental update carrying new absolute sizes.
    ///
    /// Rejects any `sequence` other than `last_update_sequence + 1` and leaves
    /// the books untouched in that case.
    pub fn apply_incremental(
        &self,
        sequence: u64,
        bid_updates: &[PriceLevel],
        ask_updates: &[PriceLevel],
    ) -> Result<(), BookError> {
        let bid_batch = aggregate_batch(bid_updates, self.precision, self.policy)?;
        let ask_batch = aggregate_batch(ask_updates, self.precision, self.policy)?;

        let mut state = self.write();
        let expected = state.last_update_sequence.wrapping_add(1);
        if sequence != expected {
            return Err(BookError::SequenceGap {
                expected,
                received: sequence,
            });
        }
        state.bids.check_batch(&bid_batch)?;
        state.asks.check_batch(&ask_batch)?;

        state.write_batch(Side::Bid, bid_batch, self.precision)?;
        state.write_batch(Side::Ask, ask_batch, self.precision)?;
        state.last_update_sequence = sequence;
        state.touch();
        Ok(())
    }

    /// Statistics over one side of the current book.
    pub fn stats_for(&self, side: Side) -> DerivedStats {
        self.read().book(side).stats()
    }

    /// Consistent export of both sides plus their statistics.
    pub fn snapshot(&self) -> BookSnapshot {
        let state = self.read();

        BookSnapshot {
            symbol: self.symbol.clone(),
            bids: state.bids.snapshot(),
            asks: state.asks.snapshot(),
            bid_stats: state.bids.stats(),
            ask_stats: state.asks.stats(),
            sequence: state.last_update_sequence,
            updated_at_ms: state.updated_at_ms,
        }
    }

    /// Levels for one side, best price first.
    pub fn levels(&self, side: Side) -> Vec<PriceLevel> {
        self.read().book(side).snapshot()
    }

    /// Clear both books and zero the sequence.
    pub fn reset(&self) {
        let mut state = self.write();
        state.bids.clear();
        state.asks.clear();
        state.last_update_sequence = 0;
        state.touch();
        debug!(symbol = %self.symbol, "Book reset");
    }

    fn read(&self) -> RwLockReadGuard<'_, BookState> {
        // Mutation never panics half-way, so a poisoned guard still holds a whole book.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BookState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
