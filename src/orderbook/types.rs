//! Order book types and data structures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Side of the book.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Side {
    /// Resting buy interest.
    #[strum(to_string = "bid", serialize = "bids", serialize = "buy")]
    Bid,
    /// Resting sell interest.
    #[strum(to_string = "ask", serialize = "asks", serialize = "sell")]
    Ask,
}

impl Side {
    /// Get the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Single aggregated price level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceLevel {
    /// Normalized price.
    pub price: Decimal,
    /// Total size resting at this price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Notional value of the level, or `None` when it does not fit in a `Decimal`.
    pub fn notional(&self) -> Option<Decimal> {
        self.price.checked_mul(self.size)
    }
}

/// Summary statistics over one side of the book.
///
/// An empty side yields zero for both fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DerivedStats {
    /// Sum of sizes across all levels.
    pub total_size: Decimal,
    /// Volume-weighted average price.
    pub average_price: Decimal,
}

impl DerivedStats {
    /// Compute statistics over a set of levels.
    pub fn from_levels<'a>(levels: impl IntoIterator<Item = &'a PriceLevel>) -> Self {
        Self::from_pairs(levels.into_iter().map(|l| (l.price, l.size)))
    }

    /// Compute statistics over `(price, size)` pairs.
    ///
    /// Never panics. When the exact totals overflow, the total size saturates at
    /// `Decimal::MAX` and the average is taken over size weights instead.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Decimal, Decimal)>) -> Self {
        let pairs: Vec<(Decimal, Decimal)> = pairs.into_iter().collect();
        Self::checked_from_pairs(&pairs).unwrap_or_else(|| Self::weighted_from_pairs(&pairs))
    }

    /// Exact statistics, or `None` if a total overflows.
    pub fn checked_from_pairs(pairs: &[(Decimal, Decimal)]) -> Option<Self> {
        let mut total_size = Decimal::ZERO;
        let mut total_notional = Decimal::ZERO;
        for &(price, size) in pairs {
            total_size = total_size.checked_add(size)?;
            total_notional = total_notional.checked_add(price.checked_mul(size)?)?;
        }

        if total_size.is_zero() {
            return Some(Self::default());
        }

        Some(Self {
            total_size,
            average_price: total_notional.checked_div(total_size)?,
        })
    }

    fn weighted_from_pairs(pairs: &[(Decimal, Decimal)]) -> Self {
        let total_size = pairs
            .iter()
            .fold(Decimal::ZERO, |total, &(_, size)| total.saturating_add(size));
        if total_size.is_zero() {
            return Self::default();
        }

        // Weights are at most 1 each; dividing by their sum also covers a saturated total.
        let (weighted, weights) = pairs.iter().fold(
            (Decimal::ZERO, Decimal::ZERO),
            |(weighted, weights), &(price, size)| {
                let weight = size.checked_div(total_size).unwrap_or(Decimal::ZERO);
                (
                    weighted.saturating_add(price.saturating_mul(weight)),
                    weights.saturating_add(weight),
                )
            },
        );
        let average_price = weighted.checked_div(weights).unwrap_or(Decimal::ZERO);

        Self {
            total_size,
            average_price,
        }
    }
}

/// Point-in-time export of the aggregated book.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BookSnapshot {
    /// Instrument symbol.
    pub symbol: String,
    /// Bid levels sorted by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending.
    pub asks: Vec<PriceLevel>,
    /// Statistics over every bid level.
    pub bid_stats: DerivedStats,
    /// Statistics over every ask level.
    pub ask_stats: DerivedStats,
    /// Last applied update sequence.
    pub sequence: u64,
    /// When the book last changed (unix milliseconds), if ever.
    pub updated_at_ms: Option<i64>,
}

impl BookSnapshot {
    /// Get the best bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get the best ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Get the spread between best bid and ask.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Calculate the mid price from best bid and ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Levels for one side.
    pub fn levels(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Statistics for one side.
    pub fn stats(&self, side: Side) -> DerivedStats {
        match side {
            Side::Bid => self.bid_stats,
            Side::Ask => self.ask_stats,
        }
    }

    /// Check if both sides are empty.
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Keep only the best `depth` levels per side.
    ///
    /// Statistics still describe the whole book.
    pub fn truncated(mut self, depth: usize) -> Self {
        self.bids.truncate(depth);
        self.asks.truncate(depth);
        self
    }
}
