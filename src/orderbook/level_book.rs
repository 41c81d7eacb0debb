//! Price-level map for one side of one instrument.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};

use super::types::{DerivedStats, PriceLevel, Side};
use crate::error::BookError;

/// Largest precision a `Decimal` can represent.
pub const MAX_PRECISION: u32 = 28;

/// Round a raw price to `precision` fractional digits.
///
/// Midpoints round away from zero and the result always carries exactly
/// `precision` digits so equal buckets render identically.
pub fn normalize_price(raw_price: Decimal, precision: u32) -> Decimal {
    let precision = precision.min(MAX_PRECISION);
    let mut price =
        raw_price.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero);
    price.rescale(precision);
    price
}

/// Check a raw level before it touches a book.
pub fn validate_level(price: Decimal, size: Decimal) -> Result<(), BookError> {
    if price < Decimal::ZERO || size < Decimal::ZERO {
        return Err(BookError::InvalidLevel { price, size });
    }
    Ok(())
}

/// Check that a side made of `levels` has a total size and notional that fit in a `Decimal`.
///
/// Reports the level at which a running total would overflow.
pub fn check_totals<'a>(
    levels: impl IntoIterator<Item = (&'a Decimal, &'a Decimal)>,
) -> Result<(), BookError> {
    let mut total_size = Decimal::ZERO;
    let mut total_notional = Decimal::ZERO;
    for (&price, &size) in levels {
        let overflow = || BookError::InvalidLevel { price, size };
        total_size = total_size.checked_add(size).ok_or_else(overflow)?;
        total_notional = price
            .checked_mul(size)
            .and_then(|notional| total_notional.checked_add(notional))
            .ok_or_else(overflow)?;
    }
    Ok(())
}

/// Aggregated levels for one side, keyed by normalized price.
#[derive(Debug, Clone)]
pub struct PriceLevelBook {
    side: Side,
    levels: BTreeMap<Decimal, Decimal>,
}

impl PriceLevelBook {
    /// Create an empty book for a side.
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
        }
    }

    /// Which side this book holds.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Set the size at a normalized price, removing the level when the size is zero.
    ///
    /// The given size replaces whatever was stored. Negative inputs are rejected
    /// and leave the book untouched.
    pub fn upsert(
        &mut self,
        raw_price: Decimal,
        raw_size: Decimal,
        precision: u32,
    ) -> Result<(), BookError> {
        validate_level(raw_price, raw_size)?;

        let price = normalize_price(raw_price, precision);
        if raw_size.is_zero() {
            self.levels.remove(&price);
        } else {
            self.levels.insert(price, raw_size);
        }
        Ok(())
    }

    /// Check the side's totals as they would be after writing `batch`.
    ///
    /// `batch` maps normalized prices to new absolute sizes, so an entry hides
    /// the stored level at the same price.
    pub fn check_batch(&self, batch: &BTreeMap<Decimal, Decimal>) -> Result<(), BookError> {
        let kept = self
            .levels
            .iter()
            .filter(|(price, _)| !batch.contains_key(*price));
        check_totals(kept.chain(batch.iter()))
    }

    /// Levels in best-price-first order: descending for bids, ascending for asks.
    pub fn snapshot(&self) -> Vec<PriceLevel> {
        let iter = self
            .levels
            .iter()
            .map(|(&price, &size)| PriceLevel { price, size });

        match self.side {
            Side::Bid => iter.rev().collect(),
            Side::Ask => iter.collect(),
        }
    }

    /// Statistics over the current levels.
    pub fn stats(&self) -> DerivedStats {
        DerivedStats::from_pairs(self.levels.iter().map(|(&price, &size)| (price, size)))
    }

    /// Size at an already-normalized price.
    pub fn size_at(&self, price: Decimal) -> Option<Decimal> {
        self.levels.get(&price).copied()
    }

    /// Best price on this side.
    pub fn best(&self) -> Option<PriceLevel> {
        let entry = match self.side {
            Side::Bid => self.levels.iter().next_back(),
            Side::Ask => self.levels.iter().next(),
        };
        entry.map(|(&price, &size)| PriceLevel { price, size })
    }

    /// Remove all levels.
    pub fn clear(&mut self) {
        self.levels.clear();
    }

    /// Number of distinct levels.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Check if the book has no levels.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
