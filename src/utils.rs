//! Utility functions.

use std::fmt;

use tokio::signal;
use tracing::{info, warn};

use crate::feed::ConnectionState;
use crate::orderbook::{BookSnapshot, Side};

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

/// Text ladder of the best levels on each side of a book.
///
/// Asks are listed best-last so the spread sits in the middle, like a ladder.
#[derive(Debug, Clone, Copy)]
pub struct BookLadder<'a> {
    book: &'a BookSnapshot,
    state: ConnectionState,
    levels: usize,
}

impl<'a> BookLadder<'a> {
    /// Show at most `levels` levels per side.
    pub fn new(book: &'a BookSnapshot, state: ConnectionState, levels: usize) -> Self {
        Self { book, state, levels }
    }
}

impl fmt::Display for BookLadder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let book = self.book;
        writeln!(f, "{}  [{}]  seq={}", book.symbol, self.state, book.sequence)?;
        writeln!(f, "{:>20} {:>20}", "PRICE", "SIZE")?;

        let asks = &book.asks[..book.asks.len().min(self.levels)];
        for level in asks.iter().rev() {
            writeln!(f, "{:>20} {:>20}  ask", level.price, level.size)?;
        }

        match book.spread() {
            Some(spread) => writeln!(f, "{:-^42}", format!(" spread {spread} "))?,
            None => writeln!(f, "{:-^42}", "")?,
        }

        let bids = &book.bids[..book.bids.len().min(self.levels)];
        for level in bids {
            writeln!(f, "{:>20} {:>20}  bid", level.price, level.size)?;
        }

        for side in [Side::Bid, Side::Ask] {
            let stats = book.stats(side);
            writeln!(
                f,
                "{side}: total size {}  average price {}",
                stats.total_size, stats.average_price
            )?;
        }
        Ok(())
    }
}

/// Render the best `levels` of each side as text.
pub fn render_book(book: &BookSnapshot, state: ConnectionState, levels: usize) -> String {
    BookLadder::new(book, state, levels).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{AggregationPolicy, OrderBookAggregator, PriceLevel};
    use rust_decimal_macros::dec;

    #[test]
    fn render_book_shows_ladder_and_stats() {
        let aggregator = OrderBookAggregator::new("BTC-USDT", 1, AggregationPolicy::Sum);
        aggregator
            .apply_snapshot(
                &[
                    PriceLevel::new(dec!(10.0), dec!(2)),
                    PriceLevel::new(dec!(9.0), dec!(2)),
                ],
                &[
                    PriceLevel::new(dec!(11.0), dec!(1)),
                    PriceLevel::new(dec!(12.0), dec!(1)),
                ],
            )
            .unwrap();

        let book = aggregator.snapshot();
        let text = render_book(&book, ConnectionState::Subscribed, 1);

        assert!(text.starts_with("BTC-USDT  [subscribed]"));
        assert!(text.contains("spread 1.0"));
        assert!(text.contains("11.0"));
        assert!(!text.contains("12.0 "));
        assert_eq!(book.bid_stats.average_price, dec!(9.5));
        assert!(text.contains(&format!(
            "bid: total size 4  average price {}",
            book.bid_stats.average_price
        )));
    }

    #[test]
    fn render_empty_book_has_zero_stats() {
        let aggregator = OrderBookAggregator::new("BTC-USDT", 1, AggregationPolicy::Sum);
        let text = render_book(&aggregator.snapshot(), ConnectionState::Connecting, 10);

        assert!(text.contains("ask: total size 0  average price 0"));
    }

    #[test]
    fn ladder_lists_asks_best_last() {
        let aggregator = OrderBookAggregator::new("BTC-USDT", 1, AggregationPolicy::Sum);
        aggregator
            .apply_snapshot(
                &[PriceLevel::new(dec!(10.0), dec!(1))],
                &[
                    PriceLevel::new(dec!(11.0), dec!(1)),
                    PriceLevel::new(dec!(12.0), dec!(1)),
                ],
            )
            .unwrap();
        let book = aggregator.snapshot();

        let text = BookLadder::new(&book, ConnectionState::Subscribed, 5).to_string();
        let worst_ask = text.find("12.0").unwrap();
        let best_ask = text.find("11.0").unwrap();
        let bid = text.find("10.0").unwrap();
        assert!(worst_ask < best_ask && best_ask < bid);
        assert_eq!(text, render_book(&book, ConnectionState::Subscribed, 5));
    }
}
