//! Registry of tracked symbols.
//!
//! Each tracked symbol gets its own aggregator and feed session. Observers
//! read books and session state through [`BookQuery`].

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::FeedError;
use crate::feed::{
    Authenticator, ConnectionState, Connector, FeedSession, NoSnapshot, SessionConfig,
    SessionHandle, SnapshotSource, StatsSnapshot,
};
use crate::orderbook::{AggregationPolicy, BookSnapshot, OrderBookAggregator, SnapshotView};

/// Status of one tracked symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Instrument symbol.
    pub symbol: String,
    /// Current session state.
    pub state: ConnectionState,
    /// Last applied incremental sequence.
    pub sequence: u64,
    /// Session counters.
    pub stats: StatsSnapshot,
}

/// Read access used by the HTTP layer.
pub trait BookQuery: Send + Sync {
    /// Book for `symbol`, limited to `depth` levels per side.
    fn book(&self, symbol: &str, depth: Option<usize>) -> Option<BookSnapshot>;

    /// Status for `symbol`.
    fn session(&self, symbol: &str) -> Option<SessionStatus>;

    /// Status of every tracked symbol, sorted by symbol.
    fn sessions(&self) -> Vec<SessionStatus>;
}

struct TrackedSymbol {
    view: SnapshotView,
    handle: SessionHandle,
}

impl TrackedSymbol {
    fn status(&self) -> SessionStatus {
        let book = self.view.snapshot();
        SessionStatus {
            symbol: book.symbol,
            state: self.handle.state(),
            sequence: book.sequence,
            stats: self.handle.stats().snapshot(),
        }
    }
}

/// One feed session and aggregator per tracked symbol.
pub struct MarketDataService<A, C, S = NoSnapshot> {
    template: SessionConfig,
    precision: u32,
    policy: AggregationPolicy,
    authenticator: A,
    connector: C,
    snapshot_source: S,
    tracked: DashMap<String, TrackedSymbol>,
}

impl<A, C> MarketDataService<A, C, NoSnapshot>
where
    A: Authenticator + Clone + 'static,
    C: Connector + Clone + 'static,
{
    /// Create an empty registry.
    ///
    /// `template` supplies the secret and timing for every session; its symbol
    /// is replaced per tracked symbol.
    pub fn new(
        template: SessionConfig,
        precision: u32,
        policy: AggregationPolicy,
        authenticator: A,
        connector: C,
    ) -> Self {
        Self {
            template,
            precision,
            policy,
            authenticator,
            connector,
            snapshot_source: NoSnapshot,
            tracked: DashMap::new(),
        }
    }
}

impl<A, C, S> MarketDataService<A, C, S>
where
    A: Authenticator + Clone + 'static,
    C: Connector + Clone + 'static,
    S: SnapshotSource + Clone + 'static,
{
    /// Use `source` for the initial book of every session started from now on.
    pub fn with_snapshot_source<S2>(self, source: S2) -> MarketDataService<A, C, S2>
    where
        S2: SnapshotSource + Clone + 'static,
    {
        MarketDataService {
            template: self.template,
            precision: self.precision,
            policy: self.policy,
            authenticator: self.authenticator,
            connector: self.connector,
            snapshot_source: source,
            tracked: self.tracked,
        }
    }

    /// Start a session for `symbol`.
    ///
    /// Returns `false` if the symbol is already tracked.
    pub fn track(&self, symbol: &str) -> bool {
        match self.tracked.entry(symbol.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let aggregator = Arc::new(OrderBookAggregator::new(symbol, self.precision, self.policy));
                let handle = FeedSession::new(
                    self.template.for_symbol(symbol),
                    self.authenticator.clone(),
                    self.connector.clone(),
                    Arc::clone(&aggregator),
                )
                .with_snapshot_source(self.snapshot_source.clone())
                .spawn();

                entry.insert(TrackedSymbol {
                    view: SnapshotView::new(aggregator),
                    handle,
                });
                info!(symbol, "Tracking symbol");
                true
            }
        }
    }

    /// Stop the session for `symbol` and drop its book.
    ///
    /// Returns `Ok(false)` if the symbol was not tracked, and the session's
    /// terminal error if it had already failed.
    pub async fn untrack(&self, symbol: &str) -> Result<bool, FeedError> {
        let Some((_, tracked)) = self.tracked.remove(symbol) else {
            return Ok(false);
        };
        info!(symbol, "Untracking symbol");
        tracked.handle.stop().await?;
        Ok(true)
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let symbols: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        for symbol in symbols {
            if let Err(e) = self.untrack(&symbol).await {
                warn!(symbol, error = %e, "Session ended with error");
            }
        }
    }

    /// Full book for `symbol`.
    pub fn snapshot(&self, symbol: &str) -> Option<BookSnapshot> {
        self.tracked.get(symbol).map(|t| t.view.snapshot())
    }

    /// Read-only view of `symbol`'s book.
    pub fn view(&self, symbol: &str) -> Option<SnapshotView> {
        self.tracked.get(symbol).map(|t| t.view.clone())
    }

    /// Session state for `symbol`.
    pub fn session_state(&self, symbol: &str) -> Option<ConnectionState> {
        self.tracked.get(symbol).map(|t| t.handle.state())
    }

    /// Status of every tracked symbol, sorted by symbol.
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<SessionStatus> = self.tracked.iter().map(|t| t.status()).collect();
        sessions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        sessions
    }

    /// Tracked symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }
}

impl<A, C, S> BookQuery for MarketDataService<A, C, S>
where
    A: Authenticator + Clone + 'static,
    C: Connector + Clone + 'static,
    S: SnapshotSource + Clone + 'static,
{
    fn book(&self, symbol: &str, depth: Option<usize>) -> Option<BookSnapshot> {
        self.tracked
            .get(symbol)
            .map(|t| t.view.snapshot_with_depth(depth))
    }

    fn session(&self, symbol: &str) -> Option<SessionStatus> {
        self.tracked.get(symbol).map(|t| t.status())
    }

    fn sessions(&self) -> Vec<SessionStatus> {
        MarketDataService::sessions(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::mock::{MockAuthenticator, MockConnector};
    use std::time::Duration;

    fn service(connector: MockConnector) -> MarketDataService<MockAuthenticator, MockConnector> {
        let mut template = SessionConfig::new("unused", "1234");
        template.reconnect.initial_delay_ms = 1;
        template.reconnect.jitter_ms = 0;
        template.reconnect.max_retries = 1_000;
        MarketDataService::new(
            template,
            1,
            AggregationPolicy::Sum,
            MockAuthenticator::new(),
            connector,
        )
    }

    async fn wait_for_state(
        service: &MarketDataService<MockAuthenticator, MockConnector>,
        symbol: &str,
        state: ConnectionState,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while service.session_state(symbol) != Some(state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn track_is_idempotent_and_untrack_stops() {
        let connector = MockConnector::new();
        let peer = connector.push_link();
        peer.send(r#"{"type":"ack"}"#);
        let service = service(connector);

        assert!(service.track("BTC-USDT"));
        assert!(!service.track("BTC-USDT"));
        wait_for_state(&service, "BTC-USDT", ConnectionState::Subscribed).await;

        assert_eq!(service.symbols(), vec!["BTC-USDT".to_string()]);
        assert!(service.untrack("BTC-USDT").await.unwrap());
        assert!(peer.is_closed());
        assert_eq!(service.session_state("BTC-USDT"), None);
        assert!(!service.untrack("BTC-USDT").await.unwrap());
    }

    #[tokio::test]
    async fn book_reflects_stream_and_depth() {
        let connector = MockConnector::new();
        let peer = connector.push_link();
        peer.send(r#"{"type":"ack"}"#);
        peer.send(
            r#"{"type":"message","subject":"snapshot","data":{"bids":[["10.01","1"],["9.5","2"],["9.0","3"]],"asks":[["11","4"]]}}"#,
        );
        let service = service(connector);
        service.track("BTC-USDT");

        tokio::time::timeout(Duration::from_secs(2), async {
            while service.snapshot("BTC-USDT").map(|b| b.bids.len()) != Some(3) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let book = service.book("BTC-USDT", Some(1)).unwrap();
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.asks.len(), 1);

        let status = service.session("BTC-USDT").unwrap();
        assert_eq!(status.state, ConnectionState::Subscribed);
        assert_eq!(status.stats.snapshots, 1);
        assert!(service.book("ETH-USDT", None).is_none());

        service.shutdown().await;
        assert!(service.sessions().is_empty());
    }
}
