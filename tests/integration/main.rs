//! Integration tests for the feed session lifecycle.
//!
//! Sessions run against the scripted collaborators in `feed::mock`, so no
//! network is needed. The last test talks to a real auth service and feed and
//! is ignored by default.
//! Run it with: cargo test --test integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use tokio::sync::watch;

use orderbook_feed::error::{AuthError, FeedError, TransportError};
use orderbook_feed::feed::mock::{MockAuthenticator, MockConnector, MockSnapshotSource};
use orderbook_feed::feed::{
    BookUpdate, ConnectionState, Credential, Endpoint, FeedSession, ReconnectConfig,
    SessionConfig,
};
use orderbook_feed::orderbook::{AggregationPolicy, DerivedStats, OrderBookAggregator, PriceLevel};

const SYMBOL: &str = "BTC-USDT";
const ACK: &str = r#"{"type":"ack"}"#;

fn fast_config(max_retries: u32) -> SessionConfig {
    let mut config = SessionConfig::new(SYMBOL, "1234");
    config.heartbeat_timeout = Duration::from_millis(500);
    config.ping_interval = Duration::from_secs(3600);
    config.reconnect = ReconnectConfig {
        initial_delay_ms: 1,
        max_delay_s: 1,
        backoff_multiplier: 2.0,
        jitter_ms: 0,
        max_retries,
    };
    config
}

fn aggregator() -> Arc<OrderBookAggregator> {
    Arc::new(OrderBookAggregator::new(SYMBOL, 1, AggregationPolicy::Sum))
}

fn snapshot_frame(sequence: u64, bids: &str, asks: &str) -> String {
    format!(
        r#"{{"type":"message","subject":"snapshot","data":{{"sequence":{sequence},"bids":{bids},"asks":{asks}}}}}"#
    )
}

fn incremental_frame(sequence: u64, bids: &str) -> String {
    format!(
        r#"{{"type":"message","subject":"trade.l2update","data":{{"sequence":{sequence},"changes":{{"bids":{bids},"asks":[]}}}}}}"#
    )
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn sequence_gap_forces_full_resync() {
    let auth = MockAuthenticator::new();
    let connector = MockConnector::new();

    let first = connector.push_link();
    first.send(ACK);
    first.send(snapshot_frame(5, r#"[["10.0","1"]]"#, r#"[["11.0","1"]]"#));
    first.send(incremental_frame(6, r#"[["10.5","2"]]"#));
    first.send(incremental_frame(8, r#"[["10.7","3"]]"#));

    let mut second = connector.push_link();
    second.send(ACK);
    second.send(snapshot_frame(100, r#"[["9.0","4"]]"#, r#"[["12.0","3"]]"#));

    let book = aggregator();
    let handle = FeedSession::new(fast_config(5), auth.clone(), connector.clone(), Arc::clone(&book)).spawn();

    let stats = Arc::clone(handle.stats());
    eventually("resync snapshot", || {
        stats.snapshots() == 2 && handle.state() == ConnectionState::Subscribed
    })
    .await;

    let snapshot = book.snapshot();
    assert_eq!(snapshot.bids, vec![PriceLevel::new(dec!(9.0), dec!(4))]);
    assert_eq!(snapshot.asks, vec![PriceLevel::new(dec!(12.0), dec!(3))]);
    assert_eq!(snapshot.sequence, 100);

    assert_eq!(stats.gaps(), 1);
    assert_eq!(stats.reconnects(), 1);
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(auth.calls(), 2);
    assert!(first.is_closed());

    let subscribe = second.next_sent(Duration::from_millis(100)).await.unwrap();
    assert!(subscribe.contains(r#""type":"subscribe""#));
    assert!(subscribe.contains("/market/level2:BTC-USDT"));

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn retry_cap_turns_transport_errors_terminal() {
    let auth = MockAuthenticator::new();
    let connector = MockConnector::new();
    let session = FeedSession::new(fast_config(3), auth.clone(), connector.clone(), aggregator());
    let state = session.subscribe_state();
    let stats = session.stats();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(2), session.run(stop_rx))
        .await
        .unwrap();

    match result {
        Err(FeedError::RetriesExhausted { attempts, last_error }) => {
            assert_eq!(attempts, 4);
            assert!(last_error.contains("no scripted transport"));
        }
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
    assert_eq!(connector.connect_count(), 4);
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert!(stats.terminal_error().is_some());
}

#[tokio::test]
async fn unauthorized_is_terminal_without_retry() {
    let auth = MockAuthenticator::new();
    auth.push(Err(AuthError::Unauthorized {
        symbol: SYMBOL.to_string(),
    }));
    let connector = MockConnector::new();
    let session = FeedSession::new(fast_config(5), auth.clone(), connector.clone(), aggregator());

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = session.run(stop_rx).await;

    assert!(matches!(
        result,
        Err(FeedError::Auth(AuthError::Unauthorized { .. }))
    ));
    assert_eq!(auth.calls(), 1);
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn unavailable_auth_service_is_retried() {
    let auth = MockAuthenticator::new();
    auth.push(Err(AuthError::Rejected { status: 503 }));
    let connector = MockConnector::new();
    let peer = connector.push_link();
    peer.send(ACK);

    let handle = FeedSession::new(fast_config(2), auth.clone(), connector.clone(), aggregator()).spawn();

    eventually("subscribed after auth retry", || {
        handle.state() == ConnectionState::Subscribed
    })
    .await;

    assert_eq!(auth.calls(), 2);
    assert_eq!(connector.connect_count(), 1);
    assert!(handle.stats().terminal_error().is_none());

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn silence_past_heartbeat_degrades_session() {
    let connector = MockConnector::new();
    let peer = connector.push_link();
    peer.send(ACK);

    let mut config = fast_config(0);
    config.heartbeat_timeout = Duration::from_millis(100);
    let session = FeedSession::new(config, MockAuthenticator::new(), connector.clone(), aggregator());

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(2), session.run(stop_rx))
        .await
        .unwrap();

    match result {
        Err(FeedError::RetriesExhausted { attempts, last_error }) => {
            assert_eq!(attempts, 1);
            assert!(last_error.contains("no message received"));
        }
        other => panic!("expected heartbeat failure, got {other:?}"),
    }
    assert!(peer.is_closed());
}

#[tokio::test]
async fn stop_closes_transport_and_disconnects() {
    let connector = MockConnector::new();
    let mut peer = connector.push_link();
    peer.send(ACK);

    let handle = FeedSession::new(fast_config(5), MockAuthenticator::new(), connector, aggregator()).spawn();
    let mut state = handle.state_receiver();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ConnectionState::Subscribed),
    )
    .await
    .unwrap()
    .unwrap();

    tokio_test::assert_ok!(handle.stop().await);

    assert!(peer.is_closed());
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert_eq!(peer.drain_sent().len(), 1);
}

#[tokio::test]
async fn malformed_messages_are_skipped() {
    let connector = MockConnector::new();
    let peer = connector.push_link();
    peer.send(ACK);
    peer.send("definitely not json");
    peer.send(snapshot_frame(0, r#"[["10.0","-1"]]"#, "[]"));
    peer.send(snapshot_frame(0, r#"[["10.00001","2"],["10.00004","3"]]"#, "[]"));
    peer.send(incremental_frame(1, r#"[["10.0","0"]]"#));

    let book = aggregator();
    let handle = FeedSession::new(fast_config(5), MockAuthenticator::new(), connector, Arc::clone(&book)).spawn();
    let stats = Arc::clone(handle.stats());
    eventually("all frames", || stats.messages() == 5 && book.last_update_sequence() == 1).await;

    assert_eq!(stats.malformed(), 2);
    assert_eq!(stats.snapshots(), 1);
    assert_eq!(stats.reconnects(), 0);
    assert_eq!(handle.state(), ConnectionState::Subscribed);
    assert!(book.snapshot().bids.is_empty());
    assert_eq!(book.stats_for(orderbook_feed::orderbook::Side::Bid), DerivedStats::default());

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn stale_incremental_is_dropped_without_resync() {
    let connector = MockConnector::new();
    let peer = connector.push_link();
    peer.send(ACK);
    peer.send(snapshot_frame(5, r#"[["10.0","1"]]"#, "[]"));
    peer.send(incremental_frame(5, r#"[["10.0","7"]]"#));
    peer.send(incremental_frame(6, r#"[["10.0","2"]]"#));

    let book = aggregator();
    let handle =
        FeedSession::new(fast_config(5), MockAuthenticator::new(), connector.clone(), Arc::clone(&book)).spawn();
    let stats = Arc::clone(handle.stats());
    eventually("all frames", || stats.messages() == 4 && book.last_update_sequence() == 6).await;

    assert_eq!(stats.stale(), 1);
    assert_eq!(stats.gaps(), 0);
    assert_eq!(connector.connect_count(), 1);
    assert_eq!(book.snapshot().bids, vec![PriceLevel::new(dec!(10.0), dec!(2))]);
    assert_eq!(book.last_update_sequence(), 6);

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn snapshot_source_seeds_sequence() {
    let connector = MockConnector::new();
    let peer = connector.push_link();
    peer.send(ACK);
    peer.send(incremental_frame(42, r#"[["10.0","5"]]"#));

    let source = MockSnapshotSource::new();
    source.push(BookUpdate {
        sequence: Some(41),
        bids: vec![PriceLevel::new(dec!(9.96), dec!(1))],
        asks: vec![PriceLevel::new(dec!(10.5), dec!(1))],
    });

    let book = aggregator();
    let handle = FeedSession::new(fast_config(5), MockAuthenticator::new(), connector, Arc::clone(&book))
        .with_snapshot_source(source.clone())
        .spawn();
    eventually("incremental after snapshot", || book.last_update_sequence() == 42).await;

    assert_eq!(source.fetches(), 1);
    assert_eq!(book.snapshot().bids, vec![PriceLevel::new(dec!(10.0), dec!(5))]);

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn server_error_frame_triggers_reconnect() {
    let connector = MockConnector::new();
    let first = connector.push_link();
    first.send(ACK);
    first.send(r#"{"type":"error","code":509,"data":"exceed max subscription count"}"#);
    let second = connector.push_link();
    second.send(ACK);

    let handle = FeedSession::new(fast_config(5), MockAuthenticator::new(), connector.clone(), aggregator()).spawn();
    let stats = Arc::clone(handle.stats());
    eventually("second subscribe", || {
        connector.connect_count() == 2 && handle.state() == ConnectionState::Subscribed
    })
    .await;

    assert_eq!(stats.reconnects(), 1);
    assert!(first.is_closed());
    assert!(!second.is_closed());

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn endpoints_are_tried_in_order() {
    let auth = MockAuthenticator::new();
    auth.push(Ok(Credential::new(
        "token",
        vec![Endpoint::new("wss://primary/endpoint"), Endpoint::new("wss://backup/endpoint")],
        Duration::from_secs(3600),
    )));
    let connector = MockConnector::new();
    connector.push_failure(TransportError::ConnectionFailed("refused".to_string()));
    let peer = connector.push_link();
    peer.send(ACK);

    let handle = FeedSession::new(fast_config(5), auth, connector.clone(), aggregator()).spawn();
    let mut state = handle.state_receiver();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ConnectionState::Subscribed),
    )
    .await
    .unwrap()
    .unwrap();

    let urls: Vec<String> = connector.connects().into_iter().map(|(url, _)| url).collect();
    assert_eq!(urls, vec!["wss://primary/endpoint", "wss://backup/endpoint"]);
    assert_eq!(handle.stats().reconnects(), 0);

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn expired_credential_is_not_used() {
    let auth = MockAuthenticator::new();
    auth.push(Ok(Credential::new(
        "token",
        vec![Endpoint::new("wss://feed/endpoint")],
        Duration::ZERO,
    )));
    let connector = MockConnector::new();
    let session = FeedSession::new(fast_config(0), auth, connector.clone(), aggregator());

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = session.run(stop_rx).await;

    match result {
        Err(FeedError::RetriesExhausted { last_error, .. }) => {
            assert!(last_error.contains("expired"));
        }
        other => panic!("expected expired credential, got {other:?}"),
    }
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn client_pings_on_interval() {
    let connector = MockConnector::new();
    let mut peer = connector.push_link();
    peer.send(ACK);

    let mut config = fast_config(5);
    config.ping_interval = Duration::from_millis(20);
    config.heartbeat_timeout = Duration::from_secs(5);
    let handle = FeedSession::new(config, MockAuthenticator::new(), connector, aggregator()).spawn();

    let subscribe = peer.next_sent(Duration::from_secs(1)).await.unwrap();
    assert!(subscribe.contains("subscribe"));
    let ping = peer.next_sent(Duration::from_secs(1)).await.unwrap();
    assert!(ping.contains(r#""type":"ping""#));

    tokio_test::assert_ok!(handle.stop().await);
}

#[tokio::test]
async fn book_stays_readable_while_degraded() {
    let connector = MockConnector::new();
    let peer = connector.push_link();
    peer.send(ACK);
    peer.send(snapshot_frame(0, r#"[["10.0","1"]]"#, r#"[["11.0","1"]]"#));

    let mut config = fast_config(5);
    config.reconnect.initial_delay_ms = 10_000;
    config.reconnect.max_delay_s = 10;
    let book = aggregator();
    let handle = FeedSession::new(config, MockAuthenticator::new(), connector, Arc::clone(&book)).spawn();
    let stats = Arc::clone(handle.stats());
    eventually("snapshot", || stats.snapshots() == 1).await;

    drop(peer);
    eventually("degraded", || handle.state() == ConnectionState::Degraded).await;

    let snapshot = book.snapshot();
    assert_eq!(snapshot.bids.len(), 1);
    assert_eq!(snapshot.asks.len(), 1);

    // Stop must not wait out the backoff.
    tokio::time::timeout(Duration::from_secs(1), handle.stop())
        .await
        .unwrap()
        .unwrap();
}

/// Live session against a real auth service and feed.
#[tokio::test]
#[ignore = "requires FEED_SYMBOL, FEED_SECRET and a reachable AUTH_BASE_URL"]
async fn live_session_reaches_subscribed() {
    let config = match orderbook_feed::Config::load() {
        Ok(c) if c.validate().is_ok() => c,
        _ => {
            println!("Skipping: FEED_SYMBOL/FEED_SECRET not set");
            return;
        }
    };

    let auth = orderbook_feed::feed::HttpAuthenticator::new(&config).unwrap();
    let book = Arc::new(OrderBookAggregator::new(
        config.feed_symbol.clone(),
        config.price_precision,
        config.policy().unwrap(),
    ));
    let handle = FeedSession::new(
        SessionConfig::from_config(&config),
        auth,
        orderbook_feed::feed::WsConnector::new(),
        Arc::clone(&book),
    )
    .spawn();

    let mut state = handle.state_receiver();
    let reached = tokio::time::timeout(
        Duration::from_secs(15),
        state.wait_for(|s| *s == ConnectionState::Subscribed),
    )
    .await;
    println!("Book: {:?}", book.snapshot());

    handle.stop().await.unwrap();
    assert!(reached.is_ok());
}
