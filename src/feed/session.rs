//! Upstream session lifecycle for one symbol.
//!
//! Features:
//! - Authenticate, connect, subscribe, stream
//! - Heartbeat timeout and client pings
//! - Reconnection with exponential backoff and jitter
//! - Full resync (reset + resubscribe) on a sequence gap
//! - Cooperative stop through a watch channel

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use strum::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::auth::{Authenticator, Credential, Endpoint};
use super::backoff::ReconnectConfig;
use super::messages::{decode, BookUpdate, FeedMessage, PingRequest, SubscribeRequest};
use super::snapshot::{NoSnapshot, SnapshotSource};
use super::transport::{Connector, Transport};
use crate::config::Config;
use crate::error::{BookError, FeedError, TransportError};
use crate::metrics::{self, LatencyTimer};
use crate::orderbook::OrderBookAggregator;

/// Lifecycle state of a feed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Not running (never started, stopped, or failed terminally).
    Disconnected,
    /// Waiting for a credential.
    Authenticating,
    /// Opening the transport and waiting for the subscribe ack.
    Connecting,
    /// Streaming updates into the book.
    Subscribed,
    /// Connection lost or book out of sync; a reconnect is pending.
    Degraded,
}

impl ConnectionState {
    /// Numeric code published on the state gauge.
    pub fn code(&self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Authenticating => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Subscribed => 3,
            ConnectionState::Degraded => 4,
        }
    }
}

/// Per-session settings.
#[derive(Clone)]
pub struct SessionConfig {
    /// Instrument symbol.
    pub symbol: String,
    /// Secret passed to the authenticator.
    pub secret: String,
    /// Read silence that degrades the session.
    pub heartbeat_timeout: Duration,
    /// Client ping cadence when the endpoint announces none.
    pub ping_interval: Duration,
    /// Backoff and retry cap.
    pub reconnect: ReconnectConfig,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("symbol", &self.symbol)
            .field("secret", &"<redacted>")
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl SessionConfig {
    /// Settings for `symbol` with default timing.
    pub fn new(symbol: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            secret: secret.into(),
            heartbeat_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(18),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Create from config values.
    pub fn from_config(config: &Config) -> Self {
        Self {
            symbol: config.feed_symbol.clone(),
            secret: config.feed_secret.clone(),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            reconnect: ReconnectConfig::from_config(config),
        }
    }

    /// Same settings for another symbol.
    pub fn for_symbol(&self, symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..self.clone()
        }
    }
}

/// Session counters, readable without a metrics recorder.
#[derive(Debug, Default)]
pub struct SessionStats {
    messages: AtomicU64,
    malformed: AtomicU64,
    gaps: AtomicU64,
    stale: AtomicU64,
    reconnects: AtomicU64,
    snapshots: AtomicU64,
    terminal_error: RwLock<Option<String>>,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames received.
    pub messages: u64,
    /// Frames dropped as malformed.
    pub malformed: u64,
    /// Sequence gaps that forced a resync.
    pub gaps: u64,
    /// Incrementals dropped as already applied.
    pub stale: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
    /// Full snapshots applied.
    pub snapshots: u64,
    /// Error that ended the session, if any.
    pub terminal_error: Option<String>,
}

impl SessionStats {
    /// Frames received.
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Frames dropped as malformed.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Sequence gaps detected.
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    /// Stale incrementals dropped.
    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    /// Reconnect attempts.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Full snapshots applied.
    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::Relaxed)
    }

    /// Error that ended the session, if any.
    pub fn terminal_error(&self) -> Option<String> {
        self.terminal_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages: self.messages(),
            malformed: self.malformed(),
            gaps: self.gaps(),
            stale: self.stale(),
            reconnects: self.reconnects(),
            snapshots: self.snapshots(),
            terminal_error: self.terminal_error(),
        }
    }

    fn set_terminal_error(&self, error: String) {
        *self
            .terminal_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

/// How one connection attempt ended without a terminal error.
enum Attempt {
    /// Stop was requested.
    Stopped,
    /// The attempt failed in a way worth retrying.
    Degraded(FeedError),
}

/// What handling one frame produced.
#[derive(Debug, PartialEq, Eq)]
enum Handled {
    /// Subscribe acknowledgment.
    Ack(Option<String>),
    /// Anything else that leaves the session running.
    Continue,
}

/// Resolve once stop is requested or the stop sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Connection manager for one symbol.
///
/// Owns its credential and transport; feeds a shared [`OrderBookAggregator`]
/// that stays readable throughout, including while degraded.
pub struct FeedSession<A, C, S = NoSnapshot> {
    config: SessionConfig,
    authenticator: A,
    connector: C,
    snapshot_source: S,
    aggregator: Arc<OrderBookAggregator>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<SessionStats>,
    retries: u32,
}

impl<A, C> FeedSession<A, C, NoSnapshot>
where
    A: Authenticator,
    C: Connector,
{
    /// Create a session that takes its initial book from the stream.
    pub fn new(
        config: SessionConfig,
        authenticator: A,
        connector: C,
        aggregator: Arc<OrderBookAggregator>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            authenticator,
            connector,
            snapshot_source: NoSnapshot,
            aggregator,
            state,
            stats: Arc::new(SessionStats::default()),
            retries: 0,
        }
    }
}

impl<A, C, S> FeedSession<A, C, S>
where
    A: Authenticator,
    C: Connector,
    S: SnapshotSource,
{
    /// Fetch the initial book from `source` after every subscribe.
    pub fn with_snapshot_source<S2: SnapshotSource>(self, source: S2) -> FeedSession<A, C, S2> {
        FeedSession {
            config: self.config,
            authenticator: self.authenticator,
            connector: self.connector,
            snapshot_source: source,
            aggregator: self.aggregator,
            state: self.state,
            stats: self.stats,
            retries: self.retries,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Book fed by this session.
    pub fn aggregator(&self) -> &Arc<OrderBookAggregator> {
        &self.aggregator
    }

    /// Run until stopped or failed terminally.
    ///
    /// Setting `shutdown` to `true`, or dropping its sender, stops the session
    /// after closing the transport. Unauthorized credentials and retry
    /// exhaustion end the session with `Err`; the state is `Disconnected`
    /// either way.
    #[instrument(skip_all, fields(symbol = %self.config.symbol))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        info!("Feed session starting");
        let result = self.run_loop(&mut shutdown).await;
        self.set_state(ConnectionState::Disconnected);

        match &result {
            Ok(()) => info!("Feed session stopped"),
            Err(e) => {
                error!(error = %e, "Feed session failed");
                self.stats.set_terminal_error(e.to_string());
            }
        }
        result
    }

    /// Run on the tokio runtime and return a handle to observe and stop it.
    pub fn spawn(self) -> SessionHandle
    where
        A: 'static,
        C: 'static,
        S: 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let state = self.subscribe_state();
        let stats = self.stats();
        let task = tokio::spawn(self.run(stop_rx));

        SessionHandle {
            state,
            stats,
            shutdown: stop_tx,
            task,
        }
    }

    async fn run_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), FeedError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let failure = match self.attempt(shutdown).await? {
                Attempt::Stopped => return Ok(()),
                Attempt::Degraded(failure) => failure,
            };

            self.set_state(ConnectionState::Degraded);
            self.retries += 1;

            if self.config.reconnect.exhausted(self.retries) {
                return Err(FeedError::RetriesExhausted {
                    attempts: self.retries,
                    last_error: failure.to_string(),
                });
            }

            let delay = self.config.reconnect.next_delay(self.retries - 1);
            warn!(
                error = %failure,
                attempt = self.retries,
                delay_ms = delay.as_millis() as u64,
                "Session degraded, reconnecting after delay"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = stop_requested(shutdown) => return Ok(()),
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::inc_reconnects(&self.config.symbol);
        }
    }

    /// One pass through Authenticating, Connecting and Subscribed.
    ///
    /// `Err` is terminal; everything retryable comes back as `Attempt::Degraded`.
    async fn attempt(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Attempt, FeedError> {
        self.set_state(ConnectionState::Authenticating);
        let credential = tokio::select! {
            result = self.authenticator.authenticate(&self.config.symbol, &self.config.secret) => {
                match result {
                    Ok(credential) => credential,
                    Err(e) if e.is_retryable() => return Ok(Attempt::Degraded(e.into())),
                    Err(e) => return Err(e.into()),
                }
            }
            _ = stop_requested(shutdown) => return Ok(Attempt::Stopped),
        };

        self.set_state(ConnectionState::Connecting);
        if credential.is_expired() {
            return Ok(Attempt::Degraded(TransportError::CredentialExpired.into()));
        }

        let (mut transport, endpoint) = tokio::select! {
            result = self.open(&credential) => match result {
                Ok(opened) => opened,
                Err(e) => return Ok(Attempt::Degraded(e.into())),
            },
            _ = stop_requested(shutdown) => return Ok(Attempt::Stopped),
        };

        // Nothing from before this connection may mix with what follows.
        self.aggregator.reset();

        let outcome = self
            .stream(&mut transport, &endpoint, &credential, shutdown)
            .await;
        transport.close().await;
        outcome
    }

    /// Try each endpoint in order.
    async fn open(
        &self,
        credential: &Credential,
    ) -> Result<(C::Transport, Endpoint), TransportError> {
        let mut last_error = TransportError::NoEndpoint;

        for endpoint in &credential.endpoints {
            let connect_id = rand::random::<u64>().to_string();
            match self.connector.connect(endpoint, credential, &connect_id).await {
                Ok(transport) => {
                    info!(endpoint = %endpoint.url, "Transport open");
                    return Ok((transport, endpoint.clone()));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.url, error = %e, "Endpoint failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Subscribe, then apply messages until something ends the connection.
    async fn stream(
        &mut self,
        transport: &mut C::Transport,
        endpoint: &Endpoint,
        credential: &Credential,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Attempt, FeedError> {
        let request_id = rand::random::<u64>().to_string();
        let subscribe = SubscribeRequest::level2(request_id.as_str(), &self.config.symbol).to_json()?;
        if let Err(e) = transport.send(subscribe).await {
            return Ok(Attempt::Degraded(e.into()));
        }

        let heartbeat = self.config.heartbeat_timeout;
        let mut last_message = Instant::now();

        // Connecting -> Subscribed once the ack for our request arrives.
        loop {
            tokio::select! {
                _ = stop_requested(shutdown) => return Ok(Attempt::Stopped),
                _ = sleep_until(last_message + heartbeat) => {
                    return Ok(Attempt::Degraded(
                        TransportError::Protocol("subscribe not acknowledged".to_string()).into(),
                    ));
                }
                received = transport.recv() => {
                    let text = match received {
                        Ok(Some(text)) => text,
                        Ok(None) => return Ok(Attempt::Degraded(peer_closed().into())),
                        Err(e) => return Ok(Attempt::Degraded(e.into())),
                    };
                    last_message = Instant::now();
                    match self.handle_text(&text) {
                        Ok(Handled::Ack(id)) if id.is_none() || id.as_deref() == Some(request_id.as_str()) => break,
                        Ok(_) => {}
                        Err(e) => return Ok(Attempt::Degraded(e)),
                    }
                }
            }
        }

        self.retries = 0;
        self.set_state(ConnectionState::Subscribed);
        info!(endpoint = %endpoint.url, "Subscribed");

        let initial = tokio::select! {
            result = self.snapshot_source.fetch(&self.config.symbol, credential) => result,
            _ = stop_requested(shutdown) => return Ok(Attempt::Stopped),
        };
        match initial {
            Ok(Some(update)) => {
                if let Err(e) = self.apply_snapshot(&update) {
                    return Ok(Attempt::Degraded(e.into()));
                }
            }
            Ok(None) => {}
            Err(e) => return Ok(Attempt::Degraded(e.into())),
        }

        let ping_every = endpoint.ping_interval.unwrap_or(self.config.ping_interval);
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_requested(shutdown) => return Ok(Attempt::Stopped),
                _ = sleep_until(last_message + heartbeat) => {
                    let elapsed_ms = last_message.elapsed().as_millis() as u64;
                    return Ok(Attempt::Degraded(TransportError::HeartbeatTimeout { elapsed_ms }.into()));
                }
                _ = ping.tick() => {
                    let frame = PingRequest::new(rand::random::<u64>().to_string()).to_json()?;
                    if let Err(e) = transport.send(frame).await {
                        return Ok(Attempt::Degraded(e.into()));
                    }
                    debug!("Ping sent");
                }
                received = transport.recv() => {
                    let text = match received {
                        Ok(Some(text)) => text,
                        Ok(None) => return Ok(Attempt::Degraded(peer_closed().into())),
                        Err(e) => return Ok(Attempt::Degraded(e.into())),
                    };
                    last_message = Instant::now();
                    if let Err(e) = self.handle_text(&text) {
                        return Ok(Attempt::Degraded(e));
                    }
                }
            }
        }
    }

    /// Decode and apply one frame.
    ///
    /// Malformed frames and stale incrementals are counted and skipped. A gap
    /// or a feed error frame comes back as `Err` and degrades the session.
    fn handle_text(&self, text: &str) -> Result<Handled, FeedError> {
        let _timer = LatencyTimer::new(&self.config.symbol);
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        metrics::inc_messages_received(&self.config.symbol);

        let message = match decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.record_malformed(&e);
                return Ok(Handled::Continue);
            }
        };

        match message {
            FeedMessage::Welcome => debug!("Welcome received"),
            FeedMessage::Heartbeat => debug!("Heartbeat received"),
            FeedMessage::Ack { id } => return Ok(Handled::Ack(id)),
            FeedMessage::Snapshot(update) => {
                if let Err(e) = self.apply_snapshot(&update) {
                    self.record_malformed(&e);
                }
            }
            FeedMessage::Incremental(update) => {
                let Some(sequence) = update.sequence else {
                    self.record_malformed(&"incremental without sequence");
                    return Ok(Handled::Continue);
                };
                match self.aggregator.apply_incremental(sequence, &update.bids, &update.asks) {
                    Ok(()) => debug!(sequence, "Applied incremental"),
                    Err(e) if e.is_stale() => {
                        self.stats.stale.fetch_add(1, Ordering::Relaxed);
                        debug!(sequence, "Dropped stale incremental");
                    }
                    Err(e @ BookError::SequenceGap { .. }) => {
                        self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                        metrics::inc_sequence_gaps(&self.config.symbol);
                        warn!(error = %e, "Sequence gap, resyncing");
                        return Err(e.into());
                    }
                    Err(e) => self.record_malformed(&e),
                }
            }
            FeedMessage::Error { code, reason } => {
                return Err(TransportError::Server { code, reason }.into());
            }
            FeedMessage::Other(kind) => debug!(kind = %kind, "Ignoring message"),
        }

        Ok(Handled::Continue)
    }

    fn apply_snapshot(&self, update: &BookUpdate) -> Result<(), BookError> {
        let sequence = update.sequence.unwrap_or(0);
        self.aggregator
            .apply_snapshot_at(sequence, &update.bids, &update.asks)?;
        self.stats.snapshots.fetch_add(1, Ordering::Relaxed);
        metrics::inc_snapshots_applied(&self.config.symbol);
        Ok(())
    }

    fn record_malformed(&self, error: &dyn std::fmt::Display) {
        self.stats.malformed.fetch_add(1, Ordering::Relaxed);
        metrics::inc_malformed_messages(&self.config.symbol);
        warn!(error = %error, "Dropped malformed message");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "State change");
            metrics::set_session_state(&self.config.symbol, state.code());
        }
    }
}

fn peer_closed() -> TransportError {
    TransportError::Closed {
        code: None,
        reason: "stream ended".to_string(),
    }
}

/// Handle to a spawned [`FeedSession`].
#[derive(Debug)]
pub struct SessionHandle {
    state: watch::Receiver<ConnectionState>,
    stats: Arc<SessionStats>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), FeedError>>,
}

impl SessionHandle {
    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Whether the session task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request a stop and wait for the session to close its transport.
    ///
    /// Returns the session's own result, so a session that had already
    /// failed terminally reports that failure here.
    pub async fn stop(self) -> Result<(), FeedError> {
        self.shutdown.send_replace(true);
        self.task.await?
    }

    /// Wait for the session to end on its own.
    pub async fn join(self) -> Result<(), FeedError> {
        let SessionHandle { shutdown, task, .. } = self;
        let result = task.await?;
        drop(shutdown);
        result
    }
}
