//! Scripted feed collaborators for testing.
//!
//! Sessions can be driven end to end without a network: the authenticator
//! and connector hand out queued results, and each [`MockTransport`] is wired
//! to a [`MockPeer`] that plays the feed's side of the conversation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use super::auth::{Authenticator, Credential, Endpoint};
use super::messages::BookUpdate;
use super::snapshot::SnapshotSource;
use super::transport::{Connector, Transport};
use crate::error::{AuthError, TransportError};

/// Endpoint handed out by [`MockAuthenticator`] when nothing is scripted.
pub const MOCK_ENDPOINT: &str = "wss://mock.feed/endpoint";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Credential valid for an hour at [`MOCK_ENDPOINT`].
pub fn mock_credential() -> Credential {
    Credential::new(
        "mock-token",
        vec![Endpoint::new(MOCK_ENDPOINT)],
        Duration::from_secs(3600),
    )
    .with_bearer("mock-session")
}

/// Authenticator returning scripted results, then [`mock_credential`] forever.
#[derive(Debug, Clone, Default)]
pub struct MockAuthenticator {
    script: Arc<Mutex<VecDeque<Result<Credential, AuthError>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockAuthenticator {
    /// Create with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next call.
    pub fn push(&self, result: Result<Credential, AuthError>) {
        lock(&self.script).push_back(result);
    }

    /// Number of `authenticate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, _symbol: &str, _secret: &str) -> Result<Credential, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| Ok(mock_credential()))
    }
}

/// Connector returning scripted transports, then failing every connect.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<Result<MockTransport, TransportError>>>>,
    connects: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockConnector {
    /// Create with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport and return the peer driving it.
    pub fn push_link(&self) -> MockPeer {
        let (transport, peer) = mock_link();
        lock(&self.script).push_back(Ok(transport));
        peer
    }

    /// Queue a connect failure.
    pub fn push_failure(&self, error: TransportError) {
        lock(&self.script).push_back(Err(error));
    }

    /// Number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        lock(&self.connects).len()
    }

    /// `(endpoint url, connect id)` of every attempt, in order.
    pub fn connects(&self) -> Vec<(String, String)> {
        lock(&self.connects).clone()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        _credential: &Credential,
        connect_id: &str,
    ) -> Result<MockTransport, TransportError> {
        lock(&self.connects).push((endpoint.url.clone(), connect_id.to_string()));
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| {
            Err(TransportError::ConnectionFailed(
                "no scripted transport".to_string(),
            ))
        })
    }
}

/// In-memory transport; its counterpart is a [`MockPeer`].
#[derive(Debug)]
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Feed side of a [`MockTransport`].
///
/// Dropping the peer closes the transport's inbound stream cleanly.
#[derive(Debug)]
pub struct MockPeer {
    inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    outbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

/// Create a connected transport/peer pair.
pub fn mock_link() -> (MockTransport, MockPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let transport = MockTransport {
        inbound: inbound_rx,
        outbound: outbound_tx,
        closed: Arc::clone(&closed),
    };
    let peer = MockPeer {
        inbound: inbound_tx,
        outbound: outbound_rx,
        closed,
    };
    (transport, peer)
}

impl Transport for MockTransport {
    async fn send(&mut self, payload: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("transport closed".to_string()));
        }
        self.outbound
            .send(payload)
            .map_err(|_| TransportError::SendFailed("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
    }
}

impl MockPeer {
    /// Deliver a text frame to the session.
    pub fn send(&self, text: impl Into<String>) {
        // The session may already have dropped its end; scripts don't care.
        let _ = self.inbound.send(Ok(text.into()));
    }

    /// Deliver a transport error to the session.
    pub fn fail(&self, error: TransportError) {
        let _ = self.inbound.send(Err(error));
    }

    /// Next frame the session sent, waiting up to `timeout`.
    pub async fn next_sent(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Frames the session has sent and nobody has read yet.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut sent = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            sent.push(frame);
        }
        sent
    }

    /// Whether the session closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Snapshot source returning scripted books, then `None`.
#[derive(Debug, Clone, Default)]
pub struct MockSnapshotSource {
    script: Arc<Mutex<VecDeque<BookUpdate>>>,
    fetches: Arc<AtomicUsize>,
}

impl MockSnapshotSource {
    /// Create with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the book returned by the next fetch.
    pub fn push(&self, update: BookUpdate) {
        lock(&self.script).push_back(update);
    }

    /// Number of fetches so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl SnapshotSource for MockSnapshotSource {
    async fn fetch(
        &self,
        _symbol: &str,
        _credential: &Credential,
    ) -> Result<Option<BookUpdate>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.script).pop_front())
    }
}
