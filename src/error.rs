//! Unified error types for the order book feed.

use rust_decimal::Decimal;
use thiserror::Error;

/// Unified error type for the order book feed.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Configuration loaded but failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Credential acquisition failed.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Book update rejected by the aggregator.
    #[error("book error: {0}")]
    Book(#[from] BookError),

    /// Upstream message could not be decoded.
    #[error("malformed message: {0}")]
    Message(#[from] MessageError),

    /// Reconnect attempts exceeded the configured cap.
    #[error("gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted {
        /// Number of consecutive failed attempts.
        attempts: u32,
        /// Display form of the last failure.
        last_error: String,
    },

    /// The session task panicked or was aborted.
    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential acquisition errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The secret was refused (HTTP 401).
    #[error("unauthorized: secret rejected for {symbol}")]
    Unauthorized {
        /// Symbol the session was authenticating for.
        symbol: String,
    },

    /// The auth service answered with an unexpected status.
    #[error("auth request rejected with status {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// The auth service answered but the body was unusable.
    #[error("invalid auth response: {0}")]
    InvalidResponse(String),

    /// The auth service could not be reached.
    #[error("auth request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl AuthError {
    /// Whether the failure is worth another attempt.
    ///
    /// A throttled or unavailable auth service is retried; a
    /// refused secret or a broken response ends the session.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Request(_) => true,
            AuthError::Rejected { status } => *status >= 500 || *status == 429,
            AuthError::Unauthorized { .. } | AuthError::InvalidResponse(_) => false,
        }
    }
}

/// Transport connection and frame errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed by the peer.
    #[error("connection closed: code={code:?}, reason={reason}")]
    Closed {
        /// Close code.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },

    /// No message arrived within the heartbeat window.
    #[error("no message received for {elapsed_ms}ms")]
    HeartbeatTimeout {
        /// Silence duration that triggered the timeout.
        elapsed_ms: u64,
    },

    /// Send failed.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// The feed reported an error frame.
    #[error("server error {code}: {reason}")]
    Server {
        /// Error code reported by the feed.
        code: i64,
        /// Error text reported by the feed.
        reason: String,
    },

    /// The credential outlived its lifetime before it was used.
    #[error("credential expired before connect")]
    CredentialExpired,

    /// The credential carried no endpoint to connect to.
    #[error("credential has no endpoint")]
    NoEndpoint,

    /// Frame or handshake violated the feed protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP error on a REST transport.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Book update rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// Incremental sequence did not follow the last applied one.
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap {
        /// Sequence the aggregator would have accepted.
        expected: u64,
        /// Sequence carried by the rejected update.
        received: u64,
    },

    /// A level carried a negative price or size.
    #[error("invalid level: price={price}, size={size}")]
    InvalidLevel {
        /// Raw price.
        price: Decimal,
        /// Raw size.
        size: Decimal,
    },
}

impl BookError {
    /// Whether a rejected sequence is behind the book (already applied).
    pub fn is_stale(&self) -> bool {
        matches!(self, BookError::SequenceGap { expected, received } if received < expected)
    }
}

/// Upstream message decoding errors.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Frame is not valid JSON for the expected shape.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A numeric field could not be parsed as a finite decimal.
    #[error("invalid number in {field}: {value:?}")]
    InvalidNumber {
        /// Field being parsed.
        field: &'static str,
        /// Raw text.
        value: String,
    },

    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A level entry did not have the `[price, size, ...]` shape.
    #[error("invalid level entry: {0}")]
    InvalidLevel(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, FeedError>;
