//! Upstream market-data feed.
//!
//! A [`FeedSession`] authenticates, connects, subscribes to the level-2 topic
//! of one symbol and streams decoded updates into an
//! [`OrderBookAggregator`](crate::orderbook::OrderBookAggregator).

pub mod auth;
pub mod backoff;
pub mod messages;
pub mod mock;
pub mod session;
pub mod snapshot;
pub mod transport;

pub use auth::{Authenticator, Credential, Endpoint, HttpAuthenticator};
pub use backoff::ReconnectConfig;
pub use messages::{decode, BookUpdate, FeedMessage};
pub use session::{
    ConnectionState, FeedSession, SessionConfig, SessionHandle, SessionStats, StatsSnapshot,
};
pub use snapshot::{NoSnapshot, RestSnapshotSource, SnapshotSource};
pub use transport::{Connector, Transport, WsConnector, WsTransport};
