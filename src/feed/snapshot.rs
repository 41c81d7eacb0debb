//! Initial book snapshots fetched outside the stream.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::auth::Credential;
use super::messages::{decode_rest_snapshot, BookUpdate};
use crate::config::Config;
use crate::error::TransportError;

/// Source of a full book taken after subscribing.
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current book for `symbol`; `Ok(None)` means the source has none
    /// and the session starts from an empty book.
    fn fetch(
        &self,
        symbol: &str,
        credential: &Credential,
    ) -> impl Future<Output = Result<Option<BookUpdate>, TransportError>> + Send;
}

/// Relies on the stream for the initial book.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshot;

impl SnapshotSource for NoSnapshot {
    async fn fetch(
        &self,
        _symbol: &str,
        _credential: &Credential,
    ) -> Result<Option<BookUpdate>, TransportError> {
        Ok(None)
    }
}

/// Level-2 (top 100) snapshot over REST.
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    http: reqwest::Client,
    base_url: String,
}

impl RestSnapshotSource {
    /// Create from config.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self::with_client(http, config.rest_base_url.clone()))
    }

    /// Create with an existing HTTP client.
    pub fn with_client(http: reqwest::Client, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl SnapshotSource for RestSnapshotSource {
    async fn fetch(
        &self,
        symbol: &str,
        credential: &Credential,
    ) -> Result<Option<BookUpdate>, TransportError> {
        let url = format!("{}/api/v1/market/orderbook/level2_100", self.base_url);
        let mut request = self.http.get(&url).query(&[("symbol", symbol)]);
        if let Some(bearer) = &credential.bearer {
            request = request.bearer_auth(bearer);
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        let update =
            decode_rest_snapshot(&body).map_err(|e| TransportError::Protocol(e.to_string()))?;

        debug!(
            symbol,
            sequence = ?update.sequence,
            bids = update.bids.len(),
            asks = update.asks.len(),
            "Fetched REST snapshot"
        );
        Ok(Some(update))
    }
}
