//! Credential acquisition for the streaming feed.

use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::Config;
use crate::error::AuthError;

/// One candidate streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Base WebSocket URL.
    pub url: String,
    /// Client ping cadence requested by the server.
    pub ping_interval: Option<Duration>,
    /// How long the server waits for a ping before dropping us.
    pub ping_timeout: Option<Duration>,
}

impl Endpoint {
    /// Endpoint with no heartbeat hints.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: None,
            ping_timeout: None,
        }
    }
}

/// Access credential for the streaming feed.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Connect token.
    pub token: String,
    /// Endpoints to try, in order.
    pub endpoints: Vec<Endpoint>,
    /// Bearer token for REST calls made on behalf of the session.
    pub bearer: Option<String>,
    issued_at: Instant,
    lifetime: Duration,
}

impl Credential {
    /// Create a credential valid for `lifetime` from now.
    pub fn new(token: impl Into<String>, endpoints: Vec<Endpoint>, lifetime: Duration) -> Self {
        Self {
            token: token.into(),
            endpoints,
            bearer: None,
            issued_at: Instant::now(),
            lifetime,
        }
    }

    /// Attach the bearer token used for REST requests.
    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    /// Check if the credential has outlived its lifetime.
    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() >= self.lifetime
    }

    /// Remaining validity.
    pub fn remaining(&self) -> Duration {
        self.lifetime.saturating_sub(self.issued_at.elapsed())
    }
}

/// Source of feed credentials.
pub trait Authenticator: Send + Sync {
    /// Obtain a fresh credential for `symbol` using the caller-held `secret`.
    fn authenticate(
        &self,
        symbol: &str,
        secret: &str,
    ) -> impl Future<Output = Result<Credential, AuthError>> + Send;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    symbol: &'a str,
    pin: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    authtoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    token: Option<String>,
    #[serde(default)]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceServer {
    endpoint: String,
    ping_interval: Option<u64>,
    ping_timeout: Option<u64>,
}

impl From<InstanceServer> for Endpoint {
    fn from(server: InstanceServer) -> Self {
        Self {
            url: server.endpoint,
            ping_interval: server.ping_interval.map(Duration::from_millis),
            ping_timeout: server.ping_timeout.map(Duration::from_millis),
        }
    }
}

/// Two-step HTTP authenticator.
///
/// `POST /api/authenticate` exchanges the secret for a session token, then
/// `POST /ws-token` exchanges that for a connect token and endpoint list.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    http: reqwest::Client,
    base_url: String,
    credential_ttl: Duration,
}

impl HttpAuthenticator {
    /// Create from config.
    pub fn new(config: &Config) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .connect_timeout(Duration::from_millis(config.http_timeout_ms.min(2_000)))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self::with_client(
            http,
            config.auth_base_url.clone(),
            Duration::from_secs(config.credential_ttl_s),
        ))
    }

    /// Create with an existing HTTP client.
    pub fn with_client(http: reqwest::Client, base_url: String, credential_ttl: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential_ttl,
        }
    }

    async fn login(&self, symbol: &str, secret: &str) -> Result<String, AuthError> {
        let url = format!("{}/api/authenticate", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest { symbol, pin: secret })
            .send()
            .await?;

        let response = check_status(response, symbol)?;
        let body: LoginResponse = response.json().await?;

        body.authtoken
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing authtoken".to_string()))
    }

    async fn connect_token(&self, symbol: &str, session_token: &str) -> Result<Credential, AuthError> {
        let url = format!("{}/ws-token", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(session_token)
            .send()
            .await?;

        let response = check_status(response, symbol)?;
        let body: TokenResponse = response.json().await?;

        let data = body
            .data
            .ok_or_else(|| AuthError::InvalidResponse("missing data".to_string()))?;
        let token = data
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing token".to_string()))?;
        if data.instance_servers.is_empty() {
            return Err(AuthError::InvalidResponse("no instance servers".to_string()));
        }

        let endpoints = data.instance_servers.into_iter().map(Endpoint::from).collect();
        Ok(Credential::new(token, endpoints, self.credential_ttl).with_bearer(session_token))
    }
}

fn check_status(response: reqwest::Response, symbol: &str) -> Result<reqwest::Response, AuthError> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthorized {
            symbol: symbol.to_string(),
        }),
        status if !status.is_success() => Err(AuthError::Rejected {
            status: status.as_u16(),
        }),
        _ => Ok(response),
    }
}

impl Authenticator for HttpAuthenticator {
    #[instrument(skip(self, secret), fields(base_url = %self.base_url))]
    async fn authenticate(&self, symbol: &str, secret: &str) -> Result<Credential, AuthError> {
        let session_token = self.login(symbol, secret).await?;
        let credential = self.connect_token(symbol, &session_token).await?;

        debug!(
            endpoints = credential.endpoints.len(),
            ttl_s = credential.remaining().as_secs(),
            "Credential acquired"
        );
        Ok(credential)
    }
}
