//! Application configuration loaded from environment variables.

use serde::Deserialize;

use crate::orderbook::level_book::MAX_PRECISION;
use crate::orderbook::AggregationPolicy;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Feed Credentials ===
    /// Instrument symbol (e.g., BTC-USDT).
    pub feed_symbol: String,

    /// Caller-held secret (PIN) exchanged for a session token.
    pub feed_secret: String,

    // === Endpoints ===
    /// Auth service base URL.
    #[serde(default = "default_auth_url")]
    pub auth_base_url: String,

    /// REST API base URL for level-2 snapshots.
    #[serde(default = "default_rest_url")]
    pub rest_base_url: String,

    /// Fetch an initial REST snapshot after subscribing.
    #[serde(default)]
    pub use_rest_snapshot: bool,

    // === Aggregation ===
    /// Fractional digits kept when normalizing prices.
    #[serde(default = "default_precision")]
    pub price_precision: u32,

    /// Same-bucket policy within one batch: `sum` or `last`.
    #[serde(default = "default_policy")]
    pub aggregation_policy: String,

    // === Session Timing ===
    /// Read silence (ms) after which the session degrades.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Client ping cadence (ms) when the endpoint announces none.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Initial reconnect delay (ms).
    #[serde(default = "default_initial_delay")]
    pub reconnect_initial_delay_ms: u64,

    /// Reconnect delay cap (s).
    #[serde(default = "default_max_delay")]
    pub reconnect_max_delay_s: u64,

    /// Max random jitter per reconnect delay (ms).
    #[serde(default = "default_jitter")]
    pub reconnect_jitter_ms: u64,

    /// Consecutive failed attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Assumed credential lifetime (s).
    #[serde(default = "default_credential_ttl")]
    pub credential_ttl_s: u64,

    /// Auth/REST request timeout (ms).
    #[serde(default = "default_http_timeout")]
    pub http_timeout_ms: u64,

    // === Server Configuration ===
    /// HTTP server port for health/metrics/book endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Enable verbose logging.
    #[serde(default)]
    pub verbose: bool,
}

fn default_auth_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_rest_url() -> String {
    "https://api.kucoin.com".to_string()
}

fn default_precision() -> u32 {
    1
}

fn default_policy() -> String {
    "sum".to_string()
}

fn default_heartbeat_timeout() -> u64 {
    30_000
}

fn default_ping_interval() -> u64 {
    18_000
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30
}

fn default_jitter() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    10
}

fn default_credential_ttl() -> u64 {
    86_400
}

fn default_http_timeout() -> u64 {
    5_000
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Config for `symbol` and `secret` with every other field at its default.
    pub fn for_symbol(symbol: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            feed_symbol: symbol.into(),
            feed_secret: secret.into(),
            auth_base_url: default_auth_url(),
            rest_base_url: default_rest_url(),
            use_rest_snapshot: false,
            price_precision: default_precision(),
            aggregation_policy: default_policy(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            ping_interval_ms: default_ping_interval(),
            reconnect_initial_delay_ms: default_initial_delay(),
            reconnect_max_delay_s: default_max_delay(),
            reconnect_jitter_ms: default_jitter(),
            max_retries: default_max_retries(),
            credential_ttl_s: default_credential_ttl(),
            http_timeout_ms: default_http_timeout(),
            port: default_port(),
            rust_log: default_log_level(),
            verbose: false,
        }
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.feed_symbol.trim().is_empty() {
            return Err("FEED_SYMBOL is required".to_string());
        }

        if self.feed_secret.is_empty() {
            return Err("FEED_SECRET is required".to_string());
        }

        if self.price_precision > MAX_PRECISION {
            return Err(format!("PRICE_PRECISION must be at most {MAX_PRECISION}"));
        }

        self.policy()?;

        if self.heartbeat_timeout_ms == 0 {
            return Err("HEARTBEAT_TIMEOUT_MS must be greater than 0".to_string());
        }

        if self.reconnect_initial_delay_ms > self.reconnect_max_delay_s.saturating_mul(1000) {
            return Err(
                "RECONNECT_INITIAL_DELAY_MS must not exceed RECONNECT_MAX_DELAY_S".to_string(),
            );
        }

        Ok(())
    }

    /// Parsed aggregation policy.
    pub fn policy(&self) -> Result<AggregationPolicy, String> {
        self.aggregation_policy
            .parse()
            .map_err(|_| format!("AGGREGATION_POLICY must be sum or last, got {}", self.aggregation_policy))
    }
}
