//! Upstream feed message decoding and outbound requests.
//!
//! Frames are JSON text. Inbound `type` values:
//! - `welcome`, `ack`, `pong`: session control
//! - `error`: feed-reported failure
//! - `message`: book data; subject `l2update` is incremental, anything else
//!   carries a full book
//! - `snapshot` / `incremental`: book data without the `message` envelope

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MessageError;
use crate::orderbook::PriceLevel;

/// Subjects that mark a `message` frame as incremental.
const INCREMENTAL_SUBJECTS: &[&str] = &["l2update", "trade.l2update", "incremental"];

/// Decoded upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Connection greeting sent before anything else.
    Welcome,
    /// Subscription acknowledgment.
    Ack {
        /// Request id being acknowledged.
        id: Option<String>,
    },
    /// Heartbeat reply.
    Heartbeat,
    /// Full book replacement.
    Snapshot(BookUpdate),
    /// Changed levels since the previous sequence.
    Incremental(BookUpdate),
    /// Error reported by the feed.
    Error {
        /// Feed error code.
        code: i64,
        /// Feed error text.
        reason: String,
    },
    /// Any other message type; ignored by the session.
    Other(String),
}

/// Levels carried by a snapshot or incremental message.
///
/// Sizes are absolute; zero removes the level.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookUpdate {
    /// Sequence number, required for incremental messages.
    pub sequence: Option<u64>,
    /// Bid levels as sent (not normalized).
    pub bids: Vec<PriceLevel>,
    /// Ask levels as sent (not normalized).
    pub asks: Vec<PriceLevel>,
}

/// JSON number or numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Number(serde_json::Number),
    Text(String),
}

impl Scalar {
    fn text(&self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }

    fn to_decimal(&self, field: &'static str) -> Result<Decimal, MessageError> {
        let text = self.text();
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|_| MessageError::InvalidNumber { field, value: text })
    }

    fn to_u64(&self, field: &'static str) -> Result<u64, MessageError> {
        let text = self.text();
        text.parse()
            .map_err(|_| MessageError::InvalidNumber { field, value: text })
    }

    fn to_i64(&self, field: &'static str) -> Result<i64, MessageError> {
        let text = self.text();
        text.parse()
            .map_err(|_| MessageError::InvalidNumber { field, value: text })
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    id: Option<Scalar>,
    subject: Option<String>,
    code: Option<Scalar>,
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBookData {
    sequence: Option<Scalar>,
    bids: Option<Vec<Vec<Scalar>>>,
    asks: Option<Vec<Vec<Scalar>>>,
    changes: Option<RawChanges>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChanges {
    bids: Option<Vec<Vec<Scalar>>>,
    asks: Option<Vec<Vec<Scalar>>>,
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<FeedMessage, MessageError> {
    let envelope: RawEnvelope = serde_json::from_str(text)?;
    let msg_type = envelope
        .msg_type
        .as_deref()
        .ok_or(MessageError::MissingField("type"))?;

    match msg_type {
        "welcome" => Ok(FeedMessage::Welcome),
        "ack" => Ok(FeedMessage::Ack {
            id: envelope.id.as_ref().map(Scalar::text),
        }),
        "pong" | "ping" | "heartbeat" => Ok(FeedMessage::Heartbeat),
        "error" => decode_error(&envelope),
        "snapshot" => Ok(FeedMessage::Snapshot(decode_book(envelope.data)?)),
        "incremental" | "update" => decode_incremental(envelope.data),
        "message" => {
            let incremental = envelope
                .subject
                .as_deref()
                .is_some_and(|s| INCREMENTAL_SUBJECTS.contains(&s));
            if incremental {
                decode_incremental(envelope.data)
            } else {
                Ok(FeedMessage::Snapshot(decode_book(envelope.data)?))
            }
        }
        other => Ok(FeedMessage::Other(other.to_string())),
    }
}

fn decode_error(envelope: &RawEnvelope) -> Result<FeedMessage, MessageError> {
    let code = match &envelope.code {
        Some(code) => code.to_i64("code")?,
        None => 0,
    };
    let reason = match &envelope.data {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    Ok(FeedMessage::Error { code, reason })
}

fn decode_incremental(data: Option<Value>) -> Result<FeedMessage, MessageError> {
    let update = decode_book(data)?;
    if update.sequence.is_none() {
        return Err(MessageError::MissingField("data.sequence"));
    }
    Ok(FeedMessage::Incremental(update))
}

fn decode_book(data: Option<Value>) -> Result<BookUpdate, MessageError> {
    let data = data.ok_or(MessageError::MissingField("data"))?;
    let raw: RawBookData = serde_json::from_value(data)?;

    let changes = raw.changes.unwrap_or_default();
    let bids = raw.bids.or(changes.bids).unwrap_or_default();
    let asks = raw.asks.or(changes.asks).unwrap_or_default();

    Ok(BookUpdate {
        sequence: raw
            .sequence
            .as_ref()
            .map(|s| s.to_u64("data.sequence"))
            .transpose()?,
        bids: decode_levels(&bids)?,
        asks: decode_levels(&asks)?,
    })
}

fn decode_levels(raw: &[Vec<Scalar>]) -> Result<Vec<PriceLevel>, MessageError> {
    raw.iter()
        .map(|entry| match entry.as_slice() {
            [price, size, ..] => Ok(PriceLevel::new(
                price.to_decimal("price")?,
                size.to_decimal("size")?,
            )),
            _ => Err(MessageError::InvalidLevel(format!(
                "expected [price, size], got {} element(s)",
                entry.len()
            ))),
        })
        .collect()
}

/// REST level-2 snapshot body (`data` of the response).
#[derive(Debug, Deserialize)]
struct RestSnapshotBody {
    data: Option<Value>,
}

/// Decode a REST level-2 snapshot response.
pub fn decode_rest_snapshot(text: &str) -> Result<BookUpdate, MessageError> {
    let body: RestSnapshotBody = serde_json::from_str(text)?;
    decode_book(body.data)
}

/// Subscription request for the level-2 topic of a symbol.
#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    /// Request id echoed by the ack.
    pub id: String,
    /// Always `subscribe`.
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    /// Topic to subscribe to.
    pub topic: String,
    /// Public channel.
    #[serde(rename = "privateChannel")]
    pub private_channel: bool,
    /// Ask the feed to acknowledge.
    pub response: bool,
}

impl SubscribeRequest {
    /// Build a level-2 subscription.
    pub fn level2(id: impl Into<String>, symbol: &str) -> Self {
        Self {
            id: id.into(),
            msg_type: "subscribe",
            topic: format!("/market/level2:{symbol}"),
            private_channel: false,
            response: true,
        }
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client heartbeat.
#[derive(Debug, Serialize)]
pub struct PingRequest {
    /// Request id.
    pub id: String,
    /// Always `ping`.
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

impl PingRequest {
    /// Build a ping.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: "ping",
        }
    }

    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}
