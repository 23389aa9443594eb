use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Stream entry field carrying the JSON-encoded envelope.
pub const FIELD_HEADER: &str = "_header";
/// Stream entry field carrying the message payload.
pub const FIELD_BODY: &str = "_body";

/// Message metadata carried alongside every payload. Immutable once
/// dispatched to the handler; re-publishing mutates a derived copy.
///
/// The wire field names (`_id`, `_delay`, ...) are the serialized JSON keys
/// under the `_header` stream field, so envelopes interoperate with any
/// producer that writes the same shape. Unknown keys are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Producer-assigned or store-generated id; `"*"` requests auto-generation.
    #[serde(rename = "_id")]
    pub id: String,

    /// Milliseconds to defer visibility after `timestamp`; 0 = immediate.
    #[serde(rename = "_delay")]
    pub delay: u64,

    /// Seconds since epoch when the message became eligible for delay
    /// counting. Set once at first publish, never reset on republish.
    #[serde(rename = "_timestamp")]
    pub timestamp: f64,

    /// Failed dispatch attempts so far.
    #[serde(rename = "_count")]
    pub retry_count: u32,

    /// Last captured failure description; empty until the first failure.
    #[serde(rename = "_error")]
    pub last_error: String,

    /// Whether acknowledged entries under this id should be purged from the
    /// log after processing.
    #[serde(rename = "_delete")]
    pub auto_delete: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: "*".to_string(),
            delay: 0,
            timestamp: 0.0,
            retry_count: 0,
            last_error: String::new(),
            auto_delete: true,
        }
    }
}

impl Envelope {
    /// Build an envelope for a first publish: timestamp stamped now.
    pub fn new(delay: u64) -> Self {
        Self {
            delay,
            timestamp: now_secs(),
            ..Default::default()
        }
    }

    /// Whether a delayed message is due for dispatch at `now` (seconds).
    pub fn is_due(&self, now: f64) -> bool {
        self.delay as f64 / 1000.0 + self.timestamp <= now
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope from the `_header` field. `None` means the header
    /// is malformed (not an object of the expected shape).
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Assemble the stream entry fields for this envelope + payload.
    pub fn to_fields(&self, body: &str) -> StoreResult<HashMap<String, String>> {
        let mut fields = HashMap::with_capacity(2);
        fields.insert(FIELD_HEADER.to_string(), self.to_json()?);
        fields.insert(FIELD_BODY.to_string(), body.to_string());
        Ok(fields)
    }
}

/// Seconds since epoch as a float, sub-second precision.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Milliseconds since epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
