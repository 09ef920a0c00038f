use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Payload, SignalId};

/// An immutable, typed message routed through the signal bus.
///
/// Signals are assembled with the `with_*` combinators before they are emitted;
/// once on the bus they are only ever read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default = "SignalId::new_v4")]
    id: SignalId,
    #[serde(rename = "type")]
    signal_type: String,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    source: String,
    #[serde(default = "fresh_correlation_id")]
    correlation_id: String,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    durable: bool,
}

fn fresh_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Signal {
    pub fn new(signal_type: impl Into<String>) -> Self {
        Self {
            id: SignalId::new_v4(),
            signal_type: signal_type.into(),
            payload: Payload::new(),
            source: String::new(),
            correlation_id: fresh_correlation_id(),
            created_at: Utc::now(),
            durable: false,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Empty correlation ids are ignored so the fresh default survives.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        if !correlation_id.is_empty() {
            self.correlation_id = correlation_id;
        }
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    pub fn signal_type(&self) -> &str {
        &self.signal_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Feedback depth carried in the payload, 0 when absent or malformed.
    pub fn depth(&self) -> u64 {
        self.payload
            .get("depth")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}
