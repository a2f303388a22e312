use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use hireflow_core::EventId;

/// Wire envelope for a domain event published to the events exchange.
///
/// Notes:
/// - `event_id` is minted per publish attempt. It is **not** the outbox row id, so a
///   redelivered row shows up downstream with a new identity. Consumers must tolerate
///   the same `event_type` + `payload` arriving more than once.
/// - `timestamp` is publish time, serialized as RFC 3339.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent<P = JsonValue> {
    event_id: EventId,
    event_type: String,
    timestamp: DateTime<Utc>,
    source_service: String,
    payload: P,
}

impl<P> DomainEvent<P> {
    /// Wrap a payload with a fresh id and the current time.
    pub fn new(event_type: impl Into<String>, source_service: impl Into<String>, payload: P) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source_service: source_service.into(),
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

impl<P: Serialize> DomainEvent<P> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<P: serde::de::DeserializeOwned> DomainEvent<P> {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
