//! Outbox row types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use hireflow_core::{CoreError, OutboxEventId};

/// Delivery status of an outbox row.
///
/// `pending` is the only non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(CoreError::validation(format!("unknown outbox status '{other}'"))),
        }
    }
}

/// An event waiting in (or done with) the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEventRow {
    pub id: OutboxEventId,
    pub event_type: String,
    pub payload: JsonValue,
    /// Only the worker for this service delivers the row.
    pub source_service: String,
    pub status: OutboxStatus,
    /// Failed delivery attempts.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Last delivery error.
    pub error: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
}

/// Input to [`OutboxStore::insert`](super::OutboxStore::insert).
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub payload: JsonValue,
    pub source_service: String,
}

impl NewOutboxEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: JsonValue,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source_service: source_service.into(),
        }
    }

    /// A fresh pending row for this event.
    pub fn into_row(self) -> OutboxEventRow {
        OutboxEventRow {
            id: OutboxEventId::new(),
            event_type: self.event_type,
            payload: self.payload,
            source_service: self.source_service,
            status: OutboxStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            published_at: None,
            error: None,
            error_at: None,
        }
    }
}
