//! Event publishing contract (mechanics only).
//!
//! Business services emit events through [`EventPublisher`] and never learn which
//! transport sits behind it. Two implementations exist in `hireflow-infra`:
//!
//! - **Direct**: `ResilientPublisher` writes straight to the broker. Best effort: if the
//!   broker is down after one reconnect attempt, the event is dropped.
//! - **Durable**: `OutboxProducer` records the event in the outbox table; the outbox
//!   worker delivers it later. Nothing is lost while the broker is down.
//!
//! Which one a service gets is decided once, at startup, by handing it an
//! `Arc<dyn EventPublisher>`.
//!
//! ## Delivery guarantees
//!
//! Delivery is **at-least-once**. The durable path redelivers when bookkeeping fails
//! after a successful send, and every publish attempt gets a fresh `event_id`, so
//! consumers must be idempotent on `event_type` + payload.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Failure to hand an event to the transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// No live broker connection, even after one reconnect attempt. The event was dropped.
    #[error("broker not connected; event dropped")]
    NotConnected,

    /// The broker rejected or failed the publish while connected.
    #[error("broker publish failed: {0}")]
    Broker(String),

    /// The durable outbox write failed.
    #[error("outbox write failed: {0}")]
    Storage(String),

    /// The payload could not be encoded.
    #[error("event serialization failed: {0}")]
    Serialization(String),
}

/// Narrow publish contract shared by the direct and the durable publisher.
///
/// `source_service` overrides the publisher's own service name when given.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        event_type: &str,
        payload: JsonValue,
        source_service: Option<&str>,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(
        &self,
        event_type: &str,
        payload: JsonValue,
        source_service: Option<&str>,
    ) -> Result<(), PublishError> {
        (**self).publish(event_type, payload, source_service).await
    }
}
