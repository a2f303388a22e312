use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use hireflow_events::{EventPublisher, PublishError};

use super::postgres::PostgresOutboxStore;
use super::record::{NewOutboxEvent, OutboxEventRow};
use super::store::{OutboxStore, OutboxStoreError};

/// Durable [`EventPublisher`]: every publish becomes a pending outbox row.
///
/// No network call happens here; the outbox worker delivers the row later.
#[derive(Debug, Clone)]
pub struct OutboxProducer<S> {
    store: S,
    source_service: String,
}

impl<S> OutboxProducer<S> {
    pub fn new(store: S, source_service: impl Into<String>) -> Self {
        Self {
            store,
            source_service: source_service.into(),
        }
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn new_event(
        &self,
        event_type: &str,
        payload: JsonValue,
        source_service: Option<&str>,
    ) -> NewOutboxEvent {
        NewOutboxEvent::new(
            event_type,
            payload,
            source_service.unwrap_or(&self.source_service),
        )
    }
}

impl<S: OutboxStore> OutboxProducer<S> {
    /// Store a pending row and return it.
    pub async fn enqueue(
        &self,
        event_type: &str,
        payload: JsonValue,
    ) -> Result<OutboxEventRow, OutboxStoreError> {
        let row = self
            .store
            .insert(self.new_event(event_type, payload, None))
            .await?;
        debug!(outbox_id = %row.id, event_type, source_service = %row.source_service, "event stored in outbox");
        Ok(row)
    }
}

impl OutboxProducer<PostgresOutboxStore> {
    /// Store the event in the caller's transaction, next to the business write it
    /// describes. Both commit or neither does.
    pub async fn publish_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_type: &str,
        payload: JsonValue,
    ) -> Result<OutboxEventRow, OutboxStoreError> {
        PostgresOutboxStore::insert_in_tx(tx, self.new_event(event_type, payload, None)).await
    }
}

#[async_trait]
impl<S: OutboxStore> EventPublisher for OutboxProducer<S> {
    async fn publish(
        &self,
        event_type: &str,
        payload: JsonValue,
        source_service: Option<&str>,
    ) -> Result<(), PublishError> {
        let row = self
            .store
            .insert(self.new_event(event_type, payload, source_service))
            .await
            .map_err(|e| PublishError::Storage(e.to_string()))?;
        debug!(outbox_id = %row.id, event_type, source_service = %row.source_service, "event stored in outbox");
        Ok(())
    }
}
