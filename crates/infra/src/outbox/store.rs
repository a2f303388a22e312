//! Outbox persistence boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use hireflow_core::OutboxEventId;

use super::record::{NewOutboxEvent, OutboxEventRow};

/// Outbox store operation error.
///
/// - **Database**: the datastore rejected or failed the statement
/// - **Unavailable**: no connection to the datastore (pool closed, network)
/// - **Corrupt**: a stored row could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxStoreError {
    #[error("outbox database error: {0}")]
    Database(String),

    #[error("outbox store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt outbox row: {0}")]
    Corrupt(String),
}

/// Durable outbox table.
///
/// Status updates only touch rows that are still `pending`; the returned `bool` says
/// whether a row was updated. A row that is already `published` or `failed` is never
/// changed again.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new pending row.
    async fn insert(&self, event: NewOutboxEvent) -> Result<OutboxEventRow, OutboxStoreError>;

    /// Oldest pending rows of one service, `created_at` ascending.
    async fn fetch_pending(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError>;

    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// Store a failed delivery. `terminal` moves the row to `failed`; otherwise it stays
    /// pending with the new attempt count.
    async fn record_failure(
        &self,
        id: OutboxEventId,
        attempts: u32,
        terminal: bool,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError>;

    /// Rows of one service that gave up, oldest first.
    async fn list_failed(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn insert(&self, event: NewOutboxEvent) -> Result<OutboxEventRow, OutboxStoreError> {
        (**self).insert(event).await
    }

    async fn fetch_pending(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        (**self).fetch_pending(source_service, limit).await
    }

    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self).mark_published(id, at).await
    }

    async fn record_failure(
        &self,
        id: OutboxEventId,
        attempts: u32,
        terminal: bool,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        (**self)
            .record_failure(id, attempts, terminal, error, at)
            .await
    }

    async fn list_failed(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        (**self).list_failed(source_service, limit).await
    }
}
