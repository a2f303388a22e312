use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hireflow_core::OutboxEventId;

use super::record::{NewOutboxEvent, OutboxEventRow, OutboxStatus};
use super::store::{OutboxStore, OutboxStoreError};

/// In-memory outbox table.
///
/// Intended for tests/dev. Writes can be switched to fail to simulate a datastore outage.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    rows: RwLock<Vec<OutboxEventRow>>,
    fail_writes: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make inserts and status updates fail with [`OutboxStoreError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every row, in insertion order.
    pub fn rows(&self) -> Vec<OutboxEventRow> {
        self.rows.read().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn get(&self, id: OutboxEventId) -> Option<OutboxEventRow> {
        self.rows
            .read()
            .ok()
            .and_then(|rows| rows.iter().find(|r| r.id == id).cloned())
    }

    fn check_writable(&self) -> Result<(), OutboxStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(OutboxStoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn select(
        &self,
        source_service: &str,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| OutboxStoreError::Unavailable("lock poisoned".to_string()))?;
        let mut selected: Vec<OutboxEventRow> = rows
            .iter()
            .filter(|r| r.source_service == source_service && r.status == status)
            .cloned()
            .collect();
        selected.sort_by_key(|r| r.created_at);
        selected.truncate(limit);
        Ok(selected)
    }

    fn update_pending(
        &self,
        id: OutboxEventId,
        apply: impl FnOnce(&mut OutboxEventRow),
    ) -> Result<bool, OutboxStoreError> {
        self.check_writable()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|_| OutboxStoreError::Unavailable("lock poisoned".to_string()))?;
        match rows
            .iter_mut()
            .find(|r| r.id == id && r.status == OutboxStatus::Pending)
        {
            Some(row) => {
                apply(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, event: NewOutboxEvent) -> Result<OutboxEventRow, OutboxStoreError> {
        self.check_writable()?;
        let row = event.into_row();
        self.rows
            .write()
            .map_err(|_| OutboxStoreError::Unavailable("lock poisoned".to_string()))?
            .push(row.clone());
        Ok(row)
    }

    async fn fetch_pending(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        self.select(source_service, OutboxStatus::Pending, limit)
    }

    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        self.update_pending(id, |row| {
            row.status = OutboxStatus::Published;
            row.published_at = Some(at);
        })
    }

    async fn record_failure(
        &self,
        id: OutboxEventId,
        attempts: u32,
        terminal: bool,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        self.update_pending(id, |row| {
            row.attempts = attempts;
            row.error = Some(error.to_string());
            row.error_at = Some(at);
            if terminal {
                row.status = OutboxStatus::Failed;
            }
        })
    }

    async fn list_failed(
        &self,
        source_service: &str,
        limit: usize,
    ) -> Result<Vec<OutboxEventRow>, OutboxStoreError> {
        self.select(source_service, OutboxStatus::Failed, limit)
    }
}
