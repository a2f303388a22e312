use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::{Span, debug, error, info, instrument, warn};

use hireflow_events::EventPublisher;

use super::record::OutboxEventRow;
use super::store::{OutboxStore, OutboxStoreError};
use crate::config::OutboxWorkerConfig;
use crate::workers::{PeriodicHandle, PeriodicTask};

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Pending rows read in this poll.
    pub fetched: usize,
    pub published: usize,
    /// Publish failed; row stays pending for the next poll.
    pub retried: usize,
    /// Publish failed for the last allowed time; row moved to `failed`.
    pub failed: usize,
    /// Status updates that did not reach the store.
    pub bookkeeping_errors: usize,
    /// Another poll was already running; nothing was done.
    pub skipped: bool,
}

/// Drains pending outbox rows of one service to an [`EventPublisher`].
///
/// ## Delivery
///
/// Rows are delivered one at a time, oldest first. After a successful publish the row is
/// marked `published`; if that update fails the row stays pending and is sent again on
/// the next poll (at-least-once). A failed publish bumps `attempts`; reaching
/// `max_attempts` parks the row as `failed`.
///
/// ## Scheduling
///
/// `start()` polls immediately and then every `poll_interval`. Polls never overlap,
/// including manual `poll_once()` calls.
pub struct OutboxWorker<S> {
    inner: Arc<WorkerInner<S>>,
}

struct WorkerInner<S> {
    store: S,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxWorkerConfig,
    in_flight: tokio::sync::Mutex<()>,
    task: Mutex<Option<PeriodicHandle>>,
}

impl<S> Clone for OutboxWorker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> std::fmt::Debug for OutboxWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWorker")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<S> OutboxWorker<S> {
    pub fn config(&self) -> &OutboxWorkerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .map(|task| task.as_ref().is_some_and(|h| !h.is_stopped()))
            .unwrap_or(false)
    }

    fn take_task(&self) -> Option<PeriodicHandle> {
        self.inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Cancel the next scheduled poll. A poll that is already running finishes on its own.
    pub fn stop(&self) {
        if let Some(handle) = self.take_task() {
            handle.stop();
            info!(source_service = %self.inner.config.source_service, "outbox worker stopped");
        }
    }

    /// Stop and wait until the poll loop has exited.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.take_task() {
            handle.shutdown().await;
            info!(source_service = %self.inner.config.source_service, "outbox worker shut down");
        }
    }
}

impl<S> OutboxWorker<S>
where
    S: OutboxStore + 'static,
{
    pub fn new(store: S, publisher: Arc<dyn EventPublisher>, config: OutboxWorkerConfig) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                publisher,
                config,
                in_flight: tokio::sync::Mutex::new(()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Begin polling. Calling it while already running does nothing.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|h| !h.is_stopped()) {
            debug!(source_service = %self.inner.config.source_service, "outbox worker already running");
            return;
        }

        let weak: Weak<WorkerInner<S>> = Arc::downgrade(&self.inner);
        let handle = PeriodicTask::new("outbox-worker", self.inner.config.poll_interval).spawn(
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if let Err(err) = inner.poll().await {
                        warn!(
                            source_service = %inner.config.source_service,
                            error = %err,
                            "outbox poll failed"
                        );
                    }
                }
            },
        );
        *task = Some(handle);

        info!(
            source_service = %self.inner.config.source_service,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            batch_size = self.inner.config.batch_size,
            "outbox worker started"
        );
    }

    /// Run one poll now. Returns a skipped report if a poll is already running.
    pub async fn poll_once(&self) -> Result<PollReport, OutboxStoreError> {
        self.inner.poll().await
    }
}

impl<S> WorkerInner<S>
where
    S: OutboxStore,
{
    #[instrument(
        skip(self),
        fields(source_service = %self.config.source_service, fetched = tracing::field::Empty),
        err
    )]
    async fn poll(&self) -> Result<PollReport, OutboxStoreError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("outbox poll already in flight");
            return Ok(PollReport {
                skipped: true,
                ..PollReport::default()
            });
        };

        let rows = self
            .store
            .fetch_pending(&self.config.source_service, self.config.batch_size)
            .await?;
        Span::current().record("fetched", rows.len());

        let mut report = PollReport {
            fetched: rows.len(),
            ..PollReport::default()
        };
        for row in rows {
            self.deliver(row, &mut report).await;
        }

        if report.fetched > 0 {
            info!(
                published = report.published,
                retried = report.retried,
                failed = report.failed,
                bookkeeping_errors = report.bookkeeping_errors,
                "outbox poll complete"
            );
        }
        Ok(report)
    }

    async fn deliver(&self, row: OutboxEventRow, report: &mut PollReport) {
        let published = self
            .publisher
            .publish(&row.event_type, row.payload.clone(), Some(&row.source_service))
            .await;

        match published {
            Ok(()) => match self.store.mark_published(row.id, Utc::now()).await {
                Ok(updated) => {
                    if !updated {
                        debug!(outbox_id = %row.id, "outbox row settled elsewhere");
                    }
                    report.published += 1;
                }
                Err(err) => {
                    // Row stays pending and will be sent again.
                    report.bookkeeping_errors += 1;
                    error!(
                        outbox_id = %row.id,
                        event_type = %row.event_type,
                        error = %err,
                        "event published but could not be marked as published"
                    );
                }
            },
            Err(publish_err) => {
                let attempts = row.attempts.saturating_add(1);
                let terminal = attempts >= self.config.max_attempts;
                let message = publish_err.to_string();

                match self
                    .store
                    .record_failure(row.id, attempts, terminal, &message, Utc::now())
                    .await
                {
                    Ok(_) if terminal => {
                        report.failed += 1;
                        error!(
                            outbox_id = %row.id,
                            event_type = %row.event_type,
                            attempts,
                            error = %message,
                            "outbox event failed permanently"
                        );
                    }
                    Ok(_) => {
                        report.retried += 1;
                        warn!(
                            outbox_id = %row.id,
                            event_type = %row.event_type,
                            attempts,
                            max_attempts = self.config.max_attempts,
                            error = %message,
                            "outbox publish failed; will retry"
                        );
                    }
                    Err(err) => {
                        report.bookkeeping_errors += 1;
                        error!(
                            outbox_id = %row.id,
                            attempts,
                            error = %err,
                            "could not record outbox publish failure"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use hireflow_events::RecordingPublisher;

    use crate::outbox::{InMemoryOutboxStore, NewOutboxEvent, OutboxStatus};

    fn worker(
        store: Arc<InMemoryOutboxStore>,
        publisher: Arc<RecordingPublisher>,
        config: OutboxWorkerConfig,
    ) -> OutboxWorker<Arc<InMemoryOutboxStore>> {
        OutboxWorker::new(store, publisher, config)
    }

    async fn seed(store: &InMemoryOutboxStore, service: &str, event_type: &str) -> OutboxEventRow {
        store
            .insert(NewOutboxEvent::new(event_type, json!({"type": event_type}), service))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn publishes_pending_rows_in_creation_order() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        for event_type in ["first", "second", "third"] {
            seed(&store, "applications", event_type).await;
        }
        let worker = worker(
            store.clone(),
            publisher.clone(),
            OutboxWorkerConfig::for_service("applications"),
        );

        let report = worker.poll_once().await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.published, 3);
        let types: Vec<String> = publisher
            .published()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect();
        assert_eq!(types, ["first", "second", "third"]);
        assert!(publisher.published().iter().all(|e| e.source_service() == "applications"));
        assert!(store.rows().iter().all(|r| r.status == OutboxStatus::Published));
        assert!(store.rows().iter().all(|r| r.published_at.is_some()));
    }

    #[tokio::test]
    async fn only_own_service_rows_are_delivered() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        seed(&store, "applications", "application.created").await;
        let foreign = seed(&store, "payments", "payout.processed").await;
        let worker = worker(
            store.clone(),
            publisher.clone(),
            OutboxWorkerConfig::for_service("applications"),
        );

        worker.poll_once().await.unwrap();

        assert_eq!(publisher.published().len(), 1);
        assert_eq!(store.get(foreign.id).unwrap().status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn batch_size_caps_each_poll() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        for i in 0..5 {
            seed(&store, "svc", &format!("evt.{i}")).await;
        }
        let worker = worker(
            store.clone(),
            publisher.clone(),
            OutboxWorkerConfig::for_service("svc").with_batch_size(2),
        );

        assert_eq!(worker.poll_once().await.unwrap().published, 2);
        assert_eq!(store.fetch_pending("svc", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn broker_outage_exhausts_attempts_then_parks_row() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        publisher.set_available(false);
        let row = seed(&store, "applications", "application.created").await;
        let worker = worker(
            store.clone(),
            publisher.clone(),
            OutboxWorkerConfig::for_service("applications").with_max_attempts(5),
        );

        for expected in 1..=4 {
            let report = worker.poll_once().await.unwrap();
            assert_eq!(report.retried, 1);
            let current = store.get(row.id).unwrap();
            assert_eq!(current.status, OutboxStatus::Pending);
            assert_eq!(current.attempts, expected);
            assert!(current.error.is_some());
        }

        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let parked = store.get(row.id).unwrap();
        assert_eq!(parked.status, OutboxStatus::Failed);
        assert_eq!(parked.attempts, 5);
        assert!(parked.error_at.is_some());
        assert_eq!(store.list_failed("applications", 10).await.unwrap().len(), 1);

        publisher.set_available(true);
        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.fetched, 0);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn recovery_before_exhaustion_publishes_row() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        publisher.fail_next(2);
        let row = seed(&store, "svc", "interview.scheduled").await;
        let worker = worker(store.clone(), publisher.clone(), OutboxWorkerConfig::for_service("svc"));

        worker.poll_once().await.unwrap();
        worker.poll_once().await.unwrap();
        let report = worker.poll_once().await.unwrap();

        assert_eq!(report.published, 1);
        let done = store.get(row.id).unwrap();
        assert_eq!(done.status, OutboxStatus::Published);
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn failed_bookkeeping_leaves_row_pending_for_redelivery() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        let row = seed(&store, "svc", "offer.sent").await;
        let worker = worker(store.clone(), publisher.clone(), OutboxWorkerConfig::for_service("svc"));

        store.fail_writes(true);
        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.bookkeeping_errors, 1);
        assert_eq!(store.get(row.id).unwrap().status, OutboxStatus::Pending);

        store.fail_writes(false);
        worker.poll_once().await.unwrap();

        // Sent twice: at-least-once.
        assert_eq!(publisher.published().len(), 2);
        assert_eq!(store.get(row.id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn overlapping_poll_is_skipped() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        let worker = worker(store, publisher, OutboxWorkerConfig::for_service("svc"));

        let _guard = worker.inner.in_flight.try_lock().unwrap();
        let report = worker.poll_once().await.unwrap();

        assert!(report.skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_polls_immediately_and_on_interval_until_stopped() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new("relay"));
        seed(&store, "svc", "first").await;
        let worker = worker(
            store.clone(),
            publisher.clone(),
            OutboxWorkerConfig::for_service("svc").with_poll_interval(Duration::from_secs(5)),
        );

        worker.start();
        worker.start();
        assert!(worker.is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(publisher.published().len(), 1);

        seed(&store, "svc", "second").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(publisher.published().len(), 2);

        worker.stop();
        assert!(!worker.is_running());
        seed(&store, "svc", "third").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(publisher.published().len(), 2);

        worker.shutdown().await;
    }
}
