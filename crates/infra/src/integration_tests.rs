//! Integration tests for the delivery pipelines.
//!
//! Tests: OutboxProducer → outbox store → OutboxWorker → ResilientPublisher → broker,
//! and the job queue's retry / dead-letter / replay cycle on the in-memory broker.
//!
//! Verifies:
//! - Events stored while the broker is down are delivered once it is back
//! - Workers of different services never deliver each other's rows
//! - Jobs are attempted `max_retries` times, then parked in the DLQ and replayable

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::{Value as JsonValue, json};

    use hireflow_events::{DomainEvent, EventPublisher};

    use crate::broker::{BrokerConnector, InMemoryBroker, MessageProperties, QueueOptions};
    use crate::config::{JobQueueConfig, OutboxWorkerConfig, PublisherConfig};
    use crate::jobs::{JobId, JobMessage, JobOptions, JobQueue, JobQueueError, JobResult, WorkerOptions};
    use crate::outbox::{InMemoryOutboxStore, OutboxProducer, OutboxStatus, OutboxWorker};
    use crate::publisher::ResilientPublisher;

    async fn tap_events(broker: &InMemoryBroker) {
        let channel = broker.connect().await.unwrap().channel;
        channel.declare_exchange("hireflow-events", true).await.unwrap();
        channel.declare_queue("tap", &QueueOptions::durable()).await.unwrap();
        channel.bind_queue("tap", "hireflow-events", "#").await.unwrap();
    }

    fn tapped(broker: &InMemoryBroker) -> Vec<DomainEvent> {
        broker
            .ready_messages("tap")
            .iter()
            .map(|body| DomainEvent::from_slice(body).unwrap())
            .collect()
    }

    fn relay(
        broker: &InMemoryBroker,
        store: &Arc<InMemoryOutboxStore>,
        service: &str,
    ) -> OutboxWorker<Arc<InMemoryOutboxStore>> {
        let publisher = ResilientPublisher::new(
            broker.clone(),
            PublisherConfig::default().with_source_service(service),
        );
        OutboxWorker::new(
            store.clone(),
            Arc::new(publisher),
            OutboxWorkerConfig::for_service(service),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn stored_events_reach_the_broker_after_an_outage() {
        let broker = InMemoryBroker::new();
        tap_events(&broker).await;
        broker.set_reachable(false);

        let store = Arc::new(InMemoryOutboxStore::new());
        let producer: Arc<dyn EventPublisher> =
            Arc::new(OutboxProducer::new(store.clone(), "applications"));
        producer
            .publish("application.created", json!({"applicationId": "a-7"}), None)
            .await
            .unwrap();

        let worker = relay(&broker, &store, "applications");
        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.retried, 1);
        assert!(tapped(&broker).is_empty());

        broker.set_reachable(true);
        let report = worker.poll_once().await.unwrap();
        assert_eq!(report.published, 1);

        let events = tapped(&broker);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "application.created");
        assert_eq!(events[0].source_service(), "applications");
        assert_eq!(events[0].payload(), &json!({"applicationId": "a-7"}));

        let row = &store.rows()[0];
        assert_eq!(row.status, OutboxStatus::Published);
        assert_eq!(row.attempts, 1);
        assert_ne!(events[0].event_id().to_string(), row.id.to_string());
    }

    #[tokio::test]
    async fn concurrent_workers_stay_within_their_service() {
        let broker = InMemoryBroker::new();
        tap_events(&broker).await;
        let store = Arc::new(InMemoryOutboxStore::new());

        let applications = OutboxProducer::new(store.clone(), "applications");
        let payments = OutboxProducer::new(store.clone(), "payments");
        for i in 0..10 {
            applications
                .publish("application.created", json!({"n": i}), None)
                .await
                .unwrap();
            payments
                .publish("payout.processed", json!({"n": i}), None)
                .await
                .unwrap();
        }

        let a = relay(&broker, &store, "applications");
        let b = relay(&broker, &store, "payments");
        let (ra, rb) = tokio::join!(a.poll_once(), b.poll_once());

        assert_eq!(ra.unwrap().published, 10);
        assert_eq!(rb.unwrap().published, 10);

        let events = tapped(&broker);
        assert_eq!(events.len(), 20);
        for event in &events {
            match event.source_service() {
                "applications" => assert_eq!(event.event_type(), "application.created"),
                "payments" => assert_eq!(event.event_type(), "payout.processed"),
                other => panic!("unexpected source service {other}"),
            }
        }
        assert!(store.rows().iter().all(|r| r.status == OutboxStatus::Published));
    }

    fn job_config() -> JobQueueConfig {
        JobQueueConfig::default()
            .with_app_name("hireflow")
            .with_queue_name("matching")
            .with_max_retries(3)
            .with_retry_delay(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_job_is_tried_max_retries_times_then_dead_lettered() {
        let broker = InMemoryBroker::new();
        let queue = JobQueue::new(broker.clone(), &job_config());
        queue.connect().await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let failing = move |_job: JobMessage<JsonValue>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                JobResult::Failure("candidate index unavailable".to_string())
            }
        };
        queue.start_worker(failing, WorkerOptions::default()).await.unwrap();

        let id = queue
            .add_job("rescore-candidates", json!({"jobPostId": 42}), JobOptions::default())
            .await
            .unwrap();

        // Retries after 100ms then 200ms.
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.ready_count("matching"), 0);
        assert_eq!(broker.unacked_count(), 0);

        let failed: Vec<JobMessage<JsonValue>> = queue.get_failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].attempts, 3);

        // Nothing else is delivered later.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    async fn dead_letter(broker: &InMemoryBroker, job: &JobMessage<JsonValue>) {
        let channel = broker.connect().await.unwrap().channel;
        channel
            .publish(
                "hireflow-jobs-dlx",
                "matching",
                &serde_json::to_vec(job).unwrap(),
                &MessageProperties::persistent(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retrying_a_job_that_is_not_at_the_dlq_head_changes_nothing() {
        let broker = InMemoryBroker::new();
        let queue = JobQueue::new(broker.clone(), &job_config());
        queue.connect().await.unwrap();

        let mut head = JobMessage::new("send-digest", json!({}));
        head.attempts = 3;
        dead_letter(&broker, &head).await;
        let before = broker.ready_messages("matching.dlq");

        let missing = JobId::from("job-42");
        let result = queue.retry_failed_job(&missing).await;

        assert!(matches!(result, Err(JobQueueError::NotFound(id)) if id == missing));
        assert_eq!(broker.ready_messages("matching.dlq"), before);
        assert_eq!(broker.ready_count("matching"), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn retrying_the_dlq_head_requeues_it_with_a_fresh_budget() {
        let broker = InMemoryBroker::new();
        let queue = JobQueue::new(broker.clone(), &job_config());
        queue.connect().await.unwrap();

        let mut head = JobMessage::new("send-digest", json!({"userId": 5}));
        head.attempts = 3;
        dead_letter(&broker, &head).await;

        queue.retry_failed_job(&head.id).await.unwrap();

        assert_eq!(broker.ready_count("matching.dlq"), 0);
        let live = broker.ready_messages("matching");
        assert_eq!(live.len(), 1);
        let requeued: JobMessage<JsonValue> = serde_json::from_slice(&live[0]).unwrap();
        assert_eq!(requeued.id, head.id);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.data, json!({"userId": 5}));
    }
}
