use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;

use hireflow_events::{DomainEvent, RecordingPublisher};
use hireflow_infra::broker::{
    BrokerChannel, BrokerConnector, InMemoryBroker, MessageProperties, QueueOptions, topic_matches,
};
use hireflow_infra::config::OutboxWorkerConfig;
use hireflow_infra::jobs::JobMessage;
use hireflow_infra::outbox::{InMemoryOutboxStore, NewOutboxEvent, OutboxStore, OutboxWorker};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matching");

    let cases = [
        ("exact", "matching.rescore", "matching.rescore"),
        ("star", "matching.*", "matching.rescore"),
        ("hash_tail", "matching.#", "matching.rescore.candidates.batch"),
        ("hash_middle", "#.batch", "matching.rescore.candidates.batch"),
        ("miss", "payments.#", "matching.rescore.candidates.batch"),
    ];
    for (name, pattern, key) in cases {
        group.bench_function(name, |b| {
            b.iter(|| topic_matches(black_box(pattern), black_box(key)));
        });
    }

    group.finish();
}

fn bench_wire_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_encoding");
    let payload = json!({
        "applicationId": "8c1f3b9e",
        "jobPostId": 42,
        "candidate": {"name": "Sam", "skills": ["rust", "sql", "k8s"]},
    });

    group.bench_function("domain_event_to_bytes", |b| {
        let event = DomainEvent::new("application.created", "applications", payload.clone());
        b.iter(|| black_box(&event).to_bytes().unwrap());
    });

    group.bench_function("domain_event_from_slice", |b| {
        let bytes = DomainEvent::new("application.created", "applications", payload.clone())
            .to_bytes()
            .unwrap();
        b.iter(|| DomainEvent::<serde_json::Value>::from_slice(black_box(&bytes)).unwrap());
    });

    group.bench_function("job_message_to_vec", |b| {
        let job = JobMessage::new("rescore-candidates", payload.clone());
        b.iter(|| serde_json::to_vec(black_box(&job)).unwrap());
    });

    group.finish();
}

fn bench_broker_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_broker_publish");
    let rt = runtime();

    for bindings in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(bindings), &bindings, |b, &bindings| {
            let broker = InMemoryBroker::new();
            let channel = rt.block_on(async {
                let channel = broker.connect().await.unwrap().channel;
                channel.declare_exchange("bench-jobs", true).await.unwrap();
                for i in 0..bindings {
                    let queue = format!("queue-{i}");
                    channel
                        .declare_queue(&queue, &QueueOptions::transient())
                        .await
                        .unwrap();
                    channel
                        .bind_queue(&queue, "bench-jobs", &format!("queue-{i}.#"))
                        .await
                        .unwrap();
                }
                channel
            });
            let properties = MessageProperties::persistent();
            let body = br#"{"id":"x"}"#;

            b.iter(|| {
                rt.block_on(channel.publish("bench-jobs", "queue-0.rescore", body, &properties))
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_outbox_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("outbox_poll");
    let rt = runtime();

    for batch in [10usize, 50] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let store = Arc::new(InMemoryOutboxStore::new());
                    rt.block_on(async {
                        for i in 0..batch {
                            store
                                .insert(NewOutboxEvent::new("job.posted", json!({"n": i}), "bench"))
                                .await
                                .unwrap();
                        }
                    });
                    OutboxWorker::new(
                        store,
                        Arc::new(RecordingPublisher::new("bench")),
                        OutboxWorkerConfig::for_service("bench").with_batch_size(batch),
                    )
                },
                |worker| rt.block_on(worker.poll_once()).unwrap(),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_topic_matching,
    bench_wire_encoding,
    bench_broker_publish,
    bench_outbox_poll
);
criterion_main!(benches);
