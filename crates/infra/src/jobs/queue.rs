//! Broker-backed job queue with delayed retries and a dead-letter queue.
//!
//! ## Topology (per queue name `q`, app `a`)
//!
//! - `a-jobs` (topic, durable): live jobs, routing key `q`
//! - `a-jobs-dlx` (topic, durable): dead letters, routing key `q`
//! - `q` (durable, DLX = `a-jobs-dlx`) bound with `q` to `a-jobs`
//! - `q.dlq` (durable) bound with `q` to `a-jobs-dlx`
//! - `q.delay.<ms>` (transient, TTL = ms, DLX = `a-jobs`, DL key `q`): one per
//!   distinct delay, declared on demand and removed by the broker once idle
//!
//! Keys are exact so queues sharing an app exchange never see each other's jobs, even
//! when one name is a dotted prefix of another. The job name travels in the body.
//!
//! A failed job is never nacked back onto the main queue. The worker publishes an
//! updated copy (attempts + 1) through a delay queue, or straight to the DLX when the
//! retry budget is spent, and only then acks the original delivery.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::types::{JobId, JobMessage, JobOptions, JobProcessor, JobResult, RetryPolicy, WorkerOptions};
use crate::broker::{
    BrokerChannel, BrokerConnector, BrokerError, DEFAULT_EXCHANGE, Delivery, MessageProperties,
    QueueOptions,
};
use crate::config::JobQueueConfig;

/// Idle time a delay queue survives beyond twice its TTL.
const DELAY_QUEUE_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("job queue is not connected")]
    NotConnected,

    #[error("a worker is already consuming this queue")]
    AlreadyProcessing,

    #[error("job {0} is not at the head of the dead-letter queue")]
    NotFound(JobId),

    #[error("job serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<serde_json::Error> for JobQueueError {
    fn from(e: serde_json::Error) -> Self {
        JobQueueError::Serialization(e.to_string())
    }
}

/// Names of the exchanges, queues and routing keys for one job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTopology {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub queue: String,
    pub dead_letter_queue: String,
}

impl JobTopology {
    pub fn new(app_name: &str, queue_name: &str) -> Self {
        Self {
            exchange: format!("{app_name}-jobs"),
            dead_letter_exchange: format!("{app_name}-jobs-dlx"),
            queue: queue_name.to_string(),
            dead_letter_queue: format!("{queue_name}.dlq"),
        }
    }

    /// Routing and binding key on both exchanges.
    pub fn routing_key(&self) -> &str {
        &self.queue
    }

    pub fn delay_queue(&self, delay_ms: u64) -> String {
        format!("{}.delay.{delay_ms}", self.queue)
    }

    fn delay_queue_options(&self, delay_ms: u64) -> QueueOptions {
        let ttl = Duration::from_millis(delay_ms);
        QueueOptions::transient()
            .with_message_ttl(ttl)
            .with_expires(ttl.saturating_mul(2).saturating_add(DELAY_QUEUE_GRACE))
            .with_dead_letter(&self.exchange, Some(self.routing_key().to_string()))
    }
}

fn whole_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Publishes job messages onto a channel according to a [`JobTopology`].
#[derive(Clone)]
struct Dispatcher {
    channel: Arc<dyn BrokerChannel>,
    topology: Arc<JobTopology>,
}

impl Dispatcher {
    /// Publish live, or through the delay queue for `delay` (rounded down to whole ms).
    async fn enqueue<S: Serialize>(
        &self,
        message: &JobMessage<S>,
        delay: Option<Duration>,
        priority: Option<u8>,
    ) -> Result<(), JobQueueError> {
        let body = serde_json::to_vec(message)?;
        let properties = MessageProperties::persistent()
            .with_priority(priority)
            .with_message_id(message.id.as_str());

        match delay.map(whole_millis).filter(|ms| *ms > 0) {
            Some(delay_ms) => {
                let queue = self.topology.delay_queue(delay_ms);
                // Redeclared on every use so the idle timer restarts.
                self.channel
                    .declare_queue(&queue, &self.topology.delay_queue_options(delay_ms))
                    .await?;
                self.channel
                    .publish(DEFAULT_EXCHANGE, &queue, &body, &properties)
                    .await?;
            }
            None => {
                self.channel
                    .publish(
                        &self.topology.exchange,
                        self.topology.routing_key(),
                        &body,
                        &properties,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &JobMessage<JsonValue>) -> Result<(), JobQueueError> {
        let body = serde_json::to_vec(message)?;
        let properties = MessageProperties::persistent().with_message_id(message.id.as_str());
        self.channel
            .publish(
                &self.topology.dead_letter_exchange,
                self.topology.routing_key(),
                &body,
                &properties,
            )
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) {
        if let Err(e) = self.channel.ack(delivery_tag).await {
            warn!(queue = %self.topology.queue, delivery_tag, error = %e, "ack failed; job may be redelivered");
        }
    }

    /// Reject without requeue: the main queue's DLX moves the message to the DLQ.
    async fn reject(&self, delivery_tag: u64) {
        if let Err(e) = self.channel.nack(delivery_tag, false).await {
            warn!(queue = %self.topology.queue, delivery_tag, error = %e, "nack failed; job may be redelivered");
        }
    }
}

/// Consumer-side state shared by every in-flight delivery.
struct Worker<T, P> {
    dispatcher: Dispatcher,
    policy: RetryPolicy,
    processor: Arc<P>,
    _payload: PhantomData<fn() -> T>,
}

impl<T, P> Worker<T, P>
where
    T: DeserializeOwned + Send + 'static,
    P: JobProcessor<T>,
{
    async fn handle(&self, delivery: Delivery) {
        let tag = delivery.delivery_tag;

        let message: JobMessage<JsonValue> = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                error!(queue = %self.dispatcher.topology.queue, error = %e, "undecodable job message; dead-lettering");
                self.dispatcher.reject(tag).await;
                return;
            }
        };
        let data: T = match serde_json::from_value(message.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                error!(job_id = %message.id, job_name = %message.job_name, error = %e, "job payload does not match processor type; dead-lettering");
                self.dispatcher.reject(tag).await;
                return;
            }
        };

        let job = message.clone().with_data(data);
        let processor = Arc::clone(&self.processor);
        let outcome = match tokio::spawn(async move { processor.process(job).await }).await {
            Ok(result) => result,
            Err(e) => JobResult::Failure(format!("processor panicked: {e}")),
        };

        match outcome {
            JobResult::Success => {
                self.dispatcher.ack(tag).await;
                debug!(job_id = %message.id, job_name = %message.job_name, "job completed");
            }
            JobResult::Failure(reason) => self.handle_failure(message, tag, &reason).await,
        }
    }

    async fn handle_failure(&self, mut message: JobMessage<JsonValue>, tag: u64, reason: &str) {
        message.attempts += 1;

        if self.policy.should_retry(message.attempts) {
            let delay = self.policy.delay_for_attempt(message.attempts);
            message = message.delayed(delay);
            warn!(
                job_id = %message.id,
                job_name = %message.job_name,
                attempt = message.attempts,
                delay_ms = whole_millis(delay),
                error = %reason,
                "job failed; retry scheduled"
            );
            match self.dispatcher.enqueue(&message, Some(delay), None).await {
                Ok(()) => self.dispatcher.ack(tag).await,
                Err(e) => {
                    error!(job_id = %message.id, error = %e, "could not schedule retry; dead-lettering");
                    self.dispatcher.reject(tag).await;
                }
            }
            return;
        }

        error!(
            job_id = %message.id,
            job_name = %message.job_name,
            attempts = message.attempts,
            error = %reason,
            "job exhausted its retries; moving to dead-letter queue"
        );
        match self.dispatcher.dead_letter(&message).await {
            Ok(()) => self.dispatcher.ack(tag).await,
            Err(e) => {
                // The broker still dead-letters the original, with its old attempt count.
                warn!(job_id = %message.id, error = %e, "dead-letter publish failed; rejecting original");
                self.dispatcher.reject(tag).await;
            }
        }
    }
}

struct Consumer {
    tag: String,
    task: JoinHandle<()>,
}

impl Consumer {
    /// The task ends when the broker closes the delivery stream.
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// A named job queue on one broker channel.
///
/// The queue does not reconnect on its own. After a connection loss the worker stops;
/// call `connect` again and then `start_worker`.
pub struct JobQueue {
    connector: Arc<dyn BrokerConnector>,
    topology: Arc<JobTopology>,
    policy: RetryPolicy,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    consumer: Mutex<Option<Consumer>>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("topology", &self.topology)
            .field("policy", &self.policy)
            .field("processing", &self.is_processing())
            .finish()
    }
}

impl JobQueue {
    pub fn new<C>(connector: C, config: &JobQueueConfig) -> Self
    where
        C: BrokerConnector + 'static,
    {
        Self {
            connector: Arc::new(connector),
            topology: Arc::new(JobTopology::new(&config.app_name, &config.queue_name)),
            policy: RetryPolicy::new(config.max_retries, config.retry_delay),
            channel: RwLock::new(None),
            consumer: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &JobTopology {
        &self.topology
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// True while a worker consumes the queue, or while one is starting or stopping.
    pub fn is_processing(&self) -> bool {
        match self.consumer.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(Consumer::is_running),
            Err(_) => true,
        }
    }

    /// Open a session and declare the queue topology.
    ///
    /// Broker failures are returned to the caller; nothing is retried here.
    #[instrument(skip(self), fields(queue = %self.topology.queue), err)]
    pub async fn connect(&self) -> Result<(), JobQueueError> {
        let session = self.connector.connect().await?;
        let channel = session.channel;

        if let Err(e) = self.declare_topology(channel.as_ref()).await {
            let _ = channel.close().await;
            return Err(e);
        }

        let mut events = session.events;
        let queue = self.topology.queue.clone();
        tokio::spawn(async move {
            if let Some(reason) = events.lost().await {
                error!(queue = %queue, reason = %reason, "job queue connection lost");
            }
        });

        let previous = self.channel.write().await.replace(channel);
        if let Some(stale) = self.consumer.lock().await.take() {
            stale.task.abort();
        }
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }
        info!(queue = %self.topology.queue, "job queue connected");
        Ok(())
    }

    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> Result<(), JobQueueError> {
        let t = &self.topology;
        channel.declare_exchange(&t.exchange, true).await?;
        channel.declare_exchange(&t.dead_letter_exchange, true).await?;
        channel
            .declare_queue(
                &t.queue,
                &QueueOptions::durable().with_dead_letter(&t.dead_letter_exchange, None),
            )
            .await?;
        channel
            .declare_queue(&t.dead_letter_queue, &QueueOptions::durable())
            .await?;
        channel.bind_queue(&t.queue, &t.exchange, t.routing_key()).await?;
        channel
            .bind_queue(&t.dead_letter_queue, &t.dead_letter_exchange, t.routing_key())
            .await?;
        Ok(())
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, JobQueueError> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or(JobQueueError::NotConnected)
    }

    fn dispatcher(&self, channel: Arc<dyn BrokerChannel>) -> Dispatcher {
        Dispatcher {
            channel,
            topology: Arc::clone(&self.topology),
        }
    }

    /// Enqueue a job and return its id once the broker has taken it.
    pub async fn add_job<T: Serialize>(
        &self,
        job_name: &str,
        data: T,
        options: JobOptions,
    ) -> Result<JobId, JobQueueError> {
        let dispatcher = self.dispatcher(self.channel().await?);

        let mut message = JobMessage::new(job_name, data);
        if let Some(delay) = options.delay.filter(|d| whole_millis(*d) > 0) {
            message = message.delayed(delay);
        }
        dispatcher
            .enqueue(&message, options.delay, options.priority)
            .await?;

        debug!(
            job_id = %message.id,
            job_name,
            delay_ms = options.delay.map(whole_millis).unwrap_or(0),
            "job enqueued"
        );
        Ok(message.id)
    }

    /// Start consuming the main queue.
    ///
    /// Each delivery is handled on its own task; `options.concurrency` bounds how many
    /// are in flight. Only one worker per `JobQueue`.
    pub async fn start_worker<T, P>(
        &self,
        processor: P,
        options: WorkerOptions,
    ) -> Result<(), JobQueueError>
    where
        T: DeserializeOwned + Send + 'static,
        P: JobProcessor<T>,
    {
        let mut slot = self.consumer.lock().await;
        if slot.as_ref().is_some_and(Consumer::is_running) {
            return Err(JobQueueError::AlreadyProcessing);
        }
        *slot = Some(self.spawn_consumer(processor, options).await?);
        Ok(())
    }

    async fn spawn_consumer<T, P>(
        &self,
        processor: P,
        options: WorkerOptions,
    ) -> Result<Consumer, JobQueueError>
    where
        T: DeserializeOwned + Send + 'static,
        P: JobProcessor<T>,
    {
        let channel = self.channel().await?;
        let concurrency = options.concurrency.max(1);
        channel.set_prefetch(concurrency).await?;

        let tag = format!("{}.worker", self.topology.queue);
        let mut deliveries = channel.consume(&self.topology.queue, &tag).await?;

        let worker = Arc::new(Worker {
            dispatcher: self.dispatcher(channel),
            policy: self.policy,
            processor: Arc::new(processor),
            _payload: PhantomData,
        });
        let queue = self.topology.queue.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = deliveries.next().await {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move { worker.handle(delivery).await });
            }
            warn!(queue = %queue, "job consumer stream ended; worker stopped");
        });

        info!(queue = %self.topology.queue, concurrency, "job worker started");
        Ok(Consumer { tag, task })
    }

    /// Up to `limit` jobs from the DLQ, head first, without removing them.
    ///
    /// Messages that do not decode as `JobMessage<T>` are left in place and skipped.
    pub async fn get_failed_jobs<T: DeserializeOwned>(
        &self,
        limit: usize,
    ) -> Result<Vec<JobMessage<T>>, JobQueueError> {
        let channel = self.channel().await?;
        let dlq = &self.topology.dead_letter_queue;

        let mut held = Vec::new();
        let mut jobs = Vec::new();
        let mut fetch_error = None;
        while held.len() < limit {
            match channel.get(dlq).await {
                Ok(Some(delivery)) => {
                    held.push(delivery.delivery_tag);
                    match serde_json::from_slice::<JobMessage<T>>(&delivery.body) {
                        Ok(job) => jobs.push(job),
                        Err(e) => warn!(queue = %dlq, error = %e, "skipping undecodable dead letter"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    fetch_error = Some(e);
                    break;
                }
            }
        }

        // Requeue newest first so the DLQ keeps its order.
        for tag in held.into_iter().rev() {
            channel.nack(tag, true).await?;
        }
        if let Some(e) = fetch_error {
            return Err(e.into());
        }
        Ok(jobs)
    }

    /// Move the job at the head of the DLQ back onto the main queue with a fresh budget.
    ///
    /// Only the head is examined. If it is not `job_id` it stays where it was and
    /// [`JobQueueError::NotFound`] is returned.
    #[instrument(skip(self), fields(queue = %self.topology.queue), err)]
    pub async fn retry_failed_job(&self, job_id: &JobId) -> Result<(), JobQueueError> {
        let channel = self.channel().await?;
        let Some(delivery) = channel.get(&self.topology.dead_letter_queue).await? else {
            return Err(JobQueueError::NotFound(job_id.clone()));
        };
        let tag = delivery.delivery_tag;

        let mut message = match serde_json::from_slice::<JobMessage<JsonValue>>(&delivery.body) {
            Ok(message) if message.id == *job_id => message,
            _ => {
                channel.nack(tag, true).await?;
                return Err(JobQueueError::NotFound(job_id.clone()));
            }
        };
        message.attempts = 0;
        message.scheduled_for = None;

        if let Err(e) = self
            .dispatcher(Arc::clone(&channel))
            .enqueue(&message, None, None)
            .await
        {
            channel.nack(tag, true).await?;
            return Err(e);
        }
        channel.ack(tag).await?;

        info!(job_id = %message.id, job_name = %message.job_name, "dead-lettered job re-enqueued");
        Ok(())
    }

    /// Stop consuming and close the channel. In-flight jobs are not awaited; their
    /// deliveries return to the queue when the channel closes.
    pub async fn close(&self) -> Result<(), JobQueueError> {
        let channel = self.channel.write().await.take();
        let consumer = self.consumer.lock().await.take();

        if let Some(consumer) = consumer {
            if let Some(channel) = &channel {
                if let Err(e) = channel.cancel(&consumer.tag).await {
                    debug!(error = %e, "consumer cancel failed during close");
                }
            }
            consumer.task.abort();
        }

        if let Some(channel) = channel {
            channel.close().await?;
        }
        info!(queue = %self.topology.queue, "job queue closed");
        Ok(())
    }
}
