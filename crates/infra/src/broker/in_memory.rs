//! In-memory AMQP-style broker for tests/dev.
//!
//! Models the parts of RabbitMQ the delivery layer depends on:
//!
//! - topic exchanges plus the default exchange (routing by queue name)
//! - `x-message-ttl`: ready messages are dead-lettered when their TTL elapses
//! - `x-dead-letter-exchange` / `x-dead-letter-routing-key` on `nack(requeue=false)` and expiry
//! - `x-expires`: a queue unused for the given time is deleted, messages included
//! - per-consumer prefetch, round-robin between consumers of the same queue
//! - `nack(requeue=true)` and channel close return messages to the head of their queue
//!
//! Timers run on the tokio clock, so tests can drive them with `tokio::time::pause`.
//! Messages that cannot be routed are dropped, as with a real broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    BrokerChannel, BrokerConnector, BrokerError, BrokerSession, ConnectionEvents, DEFAULT_EXCHANGE,
    Deliveries, Delivery, MessageProperties, QueueOptions, topic_matches,
};

/// Shared, cloneable handle to one in-memory broker instance.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    fail_publishes: bool,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    channels: HashMap<u64, ChannelState>,
    next_delivery_tag: u64,
    next_channel_id: u64,
    next_message_id: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            fail_publishes: false,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            unacked: HashMap::new(),
            channels: HashMap::new(),
            next_delivery_tag: 1,
            next_channel_id: 1,
            next_message_id: 1,
        }
    }
}

#[derive(Debug)]
struct ExchangeState {
    durable: bool,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
    last_used: Instant,
}

#[derive(Debug)]
struct ConsumerState {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    consumer_tag: Option<String>,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct ChannelState {
    open: bool,
    prefetch: u16,
    lost_tx: mpsc::UnboundedSender<String>,
}

/// Deferred work produced while the state lock is held.
#[derive(Debug)]
enum Timer {
    MessageTtl { queue: String, message_id: u64, ttl: Duration },
    QueueExpiry { queue: String, after: Duration },
}

impl BrokerState {
    fn ensure_open(&self, channel_id: u64) -> Result<(), BrokerError> {
        match self.channels.get(&channel_id) {
            Some(ch) if ch.open => Ok(()),
            _ => Err(BrokerError::Channel("channel closed".to_string())),
        }
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        timers: &mut Vec<Timer>,
    ) -> Result<(), BrokerError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let ex = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::Topology(format!("no exchange '{exchange}'")))?;
            let mut targets: Vec<String> = Vec::new();
            for (queue, key) in &ex.bindings {
                if topic_matches(key, routing_key) && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "unroutable message dropped");
        }

        for queue in targets {
            self.enqueue(&queue, routing_key, body.to_vec(), timers);
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, routing_key: &str, body: Vec<u8>, timers: &mut Vec<Timer>) {
        let id = self.next_message_id;
        self.next_message_id += 1;

        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        q.ready.push_back(StoredMessage {
            id,
            routing_key: routing_key.to_string(),
            body,
            redelivered: false,
        });
        if let Some(ttl) = q.options.message_ttl {
            timers.push(Timer::MessageTtl {
                queue: queue.to_string(),
                message_id: id,
                ttl,
            });
        }
    }

    fn dead_letter(&mut self, queue: &str, message: StoredMessage, timers: &mut Vec<Timer>) {
        let Some(options) = self.queues.get(queue).map(|q| q.options.clone()) else {
            return;
        };
        let Some(dlx) = options.dead_letter_exchange else {
            debug!(queue = %queue, "message discarded (no dead-letter exchange)");
            return;
        };
        let routing_key = options
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        if let Err(e) = self.route(&dlx, &routing_key, &message.body, timers) {
            warn!(queue = %queue, error = %e, "dead-lettering failed; message discarded");
        }
    }

    fn requeue_front(&mut self, queue: &str, mut message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            message.redelivered = true;
            q.ready.push_front(message);
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues,
            unacked,
            next_delivery_tag,
            ..
        } = self;

        loop {
            let Some(queue) = queues.get_mut(name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let n = queue.consumers.len();
            let chosen = (0..n).map(|offset| (queue.cursor + offset) % n).find(|&idx| {
                let c = &queue.consumers[idx];
                let in_flight = unacked
                    .values()
                    .filter(|u| u.channel_id == c.channel_id && u.consumer_tag.as_deref() == Some(c.tag.as_str()))
                    .count();
                c.prefetch == 0 || in_flight < c.prefetch as usize
            });
            let Some(idx) = chosen else {
                return;
            };
            queue.cursor = (idx + 1) % n;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            let tag = *next_delivery_tag;
            *next_delivery_tag += 1;

            let consumer = &queue.consumers[idx];
            let delivery = Delivery {
                delivery_tag: tag,
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };
            if consumer.tx.send(delivery).is_err() {
                queue.consumers.remove(idx);
                queue.cursor = 0;
                queue.ready.push_front(message);
                continue;
            }

            unacked.insert(
                tag,
                Unacked {
                    channel_id: consumer.channel_id,
                    consumer_tag: Some(consumer.tag.clone()),
                    queue: name.to_string(),
                    message,
                },
            );
        }
    }

    fn take_unacked(&mut self, channel_id: u64, delivery_tag: u64) -> Result<Unacked, BrokerError> {
        match self.unacked.get(&delivery_tag) {
            Some(u) if u.channel_id == channel_id => {}
            _ => {
                return Err(BrokerError::Channel(format!(
                    "unknown delivery tag {delivery_tag}"
                )));
            }
        }
        self.unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {delivery_tag}")))
    }

    fn close_channel(&mut self, channel_id: u64, reason: Option<&str>) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        if let Some(reason) = reason {
            let _ = channel.lost_tx.send(reason.to_string());
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
            queue.cursor = 0;
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                self.requeue_front(&u.queue, u.message);
            }
        }

        self.dispatch_all();
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule(&self, timers: Vec<Timer>) {
        for timer in timers {
            let broker = self.clone();
            match timer {
                Timer::MessageTtl {
                    queue,
                    message_id,
                    ttl,
                } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(ttl).await;
                        broker.expire_message(&queue, message_id);
                    });
                }
                Timer::QueueExpiry { queue, after } => {
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        broker.expire_queue(&queue);
                    });
                }
            }
        }
    }

    fn expire_message(&self, queue: &str, message_id: u64) {
        let mut timers = Vec::new();
        {
            let mut state = self.lock();
            let message = state.queues.get_mut(queue).and_then(|q| {
                let pos = q.ready.iter().position(|m| m.id == message_id)?;
                q.ready.remove(pos)
            });
            if let Some(message) = message {
                debug!(queue = %queue, "message TTL elapsed; dead-lettering");
                state.dead_letter(queue, message, &mut timers);
                state.dispatch_all();
            }
        }
        self.schedule(timers);
    }

    fn expire_queue(&self, queue: &str) {
        let mut state = self.lock();
        let expired = match state.queues.get(queue) {
            Some(q) => match q.options.expires {
                Some(expires) => q.consumers.is_empty() && q.last_used + expires <= Instant::now(),
                None => false,
            },
            None => false,
        };
        if expired {
            debug!(queue = %queue, "queue unused past x-expires; deleting");
            state.queues.remove(queue);
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|(q, _)| q != queue);
            }
        }
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Drop every open connection as a network failure would.
    ///
    /// Sessions receive a connection event; unacked deliveries are requeued.
    pub fn sever_connections(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.close_channel(id, Some(reason));
        }
    }

    /// Make publishes on open channels fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ready (not yet delivered) messages in a queue.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Bodies of the ready messages in a queue, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|c| c.open).count()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<BrokerSession, BrokerError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let id = state.next_channel_id;
        state.next_channel_id += 1;
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                prefetch: 0,
                lost_tx,
            },
        );

        Ok(BrokerSession {
            channel: Arc::new(InMemoryChannel {
                id,
                broker: self.clone(),
            }),
            events: ConnectionEvents::new(lost_rx),
        })
    }
}

/// Channel handle returned by [`InMemoryBroker::connect`].
#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        match state.exchanges.get(name) {
            Some(ex) if ex.durable != durable => Err(BrokerError::Topology(format!(
                "PRECONDITION_FAILED: inequivalent durable flag for exchange '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError> {
        let mut timers = Vec::new();
        {
            let mut state = self.broker.lock();
            state.ensure_open(self.id)?;
            match state.queues.get_mut(name) {
                Some(q) if q.options != *options => {
                    return Err(BrokerError::Topology(format!(
                        "PRECONDITION_FAILED: inequivalent arguments for queue '{name}'"
                    )));
                }
                Some(q) => q.last_used = Instant::now(),
                None => {
                    state.queues.insert(
                        name.to_string(),
                        QueueState {
                            options: options.clone(),
                            ready: VecDeque::new(),
                            consumers: Vec::new(),
                            cursor: 0,
                            last_used: Instant::now(),
                        },
                    );
                }
            }
            if let Some(after) = options.expires {
                timers.push(Timer::QueueExpiry {
                    queue: name.to_string(),
                    after,
                });
            }
        }
        self.broker.schedule(timers);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Topology(format!("no queue '{queue}'")));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Topology(format!("no exchange '{exchange}'")))?;
        let binding = (queue.to_string(), binding_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let mut timers = Vec::new();
        {
            let mut state = self.broker.lock();
            state.ensure_open(self.id)?;
            if state.fail_publishes {
                return Err(BrokerError::Publish("simulated publish failure".to_string()));
            }
            state.route(exchange, routing_key, body, &mut timers)?;
            state.dispatch_all();
        }
        self.broker.schedule(timers);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if let Some(ch) = state.channels.get_mut(&self.id) {
            ch.prefetch = count;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        let prefetch = state.channels.get(&self.id).map_or(0, |ch| ch.prefetch);
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Topology(format!("no queue '{queue}'")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerState {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            prefetch,
            tx,
        });
        q.last_used = Instant::now();
        state.dispatch(queue);
        Ok(Deliveries::new(rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        for q in state.queues.values_mut() {
            q.consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
            q.cursor = 0;
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Topology(format!("no queue '{queue}'")))?;
        q.last_used = Instant::now();
        let Some(message) = q.ready.pop_front() else {
            return Ok(None);
        };

        let tag = state.next_delivery_tag;
        state.next_delivery_tag += 1;
        let delivery = Delivery {
            delivery_tag: tag,
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(
            tag,
            Unacked {
                channel_id: self.id,
                consumer_tag: None,
                queue: queue.to_string(),
                message,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        state.take_unacked(self.id, delivery_tag)?;
        state.dispatch_all();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut timers = Vec::new();
        {
            let mut state = self.broker.lock();
            state.ensure_open(self.id)?;
            let unacked = state.take_unacked(self.id, delivery_tag)?;
            if requeue {
                state.requeue_front(&unacked.queue, unacked.message);
            } else {
                state.dead_letter(&unacked.queue, unacked.message, &mut timers);
            }
            state.dispatch_all();
        }
        self.broker.schedule(timers);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.lock().ensure_open(self.id).is_ok()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.lock().close_channel(self.id, None);
        Ok(())
    }
}
