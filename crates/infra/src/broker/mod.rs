//! AMQP-style broker boundary.
//!
//! The delivery components talk to the broker only through [`BrokerConnector`] and
//! [`BrokerChannel`]. The surface is the small subset of AMQP 0-9-1 they need:
//! durable topic exchanges, queues with TTL / expiry / dead-letter arguments,
//! bindings, persistent publish, prefetch-bounded consumers, `basic.get`, ack and nack.
//!
//! ## Implementations
//!
//! - [`InMemoryBroker`]: process-local broker for tests/dev. Implements the routing,
//!   TTL dead-lettering and redelivery rules the job queue relies on, and can be made
//!   unreachable or have its connections severed on demand.
//! - `AmqpConnector` (feature `amqp`): RabbitMQ via `lapin`.
//!
//! ## Sessions
//!
//! Each [`BrokerConnector::connect`] call opens one connection with one channel. The
//! returned [`BrokerSession`] carries a [`ConnectionEvents`] receiver that yields once
//! per connection or channel failure. Closing a channel from the client side does not
//! produce an event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod in_memory;
pub mod topic;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use in_memory::InMemoryBroker;
pub use topic::topic_matches;

/// The nameless exchange: routes a message to the queue named by its routing key.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("broker topology error: {0}")]
    Topology(String),

    #[error("broker publish error: {0}")]
    Publish(String),
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// `x-message-ttl`: ready messages older than this are dead-lettered.
    pub message_ttl: Option<Duration>,
    /// `x-expires`: the queue is deleted after being unused for this long.
    pub expires: Option<Duration>,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`; when absent the original routing key is kept.
    pub dead_letter_routing_key: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn transient() -> Self {
        Self::default()
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }
}

/// Per-message publish properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Delivery mode 2 (survives a broker restart on durable queues).
    pub persistent: bool,
    pub priority: Option<u8>,
    pub message_id: Option<String>,
}

impl MessageProperties {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Option<u8>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// A message handed to a consumer or returned by `get`; settle it with ack/nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Push-consumer stream. Ends when the consumer is cancelled or the channel closes.
#[derive(Debug)]
pub struct Deliveries {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Deliveries {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Failure notifications for one session.
#[derive(Debug)]
pub struct ConnectionEvents {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ConnectionEvents {
    pub fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx }
    }

    /// Wait for the next failure; `None` once the session is gone for good.
    pub async fn lost(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// One connection + channel pair.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    pub events: ConnectionEvents,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<BrokerSession, BrokerError>;
}

#[async_trait]
impl<C> BrokerConnector for Arc<C>
where
    C: BrokerConnector + ?Sized,
{
    async fn connect(&self) -> Result<BrokerSession, BrokerError> {
        (**self).connect().await
    }
}

/// Channel-level operations.
///
/// A channel is not safe for interleaved use by unrelated logical flows; each
/// component owns its own session.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a topic exchange (idempotent).
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Declare a queue (idempotent; redeclaring also marks the queue as used).
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Maximum unacknowledged consumer deliveries on this channel (0 = unlimited).
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Fetch one ready message without a consumer (`basic.get`, manual ack).
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery. Without `requeue` the queue's dead-letter policy applies.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    /// Close the channel and its connection. Unacked deliveries return to their queues.
    async fn close(&self) -> Result<(), BrokerError>;
}
