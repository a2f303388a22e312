//! Direct-to-broker event publisher that keeps its own connection alive.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hireflow_events::{DomainEvent, EventPublisher, PublishError};

use super::state::{ConnectionState, reconnect_delay};
use crate::broker::{BrokerChannel, BrokerConnector, BrokerError, BrokerSession, MessageProperties};
use crate::config::PublisherConfig;

/// Publishes [`DomainEvent`]s to the `<app>-events` topic exchange.
///
/// - One connection and channel, owned exclusively
/// - Lost connections are re-established with capped exponential backoff
/// - `publish` while disconnected makes one synchronous reconnect attempt; if that does
///   not help the event is dropped and [`PublishError::NotConnected`] is returned
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ResilientPublisher {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    config: PublisherConfig,
    exchange: String,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    channel: Option<Arc<dyn BrokerChannel>>,
    /// Bumped on every transition that invalidates scheduled work or session watchers.
    generation: u64,
    /// Consecutive failed connect attempts since the last success.
    failures: u32,
    watcher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ResilientPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientPublisher")
            .field("exchange", &self.inner.exchange)
            .field("state", &self.state())
            .finish()
    }
}

impl ResilientPublisher {
    pub fn new<C>(connector: C, config: PublisherConfig) -> Self
    where
        C: BrokerConnector + 'static,
    {
        let exchange = config.exchange();
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                config,
                exchange,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    channel: None,
                    generation: 0,
                    failures: 0,
                    watcher: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    pub fn is_connected(&self) -> bool {
        self.current_channel().is_some()
    }

    fn current_channel(&self) -> Option<(Arc<dyn BrokerChannel>, u64)> {
        let shared = self.lock();
        match (&shared.state, &shared.channel) {
            (ConnectionState::Connected, Some(channel)) if channel.is_open() => {
                Some((Arc::clone(channel), shared.generation))
            }
            _ => None,
        }
    }

    /// Open a session and declare the events exchange.
    ///
    /// Allowed from any state without a connect or close in flight, including `Closed`.
    /// A failure is returned and also schedules a background retry.
    pub async fn connect(&self) -> Result<(), PublishError> {
        let generation = {
            let mut shared = self.lock();
            match shared.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Closing => {
                    return Err(PublishError::NotConnected);
                }
                _ => {}
            }
            shared.generation += 1;
            shared.state = ConnectionState::Connecting;
            shared.generation
        };
        self.attempt_connect(generation).await
    }

    /// Connect unless already connected, connecting, or closed.
    pub async fn ensure_connection(&self) -> Result<(), PublishError> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(PublishError::NotConnected),
            _ => self.connect().await,
        }
    }

    async fn open_session(&self) -> Result<BrokerSession, BrokerError> {
        let session = self.inner.connector.connect().await?;
        if let Err(e) = session
            .channel
            .declare_exchange(&self.inner.exchange, true)
            .await
        {
            let _ = session.channel.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn attempt_connect(&self, generation: u64) -> Result<(), PublishError> {
        match self.open_session().await {
            Ok(session) => self.install(generation, session).await,
            Err(e) => {
                warn!(exchange = %self.inner.exchange, error = %e, "publisher connect failed");
                let mut shared = self.lock();
                if shared.generation == generation && shared.state == ConnectionState::Connecting {
                    shared.failures += 1;
                    self.schedule_reconnect(&mut shared);
                }
                Err(PublishError::Broker(e.to_string()))
            }
        }
    }

    async fn install(&self, generation: u64, session: BrokerSession) -> Result<(), PublishError> {
        let BrokerSession { channel, mut events } = session;
        {
            let mut shared = self.lock();
            if shared.generation == generation && shared.state == ConnectionState::Connecting {
                shared.state = ConnectionState::Connected;
                shared.channel = Some(Arc::clone(&channel));
                shared.failures = 0;

                let weak = Arc::downgrade(&self.inner);
                let watcher = tokio::spawn(async move {
                    if let Some(reason) = events.lost().await {
                        if let Some(publisher) = upgrade(&weak) {
                            publisher.connection_lost(generation, &reason);
                        }
                    }
                });
                if let Some(previous) = shared.watcher.replace(watcher) {
                    previous.abort();
                }

                info!(exchange = %self.inner.exchange, "publisher connected");
                return Ok(());
            }
        }

        // Closed (or superseded) while the connect was in flight.
        debug!("discarding session opened during shutdown");
        let _ = channel.close().await;
        Err(PublishError::NotConnected)
    }

    fn connection_lost(&self, generation: u64, reason: &str) {
        let mut shared = self.lock();
        if shared.generation != generation || shared.state != ConnectionState::Connected {
            return;
        }
        warn!(exchange = %self.inner.exchange, reason = %reason, "publisher connection lost");
        shared.channel = None;
        self.schedule_reconnect(&mut shared);
    }

    /// Enter `Reconnecting{n}` and arm the timer, or give up. Caller holds the lock.
    fn schedule_reconnect(&self, shared: &mut Shared) {
        let attempt = shared.failures + 1;
        shared.generation += 1;

        if attempt > self.inner.config.max_reconnect_attempts {
            shared.state = ConnectionState::Exhausted {
                attempts: shared.failures,
            };
            error!(
                exchange = %self.inner.exchange,
                attempts = shared.failures,
                "publisher gave up reconnecting; events will be dropped until a manual reconnect"
            );
            return;
        }

        shared.state = ConnectionState::Reconnecting { attempt };
        let delay = reconnect_delay(
            attempt,
            self.inner.config.base_reconnect_delay,
            self.inner.config.max_reconnect_delay,
        );
        info!(attempt, delay_ms = delay.as_millis() as u64, "publisher reconnect scheduled");

        let weak = Arc::downgrade(&self.inner);
        let generation = shared.generation;
        tokio::spawn(reconnect_after(weak, generation, attempt, delay));
    }

    /// Wrap and publish one event, routing key = `event_type`.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: JsonValue,
        source_service: Option<&str>,
    ) -> Result<(), PublishError> {
        let (channel, generation) = match self.current_channel() {
            Some(current) => current,
            None => {
                let state = self.state();
                error!(critical = true, event_type, %state, "publish attempted while not connected");
                if state.can_connect() {
                    let _ = self.connect().await;
                }
                match self.current_channel() {
                    Some(current) => current,
                    None => {
                        error!(critical = true, event_type, "event dropped: publisher is not connected");
                        return Err(PublishError::NotConnected);
                    }
                }
            }
        };

        let source = source_service.unwrap_or(&self.inner.config.source_service);
        let event = DomainEvent::new(event_type, source, payload);
        let body = event
            .to_bytes()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        let properties = MessageProperties::persistent().with_message_id(event.event_id().to_string());

        match channel
            .publish(&self.inner.exchange, event_type, &body, &properties)
            .await
        {
            Ok(()) => {
                debug!(event_id = %event.event_id(), event_type, source_service = source, "event published");
                Ok(())
            }
            Err(e) => {
                error!(event_type, error = %e, "event publish failed");
                if !channel.is_open() {
                    self.connection_lost(generation, &e.to_string());
                }
                Err(PublishError::Broker(e.to_string()))
            }
        }
    }

    /// Close the session and stop reconnecting.
    pub async fn close(&self) -> Result<(), PublishError> {
        let channel = {
            let mut shared = self.lock();
            shared.state = ConnectionState::Closing;
            shared.generation += 1;
            if let Some(watcher) = shared.watcher.take() {
                watcher.abort();
            }
            shared.channel.take()
        };

        let result = match channel {
            Some(channel) => channel
                .close()
                .await
                .map_err(|e| PublishError::Broker(e.to_string())),
            None => Ok(()),
        };

        self.lock().state = ConnectionState::Closed;
        info!(exchange = %self.inner.exchange, "publisher closed");
        result
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<ResilientPublisher> {
    weak.upgrade().map(|inner| ResilientPublisher { inner })
}

async fn reconnect_after(weak: Weak<Inner>, scheduled: u64, attempt: u32, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(publisher) = upgrade(&weak) else {
        return;
    };

    let generation = {
        let mut shared = publisher.lock();
        if shared.generation != scheduled
            || shared.state != (ConnectionState::Reconnecting { attempt })
        {
            return;
        }
        shared.generation += 1;
        shared.state = ConnectionState::Connecting;
        shared.generation
    };

    info!(attempt, "publisher reconnecting");
    let _ = publisher.attempt_connect(generation).await;
}

#[async_trait]
impl EventPublisher for ResilientPublisher {
    async fn publish(
        &self,
        event_type: &str,
        payload: JsonValue,
        source_service: Option<&str>,
    ) -> Result<(), PublishError> {
        ResilientPublisher::publish(self, event_type, payload, source_service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, QueueOptions};
    use serde_json::json;

    fn config() -> PublisherConfig {
        PublisherConfig::default()
            .with_app_name("test")
            .with_source_service("applications")
    }

    /// Bind a catch-all queue to the events exchange.
    async fn tap(broker: &InMemoryBroker) {
        let ch = broker.connect().await.unwrap().channel;
        ch.declare_exchange("test-events", true).await.unwrap();
        ch.declare_queue("tap", &QueueOptions::durable()).await.unwrap();
        ch.bind_queue("tap", "test-events", "#").await.unwrap();
    }

    fn tapped(broker: &InMemoryBroker) -> Vec<DomainEvent> {
        broker
            .ready_messages("tap")
            .iter()
            .map(|body| DomainEvent::from_slice(body).unwrap())
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn connect_declares_exchange_and_publish_wraps_envelope() {
        let broker = InMemoryBroker::new();
        tap(&broker).await;
        let publisher = ResilientPublisher::new(broker.clone(), config());

        publisher.connect().await.unwrap();
        assert!(publisher.is_connected());

        publisher
            .publish("application.created", json!({"application_id": "a-1"}), None)
            .await
            .unwrap();
        publisher
            .publish("payout.processed", json!({"amount": 5}), Some("payments"))
            .await
            .unwrap();

        let events = tapped(&broker);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "application.created");
        assert_eq!(events[0].source_service(), "applications");
        assert_eq!(events[1].source_service(), "payments");
        assert_ne!(events[0].event_id(), events[1].event_id());
    }

    #[tokio::test]
    async fn publish_while_disconnected_reconnects_once_synchronously() {
        let broker = InMemoryBroker::new();
        tap(&broker).await;
        let publisher = ResilientPublisher::new(broker.clone(), config());

        publisher
            .publish("interview.scheduled", json!({}), None)
            .await
            .unwrap();

        assert_eq!(publisher.state(), ConnectionState::Connected);
        assert_eq!(tapped(&broker).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_with_unreachable_broker_drops_event() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let publisher = ResilientPublisher::new(broker.clone(), config());

        let err = publisher
            .publish("application.created", json!({}), None)
            .await
            .unwrap_err();

        assert_eq!(err, PublishError::NotConnected);
        assert_eq!(publisher.state(), ConnectionState::Reconnecting { attempt: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_backs_off_then_gives_up() {
        let broker = InMemoryBroker::new();
        let publisher = ResilientPublisher::new(broker.clone(), config());
        publisher.connect().await.unwrap();

        broker.set_reachable(false);
        broker.sever_connections("network partition");
        settle().await;
        assert_eq!(publisher.state(), ConnectionState::Reconnecting { attempt: 1 });

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(publisher.state(), ConnectionState::Reconnecting { attempt: 2 });

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(publisher.state(), ConnectionState::Reconnecting { attempt: 3 });

        // Attempts 3..=9 wait 4 + 8 + 16 + 30 * 4 seconds.
        tokio::time::sleep(Duration::from_secs(4 + 8 + 16 + 30 * 4)).await;
        assert_eq!(publisher.state(), ConnectionState::Reconnecting { attempt: 10 });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(publisher.state(), ConnectionState::Exhausted { attempts: 10 });

        // Nothing else is scheduled.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(publisher.state(), ConnectionState::Exhausted { attempts: 10 });
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_succeeds_and_resets_attempts() {
        let broker = InMemoryBroker::new();
        tap(&broker).await;
        let publisher = ResilientPublisher::new(broker.clone(), config());
        publisher.connect().await.unwrap();

        broker.set_reachable(false);
        broker.sever_connections("broker restart");
        settle().await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(publisher.state(), ConnectionState::Reconnecting { attempt: 2 });

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(publisher.state(), ConnectionState::Connected);

        // A fresh loss starts again from attempt 1.
        broker.sever_connections("again");
        settle().await;
        assert_eq!(publisher.state(), ConnectionState::Reconnecting { attempt: 1 });
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(publisher.is_connected());

        publisher.publish("job.posted", json!({}), None).await.unwrap();
        assert_eq!(tapped(&broker).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_publisher_recovers_on_publish() {
        let broker = InMemoryBroker::new();
        let publisher = ResilientPublisher::new(
            broker.clone(),
            config().with_max_reconnect_attempts(1),
        );
        publisher.connect().await.unwrap();

        broker.set_reachable(false);
        broker.sever_connections("down");
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(publisher.state(), ConnectionState::Exhausted { attempts: 1 });

        broker.set_reachable(true);
        publisher.publish("job.posted", json!({}), None).await.unwrap();
        assert!(publisher.is_connected());
    }

    #[tokio::test]
    async fn publish_failure_on_open_channel_propagates() {
        let broker = InMemoryBroker::new();
        let publisher = ResilientPublisher::new(broker.clone(), config());
        publisher.connect().await.unwrap();

        broker.fail_publishes(true);
        let err = publisher.publish("x", json!({}), None).await.unwrap_err();

        assert!(matches!(err, PublishError::Broker(_)));
        assert_eq!(publisher.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_suppresses_reconnection() {
        let broker = InMemoryBroker::new();
        let publisher = ResilientPublisher::new(broker.clone(), config());
        publisher.connect().await.unwrap();

        publisher.close().await.unwrap();
        assert_eq!(publisher.state(), ConnectionState::Closed);
        assert_eq!(broker.open_channels(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(publisher.state(), ConnectionState::Closed);

        let err = publisher.publish("x", json!({}), None).await.unwrap_err();
        assert_eq!(err, PublishError::NotConnected);
        assert_eq!(publisher.state(), ConnectionState::Closed);
        assert!(publisher.ensure_connection().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_dropped_while_down_succeeds_after_connect() {
        let broker = InMemoryBroker::new();
        tap(&broker).await;
        broker.set_reachable(false);
        let publisher = ResilientPublisher::new(broker.clone(), config());

        let dropped = publisher
            .publish("offer.accepted", json!({"offerId": 3}), None)
            .await;
        assert_eq!(dropped, Err(PublishError::NotConnected));
        assert!(!publisher.is_connected());

        broker.set_reachable(true);
        publisher.connect().await.unwrap();
        assert!(publisher.is_connected());

        publisher
            .publish("offer.accepted", json!({"offerId": 3}), None)
            .await
            .unwrap();
        let events = tapped(&broker);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload(), &json!({"offerId": 3}));
    }

    #[tokio::test]
    async fn ensure_connection_is_idempotent() {
        let broker = InMemoryBroker::new();
        let publisher = ResilientPublisher::new(broker.clone(), config());

        publisher.ensure_connection().await.unwrap();
        publisher.ensure_connection().await.unwrap();

        assert!(publisher.is_connected());
        assert_eq!(broker.open_channels(), 1);
    }
}
