//! Transactional outbox: durable event intents and the worker that delivers them.
//!
//! ## Flow
//!
//! ```text
//! business write ─┬─> OutboxProducer ──> outbox_events (pending)
//!                 │                             │
//!                 └── same transaction          │ OutboxWorker (poll)
//!                                               v
//!                                        EventPublisher ──> broker
//! ```
//!
//! ## Guarantees
//!
//! - A row is only delivered by the worker of its own `source_service`
//! - `published` and `failed` are terminal; only `pending` rows are ever updated
//! - Delivery is at-least-once: a row whose status update fails is sent again

pub mod in_memory;
pub mod postgres;
pub mod producer;
pub mod record;
pub mod store;
pub mod worker;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use producer::OutboxProducer;
pub use record::{NewOutboxEvent, OutboxEventRow, OutboxStatus};
pub use store::{OutboxStore, OutboxStoreError};
pub use worker::{OutboxWorker, PollReport};
