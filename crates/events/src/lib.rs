//! Domain events as they travel over the broker, and the publishing contract
//! business services depend on.

pub mod envelope;
pub mod in_memory;
pub mod publisher;

pub use envelope::DomainEvent;
pub use in_memory::RecordingPublisher;
pub use publisher::{EventPublisher, PublishError};
