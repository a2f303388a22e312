//! Direct publishing of domain events to the broker.
//!
//! [`ResilientPublisher`] owns one broker session and keeps it alive with capped
//! exponential backoff. Its state is an explicit [`ConnectionState`].

pub mod resilient;
pub mod state;

pub use resilient::ResilientPublisher;
pub use state::{ConnectionState, reconnect_delay};
