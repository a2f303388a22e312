//! `hireflow-core`: identifiers and error primitives shared by the delivery crates.
//!
//! Nothing in here performs IO.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{EventId, JobId, OutboxEventId};
