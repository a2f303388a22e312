//! Background loop primitives.

pub mod periodic;

pub use periodic::{PeriodicHandle, PeriodicTask};
