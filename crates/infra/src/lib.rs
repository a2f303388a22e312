//! Infrastructure layer: broker adapters, job queue, event publishing and the outbox.

pub mod broker;
pub mod config;
pub mod jobs;
pub mod outbox;
pub mod publisher;
pub mod workers;

#[cfg(test)]
mod integration_tests;
