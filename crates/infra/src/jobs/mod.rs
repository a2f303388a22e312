//! Background jobs on the broker, with retry, backoff and dead-lettering.
//!
//! ## Design
//!
//! - Jobs are JSON `JobMessage<T>` bodies on a durable queue
//! - Failed jobs come back after `retry_delay * 2^(attempts-1)` via a TTL delay queue
//! - After `max_retries` failures a job is parked in `<queue>.dlq` and never deleted
//! - Dead letters can be inspected (`get_failed_jobs`) and replayed (`retry_failed_job`)
//!
//! ## Components
//!
//! - `JobMessage`: the wire body
//! - `JobProcessor`: user code; closures returning a `JobResult` future qualify
//! - `JobQueue`: topology, producer, consumer and DLQ tools for one queue name

pub mod queue;
pub mod types;

pub use queue::{JobQueue, JobQueueError, JobTopology};
pub use types::{JobId, JobMessage, JobOptions, JobProcessor, JobResult, RetryPolicy, WorkerOptions};
