//! In-memory publisher for tests/dev.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::envelope::DomainEvent;
use crate::publisher::{EventPublisher, PublishError};

/// Publisher that keeps every envelope it is handed.
///
/// - No IO
/// - Can be scripted to fail the next `n` calls, or to stay unavailable
#[derive(Debug)]
pub struct RecordingPublisher {
    source_service: String,
    state: Mutex<RecorderState>,
}

#[derive(Debug, Default)]
struct RecorderState {
    published: Vec<DomainEvent>,
    fail_next: usize,
    unavailable: bool,
    calls: usize,
}

impl RecordingPublisher {
    pub fn new(source_service: impl Into<String>) -> Self {
        Self {
            source_service: source_service.into(),
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Fail the next `n` publish calls with a broker error.
    pub fn fail_next(&self, n: usize) {
        self.with_state(|s| s.fail_next = n);
    }

    /// While unavailable, every publish fails with [`PublishError::NotConnected`].
    pub fn set_available(&self, available: bool) {
        self.with_state(|s| s.unavailable = !available);
    }

    /// Envelopes accepted so far, oldest first.
    pub fn published(&self) -> Vec<DomainEvent> {
        self.with_state(|s| s.published.clone())
    }

    /// Total publish calls, successful or not.
    pub fn calls(&self) -> usize {
        self.with_state(|s| s.calls)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RecorderState) -> R) -> R {
        // Lock poisoning is ignored.
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        event_type: &str,
        payload: JsonValue,
        source_service: Option<&str>,
    ) -> Result<(), PublishError> {
        self.with_state(|s| {
            s.calls += 1;
            if s.unavailable {
                return Err(PublishError::NotConnected);
            }
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err(PublishError::Broker("scripted failure".to_string()));
            }

            let source = source_service.unwrap_or(&self.source_service);
            s.published.push(DomainEvent::new(event_type, source, payload));
            Ok(())
        })
    }
}
