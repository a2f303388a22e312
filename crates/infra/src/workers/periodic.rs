use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to stop a running [`PeriodicTask`].
///
/// Dropping the handle also stops the task.
#[derive(Debug)]
pub struct PeriodicHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Cancel every future tick. A tick that is already running completes in the
    /// background and is not awaited.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow() || self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Stop and wait for the loop (including an in-flight tick) to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                debug!(task = self.name, error = %err, "periodic task ended abnormally");
            }
        }
    }
}

/// Runs an async tick right away and then once per `period`.
///
/// - Ticks never overlap: the next tick is scheduled only after the current one returns
/// - A tick that overruns its period pushes the schedule back instead of bursting
/// - Stopping never interrupts a tick midway
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self { name, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn spawn<F, Fut>(self, mut tick: F) -> PeriodicHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let name = self.name;
        let period = self.period;

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        // Sender dropped or stop requested.
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        tick().await;
                    }
                }
            }
            debug!(task = name, "periodic task stopped");
        });

        PeriodicHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}
