//! Cancellable periodic background work on `tokio::time`.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// A task that runs `tick` every `period` until it returns
/// `ControlFlow::Break`, is stopped, or is dropped.
///
/// The first tick fires one full period after spawning. Cancellation is only
/// observed between ticks: a tick in flight always runs to completion, so
/// [`PeriodicTask::stop`] returns once no tick can touch shared state again.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if tick().await.is_break() {
                    trace!(task = name, "periodic task finished");
                    break;
                }
            }
            debug!(task = name, "periodic task stopped");
        });

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Request the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the task and wait until it has exited, including any tick
    /// already in flight.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(task = self.name, error = %err, "periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
