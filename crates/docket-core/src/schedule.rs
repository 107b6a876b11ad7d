use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Recurring callback on the current thread. The first tick runs
/// immediately; later ticks follow every `period`. A tick always finishes
/// before the next one starts.
#[derive(Debug)]
pub struct Poller;

impl Poller {
    /// Must be called from inside a `tokio::task::LocalSet`. `period` is
    /// clamped to between one millisecond and one day.
    pub fn spawn<F>(period: Duration, mut tick: F) -> PollHandle
    where
        F: FnMut() + 'static,
    {
        let period = period.clamp(MIN_PERIOD, MAX_PERIOD);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        let task = tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
                "poller started"
            );

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = interval.tick() => tick(),
                }
            }

            debug!("poller stopped");
        });

        PollHandle {
            cancel: Some(cancel_tx),
            task: Some(task),
        }
    }
}

/// Owner side of a running poller. Dropping the handle stops the poller.
#[derive(Debug)]
pub struct PollHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancels and waits for the in-flight tick, if any, to complete.
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel();
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
