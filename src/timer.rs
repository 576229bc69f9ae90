//! Cancellable scheduled tasks.
//!
//! One primitive backs every timer in the crate: heartbeat, reconnect backoff,
//! subscription replay, typing idle, peer-typing expiry and inbox refresh.
//! Must be used from inside a tokio runtime.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Runs `f` once after `delay`. Replaces any pending run, so calling it
    /// again is a reset.
    pub fn start<F>(&mut self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            f();
        }));
    }

    /// Runs `f` every `period`, first after one full period.
    pub fn start_repeating<F>(&mut self, period: Duration, mut f: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f();
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
