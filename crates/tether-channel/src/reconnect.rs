//! Timer-driven reopen planner.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::channel::ChannelShared;

/// Delay before the first reconnect attempt after a fresh failure.
pub(crate) const INITIAL_DELAY: Duration = Duration::from_millis(50);

/// The back-off schedule, indexed by 1-based attempt number.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = match attempt {
        0 | 1 => 100,
        2 => 150,
        3..=4 => 250,
        5..=10 => 500,
        _ => 1000,
    };
    Duration::from_millis(ms)
}

/// Schedules reopen attempts until disposed. Never gives up on its own;
/// only channel disposal or switching off auto-reconnect stops it.
pub(crate) struct Reconnector {
    channel: Weak<ChannelShared>,
    attempt: AtomicU32,
    in_flight: AtomicBool,
    cancel: CancellationToken,
}

impl Reconnector {
    pub(crate) fn spawn(channel: Weak<ChannelShared>, initial_delay: Duration) -> Arc<Self> {
        let this = Arc::new(Self {
            channel,
            attempt: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        this.schedule(initial_delay);
        this
    }

    /// Schedule the next attempt according to the back-off table.
    pub(crate) fn plan_next(self: &Arc<Self>) {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.schedule(backoff_delay(attempt));
    }

    pub(crate) fn dispose(&self) {
        self.cancel.cancel();
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => this.tick().await,
                _ = this.cancel.cancelled() => {}
            }
        });
    }

    /// Fire-and-forget entry point into the channel lock. Never
    /// propagates; reentry is excluded by the in-flight flag.
    async fn tick(self: Arc<Self>) {
        if self.cancel.is_cancelled() || self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            let mut supervised = channel.lock.lock().await;
            if !channel.is_disposed() && !self.cancel.is_cancelled() {
                channel.reopen(&mut supervised, Some(&self)).await;
            }
        }
        self.in_flight.store(false, Ordering::Release);
    }
}
