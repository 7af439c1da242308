//! The channel's pipe-behavior wrapper.
//!
//! Sits between the transport-supplied behavior and the stable pipes.
//! Transport behaviors get first refusal; when they decline, pipe errors
//! escalate into reconnect requests so the blocked read or flush simply
//! waits for the replacement pipe. Timeouts pass through untouched; they
//! are caller-visible and not a communication fault.

use std::sync::{Arc, Mutex, Weak};

use tether_pipe::{CompletionAction, ErrorAction, PipeBehavior, PipeError};

use crate::channel::ChannelShared;
use crate::status::Level;

/// Which pipe this wrapper guards, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => f.write_str("reader"),
            Direction::Write => f.write_str("writer"),
        }
    }
}

pub(crate) struct ChannelBehavior {
    /// Dispatch-only back-reference; never used for lifetime.
    channel: Weak<ChannelShared>,
    direction: Direction,
    inner: Mutex<Option<Arc<dyn PipeBehavior>>>,
}

impl ChannelBehavior {
    pub(crate) fn new(channel: Weak<ChannelShared>, direction: Direction) -> Self {
        Self {
            channel,
            direction,
            inner: Mutex::new(None),
        }
    }

    /// Splice in (or remove) the transport-supplied behavior.
    pub(crate) fn set_inner(&self, inner: Option<Arc<dyn PipeBehavior>>) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = inner;
    }

    fn inner(&self) -> Option<Arc<dyn PipeBehavior>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PipeBehavior for ChannelBehavior {
    fn on_error(&self, error: &PipeError) -> ErrorAction {
        if let Some(inner) = self.inner() {
            match inner.on_error(error) {
                ErrorAction::Propagate => {}
                decided => return decided,
            }
        }
        if error.is_timeout() {
            return ErrorAction::Propagate;
        }
        let Some(channel) = self.channel.upgrade() else {
            return ErrorAction::Propagate;
        };
        if channel.is_disposed() || !channel.auto_reconnect() {
            return ErrorAction::Propagate;
        }
        channel.log_deferred(
            Level::Warn,
            format!("{} pipe error, scheduling reconnect", self.direction),
            Some(error),
        );
        ChannelShared::notify_pipe_error(&channel);
        ErrorAction::Retry
    }

    fn on_swallowed(&self, error: &PipeError) {
        if let Some(channel) = self.channel.upgrade() {
            channel.log_deferred(
                Level::Trace,
                format!("{} swallowed error from replaced pipe", self.direction),
                Some(error),
            );
        }
    }

    fn on_cancel(&self) {
        if let Some(inner) = self.inner() {
            inner.on_cancel();
        }
    }

    fn on_inner_completed(&self) -> CompletionAction {
        if let Some(inner) = self.inner() {
            match inner.on_inner_completed() {
                CompletionAction::Complete => {}
                decided => return decided,
            }
        }
        let Some(channel) = self.channel.upgrade() else {
            return CompletionAction::Complete;
        };
        channel.log_deferred(
            Level::Info,
            format!("{} inner pipe completed by the peer", self.direction),
            None::<&PipeError>,
        );
        // The channel is full-duplex: completion of one direction closes
        // both, then the reconnect path decides what happens next.
        channel.detach_pipes();
        ChannelShared::notify_inner_completed(&channel);
        if channel.auto_reconnect() && !channel.is_disposed() {
            CompletionAction::Retry
        } else {
            CompletionAction::Complete
        }
    }

    fn return_inner_canceled(&self) -> bool {
        if let Some(inner) = self.inner() {
            return inner.return_inner_canceled();
        }
        let Some(channel) = self.channel.upgrade() else {
            return true;
        };
        // While the channel is reconnecting, a swap-canceled operation
        // rides over to the replacement pipe instead of surfacing.
        !(channel.auto_reconnect() && !channel.is_disposed())
    }
}
