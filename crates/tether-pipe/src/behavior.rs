//! The capability set negotiated between a stable pipe and its environment.
//!
//! A [`PipeBehavior`] decides what a [`StableReader`](crate::StableReader)
//! or [`StableWriter`](crate::StableWriter) does when the inner pipe
//! errors, completes, or cancels. The default is inert: errors propagate,
//! completion completes the decorator. A supervisor can install its own
//! implementation to turn transport errors into reconnect requests.

use crate::error::PipeError;

/// What to do with an error raised by the inner pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Surface the error to the caller.
    Propagate,
    /// Swallow the error and retry the operation (typically after the
    /// inner pipe has been replaced).
    Retry,
    /// Swallow the error and report a canceled result.
    Cancel,
}

/// What to do when the inner pipe reports completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// Complete the decorator too (the default).
    Complete,
    /// Detach the inner pipe non-terminally and wait for a replacement.
    Retry,
    /// Surface the completion as an error.
    Propagate,
}

/// Callbacks a stable pipe consults while driving its inner pipe.
///
/// All methods have defaults; implementations override only the decisions
/// they care about. Methods may be called from any task driving the pipe
/// and must not block.
pub trait PipeBehavior: Send + Sync {
    /// An operation on the inner pipe failed.
    fn on_error(&self, error: &PipeError) -> ErrorAction {
        let _ = error;
        ErrorAction::Propagate
    }

    /// An error was swallowed because the inner pipe it came from is no
    /// longer the current one.
    fn on_swallowed(&self, error: &PipeError) {
        tracing::trace!(%error, "swallowed error from a replaced inner pipe");
    }

    /// A caller-supplied token canceled the operation.
    fn on_cancel(&self) {}

    /// The inner pipe reported that it is complete.
    fn on_inner_completed(&self) -> CompletionAction {
        CompletionAction::Complete
    }

    /// Whether a canceled result from the inner pipe is returned to the
    /// caller (`true`) or retried internally (`false`).
    fn return_inner_canceled(&self) -> bool {
        true
    }
}

/// The inert behavior: propagate errors, complete on completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBehavior;

impl PipeBehavior for DefaultBehavior {}
