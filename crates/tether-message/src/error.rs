use std::time::Duration;

use tether_pipe::PipeError;

/// Errors from framed message operations.
#[derive(Debug)]
pub enum MessageError {
    /// The framed-operation timeout fired before a whole frame moved.
    FrameTimeout {
        /// The timeout that elapsed.
        elapsed: Duration,
    },
    /// The underlying stable pipe failed.
    Pipe(PipeError),
}

impl MessageError {
    /// True for any timeout, message-level or pipe-level.
    pub fn is_timeout(&self) -> bool {
        match self {
            MessageError::FrameTimeout { .. } => true,
            MessageError::Pipe(e) => e.is_timeout(),
        }
    }

    /// True when a caller-supplied token canceled the operation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, MessageError::Pipe(PipeError::Canceled))
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::FrameTimeout { elapsed } => {
                write!(f, "framed operation timed out after {elapsed:?}")
            }
            MessageError::Pipe(e) => write!(f, "pipe error: {e}"),
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessageError::Pipe(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PipeError> for MessageError {
    fn from(e: PipeError) -> Self {
        MessageError::Pipe(e)
    }
}
