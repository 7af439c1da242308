use std::io;
use std::time::Duration;

/// Errors surfaced by [`StableReader`](crate::StableReader) and
/// [`StableWriter`](crate::StableWriter) operations.
#[derive(Debug)]
pub enum PipeError {
    /// An internal timeout fired before the inner pipe produced a result.
    ///
    /// Only raised when no caller token was supplied and the default
    /// timeout is armed. Routed through the behavior before it reaches
    /// the caller.
    Timeout {
        /// The timeout that elapsed.
        elapsed: Duration,
    },
    /// The caller-supplied cancellation token was triggered.
    Canceled,
    /// A read was started while another read was already in flight.
    AlreadyReading,
    /// A flush was started while another flush was already in flight.
    AlreadyWriting,
    /// The inner source was completed outside the reader's control.
    SourceCompleted,
    /// The inner sink was completed outside the writer's control.
    SinkCompleted,
    /// The inner pipe raised an I/O error.
    Transport(io::Error),
}

impl PipeError {
    /// True for the timeout variant, which callers may treat as transient.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipeError::Timeout { .. })
    }

    /// True when a caller-supplied token canceled the operation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, PipeError::Canceled)
    }
}

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeError::Timeout { elapsed } => {
                write!(f, "pipe operation timed out after {elapsed:?}")
            }
            PipeError::Canceled => write!(f, "pipe operation canceled"),
            PipeError::AlreadyReading => write!(f, "a read is already in flight"),
            PipeError::AlreadyWriting => write!(f, "a flush is already in flight"),
            PipeError::SourceCompleted => {
                write!(f, "inner source completed outside the reader's control")
            }
            PipeError::SinkCompleted => {
                write!(f, "inner sink completed outside the writer's control")
            }
            PipeError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for PipeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipeError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PipeError {
    fn from(e: io::Error) -> Self {
        PipeError::Transport(e)
    }
}
