use std::io;

/// Errors from channel construction and reconfiguration.
#[derive(Debug)]
pub enum ChannelError {
    /// The supplied configuration failed validation.
    Configuration(String),
    /// The channel has been disposed.
    Disposed,
    /// The transport raised an I/O error during a caller-visible
    /// operation (dynamic reconfigure).
    Io(io::Error),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
            ChannelError::Disposed => write!(f, "channel is disposed"),
            ChannelError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}
