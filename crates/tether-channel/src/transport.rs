//! The transport contract the supervisor drives.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use tether_pipe::{ByteSink, ByteSource, PipeBehavior};

/// Everything a successful open hands back to the channel.
pub struct Endpoints {
    pub source: Box<dyn ByteSource>,
    pub sink: Box<dyn ByteSink>,
    /// Behavior spliced under the channel's reader-side wrapper, when the
    /// transport wants a say in error handling.
    pub reader_behavior: Option<Arc<dyn PipeBehavior>>,
    /// Writer-side equivalent.
    pub writer_behavior: Option<Arc<dyn PipeBehavior>>,
}

impl std::fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoints").finish_non_exhaustive()
    }
}

impl Endpoints {
    pub fn new(source: Box<dyn ByteSource>, sink: Box<dyn ByteSink>) -> Self {
        Self {
            source,
            sink,
            reader_behavior: None,
            writer_behavior: None,
        }
    }
}

/// A transport-specific connection owner.
///
/// The supervisor owns exactly one at a time. It is created by the
/// configuration, opened under a deadline, and disposed on every restart
/// and on channel disposal. The transport uniquely owns its physical
/// resources; the byte pipes it hands out stay valid until the next
/// [`close`](ChannelTransport::close).
#[async_trait]
pub trait ChannelTransport: Send {
    /// Endpoints established eagerly at creation, if any. Only a transport
    /// created with `can_open` may return `Some`; the supervisor attaches
    /// them without calling [`open`](ChannelTransport::open).
    fn preopened(&mut self) -> Option<Endpoints> {
        None
    }

    /// Establish the connection and hand back its byte pipes. The
    /// supervisor bounds this call with its own deadline.
    async fn open(&mut self) -> io::Result<Endpoints>;

    /// Apply a configuration change without closing the connection. No
    /// cancellation is supplied; implementations bound their own work.
    async fn reconfigure(
        &mut self,
        config: &dyn crate::config::ChannelConfig,
    ) -> io::Result<()> {
        let _ = config;
        Ok(())
    }

    /// Release all transport resources.
    async fn close(&mut self);
}
