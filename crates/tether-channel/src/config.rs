//! Configuration contract consumed by the channel supervisor.

use std::any::Any;
use std::time::Duration;

use crate::error::ChannelError;
use crate::transport::ChannelTransport;

/// Generic knobs every transport configuration carries.
///
/// Changing only these between two otherwise-identical configurations is
/// always a dynamic reconfiguration; no restart occurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Default timeout for reads made without a caller token.
    pub read_timeout: Option<Duration>,
    /// Default timeout for flushes made without a caller token.
    pub write_timeout: Option<Duration>,
    /// Additional flush attempts on timeout; effective only with a write
    /// timeout set.
    pub retry_write_count: u32,
    /// Whether the channel keeps reopening after failures. Defaults on.
    pub auto_reconnect: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            retry_write_count: 0,
            auto_reconnect: true,
        }
    }
}

/// Outcome of comparing two configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfigure {
    /// Nothing changed; reconfiguration is a no-op.
    Identical,
    /// The change can be applied without closing the transport.
    Dynamic,
    /// The transport must be torn down and reopened.
    Restart,
}

/// A transport-specific channel configuration.
pub trait ChannelConfig: Send + Sync + std::fmt::Debug + 'static {
    /// Short transport tag used in the channel name (`"mem"`, `"tcp"`).
    fn scheme(&self) -> &'static str;

    /// The generic knobs.
    fn options(&self) -> &ChannelOptions;

    /// Validate at channel-construction time.
    fn validate(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Decide how to move from `self` to `other`. Implementations compare
    /// only their transport-specific fields; the supervisor upgrades an
    /// [`Reconfigure::Identical`] verdict to [`Reconfigure::Dynamic`] when
    /// the generic knobs differ.
    fn compare(&self, other: &dyn ChannelConfig) -> Reconfigure;

    /// Produce a transport. With `can_open` false the instance must come
    /// back unopened (no eagerly-established connection).
    fn create_transport(&self, can_open: bool) -> Box<dyn ChannelTransport>;

    /// Downcast support for [`compare`](Self::compare) implementations.
    fn as_any(&self) -> &dyn Any;
}
