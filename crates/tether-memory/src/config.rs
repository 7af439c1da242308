//! Channel configuration and transport for memory endpoints.

use std::any::Any;
use std::io;

use async_trait::async_trait;

use tether_channel::{
    ChannelConfig, ChannelError, ChannelOptions, ChannelTransport, Endpoints, Reconfigure,
};

use crate::directory;

/// Configuration attaching a channel to a named memory endpoint.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub endpoint: String,
    pub options: ChannelOptions,
}

impl MemoryConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            options: ChannelOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }
}

impl ChannelConfig for MemoryConfig {
    fn scheme(&self) -> &'static str {
        "mem"
    }

    fn options(&self) -> &ChannelOptions {
        &self.options
    }

    fn validate(&self) -> Result<(), ChannelError> {
        if self.endpoint.is_empty() {
            return Err(ChannelError::Configuration(
                "memory endpoint name must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn compare(&self, other: &dyn ChannelConfig) -> Reconfigure {
        match other.as_any().downcast_ref::<MemoryConfig>() {
            Some(other) if other.endpoint == self.endpoint => Reconfigure::Identical,
            _ => Reconfigure::Restart,
        }
    }

    fn create_transport(&self, can_open: bool) -> Box<dyn ChannelTransport> {
        // With permission to open eagerly, attach right away when the
        // endpoint already exists; the channel then starts connected.
        let preopened = if can_open {
            directory::attach(&self.endpoint).ok()
        } else {
            None
        };
        Box::new(MemoryTransport {
            endpoint: self.endpoint.clone(),
            preopened,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Transport pairing through the process-wide endpoint directory.
///
/// The transport owns nothing after a successful open: the byte pipes it
/// hands out carry the pair, and dropping them tears the link down.
pub struct MemoryTransport {
    endpoint: String,
    preopened: Option<Endpoints>,
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    fn preopened(&mut self) -> Option<Endpoints> {
        self.preopened.take()
    }

    async fn open(&mut self) -> io::Result<Endpoints> {
        if let Some(endpoints) = self.preopened.take() {
            return Ok(endpoints);
        }
        directory::attach(&self.endpoint)
    }

    async fn close(&mut self) {
        self.preopened = None;
    }
}
