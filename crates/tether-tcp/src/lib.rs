#![deny(unsafe_code)]

//! TCP transport for tether channels.
//!
//! Two modes: `connect` dials a remote peer on every open; `listen`
//! binds once and accepts one peer per open. Either way the channel gets
//! a buffering source and sink over the stream's split halves, with
//! `TCP_NODELAY` set so small frames leave promptly.

use std::any::Any;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use tether_channel::{
    ChannelConfig, ChannelError, ChannelOptions, ChannelTransport, Endpoints, Reconfigure,
};
use tether_pipe::{StreamSink, StreamSource};

/// Which side of the connection this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    /// Dial the given address on every open.
    Connect(SocketAddr),
    /// Bind the given address and accept one peer per open.
    Listen(SocketAddr),
}

/// TCP channel configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub mode: TcpMode,
    pub options: ChannelOptions,
}

impl TcpConfig {
    pub fn client(addr: SocketAddr) -> Self {
        Self {
            mode: TcpMode::Connect(addr),
            options: ChannelOptions::default(),
        }
    }

    pub fn server(addr: SocketAddr) -> Self {
        Self {
            mode: TcpMode::Listen(addr),
            options: ChannelOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }
}

impl ChannelConfig for TcpConfig {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn options(&self) -> &ChannelOptions {
        &self.options
    }

    fn validate(&self) -> Result<(), ChannelError> {
        let addr = match self.mode {
            TcpMode::Connect(addr) | TcpMode::Listen(addr) => addr,
        };
        if matches!(self.mode, TcpMode::Connect(_)) && addr.port() == 0 {
            return Err(ChannelError::Configuration(
                "cannot connect to port 0".into(),
            ));
        }
        Ok(())
    }

    fn compare(&self, other: &dyn ChannelConfig) -> Reconfigure {
        match other.as_any().downcast_ref::<TcpConfig>() {
            Some(other) if other.mode == self.mode => Reconfigure::Identical,
            _ => Reconfigure::Restart,
        }
    }

    fn create_transport(&self, _can_open: bool) -> Box<dyn ChannelTransport> {
        Box::new(TcpTransport {
            mode: self.mode,
            listener: None,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One TCP connection at a time, re-established per open.
pub struct TcpTransport {
    mode: TcpMode,
    /// Kept across opens in listen mode, so a reconnecting peer finds
    /// the same bound port.
    listener: Option<TcpListener>,
}

impl TcpTransport {
    fn endpoints_for(stream: TcpStream) -> io::Result<Endpoints> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Endpoints::new(
            Box::new(StreamSource::new(read_half)),
            Box::new(StreamSink::new(write_half)),
        ))
    }

    /// The locally bound address in listen mode, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

#[async_trait]
impl ChannelTransport for TcpTransport {
    async fn open(&mut self) -> io::Result<Endpoints> {
        match self.mode {
            TcpMode::Connect(addr) => {
                let stream = TcpStream::connect(addr).await?;
                tracing::debug!(%addr, "tcp connected");
                Self::endpoints_for(stream)
            }
            TcpMode::Listen(addr) => {
                if self.listener.is_none() {
                    self.listener = Some(TcpListener::bind(addr).await?);
                }
                let listener = self.listener.as_ref().expect("listener bound");
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(%peer, "tcp peer accepted");
                Self::endpoints_for(stream)
            }
        }
    }

    async fn close(&mut self) {
        self.listener = None;
    }
}
