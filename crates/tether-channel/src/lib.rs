#![deny(unsafe_code)]

//! Communication channel supervision.
//!
//! A [`Channel`] owns a transport-specific [`ChannelTransport`] and a pair
//! of stable pipes from `tether-pipe`. It tracks availability
//! ([`ConnectionStatus`]), reopens automatically with a back-off schedule
//! when the transport fails, reconfigures in place when the new
//! configuration allows it, and emits [`StatusChanged`] events decorated
//! with the channel's recent log history.
//!
//! Transports plug in through two traits: [`ChannelConfig`] (validation,
//! comparison, factory) and [`ChannelTransport`] (open, dynamic
//! reconfigure, dispose).

mod behavior;
mod channel;
mod config;
mod error;
mod pump;
mod reconnect;
mod ring;
mod status;
mod transport;

pub use channel::Channel;
pub use config::{ChannelConfig, ChannelOptions, Reconfigure};
pub use error::ChannelError;
pub use reconnect::backoff_delay;
pub use ring::LogRing;
pub use status::{ConnectionStatus, Level, LogEntry, StatusChanged};
pub use transport::{ChannelTransport, Endpoints};
