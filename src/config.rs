//! Channel and server configuration
//!
//! All tunable parameters for the RPC stack. The demo server loads a
//! [`ServerConfig`] from JSON; everything else is built in code.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rpc::codec::MAX_HEADER_LENGTH;

/// Starting receive buffer capacity in bytes.
pub const INITIAL_BUFFER_SIZE: usize = 2048;

/// Hard cap on a single envelope in bytes (1 MiB).
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

/// Per-channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Receive buffer size allocated up front (grown on demand, never shrunk)
    pub initial_buffer_size: usize,
    /// Largest envelope accepted on receive or produced on send
    pub max_buffer_size: usize,
    /// Close the connection when a header carries a foreign protocol version.
    /// Off by default: the frame is logged and skipped.
    pub close_on_version_mismatch: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: INITIAL_BUFFER_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
            close_on_version_mismatch: false,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 || self.max_buffer_size > MAX_HEADER_LENGTH as usize {
            return Err(Error::Config("max_buffer_size must fit the 28-bit header length"));
        }
        if self.initial_buffer_size == 0 || self.initial_buffer_size > self.max_buffer_size {
            return Err(Error::Config("initial_buffer_size must be in 1..=max_buffer_size"));
        }
        Ok(())
    }
}

/// TCP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "127.0.0.1:9010"
    pub bind_addr: String,
    /// Maximum concurrently connected clients
    pub max_clients: usize,
    /// Read poll interval (milliseconds)
    pub read_poll_ms: u64,
    /// Accept poll interval (milliseconds)
    pub accept_poll_ms: u64,
    /// Settings applied to every accepted channel
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9010".into(),
            max_clients: 32,
            read_poll_ms: 1,
            accept_poll_ms: 50,
            channel: ChannelConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(Error::Config("max_clients must be non-zero"));
        }
        if self.bind_addr.is_empty() {
            return Err(Error::Config("bind_addr must be set"));
        }
        self.channel.validate()
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|_| Error::Config("invalid JSON server config"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
