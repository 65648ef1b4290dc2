//! TCP transport configuration.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::settings::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration for [`TcpTransport`](super::TcpTransport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpTransportConfig {
    /// Local address to bind for incoming connections. Port 0 picks a free
    /// port; the bound address is reported by `start`.
    pub bind_address: SocketAddr,

    /// Connection and handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Maximum frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Enable TCP keepalive.
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,

    /// Keepalive interval in seconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Largest accepted handshake frame.
    #[serde(default = "default_max_handshake_size")]
    pub max_handshake_size: usize,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_io_timeout() -> u64 {
    30000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_keepalive() -> bool {
    true
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_max_handshake_size() -> usize {
    4096
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

impl TcpTransportConfig {
    #[must_use]
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            connect_timeout_ms: default_connect_timeout(),
            io_timeout_ms: default_io_timeout(),
            max_message_size: default_max_message_size(),
            keepalive: default_keepalive(),
            keepalive_interval_secs: default_keepalive_interval(),
            max_handshake_size: default_max_handshake_size(),
        }
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    #[must_use]
    pub const fn with_connect_timeout_ms(mut self, millis: u64) -> Self {
        self.connect_timeout_ms = millis;
        self
    }

    #[must_use]
    pub const fn with_io_timeout_ms(mut self, millis: u64) -> Self {
        self.io_timeout_ms = millis;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub const fn with_keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }
}
