//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::identity::DEFAULT_MAX_ATTEMPTS;

/// Complete server configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening endpoint
    #[serde(default)]
    pub listen: ListenConfig,
    /// Per-connection settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Anonymous identity allocation
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Listening endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Interface to bind
    pub bind: String,
    /// TCP port
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7000,
        }
    }
}

impl ListenConfig {
    /// `bind:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.bind.contains(':') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Longest accepted command line in bytes
    pub max_line_length: usize,
    /// Interval of the delivery worker's periodic mailbox check, in
    /// milliseconds (0 disables it)
    pub delivery_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line_length: 4096,
            delivery_poll_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn delivery_poll(&self) -> Option<Duration> {
        (self.delivery_poll_ms > 0).then(|| Duration::from_millis(self.delivery_poll_ms))
    }
}

/// Anonymous identity allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Collisions tolerated before allocation fails
    pub max_attempts: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}
