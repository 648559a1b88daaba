//! Controller configuration

use crate::{RelayError, Result};
use relaysh_proto::MAX_LINE_LENGTH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Address to listen on
    pub listen_host: String,
    /// Port to listen on
    pub listen_port: u16,
    /// Interval between heartbeat rounds, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// How long a single `PING` write may take before the session is dropped
    pub heartbeat_write_timeout_ms: u64,
    /// How long to wait for an agent's registration block
    pub registration_timeout_ms: u64,
    /// Longest inbound line before it is split
    pub max_line_length: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 4000,
            heartbeat_interval_ms: 10_000,
            heartbeat_write_timeout_ms: 5_000,
            registration_timeout_ms: 10_000,
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

impl ControllerConfig {
    /// Load a JSON configuration file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| RelayError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(RelayError::Config("heartbeat_interval_ms must be positive".to_string()));
        }
        if self.max_line_length == 0 {
            return Err(RelayError::Config("max_line_length must be positive".to_string()));
        }
        Ok(())
    }

    /// Set the listening address
    pub fn with_listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.listen_host = host.into();
        self.listen_port = port;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the registration timeout
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// `host:port` to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Heartbeat interval as a duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat write timeout as a duration
    pub fn heartbeat_write_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_write_timeout_ms)
    }

    /// Registration timeout as a duration
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}
