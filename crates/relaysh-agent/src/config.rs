//! Agent configuration

use crate::AgentError;
use relaysh_proto::MAX_LINE_LENGTH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Controller hostname or IP
    pub server_host: String,
    /// Controller port
    pub server_port: u16,
    /// Pause between connection attempts, in milliseconds
    pub reconnect_backoff_ms: u64,
    /// Upper bound on a single dial, in milliseconds
    pub connect_timeout_ms: u64,
    /// Interpreter and its flag; the command is appended as the last argument
    pub shell: Vec<String>,
    /// Longest inbound line before it is split
    pub max_line_length: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 4000,
            reconnect_backoff_ms: 3_000,
            connect_timeout_ms: 10_000,
            shell: default_shell(),
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

#[cfg(windows)]
fn default_shell() -> Vec<String> {
    vec!["cmd.exe".to_string(), "/C".to_string()]
}

#[cfg(not(windows))]
fn default_shell() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}

impl AgentConfig {
    /// Load a JSON configuration file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot work with
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.shell.is_empty() {
            return Err(AgentError::Config("shell must name an interpreter".to_string()));
        }
        if self.server_host.is_empty() {
            return Err(AgentError::Config("server_host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Set the controller address
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_host = host.into();
        self.server_port = port;
        self
    }

    /// Set the reconnect backoff
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the interpreter used for commands
    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    /// `host:port` of the controller
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Reconnect backoff as a duration
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Dial timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_targets() {
        let config = AgentConfig::default();
        assert_eq!(config.server_addr(), "127.0.0.1:4000");
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(3));
        assert!(!config.shell.is_empty());
    }

    #[test]
    fn test_builders() {
        let config = AgentConfig::default()
            .with_server("10.0.0.5", 4100)
            .with_reconnect_backoff(Duration::from_millis(250))
            .with_shell(vec!["bash".to_string(), "-c".to_string()]);

        assert_eq!(config.server_addr(), "10.0.0.5:4100");
        assert_eq!(config.reconnect_backoff_ms, 250);
        assert_eq!(config.shell[0], "bash");
    }

    #[test]
    fn test_from_file_fills_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server_host": "ctl.internal", "server_port": 5000}}"#).unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_addr(), "ctl.internal:5000");
        assert_eq!(config.reconnect_backoff_ms, 3_000);
    }

    #[test]
    fn test_from_file_rejects_empty_shell() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"shell": []}}"#).unwrap();

        let err = AgentConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = AgentConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
