//! Process-wide protocol settings.
//!
//! The retry window and attempt budget apply to every reliable packet an
//! endpoint sends; they are never chosen per packet. Binaries load these from
//! an optional JSON file and let command-line flags override individual
//! values.

use crate::error::ProtocolError;
use crate::DEFAULT_SERVER_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Well-known port the server role binds to.
    pub server_port: u16,
    /// How long a reliable packet waits for its acknowledgment before the
    /// next transmission.
    pub retry_timeout_ms: u64,
    /// Total transmissions (first send included) before a reliable packet
    /// is declared dead.
    pub max_attempts: u32,
    /// Upper bound on the number of peers a server admits.
    pub max_peers: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            retry_timeout_ms: 2000,
            max_attempts: 3,
            max_peers: 8,
        }
    }
}

impl ProtocolConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    /// Parses and validates a JSON document. Missing keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let config: ProtocolConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.max_attempts == 0 {
            return Err(ProtocolError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_timeout_ms == 0 {
            return Err(ProtocolError::Config(
                "retry_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_peers == 0 {
            return Err(ProtocolError::Config(
                "max_peers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
