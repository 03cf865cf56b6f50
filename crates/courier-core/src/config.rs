//! Controller configuration (TOML).
//!
//! ```toml
//! mode = "async"
//! response_timeout_ms = 5000
//! reap_interval_ms = 1000
//!
//! [heartbeat]
//! interval_ms = 5000
//! method = "POST"
//! target = "/example"
//! payload = "dummy task {id}"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{TaskId, TaskRequest};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How responses are matched to tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    /// One exchange per call: send, then read the reply on the same channel.
    Sync,
    /// Decoupled send / receive loops with an explicit pending-response table.
    #[default]
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mode: CorrelationMode,
    pub response_timeout_ms: u64,
    pub reap_interval_ms: u64,
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: CorrelationMode::Async,
            response_timeout_ms: 5_000,
            reap_interval_ms: 1_000,
            heartbeat: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Periodic broadcast of a dummy task to every connected worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub method: String,
    pub target: String,
    /// `{id}` is replaced with the assigned task id.
    pub payload: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            method: "POST".to_string(),
            target: "/example".to_string(),
            payload: "dummy task {id}".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Builds the request for one tick. The payload template needs the
    /// assigned id, so this runs after id allocation.
    pub fn request_for(&self, id: TaskId) -> TaskRequest {
        TaskRequest::new(
            self.method.clone(),
            self.target.clone(),
            self.payload.replace("{id}", &id.get().to_string()),
        )
    }
}
