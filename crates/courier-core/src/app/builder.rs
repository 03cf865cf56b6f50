//! ControllerBuilder - controller の構築とワイヤリング
//!
//! Configuration is validated once in `build()` (fail-fast): a controller that
//! builds successfully never runs with an infinite or zero deadline.

use std::sync::Arc;
use std::time::Duration;

use super::controller::Controller;
use crate::config::{ControllerConfig, CorrelationMode, HeartbeatConfig};
use crate::ports::{FirstAvailable, SelectionStrategy};

/// BuildError は controller 構築時のエラー
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("response timeout must be greater than zero")]
    ZeroResponseTimeout,

    #[error("reap interval must be greater than zero")]
    ZeroReapInterval,

    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,

    #[error("heartbeat method must not be empty")]
    EmptyHeartbeatMethod,
}

/// # 使用例
/// ```ignore
/// let controller = ControllerBuilder::new()
///     .mode(CorrelationMode::Async)
///     .response_timeout(Duration::from_secs(2))
///     .build()?;
/// controller.start().await;
/// ```
pub struct ControllerBuilder {
    config: ControllerConfig,
    strategy: Arc<dyn SelectionStrategy>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
            strategy: Arc::new(FirstAvailable),
        }
    }

    /// Replace the whole configuration (e.g. one loaded from TOML).
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mode(mut self, mode: CorrelationMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Millisecond granularity: anything under 1 ms is rejected by `build()`
    /// as zero, and huge values saturate.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout_ms = millis(timeout);
        self
    }

    /// Millisecond granularity, like [`response_timeout`](Self::response_timeout).
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval_ms = millis(interval);
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.config.heartbeat = Some(heartbeat);
        self
    }

    pub fn strategy(mut self, strategy: impl SelectionStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    pub fn build(self) -> Result<Controller, BuildError> {
        validate(&self.config)?;
        Ok(Controller::new(self.config, self.strategy))
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn validate(config: &ControllerConfig) -> Result<(), BuildError> {
    if config.response_timeout_ms == 0 {
        return Err(BuildError::ZeroResponseTimeout);
    }
    if config.reap_interval_ms == 0 {
        return Err(BuildError::ZeroReapInterval);
    }
    if let Some(heartbeat) = &config.heartbeat {
        if heartbeat.interval_ms == 0 {
            return Err(BuildError::ZeroHeartbeatInterval);
        }
        if heartbeat.method.trim().is_empty() {
            return Err(BuildError::EmptyHeartbeatMethod);
        }
    }
    Ok(())
}
