//! courier-core
//!
//! Transport-agnostic task dispatch: a controller hands tasks to remote
//! workers over persistent channels and matches their responses back.
//!
//! # モジュール構成
//! - **domain**: ids, Task / TaskResponse, envelope codec, errors
//! - **ports**: Channel, Acceptor / Connector, Executor, SelectionStrategy
//! - **app**: registry, dispatcher, correlator, controller, runner
//! - **impls**: memory / tcp / ws transports and the demo route executor
//! - **config**: controller configuration (TOML)

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{Controller, ControllerBuilder, Dispatcher, Runner};
pub use config::{ControllerConfig, CorrelationMode, HeartbeatConfig};
pub use domain::{DispatchError, TaskId, TaskRequest, TaskResponse, WorkerId};
