//! Ports - 抽象化レイヤー
//!
//! Traits the application layer depends on. Carriers, executors and worker
//! selection policies plug in here; `impls` holds the bundled implementations.

pub mod channel;
pub mod dispatch;
pub mod executor;
pub mod transport;

pub use self::channel::Channel;
pub use self::dispatch::{FirstAvailable, SelectionStrategy};
pub use self::executor::Executor;
pub use self::transport::{Acceptor, Connector, Handshake};
