//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **memory**: in-process channel / listener (tests, embedded demo)
//! - **tcp**: length-prefixed frames over TCP
//! - **ws**: WebSocket (tokio-tungstenite)
//! - **router**: demo Executor routing on method + path

use std::time::Duration;

pub mod frame;
pub mod memory;
pub mod router;
pub mod tcp;
pub mod ws;

pub use self::memory::{MemoryAcceptor, MemoryChannel, MemoryConnector};
pub use self::router::{RouteExecutor, RouteRequest};
pub use self::tcp::{TcpAcceptor, TcpChannel, TcpConnector};
pub use self::ws::{WsAcceptor, WsChannel, WsConnector};

/// Upper bound on a socket handshake after the raw connection is accepted.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
