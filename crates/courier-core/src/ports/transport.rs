//! Transport ports - channel の確立
//!
//! `Acceptor` is the controller side (one channel per connecting worker),
//! `Connector` the worker side.

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use super::Channel;
use crate::domain::ConnectError;

/// The rest of a connection attempt once the raw connection is accepted.
/// Runs on its own task, so a silent peer never holds up the accept loop.
pub type Handshake = BoxFuture<'static, Result<Box<dyn Channel>, ConnectError>>;

#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next raw connection. Must be cancel-safe.
    ///
    /// A failed [`Handshake`] affects that attempt only; the acceptor stays
    /// usable. `ConnectError::ListenerClosed` means no further connections
    /// will ever be produced.
    async fn accept(&self) -> Result<Handshake, ConnectError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn Channel>, ConnectError>;
}
