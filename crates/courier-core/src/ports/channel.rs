//! Channel port - worker ごとの双方向メッセージ通路
//!
//! Every carrier (in-process, TCP tunnel, WebSocket) implements this trait. The
//! dispatcher and correlator only ever talk to `dyn Channel`.
//!
//! # 契約
//! - `send` and `receive` may run concurrently on the same channel; each
//!   direction is serialized internally so frames never interleave.
//! - `receive` returns `Ok(None)` once the peer has closed the channel.
//! - `close` is idempotent and wakes any pending `receive`.

use async_trait::async_trait;

use crate::domain::{ChannelError, Message};

#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), ChannelError>;

    async fn receive(&self) -> Result<Option<Message>, ChannelError>;

    async fn close(&self);

    /// Short human-readable description of the remote end, for logs.
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}
