//! Errors - エラー型と分類
//!
//! Transport and codec errors are handled where they occur (per connection,
//! per message). Only [`DispatchError`] reaches callers of the dispatcher.

use std::time::Duration;

use thiserror::Error;

use super::ids::{TaskId, WorkerId};

/// Failure while encoding or decoding an envelope.
/// The offending message is dropped; the channel stays up.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of an established channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Transport(String),
}

/// Failure to establish a channel. Fatal to that connection attempt only.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("listener closed")]
    ListenerClosed,

    #[error("{0}")]
    Transport(String),
}

impl From<ChannelError> for ConnectError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(e) => ConnectError::Io(e),
            other => ConnectError::Handshake(other.to_string()),
        }
    }
}

/// Errors surfaced by `submit` / `broadcast` and by pending responses.
///
/// None of these are retried by the core.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No worker registered (`worker: None`) or the chosen worker failed on send.
    #[error("{}", unavailable_message(.worker))]
    WorkerUnavailable { worker: Option<WorkerId> },

    /// Synchronous mode: the worker already has an exchange in flight.
    #[error("{0} already has an exchange in flight")]
    WorkerBusy(WorkerId),

    #[error("connection to {0} lost")]
    ConnectionLost(WorkerId),

    #[error("{task} timed out after {after:?}")]
    Timeout { task: TaskId, after: Duration },

    #[error("dispatch cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

fn unavailable_message(worker: &Option<WorkerId>) -> String {
    match worker {
        Some(id) => format!("{id} unavailable"),
        None => "no workers connected".to_string(),
    }
}

impl DispatchError {
    pub fn no_workers() -> Self {
        DispatchError::WorkerUnavailable { worker: None }
    }

    pub fn unavailable(worker: WorkerId) -> Self {
        DispatchError::WorkerUnavailable {
            worker: Some(worker),
        }
    }
}
