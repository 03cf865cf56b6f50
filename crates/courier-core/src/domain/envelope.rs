//! Envelope codec - Task / TaskResponse と wire message の相互変換
//!
//! Every carrier moves opaque [`Message`]s; this module is the only place that
//! knows they hold JSON. Unknown fields are ignored on decode so newer peers can
//! add fields without breaking older ones.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::errors::CodecError;
use super::task::{Task, TaskResponse};

/// Native message form carried by a [`Channel`](crate::ports::Channel).
pub type Message = Vec<u8>;

/// Envelope は wire 上を流れるレコード
///
/// `KIND` はエラーメッセージとログで使う名前です。
pub trait Envelope: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn encode(&self) -> Result<Message, CodecError> {
        serde_json::to_vec(self).map_err(|source| CodecError::Encode {
            kind: Self::KIND,
            source,
        })
    }

    fn decode(message: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(message).map_err(|source| CodecError::Decode {
            kind: Self::KIND,
            source,
        })
    }
}

impl Envelope for Task {
    const KIND: &'static str = "task";
}

impl Envelope for TaskResponse {
    const KIND: &'static str = "task_response";
}
