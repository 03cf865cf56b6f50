//! Domain model (ids, task records, envelope codec, errors).

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod task;

pub use envelope::{Envelope, Message};
pub use errors::{ChannelError, CodecError, ConnectError, DispatchError};
pub use ids::{TaskId, WorkerId};
pub use task::{Task, TaskRequest, TaskResponse};
