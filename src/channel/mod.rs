//! Channels: the data plane of a session.
//!
//! - [`RawChannel`] moves opaque blobs over a stream socket. Blob boundaries
//!   are kept with a 4-byte big-endian length prefix.
//! - [`StructuredChannel`] moves typed messages, through the session's
//!   shared-memory pools when it has them and in-band otherwise.
//!
//! Both are non-blocking: every operation returns a
//! [`Completion`](crate::Completion).

mod message;
mod raw;
mod reader;
mod structured;
mod writer;

pub use message::{MessageBuilder, MessageView};
pub use raw::RawChannel;
pub(crate) use raw::ChannelWatch;
pub use structured::{SerializationMode, ShmLink, StructuredChannel};

pub(crate) use reader::Terminal;
