//! # shmwire
//!
//! Session establishment and zero-copy channels for local IPC.
//!
//! A client application opens a [`Session`] with a named server application.
//! The session comes with a fixed number of init-channels and, when both
//! sides allow it, a pair of shared-memory pools through which structured
//! messages travel without being copied.
//!
//! ## Architecture
//!
//! - **Control plane** (master socket): length-prefixed JSON frames for the
//!   handshake, then a liveness link watched for peer death
//! - **Raw channels** (one socket each): non-blocking blob pipes with
//!   per-direction ordering
//! - **Structured channels**: MessagePack payloads built in a lent arena
//!   pool, with only a handle crossing the socket
//!
//! Every operation returns a [`Completion`]: ready at once when the work
//! finished synchronously, otherwise resolved later on the tokio runtime
//! that drives the channel.
//!
//! ## Example
//!
//! ```ignore
//! use shmwire::{SessionClient, SessionConfig, StructuredChannel, SerializationMode};
//!
//! #[tokio::main]
//! async fn main() -> shmwire::Result<()> {
//!     let client = SessionClient::new(SessionConfig::from_env(), "viewer", "renderer");
//!     let connected = client.async_connect(1).await?;
//!     connected.session.init_handlers(|err| eprintln!("renderer gone: {err}"))?;
//!
//!     let mut channels = connected.channels;
//!     let channel = StructuredChannel::new(
//!         channels.remove(0),
//!         &connected.session,
//!         SerializationMode::ViaSessionShm,
//!     )?;
//!
//!     let mut message = channel.create_message(1024)?;
//!     message.encode(&("frame", 42u32))?;
//!     channel.async_send_struct(message).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod arena;
pub mod channel;
pub mod codec;
pub mod completion;
pub mod config;
pub mod control;
pub mod error;
pub mod protocol;
pub mod reactor;
pub mod session;
pub mod transport;

pub use app::{AppDescriptor, AppRegistry, ProcessIdentity, StaticAppRegistry};
pub use arena::{ArenaRepository, BorrowedPool, LendToken, PoolHandle, PoolId};
pub use channel::{MessageBuilder, MessageView, RawChannel, SerializationMode, ShmLink, StructuredChannel};
pub use completion::{Completer, Completion};
pub use config::{ArenaConfig, ChannelConfig, SessionConfig};
pub use error::{Result, ShmwireError};
pub use reactor::ReactorHandle;
pub use session::{Accepted, Connected, Session, SessionClient, SessionServer, SessionState};
