//! Control plane: session negotiation messages.
//!
//! The control plane carries length-prefixed JSON frames over the session's
//! master socket. After negotiation it stays open as the liveness link
//! between the two processes; only `Close` travels on it from then on.
//!
//! # Workflow
//!
//! 1. Client connects to the server socket and sends `open_session`
//! 2. Server checks identity and channel count, answers `accept` or `reject`
//! 3. Client answers `shm_offer` with its own pool (or none)
//! 4. For each channel index, in order: client connects to the channel
//!    socket, sends `join_channel`, server answers `channel_ready`
//! 5. Server sends `established`; both sides are now peers
//!
//! # Example
//!
//! ```
//! use shmwire::control::{encode_message, ControlMessage};
//!
//! let frame = encode_message(&ControlMessage::ChannelReady { index: 2 }).unwrap();
//! assert_eq!(&frame[4..], br#"{"type":"channel_ready","index":2}"#);
//! ```

mod io;
mod message;

pub use io::{encode_message, read_message, write_message, MAX_CONTROL_FRAME};
pub use message::{ControlMessage, RejectCode, PROTOCOL_VERSION};
