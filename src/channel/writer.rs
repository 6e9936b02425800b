//! Send path of a raw channel.
//!
//! Sends first try to write straight into the socket from the caller's
//! thread. Whatever the kernel does not accept is queued, and a writer task
//! on the channel's reactor drains the queue as the socket becomes writable.
//!
//! ```text
//! async_send ─► try_write_vectored ─┬─► done: completion ready
//!                                   └─► would block: queue ─► writer task ─► socket
//! ```

use std::io::{self, IoSlice};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::unix::OwnedWriteHalf;

use super::raw::{ChannelState, Shared};
use super::Terminal;
use crate::completion::{Detached, OpId};
use crate::protocol::{encode_blob_prefix, BLOB_PREFIX_SIZE};

/// A blob queued for the socket, possibly partially written.
pub(crate) struct Outgoing {
    pub(crate) id: Option<OpId>,
    prefix: [u8; BLOB_PREFIX_SIZE],
    body: Bytes,
    written: usize,
}

impl Outgoing {
    pub(crate) fn new(body: Bytes) -> Self {
        Self {
            id: None,
            prefix: encode_blob_prefix(body.len() as u32),
            body,
            written: 0,
        }
    }

    pub(crate) fn body_len(&self) -> usize {
        self.body.len()
    }

    #[inline]
    fn total(&self) -> usize {
        BLOB_PREFIX_SIZE + self.body.len()
    }

    /// Write as much as the socket takes. `Ok(true)` once fully written,
    /// `Ok(false)` if the socket would block.
    pub(crate) fn write_to(&mut self, socket: &OwnedWriteHalf) -> io::Result<bool> {
        while self.written < self.total() {
            let result = if self.written < BLOB_PREFIX_SIZE {
                let slices = [
                    IoSlice::new(&self.prefix[self.written..]),
                    IoSlice::new(&self.body),
                ];
                socket.try_write_vectored(&slices)
            } else {
                socket.try_write(&self.body[self.written - BLOB_PREFIX_SIZE..])
            };

            match result {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

enum Drain {
    Empty,
    Blocked,
    Failed(io::Error),
}

/// Write queued blobs in order until the queue is empty or the socket stops
/// taking bytes. Finished sends are detached into `done`.
fn drain(state: &mut ChannelState, socket: &OwnedWriteHalf, done: &mut Detached<usize>) -> Drain {
    loop {
        let Some(entry) = state.send_queue.front_mut() else {
            state.writer_running = false;
            return Drain::Empty;
        };

        match entry.write_to(socket) {
            Ok(true) => {
                if let Some(entry) = state.send_queue.pop_front() {
                    if let Some(id) = entry.id {
                        done.extend(state.send_ops.complete(id, Ok(entry.body_len())));
                    }
                }
            }
            Ok(false) => return Drain::Blocked,
            Err(e) => return Drain::Failed(e),
        }
    }
}

/// Drain the send queue until it is empty, the socket fails, or the channel
/// closes.
pub(crate) async fn writer_loop(shared: Arc<Shared>, socket: Arc<OwnedWriteHalf>) {
    loop {
        if let Err(e) = socket.writable().await {
            shared.fail_send(Terminal::from_io(&e));
            return;
        }

        let mut done = Detached::new();
        let outcome = {
            let mut state = shared.state.lock();
            if state.closed {
                return;
            }
            drain(&mut state, &socket, &mut done)
        };
        done.fire();

        match outcome {
            Drain::Blocked => {}
            Drain::Empty => return,
            Drain::Failed(e) => {
                tracing::debug!(
                    target: "shmwire::channel",
                    channel = %shared.label,
                    error = %e,
                    "Send failed"
                );
                shared.fail_send(Terminal::from_io(&e));
                return;
            }
        }
    }
}
