//! Receive path of a raw channel.
//!
//! A reader task owns the socket's read half. It reassembles blobs and hands
//! each one to the oldest waiting receive, or parks it in the channel inbox
//! until someone asks. While the inbox is full the task stops reading, so a
//! slow consumer pushes back on the peer through the socket buffer.

use std::io;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedReadHalf;

use super::raw::Shared;
use crate::error::ShmwireError;
use crate::protocol::BlobBuffer;

/// Why a direction of a channel stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Terminal {
    PeerClosed,
    Protocol(String),
    Io(io::ErrorKind, String),
}

impl Terminal {
    pub(crate) fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Terminal::PeerClosed,
            kind => Terminal::Io(kind, err.to_string()),
        }
    }

    pub(crate) fn error(&self) -> ShmwireError {
        match self {
            Terminal::PeerClosed => ShmwireError::PeerClosed,
            Terminal::Protocol(msg) => ShmwireError::Protocol(msg.clone()),
            Terminal::Io(kind, msg) => ShmwireError::Io(io::Error::new(*kind, msg.clone())),
        }
    }
}

pub(crate) async fn reader_loop(shared: Arc<Shared>, mut socket: OwnedReadHalf) {
    let read_size = shared.config.read_buffer_size;
    let max_buffered = shared.config.max_buffered_blobs;
    let mut buffer = BlobBuffer::with_capacity(read_size, shared.config.max_blob_size);

    loop {
        loop {
            let space = shared.inbox_space.notified();
            {
                let state = shared.state.lock();
                if state.closed {
                    return;
                }
                if state.buffered() < max_buffered {
                    break;
                }
            }
            space.await;
        }

        buffer.read_buf().reserve(read_size);
        let n = match socket.read_buf(buffer.read_buf()).await {
            Ok(n) => n,
            Err(e) => {
                shared.fail_receive(Terminal::from_io(&e));
                return;
            }
        };

        if n == 0 {
            if buffer.is_mid_blob() {
                tracing::debug!(
                    target: "shmwire::channel",
                    channel = %shared.label,
                    partial = buffer.len(),
                    "Peer closed mid-blob"
                );
            }
            shared.fail_receive(Terminal::PeerClosed);
            return;
        }

        loop {
            match buffer.try_extract() {
                Ok(Some(blob)) => shared.deliver(blob),
                Ok(None) => break,
                Err(e) => {
                    shared.fail_receive(Terminal::Protocol(e.to_string()));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_from_io() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(Terminal::from_io(&reset), Terminal::PeerClosed);

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(Terminal::from_io(&other), Terminal::Io(io::ErrorKind::PermissionDenied, _)));
    }

    #[test]
    fn test_terminal_error_is_repeatable() {
        let terminal = Terminal::Protocol("bad blob".into());
        assert!(matches!(terminal.error(), ShmwireError::Protocol(_)));
        assert!(matches!(terminal.error(), ShmwireError::Protocol(_)));
        assert!(matches!(Terminal::PeerClosed.error(), ShmwireError::PeerClosed));
    }
}
