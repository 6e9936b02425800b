//! An established session.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use super::SessionState;
use crate::app::ProcessIdentity;
use crate::arena::ArenaRepository;
use crate::channel::{ChannelWatch, ShmLink};
use crate::control::{encode_message, read_message, ControlMessage};
use crate::error::{Result, ShmwireError};
use crate::reactor::ReactorHandle;

type ErrorHandler = Box<dyn FnOnce(ShmwireError) + Send>;

/// Everything the handshake learned, handed over to the session.
pub(crate) struct SessionParts {
    pub(crate) id: u64,
    pub(crate) local: ProcessIdentity,
    pub(crate) peer: ProcessIdentity,
    pub(crate) is_server: bool,
    pub(crate) arena: ArenaRepository,
    pub(crate) link: Option<ShmLink>,
    pub(crate) master: UnixStream,
    pub(crate) channels: Vec<ChannelWatch>,
}

struct Core {
    state: SessionState,
    handler: Option<ErrorHandler>,
    registered: bool,
    pending_error: Option<ShmwireError>,
    master: Option<OwnedWriteHalf>,
    monitor: Option<JoinHandle<()>>,
}

struct SessionInner {
    id: u64,
    local: ProcessIdentity,
    peer: ProcessIdentity,
    is_server: bool,
    arena: ArenaRepository,
    link: Option<ShmLink>,
    channels: Vec<ChannelWatch>,
    core: Mutex<Core>,
}

impl SessionInner {
    /// The master link ended. Runs at most once per session.
    fn peer_lost(&self, next: SessionState, err: ShmwireError) {
        let reason = err.to_string();
        let fire = {
            let mut core = self.core.lock();
            if core.state != SessionState::Peer {
                return;
            }
            core.state = next;
            core.master = None;
            match core.handler.take() {
                Some(handler) => Some((handler, err)),
                None => {
                    if !core.registered {
                        core.pending_error = Some(err);
                    }
                    None
                }
            }
        };

        let marked = self.arena.mark_lender_gone(&self.peer);
        // Receives on the init-channels resolve before the session handler
        let failed: usize = self.channels.iter().map(ChannelWatch::peer_lost).sum();
        tracing::debug!(
            target: "shmwire::session",
            session = self.id,
            peer = %self.peer,
            state = %next,
            error = %reason,
            stale_pools = marked,
            failed_receives = failed,
            "Peer lost"
        );

        if let Some((handler, err)) = fire {
            handler(err);
        }
    }
}

async fn monitor(inner: Arc<SessionInner>, mut master: OwnedReadHalf) {
    let (next, err) = loop {
        match read_message(&mut master).await {
            Ok(ControlMessage::Close) => break (SessionState::Closed, ShmwireError::PeerClosed),
            Ok(other) => {
                tracing::debug!(
                    target: "shmwire::session",
                    session = inner.id,
                    kind = other.kind(),
                    "Ignoring control message on established session"
                );
            }
            Err(err) => break (SessionState::Failed, err),
        }
    };
    inner.peer_lost(next, err);
}

/// A negotiated session between a client and a server process.
///
/// Created by [`SessionServer::async_accept`](super::SessionServer::async_accept)
/// and [`SessionClient::async_connect`](super::SessionClient::async_connect)
/// in state `Peer`. While it is alive a monitor task watches the master
/// socket; when the peer goes away the state moves to `Closed` (the peer
/// said goodbye) or `Failed` (it vanished), pools borrowed from the peer go
/// stale and the error handler fires once.
///
/// Dropping the session closes it.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn establish(parts: SessionParts, reactor: &ReactorHandle) -> Self {
        let (read, write) = parts.master.into_split();
        let inner = Arc::new(SessionInner {
            id: parts.id,
            local: parts.local,
            peer: parts.peer,
            is_server: parts.is_server,
            arena: parts.arena,
            link: parts.link,
            channels: parts.channels,
            core: Mutex::new(Core {
                state: SessionState::Peer,
                handler: None,
                registered: false,
                pending_error: None,
                master: Some(write),
                monitor: None,
            }),
        });

        let task = reactor.spawn(monitor(inner.clone(), read));
        inner.core.lock().monitor = Some(task);

        tracing::debug!(
            target: "shmwire::session",
            session = inner.id,
            local = %inner.local,
            peer = %inner.peer,
            shm = inner.link.is_some(),
            "Session established"
        );
        Self { inner }
    }

    /// Register the handler for session failure.
    ///
    /// The handler fires exactly once if the peer exits, the transport
    /// breaks, or the peer closes the session. If that already happened it
    /// fires before this call returns.
    ///
    /// # Errors
    ///
    /// `Usage` when called twice, or on a session closed locally.
    pub fn init_handlers<F>(&self, on_error: F) -> Result<()>
    where
        F: FnOnce(ShmwireError) + Send + 'static,
    {
        let pending = {
            let mut core = self.inner.core.lock();
            if core.registered {
                return Err(ShmwireError::Usage(
                    "session handlers are already registered".into(),
                ));
            }
            match core.state {
                SessionState::Peer => {
                    core.registered = true;
                    core.handler = Some(Box::new(on_error));
                    return Ok(());
                }
                SessionState::Closed | SessionState::Failed => match core.pending_error.take() {
                    Some(err) => {
                        core.registered = true;
                        err
                    }
                    None => {
                        return Err(ShmwireError::Usage(format!(
                            "session {} is already {}",
                            self.inner.id, core.state
                        )))
                    }
                },
                state => {
                    return Err(ShmwireError::Usage(format!(
                        "session handlers need state peer, not {}",
                        state
                    )))
                }
            }
        };

        on_error(pending);
        Ok(())
    }

    /// Close the session gracefully.
    ///
    /// Tells the peer, stops watching the master socket and moves to
    /// `Closed`. The error handler does not fire for a local close.
    pub fn close(&self) {
        let (master, monitor) = {
            let mut core = self.inner.core.lock();
            if core.state.is_terminal() {
                return;
            }
            core.state = SessionState::Closed;
            core.handler = None;
            (core.master.take(), core.monitor.take())
        };

        if let Some(master) = master {
            match encode_message(&ControlMessage::Close) {
                Ok(frame) => match master.try_write(&frame) {
                    Ok(n) if n == frame.len() => {}
                    // The peer sees EOF instead of a clean close
                    Ok(n) => {
                        tracing::debug!(
                            target: "shmwire::session",
                            session = self.inner.id,
                            written = n,
                            len = frame.len(),
                            "Close frame cut short"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            target: "shmwire::session",
                            session = self.inner.id,
                            error = %e,
                            "Failed to send close"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(target: "shmwire::session", error = %e, "Failed to encode close");
                }
            }
        }
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        tracing::debug!(target: "shmwire::session", session = self.inner.id, "Session closed");
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.lock().state
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_server(&self) -> bool {
        self.inner.is_server
    }

    pub fn local(&self) -> &ProcessIdentity {
        &self.inner.local
    }

    pub fn peer(&self) -> &ProcessIdentity {
        &self.inner.peer
    }

    pub fn server_app(&self) -> &ProcessIdentity {
        if self.inner.is_server {
            &self.inner.local
        } else {
            &self.inner.peer
        }
    }

    pub fn client_app(&self) -> &ProcessIdentity {
        if self.inner.is_server {
            &self.inner.peer
        } else {
            &self.inner.local
        }
    }

    /// True if both sides mapped each other's pool.
    pub fn has_shm(&self) -> bool {
        self.inner.link.is_some()
    }

    pub fn shm_link(&self) -> Option<ShmLink> {
        self.inner.link.clone()
    }

    pub fn arena(&self) -> &ArenaRepository {
        &self.inner.arena
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {:x} ({} -> {})",
            self.inner.id,
            self.client_app(),
            self.server_app()
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .field("shm", &self.has_shm())
            .finish()
    }
}
