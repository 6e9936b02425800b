//! Session client: opens sessions to a named server application.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::handshake::{self, ClientContext};
use super::{Connected, SessionState};
use crate::app::ProcessIdentity;
use crate::arena::ArenaRepository;
use crate::completion::{Completion, PendingOps};
use crate::config::SessionConfig;
use crate::error::ShmwireError;
use crate::reactor::ReactorHandle;

struct ClientState {
    connects: PendingOps<Connected>,
    tasks: Vec<JoinHandle<()>>,
    progress: SessionState,
    closed: bool,
}

struct ClientShared {
    ctx: ClientContext,
    state: Mutex<ClientState>,
}

impl ClientShared {
    fn advance(&self, next: SessionState) {
        let mut state = self.state.lock();
        if state.progress.can_transition_to(next)
            || (state.progress.is_terminal() && next == SessionState::Connecting)
        {
            state.progress = next;
        }
    }
}

/// Connects to a server application by name.
///
/// # Example
///
/// ```ignore
/// let client = SessionClient::new(SessionConfig::from_env(), "viewer", "renderer");
/// let Connected { session, channels } = client.async_connect(2).await?;
/// assert_eq!(channels.len(), 2);
/// ```
pub struct SessionClient {
    shared: Arc<ClientShared>,
}

impl SessionClient {
    /// A client for `client_app` talking to `server_app`, with a fresh arena
    /// repository.
    pub fn new(config: SessionConfig, client_app: impl Into<String>, server_app: impl Into<String>) -> Self {
        let arena = ArenaRepository::new(ProcessIdentity::current(client_app), config.arena.clone());
        Self::with_arena(config, arena, server_app)
    }

    /// A client presenting the identity of `arena`.
    pub fn with_arena(config: SessionConfig, arena: ArenaRepository, server_app: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                ctx: ClientContext {
                    identity: arena.identity(),
                    config,
                    server_app: server_app.into(),
                    arena,
                },
                state: Mutex::new(ClientState {
                    connects: PendingOps::new(),
                    tasks: Vec::new(),
                    progress: SessionState::Idle,
                    closed: false,
                }),
            }),
        }
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.shared.ctx.identity
    }

    pub fn server_app(&self) -> &str {
        &self.shared.ctx.server_app
    }

    pub fn arena(&self) -> &ArenaRepository {
        &self.shared.ctx.arena
    }

    /// Where the most recent connection attempt got to.
    pub fn state(&self) -> SessionState {
        self.shared.state.lock().progress
    }

    /// Open a session with `channel_count` init-channels.
    ///
    /// Resolves with the session in state `Peer` and exactly
    /// `channel_count` channels, or with the error that ended negotiation;
    /// no channels are handed out on failure.
    pub fn async_connect(&self, channel_count: usize) -> Completion<Connected> {
        let reactor = match ReactorHandle::current() {
            Ok(reactor) => reactor,
            Err(e) => return Completion::ready(Err(e)),
        };

        let mut state = self.shared.state.lock();
        if state.closed {
            return Completion::ready(Err(ShmwireError::ChannelClosed));
        }
        let (id, completion) = state.connects.push();

        let shared = self.shared.clone();
        let task = reactor.clone().spawn(async move {
            let result = handshake::connect(&shared.ctx, &reactor, channel_count, |s| shared.advance(s)).await;

            match &result {
                Ok(connected) => {
                    shared.advance(SessionState::Peer);
                    tracing::debug!(
                        target: "shmwire::session",
                        session = %connected.session,
                        channels = connected.channels.len(),
                        "Session connected"
                    );
                }
                Err(e) => {
                    shared.advance(SessionState::Failed);
                    tracing::warn!(
                        target: "shmwire::session",
                        server = %shared.ctx.server_app,
                        error = %e,
                        "Session negotiation failed"
                    );
                }
            }
            let done = shared.state.lock().connects.complete(id, result);
            done.fire();
        });

        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(task);
        completion
    }

    /// Connects still in progress.
    pub fn pending_connects(&self) -> usize {
        self.shared.state.lock().connects.len()
    }

    /// Abandon every connect in progress. They resolve with `Cancelled`
    /// before this returns; returns how many.
    pub fn close(&self) -> usize {
        let (cancelled, tasks) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            (state.connects.cancel_all(), std::mem::take(&mut state.tasks))
        };
        let cancelled = cancelled.fire();
        for task in tasks {
            task.abort();
        }
        cancelled
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("identity", &self.shared.ctx.identity)
            .field("server_app", &self.shared.ctx.server_app)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new().runtime_dir(dir.path()).pool_dir(dir.path());
        let client = SessionClient::new(config, "cli", "nobody");
        assert_eq!(client.state(), SessionState::Idle);

        let err = client.async_connect(1).await.unwrap_err();
        assert!(matches!(err, ShmwireError::Io(_)));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[test]
    fn test_connect_outside_runtime() {
        let client = SessionClient::new(SessionConfig::new(), "cli", "srv");
        let mut connect = client.async_connect(0);
        assert!(matches!(connect.try_take(), Some(Err(ShmwireError::Usage(_)))));
    }

    #[tokio::test]
    async fn test_close_cancels_pending_connects() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new().runtime_dir(dir.path()).pool_dir(dir.path());

        // A listener that never answers keeps the handshake pending
        let _silent = tokio::net::UnixListener::bind(config.server_socket_path("srv")).unwrap();
        let client = SessionClient::new(config, "cli", "srv");

        let mut connects: Vec<_> = (0..2).map(|_| client.async_connect(1)).collect();
        assert_eq!(client.close(), 2);
        for connect in connects.iter_mut() {
            assert!(matches!(connect.try_take(), Some(Err(ShmwireError::Cancelled))));
        }
    }
}
