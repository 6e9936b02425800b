//! Session server: accepts sessions from registered client applications.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::handshake::{self, ServerContext};
use super::Accepted;
use crate::app::{AppDescriptor, AppRegistry, ProcessIdentity};
use crate::arena::ArenaRepository;
use crate::completion::{Completion, PendingOps};
use crate::config::SessionConfig;
use crate::error::{Result, ShmwireError};
use crate::reactor::ReactorHandle;
use crate::transport::SocketListener;

struct ServerState {
    accepts: PendingOps<Accepted>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

struct ServerShared {
    ctx: ServerContext,
    listener: SocketListener,
    state: Mutex<ServerState>,
}

/// Listens on the well-known socket of a server application.
///
/// Dropping the server cancels every pending accept and removes the socket.
pub struct SessionServer {
    shared: Arc<ServerShared>,
}

impl SessionServer {
    /// Bind the server socket of `app` with a fresh arena repository.
    ///
    /// Must be called from within a tokio runtime; that runtime drives the
    /// server and every session it accepts.
    pub fn bind(config: SessionConfig, app: AppDescriptor, clients: impl AppRegistry + 'static) -> Result<Self> {
        let arena = ArenaRepository::new(ProcessIdentity::current(app.name.clone()), config.arena.clone());
        Self::bind_with_arena(config, app, clients, arena)
    }

    /// Bind with an existing arena repository (shared by several sessions or
    /// servers of one process).
    pub fn bind_with_arena(
        config: SessionConfig,
        app: AppDescriptor,
        clients: impl AppRegistry + 'static,
        arena: ArenaRepository,
    ) -> Result<Self> {
        let reactor = ReactorHandle::current()?;
        let path = config.server_socket_path(&app.name);
        let listener = reactor.enter(|| SocketListener::bind(path))?;

        tracing::debug!(
            target: "shmwire::session",
            app = %app.name,
            path = %listener.path().display(),
            shm = config.shm_enabled,
            "Session server bound"
        );

        Ok(Self {
            shared: Arc::new(ServerShared {
                ctx: ServerContext {
                    identity: arena.identity(),
                    config,
                    app,
                    registry: Arc::new(clients),
                    arena,
                    reactor,
                },
                listener,
                state: Mutex::new(ServerState {
                    accepts: PendingOps::new(),
                    tasks: Vec::new(),
                    closed: false,
                }),
            }),
        })
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.shared.ctx.identity
    }

    pub fn app(&self) -> &AppDescriptor {
        &self.shared.ctx.app
    }

    pub fn arena(&self) -> &ArenaRepository {
        &self.shared.ctx.arena
    }

    pub fn socket_path(&self) -> &Path {
        self.shared.listener.path()
    }

    /// Accept the next session.
    ///
    /// `filter` may refuse a known client (`PermissionDenied`).
    /// `channel_count` picks the number of init-channels for the client; a
    /// client asking for a different number fails with
    /// `ChannelCountMismatch`. `per_channel` is called with each index as
    /// its channel comes up. The completion fires once, with every channel
    /// or with the error that ended negotiation.
    pub fn async_accept<F, C, P>(&self, filter: F, channel_count: C, per_channel: P) -> Completion<Accepted>
    where
        F: Fn(&AppDescriptor) -> bool + Send + 'static,
        C: FnOnce(&AppDescriptor) -> usize + Send + 'static,
        P: FnMut(usize) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Completion::ready(Err(ShmwireError::ChannelClosed));
        }
        let (id, completion) = state.accepts.push();

        let shared = self.shared.clone();
        let task = self.shared.ctx.reactor.spawn(async move {
            let result = async {
                let master = shared.listener.accept().await?;
                handshake::serve(&shared.ctx, master, filter, channel_count, per_channel).await
            }
            .await;

            match &result {
                Ok(accepted) => tracing::debug!(
                    target: "shmwire::session",
                    session = %accepted.session,
                    channels = accepted.channels.len(),
                    "Session accepted"
                ),
                Err(e) => tracing::warn!(target: "shmwire::session", error = %e, "Session negotiation failed"),
            }
            let done = shared.state.lock().accepts.complete(id, result);
            done.fire();
        });

        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(task);
        completion
    }

    /// Accepts still waiting for a client.
    pub fn pending_accepts(&self) -> usize {
        self.shared.state.lock().accepts.len()
    }

    /// Stop accepting. Pending accepts resolve with `Cancelled` before this
    /// returns; returns how many.
    pub fn close(&self) -> usize {
        let (cancelled, tasks) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            (state.accepts.cancel_all(), std::mem::take(&mut state.tasks))
        };
        let cancelled = cancelled.fire();
        for task in tasks {
            task.abort();
        }
        tracing::debug!(target: "shmwire::session", app = %self.shared.ctx.app.name, cancelled, "Session server closed");
        cancelled
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("app", &self.shared.ctx.app.name)
            .field("socket", &self.shared.listener.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::StaticAppRegistry;

    #[tokio::test]
    async fn test_bind_creates_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new().runtime_dir(dir.path()).pool_dir(dir.path());
        let server = SessionServer::bind(config, AppDescriptor::new("srv"), StaticAppRegistry::new()).unwrap();

        assert_eq!(server.socket_path(), dir.path().join("shmwire-srv.sock"));
        assert!(server.socket_path().exists());
        assert_eq!(server.identity().app_name, "srv");
    }

    #[test]
    fn test_bind_outside_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new().runtime_dir(dir.path());
        let err = SessionServer::bind(config, AppDescriptor::new("srv"), StaticAppRegistry::new()).unwrap_err();
        assert!(err.is_usage_error());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::new().runtime_dir(dir.path()).pool_dir(dir.path());
        let server = SessionServer::bind(config, AppDescriptor::new("srv"), StaticAppRegistry::new()).unwrap();

        let mut accepts: Vec<_> = (0..3).map(|_| server.async_accept(|_| true, |_| 0, |_| {})).collect();
        assert_eq!(server.pending_accepts(), 3);

        assert_eq!(server.close(), 3);
        for accept in accepts.iter_mut() {
            assert!(matches!(accept.try_take(), Some(Err(ShmwireError::Cancelled))));
        }

        let mut late = server.async_accept(|_| true, |_| 0, |_| {});
        assert!(matches!(late.try_take(), Some(Err(ShmwireError::ChannelClosed))));
    }
}
