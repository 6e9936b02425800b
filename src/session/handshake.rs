//! Session negotiation, both sides.
//!
//! Every step is bounded by the handshake timeout. Init-channels are opened
//! strictly one after another, so index `i` on the server is index `i` on
//! the client. Any failure drops every channel opened so far.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;

use super::peer::{Session, SessionParts};
use super::{Accepted, Connected, SessionState};
use crate::app::{AppDescriptor, AppRegistry, ProcessIdentity};
use crate::arena::{ArenaRepository, BorrowedPool, LendToken, PoolHandle};
use crate::channel::{RawChannel, ShmLink};
use crate::config::SessionConfig;
use crate::control::{read_message, write_message, ControlMessage, PROTOCOL_VERSION};
use crate::error::{Result, ShmwireError};
use crate::reactor::ReactorHandle;
use crate::transport::{self, generate_socket_path, random_u64, SocketListener};

/// Run one handshake step under `timeout`.
pub(crate) async fn step<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ShmwireError::Timeout(format!("{} after {:?}", what, timeout))),
    }
}

fn into_channel(stream: UnixStream, config: &SessionConfig, session_id: u64, index: usize) -> Result<RawChannel> {
    let stream = stream.into_std()?;
    RawChannel::with_label(stream, config.channel.clone(), format!("{:x}/{}", session_id, index))
}

fn create_lent_pool(arena: &ArenaRepository, size: usize, borrower: &ProcessIdentity) -> Option<(PoolHandle, LendToken)> {
    let pool = arena
        .create_pool(size)
        .map_err(|e| {
            tracing::warn!(target: "shmwire::session", error = %e, "Cannot create session pool, continuing without shared memory");
        })
        .ok()?;
    let token = arena
        .lend(&pool, borrower)
        .map_err(|e| {
            tracing::warn!(target: "shmwire::session", pool = %pool.id(), error = %e, "Cannot lend session pool");
        })
        .ok()?;
    Some((pool, token))
}

fn borrow_peer_pool(arena: &ArenaRepository, token: &LendToken) -> Option<BorrowedPool> {
    arena
        .borrow(token)
        .map_err(|e| {
            tracing::warn!(target: "shmwire::session", pool = %token.pool, error = %e, "Cannot map peer pool, continuing without shared memory");
        })
        .ok()
}

// ============================================================================
// Server
// ============================================================================

pub(crate) struct ServerContext {
    pub(crate) config: SessionConfig,
    pub(crate) app: AppDescriptor,
    pub(crate) identity: ProcessIdentity,
    pub(crate) registry: Arc<dyn AppRegistry>,
    pub(crate) arena: ArenaRepository,
    pub(crate) reactor: ReactorHandle,
}

impl ServerContext {
    /// Decide whether `client` may open a session and with how many channels.
    fn admit<F, C>(
        &self,
        master: &UnixStream,
        version: &str,
        client: &ProcessIdentity,
        server_app: &str,
        requested: usize,
        filter: &F,
        channel_count: C,
    ) -> Result<(AppDescriptor, usize)>
    where
        F: Fn(&AppDescriptor) -> bool,
        C: FnOnce(&AppDescriptor) -> usize,
    {
        if version != PROTOCOL_VERSION {
            return Err(ShmwireError::Negotiation(format!(
                "protocol version {} does not match {}",
                version, PROTOCOL_VERSION
            )));
        }
        if server_app != self.app.name {
            return Err(ShmwireError::PermissionDenied(format!(
                "this server is {}, not {}",
                self.app.name, server_app
            )));
        }

        let descriptor = self.registry.lookup(&client.app_name).ok_or_else(|| {
            ShmwireError::PermissionDenied(format!("unknown client application {}", client.app_name))
        })?;
        if let Some(uid) = descriptor.user_id {
            let peer_uid = master.peer_cred()?.uid();
            if peer_uid != uid {
                return Err(ShmwireError::PermissionDenied(format!(
                    "{} runs as uid {}, expected {}",
                    client, peer_uid, uid
                )));
            }
        }
        if !self.app.allows_client(&descriptor.name) || !filter(&descriptor) {
            return Err(ShmwireError::PermissionDenied(format!("{} is not admitted", client)));
        }

        let expected = channel_count(&descriptor);
        if expected != requested {
            return Err(ShmwireError::ChannelCountMismatch { expected, requested });
        }
        Ok((descriptor, expected))
    }
}

/// Negotiate one session on an accepted master connection.
pub(crate) async fn serve<F, C, P>(
    ctx: &ServerContext,
    mut master: UnixStream,
    filter: F,
    channel_count: C,
    mut per_channel: P,
) -> Result<Accepted>
where
    F: Fn(&AppDescriptor) -> bool,
    C: FnOnce(&AppDescriptor) -> usize,
    P: FnMut(usize),
{
    let timeout = ctx.config.handshake_timeout;

    let (version, client, server_app, requested) =
        match step(timeout, "open_session", read_message(&mut master)).await? {
            ControlMessage::OpenSession {
                version,
                client,
                server_app,
                channel_count,
            } => (version, client, server_app, channel_count),
            other => return Err(other.unexpected("open_session")),
        };

    let admitted = ctx.admit(&master, &version, &client, &server_app, requested, &filter, channel_count);
    let n = match admitted {
        Ok((_, n)) => n,
        Err(err) => {
            tracing::debug!(target: "shmwire::session", client = %client, error = %err, "Session rejected");
            let reject = ControlMessage::reject_for(&err);
            if let Err(e) = step(timeout, "reject", write_message(&mut master, &reject)).await {
                tracing::debug!(target: "shmwire::session", error = %e, "Failed to deliver reject");
            }
            return Err(err);
        }
    };

    let lent = if ctx.config.shm_enabled {
        create_lent_pool(&ctx.arena, ctx.config.pool_size, &client)
    } else {
        None
    };

    let listener = SocketListener::bind(generate_socket_path(&ctx.config.runtime_dir))?;
    let session_id = random_u64();
    let accept = ControlMessage::Accept {
        session_id,
        server: ctx.identity.clone(),
        channel_count: n,
        channel_socket: listener.path().to_path_buf(),
        shm: lent.as_ref().map(|(_, token)| token.clone()),
    };
    step(timeout, "accept", write_message(&mut master, &accept)).await?;

    let offered = match step(timeout, "shm_offer", read_message(&mut master)).await? {
        ControlMessage::ShmOffer { shm } => shm,
        other => return Err(other.unexpected("shm_offer")),
    };
    let borrowed = match (&offered, &lent) {
        (Some(token), Some(_)) => borrow_peer_pool(&ctx.arena, token),
        _ => None,
    };

    let mut channels = Vec::with_capacity(n);
    for index in 0..n {
        let mut stream = step(timeout, "channel connect", listener.accept()).await?;
        match step(timeout, "join_channel", read_message(&mut stream)).await? {
            ControlMessage::JoinChannel { session_id: sid, index: i } if sid == session_id && i == index => {}
            other => {
                return Err(ShmwireError::Protocol(format!(
                    "expected join_channel {} of session {:x}, got {:?}",
                    index, session_id, other
                )))
            }
        }
        step(
            timeout,
            "channel_ready",
            write_message(&mut stream, &ControlMessage::ChannelReady { index }),
        )
        .await?;

        channels.push(into_channel(stream, &ctx.config, session_id, index)?);
        per_channel(index);
        tracing::trace!(target: "shmwire::session", session = session_id, index, "Channel ready");
    }
    drop(listener);

    let link = match (lent, borrowed) {
        (Some((pool, _)), Some(borrowed)) => Some(ShmLink::new(pool, borrowed)),
        _ => None,
    };
    let established = ControlMessage::Established { shm: link.is_some() };
    step(timeout, "established", write_message(&mut master, &established)).await?;

    let session = Session::establish(
        SessionParts {
            id: session_id,
            local: ctx.identity.clone(),
            peer: client,
            is_server: true,
            arena: ctx.arena.clone(),
            link,
            master,
            channels: channels.iter().map(RawChannel::watch).collect(),
        },
        &ctx.reactor,
    );
    Ok(Accepted { session, channels })
}

// ============================================================================
// Client
// ============================================================================

pub(crate) struct ClientContext {
    pub(crate) config: SessionConfig,
    pub(crate) identity: ProcessIdentity,
    pub(crate) server_app: String,
    pub(crate) arena: ArenaRepository,
}

/// Negotiate a session with `requested` init-channels.
pub(crate) async fn connect<S>(
    ctx: &ClientContext,
    reactor: &ReactorHandle,
    requested: usize,
    progress: S,
) -> Result<Connected>
where
    S: Fn(SessionState),
{
    let timeout = ctx.config.handshake_timeout;
    progress(SessionState::Connecting);

    let path = ctx.config.server_socket_path(&ctx.server_app);
    let mut master = step(timeout, "connect", transport::connect(&path)).await?;

    let open = ControlMessage::OpenSession {
        version: PROTOCOL_VERSION.to_string(),
        client: ctx.identity.clone(),
        server_app: ctx.server_app.clone(),
        channel_count: requested,
    };
    step(timeout, "open_session", write_message(&mut master, &open)).await?;

    let (session_id, server, channel_socket, server_pool) =
        match step(timeout, "accept", read_message(&mut master)).await? {
            ControlMessage::Accept {
                session_id,
                server,
                channel_count,
                channel_socket,
                shm,
            } => {
                if channel_count != requested {
                    return Err(ShmwireError::ChannelCountMismatch {
                        expected: channel_count,
                        requested,
                    });
                }
                if server.app_name != ctx.server_app {
                    return Err(ShmwireError::Negotiation(format!(
                        "connected to {} instead of {}",
                        server, ctx.server_app
                    )));
                }
                (session_id, server, channel_socket, shm)
            }
            ControlMessage::Reject {
                code,
                reason,
                expected,
            } => return Err(code.into_error(reason, expected, requested)),
            other => return Err(other.unexpected("accept")),
        };

    progress(SessionState::NegotiatingChannels);

    let borrowed = match &server_pool {
        Some(token) if ctx.config.shm_enabled => borrow_peer_pool(&ctx.arena, token),
        _ => None,
    };
    let lent = if borrowed.is_some() {
        create_lent_pool(&ctx.arena, ctx.config.pool_size, &server)
    } else {
        None
    };
    let offer = ControlMessage::ShmOffer {
        shm: lent.as_ref().map(|(_, token)| token.clone()),
    };
    step(timeout, "shm_offer", write_message(&mut master, &offer)).await?;

    let mut channels = Vec::with_capacity(requested);
    for index in 0..requested {
        let mut stream = step(timeout, "channel connect", transport::connect(&channel_socket)).await?;
        let join = ControlMessage::JoinChannel { session_id, index };
        step(timeout, "join_channel", write_message(&mut stream, &join)).await?;
        match step(timeout, "channel_ready", read_message(&mut stream)).await? {
            ControlMessage::ChannelReady { index: i } if i == index => {}
            other => return Err(other.unexpected("channel_ready")),
        }
        channels.push(into_channel(stream, &ctx.config, session_id, index)?);
    }

    let shm = match step(timeout, "established", read_message(&mut master)).await? {
        ControlMessage::Established { shm } => shm,
        other => return Err(other.unexpected("established")),
    };
    let link = match (shm, lent, borrowed) {
        (true, Some((pool, _)), Some(borrowed)) => Some(ShmLink::new(pool, borrowed)),
        _ => None,
    };

    let session = Session::establish(
        SessionParts {
            id: session_id,
            local: ctx.identity.clone(),
            peer: server,
            is_server: false,
            arena: ctx.arena.clone(),
            link,
            master,
            channels: channels.iter().map(RawChannel::watch).collect(),
        },
        reactor,
    );
    Ok(Connected { session, channels })
}
