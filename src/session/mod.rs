//! Sessions between two processes.
//!
//! A session pairs a client application with a server application. It is
//! negotiated over a master socket, comes with N init-channels opened in a
//! fixed order, and optionally with a pair of shared-memory pools (one lent
//! by each side) for zero-copy structured channels.
//!
//! ```text
//! Idle ─► Connecting ─► NegotiatingChannels ─► Peer ─┬─► Closed
//!   │          │                 │                   └─► Failed
//!   └──────────┴─────────────────┴──────► Failed
//! ```
//!
//! # Example
//!
//! ```ignore
//! // server
//! let server = SessionServer::bind(config.clone(), AppDescriptor::new("renderer"), registry)?;
//! let Accepted { session, channels } = server
//!     .async_accept(|_| true, |_client| 2, |index| println!("channel {index} ready"))
//!     .await?;
//!
//! // client
//! let client = SessionClient::new(config, "viewer", "renderer");
//! let Connected { session, channels } = client.async_connect(2).await?;
//! session.init_handlers(|err| eprintln!("session lost: {err}"))?;
//! ```

mod client;
mod handshake;
mod peer;
mod server;

use std::fmt;

use crate::channel::RawChannel;

pub use client::SessionClient;
pub use peer::Session;
pub use server::SessionServer;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    NegotiatingChannels,
    Peer,
    /// Ended gracefully, by either side.
    Closed,
    /// Negotiation failed or the peer was lost.
    Failed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, NegotiatingChannels)
                | (NegotiatingChannels, Peer)
                | (Idle | Connecting | NegotiatingChannels, Failed)
                | (Peer, Closed | Failed)
        )
    }

    /// True for `Closed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::NegotiatingChannels => "negotiating-channels",
            SessionState::Peer => "peer",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of [`SessionServer::async_accept`].
#[derive(Debug)]
pub struct Accepted {
    pub session: Session,
    /// Init-channels, indexed in negotiation order.
    pub channels: Vec<RawChannel>,
}

/// Result of [`SessionClient::async_connect`].
#[derive(Debug)]
pub struct Connected {
    pub session: Session,
    /// Init-channels, indexed in negotiation order.
    pub channels: Vec<RawChannel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use SessionState::*;
        let path = [Idle, Connecting, NegotiatingChannels, Peer, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_forbidden_transitions() {
        use SessionState::*;
        assert!(!Peer.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Peer));
        assert!(!Failed.can_transition_to(Closed));
        assert!(!Idle.can_transition_to(Peer));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Peer.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Peer.is_terminal());
    }
}
