//! Control message definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::app::ProcessIdentity;
use crate::arena::LendToken;
use crate::error::ShmwireError;

/// Version both sides must agree on.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Why a server turned a session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    VersionMismatch,
    UnknownServer,
    PermissionDenied,
    ChannelCountMismatch,
    Unavailable,
}

/// One frame on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    OpenSession {
        version: String,
        client: ProcessIdentity,
        server_app: String,
        channel_count: usize,
    },
    Accept {
        session_id: u64,
        server: ProcessIdentity,
        channel_count: usize,
        /// Where the client connects each init-channel.
        channel_socket: PathBuf,
        /// The server's pool, lent to the client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shm: Option<LendToken>,
    },
    Reject {
        code: RejectCode,
        reason: String,
        /// The server's channel count, for `channel_count_mismatch`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<usize>,
    },
    ShmOffer {
        #[serde(default)]
        shm: Option<LendToken>,
    },
    JoinChannel {
        session_id: u64,
        index: usize,
    },
    ChannelReady {
        index: usize,
    },
    Established {
        /// Both pools are mapped; structured channels may go zero-copy.
        shm: bool,
    },
    Close,
}

impl ControlMessage {
    /// Wire name of the message, for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::OpenSession { .. } => "open_session",
            ControlMessage::Accept { .. } => "accept",
            ControlMessage::Reject { .. } => "reject",
            ControlMessage::ShmOffer { .. } => "shm_offer",
            ControlMessage::JoinChannel { .. } => "join_channel",
            ControlMessage::ChannelReady { .. } => "channel_ready",
            ControlMessage::Established { .. } => "established",
            ControlMessage::Close => "close",
        }
    }

    /// Build the reject frame that reports `err` to the client.
    pub fn reject_for(err: &ShmwireError) -> Self {
        let (code, expected) = match err {
            ShmwireError::PermissionDenied(_) => (RejectCode::PermissionDenied, None),
            ShmwireError::ChannelCountMismatch { expected, .. } => {
                (RejectCode::ChannelCountMismatch, Some(*expected))
            }
            ShmwireError::Negotiation(_) => (RejectCode::VersionMismatch, None),
            _ => (RejectCode::Unavailable, None),
        };
        ControlMessage::Reject {
            code,
            reason: err.to_string(),
            expected,
        }
    }

    pub(crate) fn unexpected(&self, wanted: &str) -> ShmwireError {
        ShmwireError::Protocol(format!("expected {}, got {}", wanted, self.kind()))
    }
}

impl RejectCode {
    /// The client-side error for a rejection.
    pub fn into_error(self, reason: String, expected: Option<usize>, requested: usize) -> ShmwireError {
        match self {
            RejectCode::PermissionDenied | RejectCode::UnknownServer => {
                ShmwireError::PermissionDenied(reason)
            }
            RejectCode::ChannelCountMismatch => ShmwireError::ChannelCountMismatch {
                expected: expected.unwrap_or_default(),
                requested,
            },
            RejectCode::VersionMismatch | RejectCode::Unavailable => {
                ShmwireError::Negotiation(reason)
            }
        }
    }
}
