//! Error types for shmwire.

use thiserror::Error;

/// Main error type for all shmwire operations.
#[derive(Debug, Error)]
pub enum ShmwireError {
    /// I/O error during socket or mapping operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (control plane only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Caller violated a precondition. Fatal to the call, not to the process.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Operation issued on a direction that has not been started.
    #[error("Direction not started")]
    NotReady,

    /// Operation cannot complete synchronously; the result arrives later.
    #[error("Operation would block")]
    WouldBlock,

    /// The remote side closed the channel or session.
    #[error("Peer closed")]
    PeerClosed,

    /// Operation issued after the local side closed the channel.
    #[error("Channel closed")]
    ChannelClosed,

    /// Incoming message does not fit into the receive buffer.
    #[error("Message truncated: {size} bytes do not fit in {capacity}")]
    MessageTruncated { size: usize, capacity: usize },

    /// The owning object was destroyed before the operation completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The lender tore the arena pool down.
    #[error("Arena pool {0} is stale")]
    StalePool(String),

    /// A message view outlived the pool it points into.
    #[error("Message view is stale")]
    StaleView,

    /// A message references memory outside the session arena.
    #[error("Invalid arena reference: {0}")]
    InvalidArenaReference(String),

    /// Pool was destroyed while borrowers still held it.
    #[error("Arena pool {pool} destroyed with {borrowers} live borrower(s)")]
    PoolInUse { pool: String, borrowers: u32 },

    /// Client and server disagree on the number of init-channels.
    #[error("Channel count mismatch: server expects {expected}, client requested {requested}")]
    ChannelCountMismatch { expected: usize, requested: usize },

    /// Session negotiation failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The OS could not back an allocation.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Identity does not match what the resource was granted to.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Handshake step did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Protocol error (invalid frame, unexpected message, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ShmwireError {
    /// True for errors caused by the caller violating a precondition.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ShmwireError::Usage(_) | ShmwireError::NotReady | ShmwireError::InvalidArenaReference(_)
        )
    }

    /// True for conditions that are not errors at all.
    pub fn is_transient(&self) -> bool {
        matches!(self, ShmwireError::WouldBlock)
    }

    /// True for errors that end the whole session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ShmwireError::ChannelCountMismatch { .. }
                | ShmwireError::Negotiation(_)
                | ShmwireError::PeerClosed
                | ShmwireError::Timeout(_)
                | ShmwireError::PermissionDenied(_)
        )
    }

    /// Build an I/O "would block" aware conversion.
    pub(crate) fn from_io_kind(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => ShmwireError::WouldBlock,
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => ShmwireError::PeerClosed,
            std::io::ErrorKind::OutOfMemory => ShmwireError::ResourceExhausted(err.to_string()),
            _ => ShmwireError::Io(err),
        }
    }
}

/// Result type alias using ShmwireError.
pub type Result<T> = std::result::Result<T, ShmwireError>;
