//! Wire format of raw-channel blobs and structured-message envelopes.
//!
//! Every blob on a raw channel is preceded by its length:
//! ```text
//! ┌──────────┬──────────────────┐
//! │ Length   │ Blob bytes       │
//! │ 4 bytes  │ Length bytes     │
//! │ uint32 BE│                  │
//! └──────────┴──────────────────┘
//! ```
//!
//! A structured channel sends one blob per message. The first byte of that
//! blob says how the payload travels:
//! ```text
//! SHM handle (25 bytes):
//! ┌──────┬────────────┬──────────┬──────────┬──────────┬────────────┐
//! │ 0x01 │ Lender PID │ Pool seq │ Offset   │ Length   │ Generation │
//! │ 1 B  │ uint32 BE  │ uint32 BE│ uint64 BE│ uint32 BE│ uint32 BE  │
//! └──────┴────────────┴──────────┴──────────┴──────────┴────────────┘
//!
//! Inline:
//! ┌──────┬──────────────────┐
//! │ 0x02 │ Payload bytes    │
//! └──────┴──────────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use bytes::Bytes;

use crate::arena::PoolId;
use crate::error::{Result, ShmwireError};

/// Size of the blob length prefix.
pub const BLOB_PREFIX_SIZE: usize = 4;

/// Envelope tag: payload lives in a shared-memory segment.
pub const TAG_SHM_HANDLE: u8 = 0x01;

/// Envelope tag: payload follows inline.
pub const TAG_INLINE: u8 = 0x02;

/// Encoded size of an SHM handle envelope.
pub const SHM_HANDLE_SIZE: usize = 25;

/// Encode a blob length prefix.
#[inline]
pub fn encode_blob_prefix(len: u32) -> [u8; BLOB_PREFIX_SIZE] {
    len.to_be_bytes()
}

/// Decode a blob length prefix. Returns `None` if `buf` is too short.
#[inline]
pub fn decode_blob_prefix(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; BLOB_PREFIX_SIZE] = buf.get(..BLOB_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Location of a message payload inside a lender's arena pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmHandle {
    pub pool: PoolId,
    /// Offset of the payload from the start of the pool mapping.
    pub offset: u64,
    /// Payload length in bytes.
    pub len: u32,
    /// Generation of the segment when it was sent.
    pub generation: u32,
}

impl ShmHandle {
    pub fn encode(&self) -> [u8; SHM_HANDLE_SIZE] {
        let mut buf = [0u8; SHM_HANDLE_SIZE];
        buf[0] = TAG_SHM_HANDLE;
        buf[1..5].copy_from_slice(&self.pool.lender_pid.to_be_bytes());
        buf[5..9].copy_from_slice(&self.pool.seq.to_be_bytes());
        buf[9..17].copy_from_slice(&self.offset.to_be_bytes());
        buf[17..21].copy_from_slice(&self.len.to_be_bytes());
        buf[21..25].copy_from_slice(&self.generation.to_be_bytes());
        buf
    }

    fn decode_body(buf: &[u8]) -> Option<Self> {
        if buf.len() != SHM_HANDLE_SIZE {
            return None;
        }
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[9..17]);
        Some(Self {
            pool: PoolId::new(u32_at(1), u32_at(5)),
            offset: u64::from_be_bytes(offset),
            len: u32_at(17),
            generation: u32_at(21),
        })
    }
}

/// A decoded structured-channel blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Shm(ShmHandle),
    Inline(Bytes),
}

impl Envelope {
    /// Parse a received blob. Inline payloads share the blob's storage.
    pub fn decode(blob: Bytes) -> Result<Self> {
        match blob.first() {
            Some(&TAG_SHM_HANDLE) => ShmHandle::decode_body(&blob)
                .map(Envelope::Shm)
                .ok_or_else(|| {
                    ShmwireError::Protocol(format!(
                        "SHM handle envelope must be {} bytes, got {}",
                        SHM_HANDLE_SIZE,
                        blob.len()
                    ))
                }),
            Some(&TAG_INLINE) => Ok(Envelope::Inline(blob.slice(1..))),
            Some(tag) => Err(ShmwireError::Protocol(format!(
                "Unknown envelope tag 0x{:02X}",
                tag
            ))),
            None => Err(ShmwireError::Protocol("Empty structured message".to_string())),
        }
    }
}
