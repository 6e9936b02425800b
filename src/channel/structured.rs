//! Structured channel: typed messages over a raw channel.
//!
//! With shared memory, a message is built inside the session's lent pool and
//! only a 25-byte handle crosses the socket:
//!
//! ```text
//! create_message ─► SegmentMut (lent pool) ─► encode ─► async_send_struct
//!                                                          │ [0x01 | pool | offset | len | gen]
//!                                                          ▼
//! async_receive_struct ◄─ SegmentView (borrowed pool) ◄─ resolve
//! ```
//!
//! Without it, the payload is copied into the blob behind a `0x02` tag.

use std::sync::Arc;

use bytes::Bytes;

use super::message::{Body, MessageBuilder, MessageView};
use super::raw::RawChannel;
use crate::arena::{BorrowedPool, PoolHandle};
use crate::completion::Completion;
use crate::error::{Result, ShmwireError};
use crate::protocol::{Envelope, TAG_INLINE};
use crate::session::Session;

/// How a structured channel moves payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationMode {
    /// Build messages in the session's lent pool and send handles.
    #[default]
    ViaSessionShm,
    /// Copy every payload through the socket.
    InBand,
}

/// The pair of pools a session shares with its peer.
#[derive(Clone)]
pub struct ShmLink {
    lent: PoolHandle,
    borrowed: Arc<BorrowedPool>,
}

impl ShmLink {
    pub fn new(lent: PoolHandle, borrowed: BorrowedPool) -> Self {
        Self {
            lent,
            borrowed: Arc::new(borrowed),
        }
    }

    /// Our pool, written by us and read by the peer.
    pub fn lent(&self) -> &PoolHandle {
        &self.lent
    }

    /// The peer's pool, read in place.
    pub fn borrowed(&self) -> &BorrowedPool {
        &self.borrowed
    }
}

impl std::fmt::Debug for ShmLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmLink")
            .field("lent", &self.lent.id())
            .field("borrowed", &self.borrowed.id())
            .finish()
    }
}

/// Message channel layered on a [`RawChannel`].
///
/// # Example
///
/// ```ignore
/// let channel = StructuredChannel::new(raw, &session, SerializationMode::ViaSessionShm)?;
///
/// let mut message = channel.create_message(256)?;
/// message.encode(&request)?;
/// channel.async_send_struct(message).await?;
///
/// let reply = channel.async_receive_struct().await?;
/// let reply: Reply = reply.decode()?;
/// ```
pub struct StructuredChannel {
    raw: RawChannel,
    link: Option<ShmLink>,
    zero_copy: bool,
}

impl StructuredChannel {
    /// Bind `raw` to `session` and start both directions.
    ///
    /// Falls back to in-band copying when the session has no shared memory.
    pub fn new(raw: RawChannel, session: &Session, mode: SerializationMode) -> Result<Self> {
        let link = session.shm_link();
        let zero_copy = mode == SerializationMode::ViaSessionShm && link.is_some();
        if mode == SerializationMode::ViaSessionShm && !zero_copy {
            tracing::debug!(
                target: "shmwire::channel",
                channel = %raw.label(),
                session = %session,
                "No shared memory on session, structured channel copies in-band"
            );
        }
        Self::bind(raw, link, zero_copy)
    }

    /// A channel that always copies.
    pub fn in_band(raw: RawChannel) -> Result<Self> {
        Self::bind(raw, None, false)
    }

    /// A zero-copy channel over an explicit pair of pools.
    pub fn with_shm(raw: RawChannel, link: ShmLink) -> Result<Self> {
        Self::bind(raw, Some(link), true)
    }

    fn bind(raw: RawChannel, link: Option<ShmLink>, zero_copy: bool) -> Result<Self> {
        raw.start_send()?;
        raw.start_receive()?;
        Ok(Self {
            raw,
            link,
            zero_copy,
        })
    }

    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy
    }

    pub fn raw(&self) -> &RawChannel {
        &self.raw
    }

    pub fn into_raw(self) -> RawChannel {
        self.raw
    }

    /// Start a message of at most `capacity` payload bytes.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the lent pool has no room; `StalePool` if it
    /// was torn down; `Usage` if an in-band message could never be sent.
    pub fn create_message(&self, capacity: usize) -> Result<MessageBuilder> {
        match (&self.link, self.zero_copy) {
            (Some(link), true) => Ok(MessageBuilder::shm(link.lent.allocate(capacity)?)),
            _ => {
                let limit = self.raw.config().max_blob_size.saturating_sub(1);
                if capacity > limit {
                    return Err(ShmwireError::Usage(format!(
                        "message capacity {} exceeds the in-band maximum of {}",
                        capacity, limit
                    )));
                }
                Ok(MessageBuilder::in_band(capacity))
            }
        }
    }

    /// Send a finished message.
    ///
    /// On a zero-copy channel the message must have been created by this
    /// channel's [`create_message`](Self::create_message); anything else is
    /// an `InvalidArenaReference`.
    pub fn async_send_struct(&self, message: MessageBuilder) -> Completion<()> {
        match message.into_body() {
            Body::Shm(segment) => {
                if !self.zero_copy {
                    let mut blob = Vec::with_capacity(segment.len() + 1);
                    blob.push(TAG_INLINE);
                    blob.extend_from_slice(segment.as_slice());
                    return self.raw.async_send(blob).map(|_| ());
                }
                let Some(link) = self.link.as_ref().filter(|l| segment.belongs_to(&l.lent)) else {
                    return Completion::ready(Err(ShmwireError::InvalidArenaReference(format!(
                        "message in {} was not allocated from this channel's pool",
                        segment.pool_id()
                    ))));
                };

                let handle = match segment.into_handle() {
                    Ok(handle) => handle,
                    Err(e) => return Completion::ready(Err(e)),
                };
                let pool = link.lent.clone();
                self.raw
                    .async_send(Bytes::copy_from_slice(&handle.encode()))
                    .then(move |result| match result {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            pool.reclaim(&handle);
                            Err(e)
                        }
                    })
            }
            Body::InBand { buf, .. } => {
                if self.zero_copy {
                    return Completion::ready(Err(ShmwireError::InvalidArenaReference(
                        "message was built outside the session arena".into(),
                    )));
                }
                self.raw.async_send(buf).map(|_| ())
            }
        }
    }

    /// Receive the next message.
    pub fn async_receive_struct(&self) -> Completion<MessageView> {
        let borrowed = self.link.as_ref().map(|l| l.borrowed.clone());
        self.raw
            .async_receive(self.raw.config().max_blob_size)
            .and_then(move |blob| match Envelope::decode(blob)? {
                Envelope::Inline(bytes) => Ok(MessageView::in_band(bytes)),
                Envelope::Shm(handle) => {
                    let pool = borrowed.ok_or_else(|| {
                        ShmwireError::Protocol(format!(
                            "received a handle into {} but no pool is borrowed",
                            handle.pool
                        ))
                    })?;
                    Ok(MessageView::shm(pool.resolve(&handle)?))
                }
            })
    }

    /// Close the underlying raw channel. See [`RawChannel::close`].
    pub fn close(&self) -> usize {
        self.raw.close()
    }
}

impl std::fmt::Debug for StructuredChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredChannel")
            .field("raw", &self.raw)
            .field("zero_copy", &self.zero_copy)
            .finish()
    }
}
