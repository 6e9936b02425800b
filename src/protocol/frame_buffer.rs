//! Blob buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so complete blobs are split off and frozen without
//! copying. A small state machine handles fragmented input:
//! - `WaitingForPrefix`: need at least 4 bytes
//! - `WaitingForBody`: prefix parsed, need N more bytes
//!
//! # Example
//!
//! ```
//! use shmwire::protocol::{encode_blob_prefix, BlobBuffer};
//!
//! let mut buffer = BlobBuffer::new(1024);
//! let mut wire = encode_blob_prefix(5).to_vec();
//! wire.extend_from_slice(b"hello");
//!
//! let blobs = buffer.push(&wire).unwrap();
//! assert_eq!(&blobs[0][..], b"hello");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{decode_blob_prefix, BLOB_PREFIX_SIZE};
use crate::error::{Result, ShmwireError};

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForPrefix,
    WaitingForBody { remaining: usize },
}

/// Buffer that turns a byte stream back into length-delimited blobs.
pub struct BlobBuffer {
    buffer: BytesMut,
    state: State,
    max_blob_size: usize,
}

impl BlobBuffer {
    /// Create a buffer rejecting blobs larger than `max_blob_size`.
    pub fn new(max_blob_size: usize) -> Self {
        Self::with_capacity(64 * 1024, max_blob_size)
    }

    pub fn with_capacity(capacity: usize, max_blob_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForPrefix,
            max_blob_size,
        }
    }

    /// Push data and extract all complete blobs.
    ///
    /// # Errors
    ///
    /// `Protocol` if a blob announces a length above the maximum.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut blobs = Vec::new();
        while let Some(blob) = self.try_extract()? {
            blobs.push(blob);
        }
        Ok(blobs)
    }

    /// Storage that socket reads append to directly.
    ///
    /// Follow reads with [`try_extract`](Self::try_extract).
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Extract one complete blob, or `None` if more data is needed.
    pub fn try_extract(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let Some(len) = decode_blob_prefix(&self.buffer) else {
                        return Ok(None);
                    };
                    let len = len as usize;
                    if len > self.max_blob_size {
                        return Err(ShmwireError::Protocol(format!(
                            "Blob size {} exceeds maximum {}",
                            len, self.max_blob_size
                        )));
                    }

                    let _ = self.buffer.split_to(BLOB_PREFIX_SIZE);
                    self.state = State::WaitingForBody { remaining: len };
                }
                State::WaitingForBody { remaining } => {
                    if self.buffer.len() < remaining {
                        // Reserve the rest of the body so one read can finish it
                        self.buffer.reserve(remaining - self.buffer.len());
                        return Ok(None);
                    }
                    let blob = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForPrefix;
                    return Ok(Some(blob));
                }
            }
        }
    }

    /// Number of buffered bytes not yet returned as blobs.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True when a blob has been started but not completed.
    pub fn is_mid_blob(&self) -> bool {
        matches!(self.state, State::WaitingForBody { .. }) || !self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}
