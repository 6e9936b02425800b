//! Protocol module - blob framing and structured-message envelopes.
//!
//! - 4-byte length prefix that keeps blob boundaries on a stream socket
//! - Blob buffer for accumulating partial reads
//! - Envelope telling a structured receiver where the payload lives

mod frame_buffer;
mod wire_format;

pub use frame_buffer::BlobBuffer;
pub use wire_format::{
    decode_blob_prefix, encode_blob_prefix, Envelope, ShmHandle, BLOB_PREFIX_SIZE,
    SHM_HANDLE_SIZE, TAG_INLINE, TAG_SHM_HANDLE,
};
