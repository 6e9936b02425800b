//! Outgoing and incoming structured messages.

use std::io;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::arena::{SegmentMut, SegmentView};
use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::protocol::TAG_INLINE;

pub(crate) enum Body {
    Shm(SegmentMut),
    /// Heap buffer that already starts with the inline envelope tag.
    InBand { buf: Vec<u8>, capacity: usize },
}

/// A message under construction.
///
/// On a zero-copy channel the bytes go straight into a segment of the
/// session's lent pool; otherwise into a heap buffer. Either way the
/// builder has a fixed capacity and writes past it fail.
pub struct MessageBuilder {
    body: Body,
}

impl MessageBuilder {
    pub(crate) fn shm(segment: SegmentMut) -> Self {
        Self {
            body: Body::Shm(segment),
        }
    }

    pub(crate) fn in_band(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity + 1);
        buf.push(TAG_INLINE);
        Self {
            body: Body::InBand { buf, capacity },
        }
    }

    pub(crate) fn into_body(self) -> Body {
        self.body
    }

    /// Serialize `value` as MessagePack (named fields) at the current end of
    /// the message. Returns the number of bytes written.
    pub fn encode<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<usize> {
        MsgPackCodec::encode_into(self, value)
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.body {
            Body::Shm(segment) => segment.as_slice(),
            Body::InBand { buf, .. } => &buf[1..],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match &self.body {
            Body::Shm(segment) => segment.capacity(),
            Body::InBand { capacity, .. } => *capacity,
        }
    }

    /// True if the message lives in shared memory.
    pub fn is_zero_copy(&self) -> bool {
        matches!(self.body, Body::Shm(_))
    }
}

impl io::Write for MessageBuilder {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.body {
            Body::Shm(segment) => segment.write(data),
            Body::InBand { buf, capacity } => {
                if data.is_empty() {
                    return Ok(0);
                }
                let room = *capacity - (buf.len() - 1);
                let n = data.len().min(room);
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("message full ({} bytes)", capacity),
                    ));
                }
                buf.extend_from_slice(&data[..n]);
                Ok(n)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("zero_copy", &self.is_zero_copy())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

enum View {
    Shm(SegmentView),
    InBand(Bytes),
}

/// A received structured message.
///
/// Zero-copy views read the sender's pool in place and give the segment
/// back when dropped. Reads fail with `StaleView` once the pool is gone.
pub struct MessageView {
    view: View,
}

impl MessageView {
    pub(crate) fn shm(view: SegmentView) -> Self {
        Self {
            view: View::Shm(view),
        }
    }

    pub(crate) fn in_band(bytes: Bytes) -> Self {
        Self {
            view: View::InBand(bytes),
        }
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        match &self.view {
            View::Shm(view) => view.bytes(),
            View::InBand(bytes) => Ok(bytes),
        }
    }

    /// Decode the payload as MessagePack.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(self.bytes()?)
    }

    pub fn len(&self) -> usize {
        match &self.view {
            View::Shm(view) => view.len(),
            View::InBand(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.view, View::Shm(_))
    }
}

impl std::fmt::Debug for MessageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageView")
            .field("zero_copy", &self.is_zero_copy())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_in_band_builder_capacity() {
        let mut builder = MessageBuilder::in_band(4);
        builder.write_all(b"abcd").unwrap();
        assert_eq!(builder.as_slice(), b"abcd");
        assert_eq!(
            builder.write(b"e").unwrap_err().kind(),
            io::ErrorKind::WriteZero
        );
        assert!(!builder.is_zero_copy());
    }

    #[test]
    fn test_encode_then_view_decode() {
        let mut builder = MessageBuilder::in_band(64);
        let n = builder.encode(&Point { x: 3, y: -4 }).unwrap();
        assert_eq!(n, builder.len());

        let view = MessageView::in_band(Bytes::copy_from_slice(builder.as_slice()));
        assert_eq!(view.decode::<Point>().unwrap(), Point { x: 3, y: -4 });
        assert!(!view.is_zero_copy());
    }

    #[test]
    fn test_encode_overflow_fails() {
        let mut builder = MessageBuilder::in_band(2);
        assert!(builder.encode(&"a string longer than two bytes").is_err());
    }
}
