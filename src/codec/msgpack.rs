//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always encoded as maps with field names (`write_named` /
//! `to_vec_named`), so readers built against a newer struct definition can
//! still decode older messages.
//!
//! # Example
//!
//! ```
//! use shmwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let mut sink = Vec::new();
//! let written = MsgPackCodec::encode_into(&mut sink, &msg).unwrap();
//! assert_eq!(written, sink.len());
//!
//! let decoded: Message = MsgPackCodec::decode(&sink).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use std::io::Write;

use crate::error::Result;

/// MessagePack codec for structured payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to a freshly allocated buffer.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Encode a value into `sink`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an encode error if the value cannot be serialized or the sink
    /// runs out of room.
    pub fn encode_into<W, T>(sink: &mut W, value: &T) -> Result<usize>
    where
        W: Write,
        T: serde::Serialize + ?Sized,
    {
        let mut counting = CountingWriter {
            inner: sink,
            written: 0,
        };
        rmp_serde::encode::write_named(&mut counting, value)?;
        Ok(counting.written)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

struct CountingWriter<'a, W> {
    inner: &'a mut W,
    written: usize,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_named_fields_produce_map_format() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackCodec::encode(&test).unwrap();

        // fixmap with 3 entries, not fixarray (0x93)
        assert_eq!(encoded[0], 0x83, "Expected fixmap, got {:02X}", encoded[0]);
    }

    #[test]
    fn test_encode_into_matches_encode() {
        let value = TestStruct {
            id: 7,
            name: "same bytes".to_string(),
            active: true,
        };

        let mut sink = Vec::new();
        let written = MsgPackCodec::encode_into(&mut sink, &value).unwrap();

        assert_eq!(written, sink.len());
        assert_eq!(sink, MsgPackCodec::encode(&value).unwrap());
    }

    #[test]
    fn test_encode_into_fixed_slice_overflow() {
        let value = vec![0u32; 64];
        let mut storage = [0u8; 8];
        let mut cursor = &mut storage[..];

        let result = MsgPackCodec::encode_into(&mut cursor, &value);
        assert!(result.is_err());
    }

    #[test]
    fn test_binary_payload() {
        let data: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let encoded = MsgPackCodec::encode(&serde_bytes::Bytes::new(&data)).unwrap();

        assert_eq!(encoded[0], 0xc4, "Expected bin8 format");

        let decoded: serde_bytes::ByteBuf = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<TestStruct> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_option_none_is_nil() {
        let val: Option<i32> = None;
        let encoded = MsgPackCodec::encode(&val).unwrap();
        assert_eq!(encoded, vec![0xc0]);
    }
}
