//! Codec module - serialization of structured payloads.
//!
//! [`MsgPackCodec`] is the payload codec of structured channels. It can
//! encode into any `std::io::Write` sink, which is how messages are
//! serialized straight into a shared-memory segment without an intermediate
//! buffer.
//!
//! # Example
//!
//! ```
//! use shmwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
