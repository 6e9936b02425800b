//! Integration tests for the channel stack below sessions.
//!
//! These tests verify the integration between framing, codec, arena and
//! channels without going through a handshake.

use std::io::Write;

use bytes::Bytes;
use shmwire::app::ProcessIdentity;
use shmwire::arena::ArenaRepository;
use shmwire::codec::MsgPackCodec;
use shmwire::config::{ArenaConfig, ChannelConfig};
use shmwire::protocol::{encode_blob_prefix, BlobBuffer, Envelope};
use shmwire::{RawChannel, ReactorHandle, ShmLink, ShmwireError, StructuredChannel};

fn started_pair(config: ChannelConfig) -> (RawChannel, RawChannel) {
    let (a, b) = RawChannel::pair_with_config(config).unwrap();
    for ch in [&a, &b] {
        ch.start_send().unwrap();
        ch.start_receive().unwrap();
    }
    (a, b)
}

/// MsgPack payloads survive the blob framing intact.
#[test]
fn test_blob_with_msgpack_payload() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Payload {
        id: i32,
        message: String,
    }

    let payload = Payload {
        id: 42,
        message: "Hello, world!".to_string(),
    };
    let body = MsgPackCodec::encode(&payload).unwrap();

    let mut wire = encode_blob_prefix(body.len() as u32).to_vec();
    wire.extend_from_slice(&body);

    let mut buffer = BlobBuffer::new(1024);
    let blobs = buffer.push(&wire).unwrap();
    assert_eq!(blobs.len(), 1);

    let decoded: Payload = MsgPackCodec::decode(&blobs[0]).unwrap();
    assert_eq!(decoded, payload);
}

/// Byte-at-a-time delivery still yields whole blobs.
#[test]
fn test_fragmented_blob_parsing() {
    let body = MsgPackCodec::encode(&"test data for fragmentation").unwrap();
    let mut wire = encode_blob_prefix(body.len() as u32).to_vec();
    wire.extend_from_slice(&body);

    let mut buffer = BlobBuffer::new(1024);
    let mut blobs = Vec::new();
    for byte in &wire {
        blobs.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
        if blobs.is_empty() {
            assert!(buffer.is_mid_blob());
        }
    }

    assert_eq!(blobs.len(), 1);
    assert!(!buffer.is_mid_blob());
    let decoded: String = MsgPackCodec::decode(&blobs[0]).unwrap();
    assert_eq!(decoded, "test data for fragmentation");
}

/// An inline envelope shares the received blob.
#[test]
fn test_inline_envelope() {
    let blob = Bytes::from_static(&[0x02, b'o', b'k']);
    match Envelope::decode(blob).unwrap() {
        Envelope::Inline(body) => assert_eq!(&body[..], b"ok"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(Envelope::decode(Bytes::from_static(&[0x7F])).is_err());
}

#[tokio::test]
async fn test_large_blobs_cross_intact() {
    let (a, b) = started_pair(ChannelConfig::default());
    let blob: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let send = a.async_send(blob.clone());
    let received = b.async_receive(blob.len()).await.unwrap();
    assert_eq!(send.await.unwrap(), blob.len());
    assert_eq!(received.len(), blob.len());
    assert!(received[..] == blob[..]);
}

#[tokio::test]
async fn test_both_directions_independent() {
    let (a, b) = started_pair(ChannelConfig::default());

    let a_recv = a.async_receive(16);
    let b_recv = b.async_receive(16);
    a.async_send(&b"to b"[..]).await.unwrap();
    b.async_send(&b"to a"[..]).await.unwrap();

    assert_eq!(&a_recv.await.unwrap()[..], b"to a");
    assert_eq!(&b_recv.await.unwrap()[..], b"to b");
}

#[tokio::test]
async fn test_stop_receive_keeps_waiters() {
    let (a, b) = started_pair(ChannelConfig::default());

    let waiting = b.async_receive(16);
    b.stop_receive().unwrap();
    let mut refused = b.async_receive(16);
    assert!(matches!(refused.try_take(), Some(Err(ShmwireError::NotReady))));

    a.async_send(&b"still delivered"[..]).await.unwrap();
    assert_eq!(&waiting.await.unwrap()[..], b"still delivered");
}

#[tokio::test]
async fn test_oversized_blob_from_peer_is_protocol_error() {
    // Hand-write a prefix the sending side would never produce
    let (raw_a, raw_b) = std::os::unix::net::UnixStream::pair().unwrap();
    let victim = RawChannel::from_std(raw_b, ChannelConfig::new().max_blob_size(16)).unwrap();
    victim.start_receive().unwrap();
    (&raw_a).write_all(&encode_blob_prefix(1 << 20)).unwrap();

    let err = victim.async_receive(16).await.unwrap_err();
    assert!(matches!(err, ShmwireError::Protocol(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_entry_points_from_plain_threads() {
    let reactor = ReactorHandle::current().unwrap();
    let (a, b) = RawChannel::pair().unwrap();
    for ch in [&a, &b] {
        ch.replace_event_wait_handles(|| reactor.clone()).unwrap();
        ch.start_send().unwrap();
        ch.start_receive().unwrap();
    }

    let handle = reactor.handle().clone();
    let sender = std::thread::spawn(move || {
        for i in 0..50u32 {
            let done = a.async_send(i.to_be_bytes().to_vec());
            handle.block_on(done).unwrap();
        }
        a
    });

    for i in 0..50u32 {
        let blob = b.async_receive(4).await.unwrap();
        assert_eq!(u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]), i);
    }
    let a = tokio::task::spawn_blocking(move || sender.join().unwrap()).await.unwrap();
    drop(a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_on_complete_from_plain_thread() {
    let (a, b) = started_pair(ChannelConfig::default());
    let (tx, rx) = std::sync::mpsc::channel();

    // The handler is registered where no runtime is entered
    let a = std::thread::spawn(move || {
        a.async_receive(16).on_complete(move |r| {
            let _ = tx.send(r.map(|blob| blob.to_vec()));
        });
        a
    })
    .join()
    .unwrap();

    b.async_send(&b"hello"[..]).await.unwrap();
    let got = tokio::task::spawn_blocking(move || rx.recv_timeout(std::time::Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.unwrap(), b"hello");
    drop(a);
}

#[tokio::test]
async fn test_close_with_queued_sends_cancels_them() {
    let (a, _b) = started_pair(ChannelConfig::default());
    let chunk = vec![0u8; 1024 * 1024];

    // Nobody reads on the other side, so the socket buffer fills up
    let mut sends: Vec<_> = (0..16).map(|_| a.async_send(chunk.clone())).collect();
    let queued = sends.iter().filter(|s| s.would_block()).count();
    assert!(queued > 0);

    assert_eq!(a.close(), queued);
    for send in sends.iter_mut().filter(|s| s.would_block()) {
        assert!(matches!(send.try_take(), Some(Err(ShmwireError::Cancelled))));
    }
}

#[tokio::test]
async fn test_structured_over_explicit_link() {
    let dir = tempfile::tempdir().unwrap();
    let config = ArenaConfig::new().pool_dir(dir.path());
    let left = ArenaRepository::new(ProcessIdentity::new("left", 7001), config.clone());
    let right = ArenaRepository::new(ProcessIdentity::new("right", 7002), config);

    let left_pool = left.create_pool(128 * 1024).unwrap();
    let right_pool = right.create_pool(128 * 1024).unwrap();
    let to_right = left.lend(&left_pool, &right.identity()).unwrap();
    let to_left = right.lend(&right_pool, &left.identity()).unwrap();

    let (ra, rb) = RawChannel::pair().unwrap();
    let a = StructuredChannel::with_shm(ra, ShmLink::new(left_pool.clone(), left.borrow(&to_left).unwrap())).unwrap();
    let b = StructuredChannel::with_shm(rb, ShmLink::new(right_pool, right.borrow(&to_right).unwrap())).unwrap();

    let mut message = a.create_message(4096).unwrap();
    message.write_all(&[0xAB; 4000]).unwrap();
    a.async_send_struct(message).await.unwrap();

    let view = b.async_receive_struct().await.unwrap();
    assert!(view.is_zero_copy());
    assert_eq!(view.bytes().unwrap(), &[0xAB; 4000][..]);
    assert_eq!(left_pool.live_segments(), 1);

    drop(view);
    // A released segment is reclaimed by the next allocation
    let again = a.create_message(4096).unwrap();
    assert_eq!(left_pool.live_segments(), 1);
    drop(again);
    assert_eq!(left_pool.live_segments(), 0);
    assert_eq!(left_pool.borrowers(), 1);
}
