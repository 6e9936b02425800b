//! Raw channel: a bidirectional, non-blocking blob pipe.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::reader::{reader_loop, Terminal};
use super::writer::{writer_loop, Outgoing};
use crate::completion::{Completion, PendingOps};
use crate::config::ChannelConfig;
use crate::error::{Result, ShmwireError};
use crate::reactor::ReactorHandle;

enum Socket {
    /// Not yet registered with a reactor.
    Idle(StdUnixStream),
    Registered {
        read: Option<OwnedReadHalf>,
        write: Arc<OwnedWriteHalf>,
    },
    Gone,
}

pub(crate) struct ChannelState {
    socket: Socket,
    reactor: Option<ReactorHandle>,
    started: bool,
    send_enabled: bool,
    recv_enabled: bool,
    pub(crate) closed: bool,
    send_end: Option<Terminal>,
    recv_end: Option<Terminal>,
    pub(crate) send_queue: VecDeque<Outgoing>,
    pub(crate) send_ops: PendingOps<usize>,
    pub(crate) writer_running: bool,
    inbox: VecDeque<Bytes>,
    recv_ops: PendingOps<Bytes>,
    recv_limits: VecDeque<usize>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelState {
    pub(crate) fn buffered(&self) -> usize {
        self.inbox.len()
    }
}

pub(crate) struct Shared {
    pub(crate) label: String,
    pub(crate) config: ChannelConfig,
    pub(crate) state: Mutex<ChannelState>,
    pub(crate) inbox_space: Notify,
    /// Held while receives are resolved, so a terminal failure never
    /// overtakes a delivery already taken off the queue.
    recv_turn: Mutex<()>,
}

impl Shared {
    /// Hand a received blob to the oldest waiting receive, or park it.
    pub(crate) fn deliver(&self, blob: Bytes) {
        let _turn = self.recv_turn.lock();
        let done = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            match state.recv_limits.pop_front() {
                Some(limit) => state.recv_ops.complete_front(fit(blob, limit)),
                None => {
                    state.inbox.push_back(blob);
                    return;
                }
            }
        };
        done.fire();
    }

    /// End the receive direction. Waiting receives resolve with the
    /// terminal error before this returns; returns how many.
    pub(crate) fn fail_receive(&self, terminal: Terminal) -> usize {
        let _turn = self.recv_turn.lock();
        let failed = {
            let mut state = self.state.lock();
            if state.closed || state.recv_end.is_some() {
                return 0;
            }
            tracing::debug!(
                target: "shmwire::channel",
                channel = %self.label,
                reason = ?terminal,
                waiting = state.recv_ops.len(),
                "Receive direction ended"
            );
            state.recv_limits.clear();
            let failed = state.recv_ops.fail_all(|| terminal.error());
            state.recv_end = Some(terminal);
            failed
        };
        failed.fire()
    }

    pub(crate) fn fail_send(&self, terminal: Terminal) {
        let failed = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.writer_running = false;
            state.send_queue.clear();
            let failed = state.send_ops.fail_all(|| terminal.error());
            state.send_end = Some(terminal);
            failed
        };
        failed.fire();
    }
}

/// Weak link from a session to one of its init-channels.
pub(crate) struct ChannelWatch(Weak<Shared>);

impl ChannelWatch {
    /// End the receive direction with `PeerClosed` if the channel is still
    /// alive. Returns how many waiting receives were failed.
    pub(crate) fn peer_lost(&self) -> usize {
        match self.0.upgrade() {
            Some(shared) => shared.fail_receive(Terminal::PeerClosed),
            None => 0,
        }
    }
}

fn fit(blob: Bytes, capacity: usize) -> Result<Bytes> {
    if blob.len() > capacity {
        Err(ShmwireError::MessageTruncated {
            size: blob.len(),
            capacity,
        })
    } else {
        Ok(blob)
    }
}

/// Bidirectional blob pipe over a local stream socket.
///
/// Each direction is started independently. Operations never block: they
/// return a [`Completion`] that is either ready at once or resolves later on
/// the channel's reactor. Completions of one direction resolve in issue
/// order. Closing or dropping the channel cancels everything outstanding.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> shmwire::Result<()> {
/// use shmwire::channel::RawChannel;
///
/// let (a, b) = RawChannel::pair()?;
/// a.start_send()?;
/// b.start_receive()?;
///
/// let sent = a.async_send(&b"ping"[..]).await?;
/// assert_eq!(sent, 4);
/// let blob = b.async_receive(64).await?;
/// assert_eq!(&blob[..], b"ping");
/// # Ok(())
/// # }
/// ```
pub struct RawChannel {
    shared: Arc<Shared>,
}

impl RawChannel {
    /// Wrap a connected stream socket.
    pub fn from_std(stream: StdUnixStream, config: ChannelConfig) -> Result<Self> {
        let label = format!("fd{}", stream.as_raw_fd());
        Self::with_label(stream, config, label)
    }

    pub(crate) fn with_label(
        stream: StdUnixStream,
        config: ChannelConfig,
        label: impl Into<String>,
    ) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            shared: Arc::new(Shared {
                label: label.into(),
                config,
                state: Mutex::new(ChannelState {
                    socket: Socket::Idle(stream),
                    reactor: None,
                    started: false,
                    send_enabled: false,
                    recv_enabled: false,
                    closed: false,
                    send_end: None,
                    recv_end: None,
                    send_queue: VecDeque::new(),
                    send_ops: PendingOps::new(),
                    writer_running: false,
                    inbox: VecDeque::new(),
                    recv_ops: PendingOps::new(),
                    recv_limits: VecDeque::new(),
                    tasks: Vec::new(),
                }),
                inbox_space: Notify::new(),
                recv_turn: Mutex::new(()),
            }),
        })
    }

    /// A connected pair of channels with default limits.
    pub fn pair() -> Result<(Self, Self)> {
        Self::pair_with_config(ChannelConfig::default())
    }

    pub fn pair_with_config(config: ChannelConfig) -> Result<(Self, Self)> {
        let (a, b) = StdUnixStream::pair()?;
        Ok((
            Self::with_label(a, config.clone(), "pair-a")?,
            Self::with_label(b, config, "pair-b")?,
        ))
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub(crate) fn watch(&self) -> ChannelWatch {
        ChannelWatch(Arc::downgrade(&self.shared))
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Install the reactor that drives this channel.
    ///
    /// Without it, the first `start_*` uses the tokio runtime it is called
    /// from.
    ///
    /// # Errors
    ///
    /// `Usage` once any direction has been started; `ChannelClosed` after
    /// close.
    pub fn replace_event_wait_handles<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce() -> ReactorHandle,
    {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(ShmwireError::ChannelClosed);
        }
        if state.started {
            return Err(ShmwireError::Usage(
                "event wait handles must be replaced before any direction is started".into(),
            ));
        }
        state.reactor = Some(factory());
        Ok(())
    }

    fn register(&self, state: &mut ChannelState) -> Result<()> {
        if state.closed {
            return Err(ShmwireError::ChannelClosed);
        }
        if state.started {
            return Ok(());
        }

        let reactor = match &state.reactor {
            Some(reactor) => reactor.clone(),
            None => ReactorHandle::current()?,
        };
        let Socket::Idle(stream) = std::mem::replace(&mut state.socket, Socket::Gone) else {
            return Err(ShmwireError::ChannelClosed);
        };

        let stream = reactor.enter(|| tokio::net::UnixStream::from_std(stream))?;
        let (read, write) = stream.into_split();
        state.socket = Socket::Registered {
            read: Some(read),
            write: Arc::new(write),
        };
        state.reactor = Some(reactor);
        state.started = true;

        tracing::trace!(target: "shmwire::channel", channel = %self.shared.label, "Registered with reactor");
        Ok(())
    }

    /// Allow `async_send`.
    pub fn start_send(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.register(&mut state)?;
        state.send_enabled = true;
        Ok(())
    }

    /// Allow `async_receive` and start reading from the socket.
    pub fn start_receive(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.register(&mut state)?;
        state.recv_enabled = true;

        let read = match &mut state.socket {
            Socket::Registered { read, .. } => read.take(),
            _ => None,
        };
        if let (Some(read), Some(reactor)) = (read, state.reactor.clone()) {
            let task = reactor.spawn(reader_loop(self.shared.clone(), read));
            state.tasks.push(task);
        }
        Ok(())
    }

    /// Refuse further `async_send` calls. Queued sends still complete.
    pub fn stop_send(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(ShmwireError::ChannelClosed);
        }
        state.send_enabled = false;
        Ok(())
    }

    /// Refuse further `async_receive` calls. Waiting receives still complete.
    pub fn stop_receive(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(ShmwireError::ChannelClosed);
        }
        state.recv_enabled = false;
        Ok(())
    }

    pub fn is_send_started(&self) -> bool {
        self.shared.state.lock().send_enabled
    }

    pub fn is_receive_started(&self) -> bool {
        self.shared.state.lock().recv_enabled
    }

    /// Send one blob.
    ///
    /// Resolves with the number of bytes sent. Empty blobs complete at once
    /// with 0 and never reach the wire.
    pub fn async_send(&self, blob: impl Into<Bytes>) -> Completion<usize> {
        let blob = blob.into();
        let mut state = self.shared.state.lock();

        if state.closed {
            return Completion::ready(Err(ShmwireError::ChannelClosed));
        }
        if !state.send_enabled {
            return Completion::ready(Err(ShmwireError::NotReady));
        }
        if blob.is_empty() {
            return Completion::ready(Ok(0));
        }
        if blob.len() > self.shared.config.max_blob_size || blob.len() > u32::MAX as usize {
            return Completion::ready(Err(ShmwireError::Usage(format!(
                "blob of {} bytes exceeds the channel maximum of {}",
                blob.len(),
                self.shared.config.max_blob_size
            ))));
        }
        if let Some(end) = &state.send_end {
            return Completion::ready(Err(end.error()));
        }
        let socket = match &state.socket {
            Socket::Registered { write, .. } => write.clone(),
            _ => return Completion::ready(Err(ShmwireError::NotReady)),
        };

        let mut entry = Outgoing::new(blob);
        if state.send_queue.is_empty() {
            match entry.write_to(&socket) {
                Ok(true) => return Completion::ready(Ok(entry.body_len())),
                Ok(false) => {}
                Err(e) => {
                    let terminal = Terminal::from_io(&e);
                    let err = terminal.error();
                    state.send_end = Some(terminal);
                    return Completion::ready(Err(err));
                }
            }
        }

        let (id, completion) = state.send_ops.push();
        entry.id = Some(id);
        state.send_queue.push_back(entry);

        if !state.writer_running {
            if let Some(reactor) = state.reactor.clone() {
                state.writer_running = true;
                state.tasks.retain(|t| !t.is_finished());
                let task = reactor.spawn(writer_loop(self.shared.clone(), socket));
                state.tasks.push(task);
            }
        }

        tracing::trace!(
            target: "shmwire::channel",
            channel = %self.shared.label,
            queued = state.send_queue.len(),
            "Send would block"
        );
        completion
    }

    /// Receive one blob of at most `max_len` bytes.
    ///
    /// A larger blob is consumed and reported as `MessageTruncated`.
    pub fn async_receive(&self, max_len: usize) -> Completion<Bytes> {
        let mut state = self.shared.state.lock();

        if state.closed {
            return Completion::ready(Err(ShmwireError::ChannelClosed));
        }
        if !state.recv_enabled {
            return Completion::ready(Err(ShmwireError::NotReady));
        }
        if let Some(blob) = state.inbox.pop_front() {
            drop(state);
            self.shared.inbox_space.notify_one();
            return Completion::ready(fit(blob, max_len));
        }
        if let Some(end) = &state.recv_end {
            return Completion::ready(Err(end.error()));
        }

        let (_, completion) = state.recv_ops.push();
        state.recv_limits.push_back(max_len);
        completion
    }

    /// Sends queued but not yet completed.
    pub fn pending_sends(&self) -> usize {
        self.shared.state.lock().send_ops.len()
    }

    /// Receives waiting for a blob.
    pub fn pending_receives(&self) -> usize {
        self.shared.state.lock().recv_ops.len()
    }

    /// Received blobs nobody has asked for yet.
    pub fn buffered_blobs(&self) -> usize {
        self.shared.state.lock().buffered()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close both directions.
    ///
    /// Every outstanding operation is resolved with `Cancelled` before this
    /// returns. Returns how many were cancelled.
    pub fn close(&self) -> usize {
        let (cancelled, tasks) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            state.send_enabled = false;
            state.recv_enabled = false;

            let cancelled = (state.send_ops.cancel_all(), state.recv_ops.cancel_all());
            state.send_queue.clear();
            state.recv_limits.clear();
            state.inbox.clear();
            state.writer_running = false;
            state.socket = Socket::Gone;
            (cancelled, std::mem::take(&mut state.tasks))
        };

        let cancelled = cancelled.0.fire() + cancelled.1.fire();
        for task in tasks {
            task.abort();
        }
        self.shared.inbox_space.notify_one();

        tracing::debug!(
            target: "shmwire::channel",
            channel = %self.shared.label,
            cancelled,
            "Channel closed"
        );
        cancelled
    }
}

impl Drop for RawChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RawChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RawChannel")
            .field("label", &self.shared.label)
            .field("send", &state.send_enabled)
            .field("receive", &state.recv_enabled)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn started_pair() -> (RawChannel, RawChannel) {
        let (a, b) = RawChannel::pair().unwrap();
        a.start_send().unwrap();
        a.start_receive().unwrap();
        b.start_send().unwrap();
        b.start_receive().unwrap();
        (a, b)
    }

    #[test]
    fn test_not_ready_before_start() {
        let (a, _b) = RawChannel::pair().unwrap();
        let mut send = a.async_send(&b"x"[..]);
        let mut recv = a.async_receive(16);
        assert!(matches!(send.try_take(), Some(Err(ShmwireError::NotReady))));
        assert!(matches!(recv.try_take(), Some(Err(ShmwireError::NotReady))));
    }

    #[test]
    fn test_start_outside_runtime_without_reactor() {
        let (a, _b) = RawChannel::pair().unwrap();
        assert!(a.start_send().unwrap_err().is_usage_error());
    }

    #[tokio::test]
    async fn test_zero_length_send_is_synchronous() {
        let (a, b) = started_pair();
        let mut done = a.async_send(Bytes::new());
        assert!(done.is_ready());
        assert_eq!(done.try_take().unwrap().unwrap(), 0);

        // Nothing reached the peer
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.buffered_blobs(), 0);
    }

    #[tokio::test]
    async fn test_small_send_completes_synchronously() {
        let (a, b) = started_pair();
        let mut done = a.async_send(&b"hello"[..]);
        assert!(done.is_ready());
        assert_eq!(done.try_take().unwrap().unwrap(), 5);

        let blob = b.async_receive(64).await.unwrap();
        assert_eq!(&blob[..], b"hello");
    }

    #[tokio::test]
    async fn test_replace_handles_after_start_rejected() {
        let (a, _b) = RawChannel::pair().unwrap();
        a.replace_event_wait_handles(|| ReactorHandle::current().unwrap())
            .unwrap();
        a.start_receive().unwrap();

        let err = a
            .replace_event_wait_handles(|| ReactorHandle::current().unwrap())
            .unwrap_err();
        assert!(matches!(err, ShmwireError::Usage(_)));
    }

    #[tokio::test]
    async fn test_injected_reactor_drives_channel() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let reactor = ReactorHandle::new(runtime.handle().clone());

        let (a, b) = RawChannel::pair().unwrap();
        a.replace_event_wait_handles(|| reactor.clone()).unwrap();
        b.replace_event_wait_handles(|| reactor.clone()).unwrap();
        a.start_send().unwrap();
        b.start_receive().unwrap();

        a.async_send(&b"via injected"[..]).await.unwrap();
        assert_eq!(&b.async_receive(64).await.unwrap()[..], b"via injected");

        drop(a);
        drop(b);
        runtime.shutdown_background();
    }

    #[tokio::test]
    async fn test_receive_order_matches_issue_order() {
        let (a, b) = started_pair();

        let waits: Vec<_> = (0..5).map(|_| b.async_receive(64)).collect();
        assert_eq!(b.pending_receives(), 5);

        for i in 0..5u8 {
            a.async_send(vec![i; 3]).await.unwrap();
        }
        for (i, wait) in waits.into_iter().enumerate() {
            assert_eq!(wait.await.unwrap().to_vec(), vec![i as u8; 3]);
        }
    }

    #[tokio::test]
    async fn test_send_order_under_backpressure() {
        let (a, b) = started_pair();
        let chunk = 512 * 1024;

        let sends: Vec<_> = (0..8u8).map(|i| a.async_send(vec![i; chunk])).collect();
        assert!(sends.iter().any(|s| s.would_block()));

        let mut received = Vec::new();
        for _ in 0..8 {
            received.push(b.async_receive(chunk).await.unwrap()[0]);
        }
        assert_eq!(received, (0..8u8).collect::<Vec<_>>());

        for send in sends {
            assert_eq!(send.await.unwrap(), chunk);
        }
    }

    #[tokio::test]
    async fn test_truncated_message() {
        let (a, b) = started_pair();
        a.async_send(vec![7u8; 100]).await.unwrap();
        a.async_send(vec![8u8; 10]).await.unwrap();

        let err = b.async_receive(50).await.unwrap_err();
        assert!(matches!(
            err,
            ShmwireError::MessageTruncated {
                size: 100,
                capacity: 50
            }
        ));
        // The oversized blob was consumed; the next one is intact
        assert_eq!(b.async_receive(50).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let (a, b) = started_pair();
        let waiting = b.async_receive(64);
        a.async_send(&b"last words"[..]).await.unwrap();
        drop(a);

        assert_eq!(&waiting.await.unwrap()[..], b"last words");
        assert!(matches!(b.async_receive(64).await, Err(ShmwireError::PeerClosed)));
        assert!(matches!(b.async_receive(64).await, Err(ShmwireError::PeerClosed)));
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding() {
        let (a, b) = started_pair();
        let k = 4;
        let mut waits: Vec<_> = (0..k).map(|_| b.async_receive(64)).collect();

        assert_eq!(b.close(), k);
        for wait in waits.iter_mut() {
            assert!(matches!(wait.try_take(), Some(Err(ShmwireError::Cancelled))));
        }
        assert_eq!(b.close(), 0);

        let mut after = b.async_receive(64);
        assert!(matches!(after.try_take(), Some(Err(ShmwireError::ChannelClosed))));
        let mut after = b.async_send(&b"x"[..]);
        assert!(matches!(after.try_take(), Some(Err(ShmwireError::ChannelClosed))));
        drop(a);
    }

    #[tokio::test]
    async fn test_drop_cancels_outstanding() {
        let (a, b) = started_pair();
        let mut waits: Vec<_> = (0..3).map(|_| b.async_receive(64)).collect();
        drop(b);
        for wait in waits.iter_mut() {
            assert!(matches!(wait.try_take(), Some(Err(ShmwireError::Cancelled))));
        }
        drop(a);
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let config = ChannelConfig::new().max_blob_size(8);
        let (a, _b) = RawChannel::pair_with_config(config).unwrap();
        a.start_send().unwrap();
        let err = a.async_send(vec![0u8; 9]).await.unwrap_err();
        assert!(err.is_usage_error());
    }

    #[tokio::test]
    async fn test_inbox_limit_pauses_reader() {
        let config = ChannelConfig::new().max_buffered_blobs(2);
        let (a, b) = RawChannel::pair_with_config(config).unwrap();
        a.start_send().unwrap();
        b.start_receive().unwrap();

        for i in 0..6u8 {
            let _ = a.async_send(vec![i; 4]);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.buffered_blobs() < 6);

        for i in 0..6u8 {
            assert_eq!(b.async_receive(4).await.unwrap()[0], i);
        }
    }
}
