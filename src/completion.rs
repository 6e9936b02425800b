//! One-shot completion handlers for asynchronous operations.
//!
//! Every `async_*` operation in this crate returns a [`Completion`]. A
//! completion is either already resolved (the operation finished
//! synchronously) or pending (the result arrives once the reactor drives the
//! operation to its end). Either way it resolves exactly once.
//!
//! The sending half is a [`Completer`]. Dropping a completer that never fired
//! resolves its completion with [`ShmwireError::Cancelled`], so a started
//! operation can never vanish without an outcome.
//!
//! # Example
//!
//! ```
//! use shmwire::completion::Completion;
//!
//! let mut done: Completion<usize> = Completion::ready(Ok(0));
//! assert!(done.is_ready());
//! assert_eq!(done.try_take().unwrap().unwrap(), 0);
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, ShmwireError};

type Handler<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Handler slot shared by a completer and its completion. Holding the lock
/// makes "look for a result, else park the handler" atomic against firing.
type Hook<T> = Arc<Mutex<Option<Handler<T>>>>;

/// Something that will eventually produce a result.
trait PendingResult<T>: Send {
    fn poll_result(&mut self, cx: &mut Context<'_>) -> Poll<Result<T>>;
    fn try_result(&mut self) -> Option<Result<T>>;
    fn on_result(self: Box<Self>, handler: Handler<T>);
}

struct Receiver<T> {
    rx: oneshot::Receiver<Result<T>>,
    hook: Hook<T>,
}

impl<T: Send> PendingResult<T> for Receiver<T> {
    fn poll_result(&mut self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ShmwireError::Cancelled)))
    }

    fn try_result(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ShmwireError::Cancelled)),
        }
    }

    fn on_result(self: Box<Self>, handler: Handler<T>) {
        let Receiver { mut rx, hook } = *self;
        let mut slot = hook.lock();
        let result = match rx.try_recv() {
            Ok(r) => r,
            Err(oneshot::error::TryRecvError::Closed) => Err(ShmwireError::Cancelled),
            Err(oneshot::error::TryRecvError::Empty) => {
                *slot = Some(handler);
                return;
            }
        };
        drop(slot);
        handler(result);
    }
}

struct Then<U, F> {
    inner: Completion<U>,
    f: Option<F>,
}

impl<T, U, F> Then<U, F>
where
    F: FnOnce(Result<U>) -> Result<T>,
{
    fn apply(&mut self, r: Result<U>) -> Result<T> {
        match self.f.take() {
            Some(f) => f(r),
            None => Err(ShmwireError::Usage("completion polled after it resolved".into())),
        }
    }
}

impl<T, U, F> PendingResult<T> for Then<U, F>
where
    T: 'static,
    U: Send + 'static,
    F: FnOnce(Result<U>) -> Result<T> + Send + 'static,
{
    fn poll_result(&mut self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(r) => Poll::Ready(self.apply(r)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn try_result(&mut self) -> Option<Result<T>> {
        let r = self.inner.try_take()?;
        Some(self.apply(r))
    }

    fn on_result(self: Box<Self>, handler: Handler<T>) {
        let mut then = *self;
        let f = then.f.take();
        then.inner.on_complete(move |r| match f {
            Some(f) => handler(f(r)),
            None => handler(Err(ShmwireError::Usage("completion polled after it resolved".into()))),
        });
    }
}

enum State<T> {
    Ready(Option<Result<T>>),
    Pending(Box<dyn PendingResult<T>>),
}

/// The outcome of one asynchronous operation.
///
/// Implements `Future<Output = Result<T>>`; can also be inspected without a
/// task context via [`try_take`](Completion::try_take).
#[must_use = "a completion carries the only report of the operation's outcome"]
pub struct Completion<T> {
    state: State<T>,
}

impl<T: Send + 'static> Completion<T> {
    /// A completion that resolved synchronously.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }

    /// Create a pending completion and the completer that resolves it.
    pub fn pending() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        let hook: Hook<T> = Arc::new(Mutex::new(None));
        (
            Completer {
                tx: Some(tx),
                hook: hook.clone(),
            },
            Self {
                state: State::Pending(Box::new(Receiver { rx, hook })),
            },
        )
    }

    /// True if the result was available when the operation returned.
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// True if the operation is in flight and will complete via the reactor.
    #[inline]
    pub fn would_block(&self) -> bool {
        !self.is_ready()
    }

    /// Take the result if it is available now.
    ///
    /// Returns `None` while the operation is still in flight. Once a result
    /// has been taken further calls report a usage error.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        let result = match &mut self.state {
            State::Ready(slot) => Some(slot.take().unwrap_or_else(|| {
                Err(ShmwireError::Usage("completion result already taken".into()))
            })),
            State::Pending(p) => p.try_result(),
        };
        if result.is_some() {
            self.state = State::Ready(None);
        }
        result
    }

    /// Transform a successful result.
    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |v| Ok(f(v)))
    }

    /// Chain a fallible transformation onto a successful result.
    pub fn and_then<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        self.then(move |r| r.and_then(f))
    }

    /// Chain a transformation that sees the success or the error.
    ///
    /// Ready completions are transformed immediately, so synchronous results
    /// stay synchronous.
    pub fn then<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        match self.state {
            State::Ready(Some(r)) => Completion::ready(f(r)),
            State::Ready(None) => Completion::ready(Err(ShmwireError::Usage(
                "completion result already taken".into(),
            ))),
            state @ State::Pending(_) => Completion {
                state: State::Pending(Box::new(Then {
                    inner: Completion { state },
                    f: Some(f),
                })),
            },
        }
    }

    /// Invoke `handler` with the result.
    ///
    /// Ready results invoke the handler before this call returns. Pending
    /// ones invoke it on the thread that resolves the operation (usually a
    /// reactor task), inside the resolving call. No runtime is needed on the
    /// calling thread.
    pub fn on_complete<F>(self, handler: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        match self.state {
            State::Ready(Some(r)) => handler(r),
            State::Ready(None) => handler(Err(ShmwireError::Usage(
                "completion result already taken".into(),
            ))),
            State::Pending(p) => p.on_result(Box::new(handler)),
        }
    }
}

// Never pin-projected; the pending state is already boxed.
impl<T> Unpin for Completion<T> {}

impl<T: Send + 'static> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let poll = match &mut this.state {
            State::Ready(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                Err(ShmwireError::Usage("completion result already taken".into()))
            })),
            State::Pending(p) => p.poll_result(cx),
        };
        if poll.is_ready() {
            this.state = State::Ready(None);
        }
        poll
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "taken",
            State::Pending(_) => "pending",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}

/// Sending half of a pending [`Completion`].
pub struct Completer<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
    hook: Hook<T>,
}

impl<T> Completer<T> {
    /// Resolve the completion.
    ///
    /// A handler registered with [`Completion::on_complete`] runs before this
    /// returns. A completion nobody waits on anymore silently discards the
    /// result.
    pub fn complete(mut self, result: Result<T>) {
        self.fire(result);
    }

    /// Resolve the completion with [`ShmwireError::Cancelled`].
    pub fn cancel(self) {
        self.complete(Err(ShmwireError::Cancelled));
    }

    fn fire(&mut self, result: Result<T>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let mut slot = self.hook.lock();
        match slot.take() {
            Some(handler) => {
                drop(slot);
                handler(result);
            }
            None => {
                let _ = tx.send(result);
            }
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.fire(Err(ShmwireError::Cancelled));
    }
}

/// Completers taken out of a [`PendingOps`] together with their results.
///
/// Owners detach them while holding their state lock and fire them once the
/// lock is released, so completion handlers may call back into the owner.
#[must_use = "detached completers resolve with Cancelled unless fired"]
pub(crate) struct Detached<T> {
    entries: Vec<(Completer<T>, Result<T>)>,
}

impl<T> Detached<T> {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub(crate) fn extend(&mut self, other: Detached<T>) {
        self.entries.extend(other.entries);
    }

    /// Resolve every completion, oldest first. Returns how many.
    pub(crate) fn fire(self) -> usize {
        let count = self.entries.len();
        for (completer, result) in self.entries {
            completer.complete(result);
        }
        count
    }
}

/// Identifier of an operation registered in [`PendingOps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

/// Ordered set of outstanding operations for one direction of an object.
///
/// Operations are kept in issue order, so completing from the front preserves
/// the per-direction ordering guarantee.
pub(crate) struct PendingOps<T> {
    next_id: u64,
    ops: VecDeque<(OpId, Completer<T>)>,
}

impl<T: Send + 'static> PendingOps<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            ops: VecDeque::new(),
        }
    }

    /// Register a new operation at the back of the queue.
    pub(crate) fn push(&mut self) -> (OpId, Completion<T>) {
        let (completer, completion) = Completion::pending();
        let id = OpId(self.next_id);
        self.next_id += 1;
        self.ops.push_back((id, completer));
        (id, completion)
    }

    pub(crate) fn front_id(&self) -> Option<OpId> {
        self.ops.front().map(|(id, _)| *id)
    }

    /// Detach the oldest operation with its result. Empty if none is waiting.
    pub(crate) fn complete_front(&mut self, result: Result<T>) -> Detached<T> {
        let mut detached = Detached::new();
        if let Some((_, completer)) = self.ops.pop_front() {
            detached.entries.push((completer, result));
        }
        detached
    }

    /// Detach a specific operation with its result. Empty if it is no longer
    /// registered.
    pub(crate) fn complete(&mut self, id: OpId, result: Result<T>) -> Detached<T> {
        let mut detached = Detached::new();
        if let Some(pos) = self.ops.iter().position(|(op, _)| *op == id) {
            if let Some((_, completer)) = self.ops.remove(pos) {
                detached.entries.push((completer, result));
            }
        }
        detached
    }

    /// Detach every outstanding operation with `err()`, oldest first.
    pub(crate) fn fail_all(&mut self, err: impl Fn() -> ShmwireError) -> Detached<T> {
        Detached {
            entries: self.ops.drain(..).map(|(_, c)| (c, Err(err()))).collect(),
        }
    }

    /// Detach every outstanding operation with `Cancelled`.
    pub(crate) fn cancel_all(&mut self) -> Detached<T> {
        self.fail_all(|| ShmwireError::Cancelled)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_completion() {
        let mut c = Completion::ready(Ok(5usize));
        assert!(c.is_ready());
        assert!(!c.would_block());
        assert_eq!(c.try_take().unwrap().unwrap(), 5);
        assert!(matches!(c.try_take(), Some(Err(ShmwireError::Usage(_)))));
    }

    #[test]
    fn test_pending_then_completed() {
        let (completer, mut c) = Completion::<u32>::pending();
        assert!(c.would_block());
        assert!(c.try_take().is_none());

        completer.complete(Ok(7));
        assert_eq!(c.try_take().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_dropped_completer_cancels() {
        let (completer, mut c) = Completion::<u32>::pending();
        drop(completer);
        assert!(matches!(c.try_take(), Some(Err(ShmwireError::Cancelled))));
    }

    #[tokio::test]
    async fn test_await_pending() {
        let (completer, c) = Completion::<&'static str>::pending();
        tokio::spawn(async move { completer.complete(Ok("done")) });
        assert_eq!(c.await.unwrap(), "done");
    }

    #[test]
    fn test_and_then_ready_stays_ready() {
        let c = Completion::ready(Ok(2u32)).and_then(|v| Ok(v * 10));
        assert!(c.is_ready());
    }

    #[tokio::test]
    async fn test_and_then_pending() {
        let (completer, c) = Completion::<u32>::pending();
        let mapped = c.and_then(|v| Ok(v.to_string()));
        completer.complete(Ok(42));
        assert_eq!(mapped.await.unwrap(), "42");
    }

    #[test]
    fn test_then_sees_errors() {
        let (completer, c) = Completion::<u32>::pending();
        let mut recovered = c.then(|r| match r {
            Err(ShmwireError::PeerClosed) => Ok(0),
            other => other,
        });
        completer.complete(Err(ShmwireError::PeerClosed));
        assert_eq!(recovered.try_take().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_and_then_propagates_error() {
        let (completer, c) = Completion::<u32>::pending();
        let mut mapped = c.and_then(|v| Ok(v + 1));
        completer.complete(Err(ShmwireError::PeerClosed));
        assert!(matches!(mapped.try_take(), Some(Err(ShmwireError::PeerClosed))));
    }

    #[tokio::test]
    async fn test_on_complete_ready_runs_inline() {
        let hit = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hit2 = hit.clone();
        Completion::ready(Ok(())).on_complete(move |r| {
            assert!(r.is_ok());
            hit2.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(hit.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_on_complete_pending_runs_in_completer() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = seen.clone();
        let (completer, c) = Completion::<u32>::pending();

        // No runtime on this thread
        c.map(|v| v + 1).on_complete(move |r| log.lock().push(r.unwrap()));
        assert!(seen.lock().is_empty());

        completer.complete(Ok(41));
        assert_eq!(*seen.lock(), vec![42]);
    }

    #[test]
    fn test_on_complete_after_result_arrived() {
        let hit = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hit2 = hit.clone();
        let (completer, c) = Completion::<u32>::pending();
        completer.complete(Ok(1));

        c.on_complete(move |r| {
            assert_eq!(r.unwrap(), 1);
            hit2.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert!(hit.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_on_complete_sees_dropped_completer() {
        let cancelled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cancelled.clone();
        let (completer, c) = Completion::<u32>::pending();

        c.on_complete(move |r| {
            flag.store(matches!(r, Err(ShmwireError::Cancelled)), std::sync::atomic::Ordering::SeqCst);
        });
        drop(completer);
        assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_pending_ops_order() {
        let mut ops = PendingOps::<usize>::new();
        let (_, mut a) = ops.push();
        let (_, mut b) = ops.push();
        let (_, mut c) = ops.push();
        assert_eq!(ops.len(), 3);

        ops.complete_front(Ok(1)).fire();
        let second = ops.complete_front(Ok(2));
        assert!(b.try_take().is_none());
        assert_eq!(second.fire(), 1);
        assert_eq!(a.try_take().unwrap().unwrap(), 1);
        assert_eq!(b.try_take().unwrap().unwrap(), 2);
        assert!(c.try_take().is_none());
    }

    #[test]
    fn test_pending_ops_cancel_all() {
        let mut ops = PendingOps::<usize>::new();
        let mut completions: Vec<_> = (0..4).map(|_| ops.push().1).collect();

        let cancelled = ops.cancel_all();
        assert!(ops.is_empty());
        assert_eq!(cancelled.fire(), 4);
        for c in completions.iter_mut() {
            assert!(matches!(c.try_take(), Some(Err(ShmwireError::Cancelled))));
        }
    }

    #[test]
    fn test_pending_ops_complete_by_id() {
        let mut ops = PendingOps::<usize>::new();
        let (first, _a) = ops.push();
        let (second, mut b) = ops.push();

        assert_eq!(ops.front_id(), Some(first));
        assert_eq!(ops.complete(second, Ok(9)).fire(), 1);
        assert_eq!(ops.complete(second, Ok(10)).fire(), 0);
        assert_eq!(b.try_take().unwrap().unwrap(), 9);
        assert_eq!(ops.len(), 1);
    }
}
