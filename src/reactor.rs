//! Reactor integration.
//!
//! Channels never own an event loop. The application hands them a
//! [`ReactorHandle`] (via
//! [`RawChannel::replace_event_wait_handles`](crate::channel::RawChannel::replace_event_wait_handles))
//! and every readiness wait and pending completion is driven on that runtime.

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Result, ShmwireError};

/// Handle to the tokio runtime that drives a channel's I/O.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    handle: Handle,
}

impl ReactorHandle {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Handle of the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// `Usage` when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current().map(Self::new).map_err(|_| {
            ShmwireError::Usage("no reactor supplied and no tokio runtime is running".into())
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `f` with this runtime entered, so tokio I/O objects created inside
    /// register with its driver.
    pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.handle.enter();
        f()
    }
}

impl From<Handle> for ReactorHandle {
    fn from(handle: Handle) -> Self {
        Self::new(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_outside_runtime() {
        assert!(matches!(ReactorHandle::current(), Err(ShmwireError::Usage(_))));
    }

    #[tokio::test]
    async fn test_current_inside_runtime() {
        let reactor = ReactorHandle::current().unwrap();
        let value = reactor.spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
