//! Interrupt token polled at the engine's suspension points.
//!
//! The VFS host decides when a request is interrupted; the engine only ever
//! polls. The token is cloned into whatever is waiting (chunk lock, network
//! transfer, blocking stream read) and checked there.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the request as interrupted and wake anything polling.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the token has been triggered. Used inside `select!`
    /// arms; pending forever if the request is never interrupted.
    pub async fn triggered(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        loop {
            // Register with the Notify before re-checking the flag, so a
            // trigger between the check and the await can't be missed.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}
