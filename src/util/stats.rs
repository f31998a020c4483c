//! Monotonic 64-bit counters with change notification.
//!
//! A [`CounterWatch`] is a snapshot marker: it answers "has the counter
//! changed since I took this?" and can be awaited, which is what makes the
//! namespace's counter files pollable.

use std::sync::Arc;
use tokio::sync::watch;

/// Monotonically non-decreasing counter. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Counter {
    tx: Arc<watch::Sender<u64>>,
}

impl Counter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Atomic add; wakes every attached watch.
    pub fn add(&self, val: u64) {
        self.tx.send_modify(|v| *v += val);
    }

    pub fn get(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Snapshot the current point in the counter's history. The watch
    /// reports changed for any mutation after this call.
    pub fn watch(&self) -> CounterWatch {
        CounterWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CounterWatch {
    rx: watch::Receiver<u64>,
}

impl CounterWatch {
    /// True iff the counter was mutated after the watch was taken.
    pub fn is_changed(&self) -> bool {
        // A dropped sender counts as changed so pollers don't hang on a
        // dead counter.
        self.rx.has_changed().unwrap_or(true)
    }

    /// Resolve at the next mutation, or immediately if one already
    /// happened. One-shot: callers take a fresh watch afterwards.
    pub async fn changed(&mut self) {
        let _ = self.rx.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_add_and_get() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.add(3);
        c.add(4);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn test_watch_tracks_changes_after_snapshot() {
        let c = Counter::new();
        c.add(1);
        let w = c.watch();
        assert!(!w.is_changed());
        c.add(1);
        assert!(w.is_changed());
    }

    #[tokio::test]
    async fn test_changed_wakes_on_mutation() {
        let c = Counter::new();
        let mut w = c.watch();
        let c2 = c.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c2.add(5);
        });
        tokio::time::timeout(Duration::from_secs(1), w.changed())
            .await
            .expect("watch should fire");
        assert_eq!(c.get(), 5);
    }

    #[tokio::test]
    async fn test_changed_fires_immediately_when_already_changed() {
        let c = Counter::new();
        let mut w = c.watch();
        c.add(1);
        tokio::time::timeout(Duration::from_millis(100), w.changed())
            .await
            .expect("already-changed watch must not block");
    }
}
