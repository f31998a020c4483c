//! Stream groups: fan-out of an append-only byte log to any number of
//! late-joining subscribers, each with its own cursor.
//!
//! A group write appends to every live subscriber. A subscriber opened
//! against a group with a populate callback first receives the historical
//! state, then live writes. Closing the group unblocks readers; they drain
//! whatever is buffered and then see EOF.

use crate::error::StreamError;
use crate::util::cancel::Interrupt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

type PopulateFn = Box<dyn Fn(&Stream) + Send + Sync>;

/// Owner side of a subscriber fan-out. Cloning shares the group.
#[derive(Clone)]
pub struct StreamGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    state: Mutex<GroupState>,
    populate: Option<PopulateFn>,
}

struct GroupState {
    streams: Vec<Weak<StreamShared>>,
    closed: bool,
}

struct StreamShared {
    buf: Mutex<VecDeque<u8>>,
    notify: Notify,
}

impl StreamGroup {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// The populate callback runs synchronously for each new subscriber,
    /// before any live write reaches it. It runs under the group lock, so
    /// it must not subscribe to or write through the same group.
    pub fn with_populate(populate: impl Fn(&Stream) + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(populate)))
    }

    fn build(populate: Option<PopulateFn>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState {
                    streams: Vec::new(),
                    closed: false,
                }),
                populate,
            }),
        }
    }

    /// Open a subscriber. Valid on a closed group: the subscriber sees the
    /// populated snapshot (if any) and then EOF.
    pub fn subscribe(&self) -> Stream {
        let shared = Arc::new(StreamShared {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        let stream = Stream {
            shared: shared.clone(),
            group: self.inner.clone(),
        };
        // Registration and populate form one critical section: a concurrent
        // group write must either land before the snapshot or after the
        // stream holds it, never both for the same event. Populate
        // callbacks take their own state locks inside the group lock;
        // writers always release those before calling write(), so the two
        // locks are never nested in the other order.
        let mut state = self.inner.state.lock().unwrap();
        state.streams.push(Arc::downgrade(&shared));
        if let Some(populate) = &self.inner.populate {
            populate(&stream);
        }
        drop(state);
        stream
    }

    /// Append `text` to every live subscriber. Ignored once the group is
    /// closed.
    pub fn write(&self, text: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.streams.retain(|weak| match weak.upgrade() {
            Some(shared) => {
                shared.buf.lock().unwrap().extend(text.as_bytes());
                shared.notify.notify_one();
                true
            }
            None => false,
        });
    }

    /// No more writes; blocked readers wake, drain, and return EOF.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        for weak in &state.streams {
            if let Some(shared) = weak.upgrade() {
                shared.notify.notify_one();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }
}

impl Default for StreamGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-reader subscriber cursor.
pub struct Stream {
    shared: Arc<StreamShared>,
    group: Arc<GroupInner>,
}

impl Stream {
    /// Append directly to this subscriber only. Used by populate callbacks
    /// to seed historical state.
    pub fn write(&self, text: &str) {
        self.shared.buf.lock().unwrap().extend(text.as_bytes());
        self.shared.notify.notify_one();
    }

    /// Return up to `count` buffered bytes. An empty result means EOF (the
    /// group is closed and fully drained).
    pub async fn read(
        &self,
        count: usize,
        blocking: bool,
        intr: &Interrupt,
    ) -> Result<Vec<u8>, StreamError> {
        loop {
            {
                let mut buf = self.shared.buf.lock().unwrap();
                if !buf.is_empty() {
                    let take = count.min(buf.len());
                    return Ok(buf.drain(..take).collect());
                }
            }
            if self.group.state.lock().unwrap().closed {
                return Ok(Vec::new());
            }
            if !blocking {
                return Err(StreamError::WouldBlock);
            }
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = intr.triggered() => return Err(StreamError::Interrupted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_reaches_all_subscribers() {
        let grp = StreamGroup::new();
        let a = grp.subscribe();
        let b = grp.subscribe();
        grp.write("hello\n");
        let intr = Interrupt::new();
        assert_eq!(a.read(64, false, &intr).await.unwrap(), b"hello\n");
        assert_eq!(b.read(64, false, &intr).await.unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_writes() {
        let grp = StreamGroup::new();
        grp.write("early\n");
        let s = grp.subscribe();
        let intr = Interrupt::new();
        assert!(matches!(
            s.read(64, false, &intr).await,
            Err(StreamError::WouldBlock)
        ));
    }

    #[tokio::test]
    async fn test_populate_seeds_before_live_writes() {
        let grp = StreamGroup::with_populate(|strm| strm.write("history\n"));
        let s = grp.subscribe();
        grp.write("live\n");
        let intr = Interrupt::new();
        assert_eq!(s.read(64, false, &intr).await.unwrap(), b"history\nlive\n");
    }

    #[tokio::test]
    async fn test_partial_reads_preserve_order() {
        let grp = StreamGroup::new();
        let s = grp.subscribe();
        grp.write("abcdef");
        let intr = Interrupt::new();
        assert_eq!(s.read(2, false, &intr).await.unwrap(), b"ab");
        assert_eq!(s.read(2, false, &intr).await.unwrap(), b"cd");
        assert_eq!(s.read(64, false, &intr).await.unwrap(), b"ef");
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_write() {
        let grp = StreamGroup::new();
        let s = grp.subscribe();
        let writer = grp.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.write("x");
        });
        let intr = Interrupt::new();
        let got = tokio::time::timeout(Duration::from_secs(1), s.read(16, true, &intr))
            .await
            .expect("blocked reader should wake")
            .unwrap();
        assert_eq!(got, b"x");
    }

    #[tokio::test]
    async fn test_close_unblocks_with_eof() {
        let grp = StreamGroup::new();
        let s = grp.subscribe();
        let closer = grp.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        let intr = Interrupt::new();
        let got = tokio::time::timeout(Duration::from_secs(1), s.read(16, true, &intr))
            .await
            .expect("close should unblock")
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_close_drains_buffered_bytes_first() {
        let grp = StreamGroup::new();
        let s = grp.subscribe();
        grp.write("tail");
        grp.close();
        let intr = Interrupt::new();
        assert_eq!(s.read(16, true, &intr).await.unwrap(), b"tail");
        assert!(s.read(16, true, &intr).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_blocking_read() {
        let grp = StreamGroup::new();
        let s = grp.subscribe();
        let intr = Interrupt::new();
        let trigger = intr.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });
        assert!(matches!(
            s.read(16, true, &intr).await,
            Err(StreamError::Interrupted)
        ));
    }
}
