//! Per-chunk exclusive locks with interruptible acquire.
//!
//! Concurrent demand for the same chunk coalesces here: one task performs
//! the fetch while the rest wait on the entry, then observe the populated
//! cache. Entries exist only while a chunk is locked or waited on.

use crate::util::cancel::Interrupt;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub struct ChunkLockTable {
    chunks: Mutex<HashMap<u64, LockEntry>>,
}

struct LockEntry {
    busy: bool,
    waiters: u32,
    available: Arc<Notify>,
}

/// Held for the duration of one chunk operation; releases on drop.
pub struct ChunkGuard<'a> {
    table: &'a ChunkLockTable,
    chunk: u64,
}

impl ChunkLockTable {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `chunk`, waiting if it is busy. Returns `None`
    /// if the host interrupted the request before the lock was acquired.
    pub async fn acquire(&self, chunk: u64, intr: &Interrupt) -> Option<ChunkGuard<'_>> {
        let available = {
            let mut chunks = self.chunks.lock().unwrap();
            match chunks.entry(chunk) {
                Entry::Vacant(slot) => {
                    slot.insert(LockEntry {
                        busy: true,
                        waiters: 0,
                        available: Arc::new(Notify::new()),
                    });
                    return Some(ChunkGuard { table: self, chunk });
                }
                Entry::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    entry.waiters += 1;
                    entry.available.clone()
                }
            }
        };

        let mut interrupted = false;
        loop {
            if !interrupted {
                tokio::select! {
                    _ = available.notified() => {}
                    _ = intr.triggered() => interrupted = true,
                }
            }
            let mut chunks = self.chunks.lock().unwrap();
            let entry = chunks.get_mut(&chunk).expect("waited-on lock entry");
            if !entry.busy {
                // If we were interrupted but the lock happens to be free,
                // we take it anyway so there is exactly one release path.
                entry.busy = true;
                entry.waiters -= 1;
                return Some(ChunkGuard { table: self, chunk });
            }
            if interrupted {
                entry.waiters -= 1;
                return None;
            }
        }
    }

    fn release(&self, chunk: u64) {
        let mut chunks = self.chunks.lock().unwrap();
        let entry = chunks.get_mut(&chunk).expect("released lock entry");
        if entry.waiters > 0 {
            entry.busy = false;
            entry.available.notify_one();
        } else {
            chunks.remove(&chunk);
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

impl Default for ChunkLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChunkGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.chunk);
    }
}
